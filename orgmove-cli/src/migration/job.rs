//! Job assembly, orchestration and the write phase
//!
//! A job binds a migration script to two endpoints: tasks are ordered,
//! source files validated and repaired (file sources only), records
//! retrieved through the multi-pass protocol, and finally written out per
//! task in execution order. Issues accumulate throughout and gate
//! confirm-or-abort decision points; an abort is a normal termination.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::config::{MigrationScript, OperationKind, Settings};
use crate::confirm::{Flow, RunOutcome, confirm_continue};
use crate::data::{Row, Value};
use crate::engine::{EngineParams, select_engine};
use crate::files::cache::{FileCache, ID_COLUMN, SyntheticIds, write_records};
use crate::files::layout::FileLayout;
use crate::files::repair;
use crate::issues::IssueLog;
use crate::mappings::{FieldMappings, ValueMappings};

use super::descriptor::{EntityDescriptor, FieldDescriptor, FieldKind, link_descriptors};
use super::endpoint::Endpoint;
use super::graph::{execution_order, query_order};
use super::retrieve;
use super::task::{MigrationTask, Side};

/// One migration run
pub struct MigrationJob {
    pub(crate) tasks: Vec<MigrationTask>,
    pub(crate) query_order: Vec<usize>,
    pub(crate) source: Endpoint,
    pub(crate) target: Endpoint,
    pub(crate) layout: FileLayout,
    pub(crate) cache: FileCache,
    pub(crate) ids: SyntheticIds,
    pub(crate) issues: IssueLog,
    pub(crate) value_mappings: ValueMappings,
    pub(crate) field_mappings: FieldMappings,
    pub(crate) settings: Settings,
    pub(crate) assume_yes: bool,
}

/// Records staged for one task's write step, split by actual operation
#[derive(Debug, Default)]
struct WritePlan {
    inserts: Vec<Row>,
    updates: Vec<Row>,
    deletes: Vec<Row>,
    /// Self-lookups that can only resolve once this task's inserts exist
    /// on the target
    deferred: Vec<DeferredSelfLookup>,
    new_missing_parents: usize,
}

impl WritePlan {
    fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.deferred.is_empty()
    }
}

#[derive(Debug)]
struct DeferredSelfLookup {
    source_id: String,
    column: String,
    parent_source_id: String,
}

impl MigrationJob {
    pub fn new(
        script: MigrationScript,
        source: Endpoint,
        target: Endpoint,
        root: &Path,
        assume_yes: bool,
    ) -> Result<Self> {
        let settings = script.settings.clone();
        let layout = FileLayout::new(root, settings.merge_person_files);
        layout.ensure_dirs()?;

        let mut descriptors: Vec<EntityDescriptor> = script
            .objects
            .iter()
            .map(EntityDescriptor::from_config)
            .collect::<Result<Vec<_>>>()?;
        link_descriptors(&mut descriptors);
        let tasks = execution_order(descriptors.into_iter().map(MigrationTask::new).collect());
        let names: Vec<&str> = tasks.iter().map(|t| t.name()).collect();
        log::info!("Execution order: {}", names.join(" -> "));
        let query_order = query_order(&tasks);

        let value_mappings = ValueMappings::load(&layout.value_mapping_file())?;
        let field_mappings = FieldMappings::load(&layout.field_mapping_file())?;

        Ok(Self {
            tasks,
            query_order,
            source,
            target,
            layout,
            cache: FileCache::new(),
            ids: SyntheticIds::new(),
            issues: IssueLog::default(),
            value_mappings,
            field_mappings,
            settings,
            assume_yes,
        })
    }

    /// Run the whole migration. `Ok(RunOutcome::Aborted)` is a normal early
    /// termination chosen at a confirmation point, not a failure.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        if let Flow::Abort = self.prepare_files()? {
            return Ok(RunOutcome::Aborted);
        }
        retrieve::run_retrieval(self).await?;
        let outcome = self.write_phase().await?;
        self.write_reports()?;
        Ok(outcome)
    }

    /// Validate and repair the source files without touching any org,
    /// returning how many structural issues were found
    pub fn check_files(&mut self) -> Result<usize> {
        self.repair_sources()?;
        self.issues
            .write_csv_issues_report(&self.layout.csv_issues_report())?;
        Ok(self.issues.csv_issue_count())
    }

    fn prompts_suppressed(&self) -> bool {
        self.assume_yes || !self.settings.prompt_on_issues
    }

    /// Repair source files ahead of retrieval (file sources only), then
    /// suspend for confirmation when structural issues were found
    fn prepare_files(&mut self) -> Result<Flow> {
        if !self.source.is_files() {
            return Ok(Flow::Continue);
        }
        self.repair_sources()?;
        let count = self.issues.csv_issue_count();
        if count == 0 {
            return Ok(Flow::Continue);
        }
        self.issues
            .write_csv_issues_report(&self.layout.csv_issues_report())?;
        confirm_continue(
            &format!(
                "{} structural issue(s) found in the source files (see {}). Continue?",
                count,
                self.layout.csv_issues_report().display()
            ),
            self.prompts_suppressed(),
        )
    }

    fn repair_sources(&mut self) -> Result<()> {
        let descriptors: Vec<EntityDescriptor> =
            self.tasks.iter().map(|t| t.descriptor.clone()).collect();
        repair::validate_files(
            &descriptors,
            &self.layout,
            &mut self.cache,
            &mut self.ids,
            &mut self.issues,
        )?;
        repair::repair_files(
            &descriptors,
            &self.layout,
            &mut self.cache,
            &mut self.ids,
            &self.value_mappings,
            &self.field_mappings,
            &mut self.issues,
        )?;
        let flushed = self.cache.flush()?;
        if flushed > 0 {
            log::info!("Repaired and rewrote {} source file(s)", flushed);
        }
        Ok(())
    }

    /// Write each task's records in execution order, so parent tasks commit
    /// before the children that reference them
    async fn write_phase(&mut self) -> Result<RunOutcome> {
        for index in 0..self.tasks.len() {
            if self.tasks[index].descriptor.is_readonly() {
                continue;
            }
            let plan = self.build_write_plan(index);
            if plan.new_missing_parents > 0 {
                self.issues
                    .write_missing_parents_report(&self.layout.missing_parents_report())?;
                let message = format!(
                    "{}: {} lookup value(s) have no parent record (see {}). Continue?",
                    self.tasks[index].name(),
                    plan.new_missing_parents,
                    self.layout.missing_parents_report().display()
                );
                if let Flow::Abort = confirm_continue(&message, self.prompts_suppressed())? {
                    return Ok(RunOutcome::Aborted);
                }
            }
            if plan.is_empty() {
                log::info!("{}: nothing to write", self.tasks[index].name());
                continue;
            }
            self.execute_plan(index, plan).await?;
        }
        Ok(RunOutcome::Completed)
    }

    /// Match one task's source records against the target by external id
    /// and stage them for writing, rewriting lookup columns from source
    /// parent identifiers to target ones
    fn build_write_plan(&mut self, index: usize) -> WritePlan {
        let Self {
            tasks,
            issues,
            target,
            ..
        } = self;
        let target_files = target.is_files();
        let task = &tasks[index];
        let descriptor = &task.descriptor;
        let mut plan = WritePlan::default();

        if descriptor.operation == OperationKind::Delete {
            for (_, record) in task.source.records() {
                let Some(external) = task.external_value(record) else {
                    continue;
                };
                if let Some(target_id) = task.target.id_for_external(&external) {
                    let mut row = Row::new();
                    row.set(ID_COLUMN, Value::String(target_id.to_string()));
                    plan.deletes.push(row);
                }
            }
            return plan;
        }

        let payload_columns = descriptor.payload_columns();
        let reference_fields: Vec<&FieldDescriptor> = if descriptor.has_relationships() {
            let mut seen = HashSet::new();
            descriptor
                .reference_fields()
                .filter(|f| seen.insert(f.id_column.clone()))
                .collect()
        } else {
            Vec::new()
        };

        for (source_id, record) in task.source.records() {
            let mut row = Row::new();
            if target_files {
                // File outputs keep source identifiers so the file set stays
                // internally consistent
                row.set(ID_COLUMN, Value::String(source_id.to_string()));
            }
            for column in &payload_columns {
                row.set(column.clone(), record.get(column).cloned().unwrap_or(Value::Null));
            }

            for field in &reference_fields {
                let Some(parent_source_id) = record.text(&field.id_column) else {
                    continue;
                };
                if target_files {
                    let exists = field
                        .references
                        .as_deref()
                        .and_then(|parent| tasks.iter().find(|t| t.name() == parent))
                        .is_some_and(|parent| parent.source.contains_id(&parent_source_id));
                    if !exists {
                        issues.record_missing_parent(
                            &descriptor.name,
                            &field.id_column,
                            &parent_source_id,
                        );
                        plan.new_missing_parents += 1;
                    }
                    continue;
                }
                match resolve_parent_target_id(tasks, field, &parent_source_id) {
                    Some(target_id) => {
                        row.set(field.id_column.clone(), Value::String(target_id));
                    }
                    None if matches!(field.kind, FieldKind::SelfLookup) => {
                        // The parent may be inserted by this very task
                        row.set(field.id_column.clone(), Value::Null);
                        plan.deferred.push(DeferredSelfLookup {
                            source_id: source_id.to_string(),
                            column: field.id_column.clone(),
                            parent_source_id,
                        });
                    }
                    None => {
                        issues.record_missing_parent(
                            &descriptor.name,
                            &field.id_column,
                            &parent_source_id,
                        );
                        plan.new_missing_parents += 1;
                        row.set(field.id_column.clone(), Value::Null);
                    }
                }
            }

            let matched = task
                .external_value(record)
                .and_then(|external| task.target.id_for_external(&external).map(str::to_string));
            match (descriptor.operation, matched) {
                (OperationKind::Insert, Some(_)) => {}
                (OperationKind::Insert, None) => plan.inserts.push(row),
                (OperationKind::Update | OperationKind::Upsert, Some(target_id)) => {
                    row.set(ID_COLUMN, Value::String(target_id));
                    plan.updates.push(row);
                }
                (OperationKind::Update, None) => {
                    log::debug!(
                        "{}: no target match to update for source record {}",
                        descriptor.name,
                        source_id
                    );
                }
                (OperationKind::Upsert, None) => plan.inserts.push(row),
                (OperationKind::Delete | OperationKind::Readonly, _) => {}
            }
        }
        plan
    }

    async fn execute_plan(&mut self, index: usize, plan: WritePlan) -> Result<()> {
        let WritePlan {
            inserts,
            updates,
            deletes,
            deferred,
            ..
        } = plan;
        for (kind, records) in [
            (OperationKind::Insert, inserts),
            (OperationKind::Update, updates),
            (OperationKind::Delete, deletes),
        ] {
            if records.is_empty() {
                continue;
            }
            self.dispatch(index, kind, records).await?;
        }
        if !deferred.is_empty() {
            self.resolve_deferred_self_lookups(index, deferred).await?;
        }
        Ok(())
    }

    /// Hand one record set to the target: a CSV file for file endpoints,
    /// otherwise the engine selected for the record count. An entity-level
    /// field mapping renames the entity at this boundary.
    async fn dispatch(&mut self, index: usize, kind: OperationKind, records: Vec<Row>) -> Result<()> {
        let entity = self
            .field_mappings
            .target_entity(self.tasks[index].name())
            .to_string();
        match &self.target {
            Endpoint::Files => {
                let path = self.layout.target_file(&entity, kind);
                write_records(&path, &records)?;
                log::info!("Wrote {} {} record(s) to {}", records.len(), kind, path.display());
                Ok(())
            }
            Endpoint::Org(client) => {
                let params = EngineParams {
                    client,
                    entity: entity.clone(),
                    operation: kind,
                    poll_interval: Duration::from_millis(self.settings.poll_interval_ms),
                    propagate_ids: self.settings.propagate_ids,
                    output_path: self.layout.engine_result_file(&entity, kind),
                    persist_output: self.settings.persist_engine_output,
                };
                let engine = select_engine(records.len(), &self.settings, params);
                log::info!(
                    "Executing {} ({} record(s)) via {}",
                    engine.describe_operation(),
                    records.len(),
                    engine.describe_engine()
                );
                let updated = engine
                    .execute(records, &mut |event| {
                        let (level, message_kind) = event.importance();
                        log::log!(level, "[{}] {}: {}", message_kind, entity, event);
                    })
                    .await?;
                // Generated identifiers feed the target index so child tasks
                // can resolve their parents
                if kind != OperationKind::Delete && self.settings.propagate_ids {
                    self.tasks[index].absorb_records(Side::Target, updated);
                }
                Ok(())
            }
        }
    }

    /// Second write pass for self-references deferred until this task's own
    /// inserts exist on the target
    async fn resolve_deferred_self_lookups(
        &mut self,
        index: usize,
        deferred: Vec<DeferredSelfLookup>,
    ) -> Result<()> {
        let mut updates = Vec::new();
        {
            let Self { tasks, issues, .. } = self;
            let task = &tasks[index];
            for item in &deferred {
                let child = target_id_of(task, &item.source_id);
                let parent = target_id_of(task, &item.parent_source_id);
                match (child, parent) {
                    (Some(child), Some(parent)) => {
                        let mut row = Row::new();
                        row.set(ID_COLUMN, Value::String(child));
                        row.set(item.column.clone(), Value::String(parent));
                        updates.push(row);
                    }
                    _ => issues.record_missing_parent(
                        task.name(),
                        &item.column,
                        &item.parent_source_id,
                    ),
                }
            }
        }
        if updates.is_empty() {
            return Ok(());
        }
        log::info!(
            "{}: resolving {} deferred self-reference(s)",
            self.tasks[index].name(),
            updates.len()
        );
        self.dispatch(index, OperationKind::Update, updates).await
    }

    fn write_reports(&self) -> Result<()> {
        self.issues
            .write_csv_issues_report(&self.layout.csv_issues_report())?;
        self.issues
            .write_missing_parents_report(&self.layout.missing_parents_report())?;
        for task in &self.tasks {
            log::info!(
                "{}: {} source / {} target record(s)",
                task.name(),
                task.source.len(),
                task.target.len()
            );
        }
        Ok(())
    }
}

/// Map a source parent identifier to its target-side identifier through the
/// parent task's indexes
fn resolve_parent_target_id(
    tasks: &[MigrationTask],
    field: &FieldDescriptor,
    source_parent_id: &str,
) -> Option<String> {
    let parent_name = field.references.as_deref()?;
    let parent = tasks.iter().find(|t| t.name() == parent_name)?;
    let record = parent.source.get(source_parent_id)?;
    let external = parent.external_value(record)?;
    parent.target.id_for_external(&external).map(str::to_string)
}

/// Target-side id of a task's own source record, via its external id value
fn target_id_of(task: &MigrationTask, source_id: &str) -> Option<String> {
    let record = task.source.get(source_id)?;
    let external = task.external_value(record)?;
    task.target.id_for_external(&external).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;

    fn write_file(path: &PathBuf, content: &str) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    fn make_script(raw: &str) -> MigrationScript {
        serde_json::from_str(raw).unwrap()
    }

    fn make_record(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from_csv(v)))
            .collect()
    }

    const TWO_OBJECT_SCRIPT: &str = r#"{
        "objects": [
            {
                "name": "Contact",
                "operation": "Upsert",
                "externalId": "Email",
                "query": "select Id, Email, AccountId, Account.Name from Contact",
                "lookups": { "AccountId": "Account" }
            },
            {
                "name": "Account",
                "operation": "Upsert",
                "externalId": "Name",
                "query": "select Id, Name from Account"
            }
        ],
        "settings": { "promptOnIssues": false }
    }"#;

    #[tokio::test]
    async fn test_files_to_files_migration() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = MigrationJob::new(
            make_script(TWO_OBJECT_SCRIPT),
            Endpoint::Files,
            Endpoint::Files,
            dir.path(),
            true,
        )
        .unwrap();
        // The graph pulled Account ahead of the Contact that references it
        assert_eq!(job.tasks[0].name(), "Account");

        write_file(&job.layout.source_file("Account"), "Id,Name\nA1,Acme\n");
        write_file(
            &job.layout.source_file("Contact"),
            "Id,Email,AccountId,Account.Name\nC1,a@x.test,A1,Acme\nC2,b@x.test,A9,Ghost\n",
        );

        let outcome = job.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let accounts =
            std::fs::read_to_string(job.layout.target_file("Account", OperationKind::Insert))
                .unwrap();
        assert!(accounts.contains("A1"));
        let contacts =
            std::fs::read_to_string(job.layout.target_file("Contact", OperationKind::Insert))
                .unwrap();
        assert!(contacts.contains("C1"));
        assert!(contacts.contains("A1"));

        // C2 points at an account no source row has
        assert_eq!(job.issues.missing_parent_count(), 1);
        assert!(job.layout.missing_parents_report().exists());
    }

    #[tokio::test]
    async fn test_missing_source_file_reported_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let script = make_script(
            r#"{
                "objects": [
                    {
                        "name": "Account",
                        "operation": "Upsert",
                        "externalId": "Name",
                        "query": "select Id, Name from Account"
                    }
                ]
            }"#,
        );
        let mut job =
            MigrationJob::new(script, Endpoint::Files, Endpoint::Files, dir.path(), true).unwrap();

        // No source file at all: one structural issue, reported but not
        // fatal; with prompts suppressed the run continues to completion
        let outcome = job.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(job.issues.csv_issue_count(), 1);
        assert!(job.layout.csv_issues_report().exists());
    }

    #[test]
    fn test_write_plan_rewrites_lookups_to_target_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = MigrationJob::new(
            make_script(TWO_OBJECT_SCRIPT),
            Endpoint::Org(crate::api::OrgClient::new("https://src.example", "t")),
            Endpoint::Org(crate::api::OrgClient::new("https://dst.example", "t")),
            dir.path(),
            true,
        )
        .unwrap();

        let account = 0;
        let contact = 1;
        job.tasks[account].absorb_records(
            Side::Source,
            vec![make_record(&[("Id", "A1"), ("Name", "Acme")])],
        );
        job.tasks[account].absorb_records(
            Side::Target,
            vec![make_record(&[("Id", "T1"), ("Name", "Acme")])],
        );
        job.tasks[contact].absorb_records(
            Side::Source,
            vec![
                make_record(&[("Id", "C1"), ("Email", "a@x.test"), ("AccountId", "A1")]),
                make_record(&[("Id", "C2"), ("Email", "b@x.test"), ("AccountId", "A9")]),
            ],
        );

        let plan = job.build_write_plan(contact);
        assert_eq!(plan.inserts.len(), 2);
        let resolved = plan
            .inserts
            .iter()
            .find(|r| r.text("Email").as_deref() == Some("a@x.test"))
            .unwrap();
        assert_eq!(resolved.text("AccountId").as_deref(), Some("T1"));
        // Org-bound inserts never carry a source identifier
        assert_eq!(resolved.text(ID_COLUMN), None);

        let unresolved = plan
            .inserts
            .iter()
            .find(|r| r.text("Email").as_deref() == Some("b@x.test"))
            .unwrap();
        assert_eq!(unresolved.text("AccountId"), None);
        assert_eq!(plan.new_missing_parents, 1);
        assert_eq!(job.issues.missing_parent_count(), 1);
    }

    #[test]
    fn test_write_plan_routes_by_target_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = MigrationJob::new(
            make_script(TWO_OBJECT_SCRIPT),
            Endpoint::Org(crate::api::OrgClient::new("https://src.example", "t")),
            Endpoint::Org(crate::api::OrgClient::new("https://dst.example", "t")),
            dir.path(),
            true,
        )
        .unwrap();

        let account = 0;
        job.tasks[account].absorb_records(
            Side::Source,
            vec![
                make_record(&[("Id", "A1"), ("Name", "Acme")]),
                make_record(&[("Id", "A2"), ("Name", "Globex")]),
            ],
        );
        job.tasks[account].absorb_records(
            Side::Target,
            vec![make_record(&[("Id", "T1"), ("Name", "Acme")])],
        );

        let plan = job.build_write_plan(account);
        // Matched record updates under its target id, the other inserts
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].text(ID_COLUMN).as_deref(), Some("T1"));
    }

    #[test]
    fn test_self_lookup_deferred_not_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let script = make_script(
            r#"{
                "objects": [
                    {
                        "name": "Contact",
                        "operation": "Insert",
                        "externalId": "Email",
                        "query": "select Id, Email, ReportsToId from Contact",
                        "lookups": { "ReportsToId": "Contact" }
                    }
                ]
            }"#,
        );
        let mut job = MigrationJob::new(
            script,
            Endpoint::Org(crate::api::OrgClient::new("https://src.example", "t")),
            Endpoint::Org(crate::api::OrgClient::new("https://dst.example", "t")),
            dir.path(),
            true,
        )
        .unwrap();
        job.tasks[0].absorb_records(
            Side::Source,
            vec![
                make_record(&[("Id", "C1"), ("Email", "boss@x.test")]),
                make_record(&[("Id", "C2"), ("Email", "dev@x.test"), ("ReportsToId", "C1")]),
            ],
        );

        let plan = job.build_write_plan(0);
        assert_eq!(plan.inserts.len(), 2);
        assert_eq!(plan.deferred.len(), 1);
        assert_eq!(plan.deferred[0].parent_source_id, "C1");
        // Deferral is not a missing parent yet
        assert_eq!(plan.new_missing_parents, 0);
    }

    #[test]
    fn test_delete_plan_targets_matched_records() {
        let dir = tempfile::tempdir().unwrap();
        let script = make_script(
            r#"{
                "objects": [
                    {
                        "name": "Account",
                        "operation": "Delete",
                        "externalId": "Name",
                        "query": "select Id, Name from Account"
                    }
                ]
            }"#,
        );
        let mut job = MigrationJob::new(
            script,
            Endpoint::Org(crate::api::OrgClient::new("https://src.example", "t")),
            Endpoint::Org(crate::api::OrgClient::new("https://dst.example", "t")),
            dir.path(),
            true,
        )
        .unwrap();
        job.tasks[0].absorb_records(
            Side::Source,
            vec![
                make_record(&[("Id", "A1"), ("Name", "Acme")]),
                make_record(&[("Id", "A2"), ("Name", "NotOnTarget")]),
            ],
        );
        job.tasks[0].absorb_records(
            Side::Target,
            vec![make_record(&[("Id", "T1"), ("Name", "Acme")])],
        );

        let plan = job.build_write_plan(0);
        assert_eq!(plan.deletes.len(), 1);
        assert_eq!(plan.deletes[0].text(ID_COLUMN).as_deref(), Some("T1"));
        assert!(plan.inserts.is_empty());
    }
}
