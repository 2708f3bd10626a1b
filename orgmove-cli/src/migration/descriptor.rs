//! Entity and field descriptors
//!
//! Descriptors are immutable job input: the declared shape of each object,
//! its external id, its query template and its parent relationships. Field
//! descriptors are derived from the query template plus the script's lookup
//! declarations.

use std::collections::HashSet;

use anyhow::{Context, Result};

use crate::config::{ObjectConfig, OperationKind};

use super::query::{ParsedQuery, parse_query};

/// The distinguished type-classification entity, always first in execution
/// order when declared
pub const CLASSIFICATION_ENTITY: &str = "RecordType";

/// Separator between the components of a composite external id
pub const EXTERNAL_ID_SEPARATOR: char = ';';

/// How a field relates to other entities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain data field
    Scalar,
    /// Lookup-id column referencing another entity
    Lookup,
    /// Lookup-id column referencing the owning entity itself
    SelfLookup,
    /// Dotted relationship-path column ("Account.Name")
    RelationshipPath,
}

/// One field of an entity's query
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    /// The field as written in the query template
    pub name: String,
    pub kind: FieldKind,
    /// Column carrying the referenced record's identifier
    pub id_column: String,
    /// Dotted column carrying the referenced record's external id; filled in
    /// once all descriptors are known
    pub relationship_column: Option<String>,
    /// Owning entity
    pub entity: String,
    /// Referenced (parent) entity, for reference kinds
    pub references: Option<String>,
    pub master_detail: bool,
}

impl FieldDescriptor {
    pub fn is_reference(&self) -> bool {
        !matches!(self.kind, FieldKind::Scalar)
    }
}

/// The declared shape of one entity in the migration
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub name: String,
    pub operation: OperationKind,
    pub external_id: String,
    pub query: ParsedQuery,
    pub fields: Vec<FieldDescriptor>,
    pub process_all_source: bool,
    pub process_all_target: bool,
    pub auto_number_external_id: bool,
    pub no_relationships: bool,
}

impl EntityDescriptor {
    /// Build a descriptor from one script object block. Relationship columns
    /// stay unresolved until [`link_descriptors`] runs over the whole set.
    pub fn from_config(config: &ObjectConfig) -> Result<Self> {
        let query = parse_query(&config.query)
            .with_context(|| format!("Invalid query for object '{}'", config.name))?;

        let master_detail: HashSet<&str> = config
            .master_detail_fields
            .iter()
            .map(String::as_str)
            .collect();

        let fields = query
            .fields
            .iter()
            .map(|field| {
                let (kind, id_column, references) = classify_field(&config.name, field, config);
                FieldDescriptor {
                    name: field.clone(),
                    kind,
                    master_detail: master_detail.contains(id_column.as_str()),
                    relationship_column: None,
                    entity: config.name.clone(),
                    id_column,
                    references,
                }
            })
            .collect();

        Ok(Self {
            name: config.name.clone(),
            operation: config.operation,
            external_id: config.external_id.clone(),
            query,
            fields,
            process_all_source: config.process_all_source,
            process_all_target: config.process_all_target,
            auto_number_external_id: config.auto_number_external_id,
            no_relationships: config.no_relationships,
        })
    }

    pub fn is_classification(&self) -> bool {
        self.name == CLASSIFICATION_ENTITY
    }

    pub fn is_readonly(&self) -> bool {
        self.operation == OperationKind::Readonly
    }

    pub fn has_composite_external_id(&self) -> bool {
        self.external_id.contains(EXTERNAL_ID_SEPARATOR)
    }

    pub fn external_id_components(&self) -> Vec<&str> {
        self.external_id
            .split(EXTERNAL_ID_SEPARATOR)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect()
    }

    /// First external-id component, used for relationship-path columns
    pub fn primary_external_id(&self) -> &str {
        self.external_id_components().first().copied().unwrap_or("Id")
    }

    pub fn has_limited_query(&self) -> bool {
        self.query.has_limit()
    }

    /// Whether this entity's relationships take part in the migration.
    /// False when no field references another entity, or when the object is
    /// flagged no-relationships.
    pub fn has_relationships(&self) -> bool {
        self.reference_fields().next().is_some()
    }

    /// Lookup fields referencing another entity (self-references excluded)
    pub fn lookup_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        let suppress = self.no_relationships;
        self.fields
            .iter()
            .filter(move |f| !suppress && matches!(f.kind, FieldKind::Lookup))
    }

    pub fn self_lookup_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        let suppress = self.no_relationships;
        self.fields
            .iter()
            .filter(move |f| !suppress && matches!(f.kind, FieldKind::SelfLookup))
    }

    /// All reference fields, in query order; empty for a no-relationships
    /// object
    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        let suppress = self.no_relationships;
        self.fields.iter().filter(move |f| !suppress && f.is_reference())
    }

    pub fn parent_lookup_entities(&self) -> HashSet<&str> {
        self.lookup_fields()
            .filter_map(|f| f.references.as_deref())
            .collect()
    }

    /// Master-detail parents. The relationship may be declared without a
    /// lookup entry (metadata-derived), in which case the parent name falls
    /// back to the id column's relationship name.
    pub fn parent_master_detail_entities(&self) -> HashSet<&str> {
        if self.no_relationships {
            return HashSet::new();
        }
        self.fields
            .iter()
            .filter(|f| f.master_detail)
            .map(|f| {
                f.references
                    .as_deref()
                    .unwrap_or_else(|| relationship_name(&f.id_column))
            })
            .filter(|target| *target != self.name)
            .collect()
    }

    /// Fields a well-formed source file must carry: every query field except
    /// the record identifier itself
    pub fn required_csv_fields(&self) -> impl Iterator<Item = &str> {
        self.query
            .fields
            .iter()
            .map(String::as_str)
            .filter(|f| *f != "Id")
    }

    /// Columns included in write payloads: scalars and lookup-id columns,
    /// never the record id, relationship paths, or an auto-number external id
    pub fn payload_columns(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| !matches!(f.kind, FieldKind::RelationshipPath))
            .map(|f| f.id_column.clone())
            .filter(|c| c != "Id")
            .filter(|c| !(self.auto_number_external_id && self.external_id_components().contains(&c.as_str())))
            .collect()
    }
}

/// Derive a field's reference kind and id column from its name and the
/// script's lookup declarations
fn classify_field(entity: &str, field: &str, config: &ObjectConfig) -> (FieldKind, String, Option<String>) {
    if let Some((relationship, _)) = field.split_once('.') {
        let id_column = format!("{}Id", relationship);
        let references = config.lookups.get(&id_column).cloned();
        return (FieldKind::RelationshipPath, id_column, references);
    }
    match config.lookups.get(field) {
        Some(target) if target == entity => (FieldKind::SelfLookup, field.to_string(), Some(target.clone())),
        Some(target) => (FieldKind::Lookup, field.to_string(), Some(target.clone())),
        None => (FieldKind::Scalar, field.to_string(), None),
    }
}

/// Resolve relationship-path column names across the whole descriptor set.
/// A lookup "AccountId" referencing Account with external id "Name" gets the
/// relationship column "Account.Name".
pub fn link_descriptors(descriptors: &mut [EntityDescriptor]) {
    let external_ids: std::collections::HashMap<String, String> = descriptors
        .iter()
        .map(|d| (d.name.clone(), d.primary_external_id().to_string()))
        .collect();

    for descriptor in descriptors.iter_mut() {
        for field in descriptor.fields.iter_mut() {
            match field.kind {
                FieldKind::Scalar => {}
                FieldKind::RelationshipPath => {
                    field.relationship_column = Some(field.name.clone());
                }
                FieldKind::Lookup | FieldKind::SelfLookup => {
                    let parent_external = field
                        .references
                        .as_ref()
                        .and_then(|r| external_ids.get(r).cloned())
                        .unwrap_or_else(|| "Id".to_string());
                    field.relationship_column =
                        Some(format!("{}.{}", relationship_name(&field.id_column), parent_external));
                }
            }
        }
    }
}

/// Relationship name of a lookup-id column: "AccountId" -> "Account"
pub fn relationship_name(id_column: &str) -> &str {
    match id_column.strip_suffix("Id") {
        Some(stem) if !stem.is_empty() => stem,
        _ => id_column,
    }
}
