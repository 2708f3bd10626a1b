//! Lazy, job-scoped cache of parsed CSV files
//!
//! Each distinct path parses at most once per run. Mutations happen in
//! memory and mark the file dirty; nothing reaches disk until the single
//! batch flush after all repairs complete, and in-memory reads always see
//! the latest repaired state.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;

use crate::data::{Row, Value};

/// Column holding a record's identifier
pub const ID_COLUMN: &str = "Id";

/// Job-scoped issuer of placeholder identifiers; never repeats a value
/// within a run
#[derive(Debug, Default)]
pub struct SyntheticIds {
    issued: u64,
}

impl SyntheticIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> String {
        self.issued += 1;
        format!("SYN{:07}", self.issued)
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }
}

/// One parsed file: header order plus rows keyed by resolved row identifier
/// (the Id cell when present, a synthetic id otherwise)
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub path: PathBuf,
    pub columns: Vec<String>,
    pub rows: IndexMap<String, Row>,
}

impl CachedFile {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Append a header column if absent. Returns true when added.
    pub fn add_column(&mut self, name: &str) -> bool {
        if self.has_column(name) {
            return false;
        }
        self.columns.push(name.to_string());
        true
    }

    /// Rename a header column and propagate to every row
    pub fn rename_column(&mut self, old: &str, new: &str) {
        for column in self.columns.iter_mut() {
            if column == old {
                *column = new.to_string();
            }
        }
        for row in self.rows.values_mut() {
            row.rename_column(old, new);
        }
    }
}

/// Lazy cache of parsed files plus the dirty set awaiting flush
#[derive(Debug, Default)]
pub struct FileCache {
    files: HashMap<PathBuf, CachedFile>,
    dirty: HashSet<PathBuf>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a file through the cache, parsing it on first access. A missing
    /// or empty file yields an empty entry rather than an error.
    pub fn load(&mut self, path: &Path, ids: &mut SyntheticIds) -> Result<&CachedFile> {
        self.ensure_loaded(path, ids)?;
        Ok(self.files.get(path).expect("entry present after load"))
    }

    pub fn load_mut(&mut self, path: &Path, ids: &mut SyntheticIds) -> Result<&mut CachedFile> {
        self.ensure_loaded(path, ids)?;
        Ok(self.files.get_mut(path).expect("entry present after load"))
    }

    fn ensure_loaded(&mut self, path: &Path, ids: &mut SyntheticIds) -> Result<()> {
        if self.files.contains_key(path) {
            return Ok(());
        }
        let file = parse_file(path, ids)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.files.insert(path.to_path_buf(), file);
        Ok(())
    }

    pub fn mark_dirty(&mut self, path: &Path) {
        self.dirty.insert(path.to_path_buf());
    }

    pub fn is_dirty(&self, path: &Path) -> bool {
        self.dirty.contains(path)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Write exactly the dirty files back to disk, clearing the dirty set.
    /// Returns how many files were written.
    pub fn flush(&mut self) -> Result<usize> {
        let mut written = 0;
        let dirty: Vec<PathBuf> = self.dirty.drain().collect();
        for path in dirty {
            let Some(file) = self.files.get(&path) else {
                continue;
            };
            write_file(file).with_context(|| format!("Failed to write {}", path.display()))?;
            written += 1;
        }
        Ok(written)
    }
}

fn parse_file(path: &Path, ids: &mut SyntheticIds) -> Result<CachedFile> {
    if !path.exists() {
        return Ok(CachedFile {
            path: path.to_path_buf(),
            columns: Vec::new(),
            rows: IndexMap::new(),
        });
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)?;

    let columns: Vec<String> = match reader.headers() {
        Ok(headers) => headers.iter().map(|h| h.to_string()).collect(),
        Err(_) => Vec::new(),
    };

    let mut rows = IndexMap::new();
    for record in reader.records() {
        let record = record?;
        let row: Row = columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                (
                    column.clone(),
                    Value::from_csv(record.get(i).unwrap_or_default()),
                )
            })
            .collect();
        let key = row
            .text(ID_COLUMN)
            .unwrap_or_else(|| ids.next_id());
        rows.insert(key, row);
    }

    Ok(CachedFile {
        path: path.to_path_buf(),
        columns,
        rows,
    })
}

/// Write rows to a CSV file outside the cache, the header being the union
/// of row columns in first-seen order
pub fn write_records(path: &Path, rows: &[Row]) -> Result<()> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for name in row.column_names() {
            if !columns.iter().any(|c| c == name) {
                columns.push(name.to_string());
            }
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(&columns)?;
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| row.text(column).unwrap_or_default())
            .collect();
        writer.write_record(&cells)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_file(file: &CachedFile) -> Result<()> {
    if let Some(parent) = file.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(&file.path)?;
    writer.write_record(&file.columns)?;
    for row in file.rows.values() {
        let cells: Vec<String> = file
            .columns
            .iter()
            .map(|column| row.text(column).unwrap_or_default())
            .collect();
        writer.write_record(&cells)?;
    }
    writer.flush()?;
    Ok(())
}
