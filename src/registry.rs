//! Declarative description of the content tables to scan.
//!
//! The registry is a JSON document:
//!
//! ```json
//! {
//!   "scope_table": "course",
//!   "tables": [
//!     { "name": "course", "fields": ["fullname", "summary"],
//!       "level": "container", "scope": { "kind": "scope" } },
//!     { "name": "page", "fields": ["name", "intro", "content"],
//!       "level": "unit", "scope": { "kind": "via", "hops": [
//!         { "column": "course", "table": "course" } ] } },
//!     { "name": "question_answers", "fields": ["answer"],
//!       "level": "unit", "scope": { "kind": "via", "hops": [
//!         { "column": "question", "table": "question" },
//!         { "column": "versionid", "table": "question_versions" },
//!         { "column": "course", "table": "course" } ] } }
//!   ]
//! }
//! ```
//!
//! A `via` chain starts on the content row: the first hop's column holds an
//! id in the first hop's table, that row's next-hop column holds an id in the
//! next table, and so on. The last hop must land on `scope_table`.

use crate::content::quote_ident;
use crate::db::ScopeLevel;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub column: String,
    pub table: String,
}

/// How rows of a table reach their owning scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeRelation {
    /// No owning scope (site-wide content); rows are tagged but never mapped.
    #[default]
    None,
    /// The table is the scope table; a row's id is its scope id.
    Scope,
    /// Follow foreign keys to the scope table.
    Via { hops: Vec<Hop> },
}

impl ScopeRelation {
    pub fn is_scoped(&self) -> bool {
        !matches!(self, ScopeRelation::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub level: ScopeLevel,
    #[serde(default)]
    pub scope: ScopeRelation,
}

impl TableSpec {
    /// Columns a scan has to read: the text fields plus the first hop's key.
    pub fn scan_columns(&self) -> Vec<String> {
        let mut columns = self.fields.clone();
        if let ScopeRelation::Via { hops } = &self.scope {
            if let Some(first) = hops.first() {
                if !columns.contains(&first.column) {
                    columns.push(first.column.clone());
                }
            }
        }
        columns
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRegistry {
    pub scope_table: String,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

impl TableRegistry {
    /// Load and validate a registry file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read registry file {}", path.display()))?;
        let registry = Self::from_json(&content)
            .with_context(|| format!("Invalid registry file {}", path.display()))?;
        info!(
            "Loaded registry with {} tables (scope table: {})",
            registry.tables.len(),
            registry.scope_table
        );
        Ok(registry)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let mut registry: TableRegistry =
            serde_json::from_str(content).context("Failed to parse registry JSON")?;
        registry.validate()?;
        registry.tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(registry)
    }

    /// Reject unusable names and duplicates; warn about chains that do not
    /// end on the scope table.
    pub fn validate(&self) -> Result<()> {
        quote_ident(&self.scope_table)?;

        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            quote_ident(&table.name)?;
            if !seen.insert(table.name.as_str()) {
                bail!("Table {} is registered twice", table.name);
            }
            if table.fields.is_empty() {
                bail!("Table {} has no fields to scan", table.name);
            }
            for field in &table.fields {
                quote_ident(field)?;
            }
            match &table.scope {
                ScopeRelation::Via { hops } if hops.is_empty() => {
                    bail!("Table {} has an empty foreign-key chain", table.name);
                }
                ScopeRelation::Via { hops } => {
                    for hop in hops {
                        quote_ident(&hop.column)?;
                        quote_ident(&hop.table)?;
                    }
                    if hops.last().map(|h| h.table.as_str()) != Some(self.scope_table.as_str()) {
                        warn!(
                            "Chain of {} ends on {} instead of scope table {}",
                            table.name,
                            hops.last().map(|h| h.table.as_str()).unwrap_or(""),
                            self.scope_table
                        );
                    }
                }
                ScopeRelation::Scope if table.name != self.scope_table => {
                    warn!(
                        "Table {} declares itself a scope but scope table is {}",
                        table.name, self.scope_table
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Tables in traversal order (sorted by name).
    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.name == name)
    }

    /// Tables whose rows can be attributed to a scope.
    pub fn scoped_tables(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.iter().filter(|t| t.scope.is_scoped())
    }
}
