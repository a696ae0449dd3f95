//! Foreign-key walks between content rows and their owning scope.

use crate::content::{ContentRow, ContentStore};
use crate::registry::{ScopeRelation, TableSpec};
use anyhow::Result;
use std::collections::HashMap;
use tracing::debug;

/// Resolves rows to scopes, remembering the answer for each first-hop key.
///
/// Sibling rows usually share a parent, so a page of rows costs one walk per
/// distinct parent instead of one per row.
#[derive(Default)]
pub struct ScopeResolver {
    cache: HashMap<(String, i64), Option<i64>>,
}

impl ScopeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owning scope of `row`, or `None` when the chain breaks.
    ///
    /// Store errors (missing table or column) are returned to the caller.
    pub fn resolve(
        &mut self,
        store: &dyn ContentStore,
        spec: &TableSpec,
        row: &ContentRow,
    ) -> Result<Option<i64>> {
        match &spec.scope {
            ScopeRelation::None => Ok(None),
            ScopeRelation::Scope => Ok(Some(row.id)),
            ScopeRelation::Via { hops } => {
                let Some(first) = hops.first() else {
                    return Ok(None);
                };
                let Some(key) = row.int(&first.column).filter(|v| *v > 0) else {
                    return Ok(None);
                };

                let cache_key = (spec.name.clone(), key);
                if let Some(cached) = self.cache.get(&cache_key) {
                    return Ok(*cached);
                }

                let resolved = resolve_scope(store, spec, row)?;
                self.cache.insert(cache_key, resolved);
                Ok(resolved)
            }
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Walk `spec`'s chain from `row` to the scope table.
///
/// Returns `None` when a key is empty or non-positive, or a row along the way
/// (the scope row included) does not exist.
pub fn resolve_scope(
    store: &dyn ContentStore,
    spec: &TableSpec,
    row: &ContentRow,
) -> Result<Option<i64>> {
    let hops = match &spec.scope {
        ScopeRelation::None => return Ok(None),
        ScopeRelation::Scope => return Ok(Some(row.id)),
        ScopeRelation::Via { hops } => hops,
    };

    let Some(first) = hops.first() else {
        return Ok(None);
    };
    let mut current = match row.int(&first.column) {
        Some(id) if id > 0 => id,
        _ => return Ok(None),
    };

    // hops[i - 1].table holds the row whose hops[i].column leads on.
    for pair in hops.windows(2) {
        let (holder, next) = (&pair[0], &pair[1]);
        let rows = store.read_rows(&holder.table, std::slice::from_ref(&next.column), &[current])?;
        current = match rows.first().and_then(|r| r.int(&next.column)) {
            Some(id) if id > 0 => id,
            _ => {
                debug!(
                    "Chain of {} broken at {} id {} (column {})",
                    spec.name, holder.table, current, next.column
                );
                return Ok(None);
            }
        };
    }

    let scope_table = &hops[hops.len() - 1].table;
    if store.existing_ids(scope_table, &[current])?.contains(&current) {
        Ok(Some(current))
    } else {
        debug!("Scope {} of {} row {} no longer exists", current, spec.name, row.id);
        Ok(None)
    }
}

/// Ids of `spec`'s rows that belong to `scope_id`, ascending.
///
/// Reverse of [`resolve_scope`]: starts from the scope and follows each hop
/// backwards with `ids_where`.
pub fn rows_in_scope(store: &dyn ContentStore, spec: &TableSpec, scope_id: i64) -> Result<Vec<i64>> {
    match &spec.scope {
        ScopeRelation::None => Ok(Vec::new()),
        ScopeRelation::Scope => {
            let existing = store.existing_ids(&spec.name, &[scope_id])?;
            Ok(existing.into_iter().collect())
        }
        ScopeRelation::Via { hops } => {
            let mut ids = vec![scope_id];
            for i in (0..hops.len()).rev() {
                let holder = if i == 0 { spec.name.as_str() } else { hops[i - 1].table.as_str() };
                ids = store.ids_where(holder, &hops[i].column, &ids)?;
                if ids.is_empty() {
                    break;
                }
            }
            Ok(ids)
        }
    }
}
