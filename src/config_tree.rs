//! The system configuration table seen as one nested tree.
//!
//! Rows of `core_config_data(config_id, scope, scope_id, path, value)` are
//! placed at `scope → scope_id → path segments`, walked in one pass, and
//! only the leaves whose value changed are written back.

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::encryptor::SecretCipher;
use crate::error::Result;
use crate::scanner::CONFIG_TABLE;
use crate::storage::sqlite::quote_ident;
use crate::storage::{ColumnRef, MemoryStore, SecretStore, SqliteStore};
use crate::walker::{StructuralReencryptor, WalkStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRow {
    pub config_id: i64,
    pub scope: String,
    pub scope_id: i64,
    pub path: String,
    pub value: Option<String>,
}

/// Stores that can list the system configuration rows.
pub trait ConfigRows {
    /// Every row ordered by `config_id`; empty when the table is absent.
    fn config_rows(&self) -> Result<Vec<ConfigRow>>;
}

impl ConfigRows for SqliteStore {
    fn config_rows(&self) -> Result<Vec<ConfigRow>> {
        if !self.table_exists(CONFIG_TABLE)? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT config_id, scope, scope_id, path, value FROM {} ORDER BY config_id",
            quote_ident(CONFIG_TABLE)
        );
        let conn = self.connection();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ConfigRow {
                    config_id: row.get(0)?,
                    scope: row.get(1)?,
                    scope_id: row.get(2)?,
                    path: row.get(3)?,
                    value: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl ConfigRows for MemoryStore {
    fn config_rows(&self) -> Result<Vec<ConfigRow>> {
        if !self.table_exists(CONFIG_TABLE)? {
            return Ok(Vec::new());
        }
        let scopes = self.snapshot(CONFIG_TABLE, "scope");
        let scope_ids = self.snapshot(CONFIG_TABLE, "scope_id");
        let paths = self.snapshot(CONFIG_TABLE, "path");
        let values = self.snapshot(CONFIG_TABLE, "value");
        Ok(scopes
            .into_iter()
            .zip(scope_ids)
            .zip(paths)
            .zip(values)
            .map(|(((scope, scope_id), path), value)| ConfigRow {
                config_id: scope.id,
                scope: scope.value.unwrap_or_else(|| "default".into()),
                scope_id: scope_id
                    .value
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default(),
                path: path.value.unwrap_or_default(),
                value: value.value,
            })
            .collect())
    }
}

// ============================================================================
// ConfigTree
// ============================================================================

#[derive(Debug, Clone)]
enum Location {
    Tree(Vec<String>),
    /// Path collides with another row's path; walked on its own.
    Detached(usize),
}

#[derive(Debug, Clone)]
struct Leaf {
    config_id: i64,
    original: String,
    location: Location,
}

#[derive(Debug, Clone)]
pub struct ConfigTree {
    tree: Value,
    detached: Vec<Value>,
    leaves: Vec<Leaf>,
}

impl ConfigTree {
    pub fn build(rows: Vec<ConfigRow>) -> Self {
        let mut tree = Value::Object(Map::new());
        let mut detached = Vec::new();
        let mut leaves = Vec::new();

        for row in rows {
            let Some(value) = row.value else { continue };
            let mut key_path = vec![row.scope, row.scope_id.to_string()];
            key_path.extend(row.path.split('/').filter(|s| !s.is_empty()).map(str::to_string));

            let location = if insert_leaf(&mut tree, &key_path, &value) {
                Location::Tree(key_path)
            } else {
                warn!(config_id = row.config_id, "config path collides, walking it separately");
                detached.push(Value::String(value.clone()));
                Location::Detached(detached.len() - 1)
            };
            leaves.push(Leaf {
                config_id: row.config_id,
                original: value,
                location,
            });
        }
        Self {
            tree,
            detached,
            leaves,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.tree
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Re-encrypt every stale leaf in place.
    pub fn reencrypt<C: SecretCipher + ?Sized>(&mut self, cipher: &C) -> WalkStats {
        let mut walker = StructuralReencryptor::new(cipher);
        walker.walk_in_place(&mut self.tree);
        for value in &mut self.detached {
            walker.walk_in_place(value);
        }
        walker.stats()
    }

    /// `(config_id, value)` for every leaf that differs from what was loaded.
    pub fn changes(&self) -> Vec<(i64, String)> {
        self.leaves
            .iter()
            .filter_map(|leaf| {
                let current = match &leaf.location {
                    Location::Tree(path) => path.iter().try_fold(&self.tree, |n, k| n.get(k)),
                    Location::Detached(i) => self.detached.get(*i),
                }?
                .as_str()?;
                (current != leaf.original).then(|| (leaf.config_id, current.to_string()))
            })
            .collect()
    }
}

/// Place `value` at `path`. Returns false when the path is already taken or
/// runs through a scalar.
fn insert_leaf(root: &mut Value, path: &[String], value: &str) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut node = root;
    for key in parents {
        let Some(map) = node.as_object_mut() else {
            return false;
        };
        node = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    match node.as_object_mut() {
        Some(map) if !map.contains_key(last) => {
            map.insert(last.clone(), Value::String(value.to_string()));
            true
        }
        _ => false,
    }
}

// ============================================================================
// SystemConfigTable
// ============================================================================

pub struct SystemConfigTable<'s, S> {
    store: &'s S,
}

impl<'s, S: SecretStore + ConfigRows> SystemConfigTable<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Result<ConfigTree> {
        Ok(ConfigTree::build(self.store.config_rows()?))
    }

    /// Write back changed leaves in one transaction; returns how many.
    pub fn save(&self, tree: &ConfigTree) -> Result<usize> {
        let changes = tree.changes();
        if changes.is_empty() {
            return Ok(0);
        }
        let column = ColumnRef::new(CONFIG_TABLE, "config_id", "value")?;
        self.store.transaction(|store| {
            for (config_id, value) in &changes {
                store.update_value(&column, *config_id, value)?;
            }
            Ok(())
        })?;
        info!(updated = changes.len(), "saved system configuration");
        Ok(changes.len())
    }
}
