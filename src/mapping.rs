use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A resolved reference to one column in one user-defined table.
///
/// An unmapped role resolves to an empty reference (blank `column_id`)
/// rather than an error, so callers can test emptiness uniformly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table_id: String,
    pub column_id: String,
}

impl ColumnRef {
    pub fn new(table_id: impl Into<String>, column_id: impl Into<String>) -> Self {
        Self {
            table_id: table_id.into(),
            column_id: column_id.into(),
        }
    }

    fn empty(fallback_table_id: &str) -> Self {
        Self::new(fallback_table_id, "")
    }

    pub fn is_mapped(&self) -> bool {
        !self.table_id.is_empty() && !self.column_id.is_empty()
    }
}

/// A role that spans several source columns which must be summed together,
/// e.g. multiple profit-amount columns on one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiColumnRef {
    pub table_id: String,
    pub column_ids: Vec<String>,
}

impl MultiColumnRef {
    fn empty(fallback_table_id: &str) -> Self {
        Self {
            table_id: fallback_table_id.to_string(),
            column_ids: Vec::new(),
        }
    }

    pub fn is_mapped(&self) -> bool {
        !self.table_id.is_empty() && !self.column_ids.is_empty()
    }
}

/// A template's persisted role→column bindings.
///
/// The raw mapping payload is duck-typed for backward compatibility: a
/// binding may be a bare column id string (legacy, resolved against the
/// fallback table), a `"tableId::columnId"` delimiter string, or a
/// structured object. All decode precedence lives here; consumers only
/// ever see the normalized `ColumnRef`/`MultiColumnRef` shapes.
#[derive(Debug, Clone, Default)]
pub struct TemplateMappings {
    mappings: serde_json::Map<String, Value>,
    fallback_table_id: String,
}

impl TemplateMappings {
    pub fn new(mappings: serde_json::Map<String, Value>, fallback_table_id: impl Into<String>) -> Self {
        Self {
            mappings,
            fallback_table_id: fallback_table_id.into(),
        }
    }

    /// Build from an arbitrary JSON value. Anything that is not an object
    /// degrades to an empty mapping set.
    pub fn from_value(raw: Value, fallback_table_id: impl Into<String>) -> Self {
        let mappings = match raw {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self::new(mappings, fallback_table_id)
    }

    pub fn fallback_table_id(&self) -> &str {
        &self.fallback_table_id
    }

    /// Resolve a role binding to a single column reference.
    ///
    /// Never fails: a missing or malformed binding degrades to an empty
    /// reference, which callers treat as "mapping not configured".
    pub fn resolve(&self, role: &str) -> ColumnRef {
        let raw = match self.mappings.get(role) {
            Some(v) => v,
            None => return ColumnRef::empty(&self.fallback_table_id),
        };
        match raw {
            Value::String(s) => self.decode_string(s),
            Value::Object(obj) => self.decode_object(obj),
            _ => ColumnRef::empty(&self.fallback_table_id),
        }
    }

    /// Resolve a role binding that may span several columns.
    ///
    /// Accepts an array of bindings, a comma/semicolon/newline-delimited
    /// string, or an object carrying `columnIds`/`column_ids` (a singular
    /// `columnId`/`column_id` is promoted to a one-element list).
    pub fn resolve_multi(&self, role: &str) -> MultiColumnRef {
        let raw = match self.mappings.get(role) {
            Some(v) => v,
            None => return MultiColumnRef::empty(&self.fallback_table_id),
        };
        match raw {
            Value::String(s) => {
                let mut table_id = self.fallback_table_id.clone();
                let mut column_ids = Vec::new();
                for piece in s.split(|c| c == ',' || c == ';' || c == '\n') {
                    let piece = piece.trim();
                    if piece.is_empty() {
                        continue;
                    }
                    let r = self.decode_string(piece);
                    if r.is_mapped() {
                        table_id = r.table_id;
                        column_ids.push(r.column_id);
                    }
                }
                MultiColumnRef { table_id, column_ids }
            }
            Value::Array(items) => {
                let mut table_id = self.fallback_table_id.clone();
                let mut column_ids = Vec::new();
                for item in items {
                    let r = match item {
                        Value::String(s) => self.decode_string(s),
                        Value::Object(obj) => self.decode_object(obj),
                        _ => continue,
                    };
                    if r.is_mapped() {
                        table_id = r.table_id;
                        column_ids.push(r.column_id);
                    }
                }
                MultiColumnRef { table_id, column_ids }
            }
            Value::Object(obj) => {
                let table_id = str_field(obj, &["tableId", "table_id"])
                    .unwrap_or_else(|| self.fallback_table_id.clone());
                let mut column_ids: Vec<String> = Vec::new();
                if let Some(ids) = obj.get("columnIds").or_else(|| obj.get("column_ids")) {
                    if let Value::Array(items) = ids {
                        for item in items {
                            if let Value::String(s) = item {
                                if !s.trim().is_empty() {
                                    column_ids.push(s.trim().to_string());
                                }
                            }
                        }
                    }
                }
                if column_ids.is_empty() {
                    if let Some(single) = str_field(obj, &["columnId", "column_id"]) {
                        if !single.is_empty() {
                            column_ids.push(single);
                        }
                    }
                }
                MultiColumnRef { table_id, column_ids }
            }
            _ => MultiColumnRef::empty(&self.fallback_table_id),
        }
    }

    /// Roles from `roles` whose bindings resolve empty.
    pub fn missing_roles(&self, roles: &[&str]) -> Vec<String> {
        roles
            .iter()
            .filter(|r| !self.resolve(r).is_mapped())
            .map(|r| r.to_string())
            .collect()
    }

    /// Fail fast with a configuration error when any required role is
    /// unmapped. Runs before any network call.
    pub fn require(&self, roles: &[&str]) -> Result<()> {
        let missing = self.missing_roles(roles);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::missing_roles(missing))
        }
    }

    fn decode_string(&self, s: &str) -> ColumnRef {
        let s = s.trim();
        if let Some((table, column)) = s.split_once("::") {
            return ColumnRef::new(table, column);
        }
        ColumnRef::new(&self.fallback_table_id, s)
    }

    fn decode_object(&self, obj: &serde_json::Map<String, Value>) -> ColumnRef {
        let table_id = str_field(obj, &["tableId", "table_id"])
            .unwrap_or_else(|| self.fallback_table_id.clone());
        let column_id = str_field(obj, &["columnId", "column_id"]).unwrap_or_default();
        ColumnRef::new(table_id, column_id)
    }
}

fn str_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(Value::String(s)) = obj.get(*key) {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}
