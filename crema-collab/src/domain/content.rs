//! Editable table content held by a domain.
//!
//! Rows are addressed by their key values. Every batch operation validates
//! all rows before touching anything, so a batch is applied completely or
//! not at all.

use crema_core::DomainRowInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path};

use crate::error::{CremaError, Result};

/// One stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRow {
    pub keys: Vec<Value>,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainTable {
    /// Allowed field names; empty accepts any field.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Names of the key columns; empty accepts any key arity.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Rows by encoded key.
    #[serde(default)]
    pub rows: BTreeMap<String, DomainRow>,
}

impl DomainTable {
    pub fn new(columns: Vec<String>, keys: Vec<String>) -> Self {
        Self {
            columns,
            keys,
            rows: BTreeMap::new(),
        }
    }

    pub fn row(&self, keys: &[Value]) -> Option<&DomainRow> {
        self.rows.get(&row_key(keys))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn check_keys(&self, table_name: &str, keys: &[Value]) -> Result<()> {
        if keys.is_empty() {
            return Err(CremaError::InvalidArgument(format!(
                "row of table '{table_name}' has no keys"
            )));
        }
        if !self.keys.is_empty() && self.keys.len() != keys.len() {
            return Err(CremaError::InvalidArgument(format!(
                "table '{table_name}' expects {} key(s), got {}",
                self.keys.len(),
                keys.len()
            )));
        }
        Ok(())
    }

    fn check_fields(&self, table_name: &str, fields: &Map<String, Value>) -> Result<()> {
        if self.columns.is_empty() {
            return Ok(());
        }
        match fields.keys().find(|name| !self.columns.contains(name)) {
            Some(name) => Err(CremaError::InvalidArgument(format!(
                "table '{table_name}' has no column '{name}'"
            ))),
            None => Ok(()),
        }
    }
}

/// Content of one domain: named tables plus free-form properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainContent {
    #[serde(default)]
    pub tables: BTreeMap<String, DomainTable>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl DomainContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, table: DomainTable) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&DomainTable> {
        self.tables.get(name)
    }

    /// Every table name must be usable as a single file name.
    pub fn validate(&self) -> Result<()> {
        self.tables.keys().try_for_each(|name| check_table_name(name))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    // ─── Row operations ───────────────────────────────────────────────

    pub fn check_new_rows(&self, rows: &[DomainRowInfo]) -> Result<()> {
        let mut seen = HashSet::new();
        for row in rows {
            let table = self.table_of(row)?;
            table.check_keys(&row.table_name, &row.keys)?;
            table.check_fields(&row.table_name, &row.fields)?;
            let key = row_key(&row.keys);
            if table.rows.contains_key(&key) || !seen.insert((row.table_name.as_str(), key)) {
                return Err(CremaError::InvalidArgument(format!(
                    "row {} already exists in table '{}'",
                    Value::Array(row.keys.clone()),
                    row.table_name
                )));
            }
        }
        Ok(())
    }

    /// Insert rows. Returns the stored rows.
    pub fn new_rows(&mut self, rows: &[DomainRowInfo]) -> Result<Vec<DomainRowInfo>> {
        self.check_new_rows(rows)?;
        let mut added = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = DomainRow {
                keys: row.keys.clone(),
                fields: row.fields.clone(),
            };
            if let Some(table) = self.tables.get_mut(&row.table_name) {
                table.rows.insert(row_key(&row.keys), stored);
            }
            added.push(row.clone());
        }
        Ok(added)
    }

    pub fn check_set_rows(&self, rows: &[DomainRowInfo]) -> Result<()> {
        for row in rows {
            let table = self.table_of(row)?;
            table.check_fields(&row.table_name, &row.fields)?;
            self.existing_row(table, row)?;
        }
        Ok(())
    }

    /// Merge fields into existing rows. Returns the rows after the merge.
    pub fn set_rows(&mut self, rows: &[DomainRowInfo]) -> Result<Vec<DomainRowInfo>> {
        self.check_set_rows(rows)?;
        let mut changed = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(stored) = self
                .tables
                .get_mut(&row.table_name)
                .and_then(|table| table.rows.get_mut(&row_key(&row.keys)))
            else {
                continue;
            };
            for (name, value) in &row.fields {
                stored.fields.insert(name.clone(), value.clone());
            }
            changed.push(DomainRowInfo {
                table_name: row.table_name.clone(),
                keys: stored.keys.clone(),
                fields: stored.fields.clone(),
            });
        }
        Ok(changed)
    }

    pub fn check_remove_rows(&self, rows: &[DomainRowInfo]) -> Result<()> {
        let mut seen = HashSet::new();
        for row in rows {
            let table = self.table_of(row)?;
            self.existing_row(table, row)?;
            if !seen.insert((row.table_name.as_str(), row_key(&row.keys))) {
                return Err(CremaError::InvalidArgument(format!(
                    "row {} is removed twice",
                    Value::Array(row.keys.clone())
                )));
            }
        }
        Ok(())
    }

    /// Remove rows. Returns the removed rows with their last field values.
    pub fn remove_rows(&mut self, rows: &[DomainRowInfo]) -> Result<Vec<DomainRowInfo>> {
        self.check_remove_rows(rows)?;
        let mut removed = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(stored) = self
                .tables
                .get_mut(&row.table_name)
                .and_then(|table| table.rows.remove(&row_key(&row.keys)))
            else {
                continue;
            };
            removed.push(DomainRowInfo {
                table_name: row.table_name.clone(),
                keys: stored.keys,
                fields: stored.fields,
            });
        }
        Ok(removed)
    }

    pub fn check_property(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(CremaError::InvalidArgument("property name is empty".into()));
        }
        Ok(())
    }

    pub fn set_property(&mut self, name: &str, value: Value) -> Result<()> {
        self.check_property(name)?;
        self.properties.insert(name.to_string(), value);
        Ok(())
    }

    fn table_of(&self, row: &DomainRowInfo) -> Result<&DomainTable> {
        self.tables
            .get(&row.table_name)
            .ok_or_else(|| CremaError::ItemNotFound(format!("table '{}'", row.table_name)))
    }

    fn existing_row<'t>(&self, table: &'t DomainTable, row: &DomainRowInfo) -> Result<&'t DomainRow> {
        table.row(&row.keys).ok_or_else(|| {
            CremaError::ItemNotFound(format!(
                "row {} in table '{}'",
                Value::Array(row.keys.clone()),
                row.table_name
            ))
        })
    }
}

/// Stable map key for a list of key values.
fn row_key(keys: &[Value]) -> String {
    Value::Array(keys.to_vec()).to_string()
}

/// A table name is stored as `<name>.json` next to its siblings, so it must
/// be exactly one plain path component.
pub fn check_table_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    );
    if !single || name.contains(['/', '\\']) || name.starts_with('_') {
        return Err(CremaError::InvalidArgument(format!("invalid table name '{name}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content() -> DomainContent {
        DomainContent::new().with_table(
            "Items",
            DomainTable::new(vec!["Name".into(), "Price".into()], vec!["Id".into()]),
        )
    }

    fn item(id: i64, name: &str) -> DomainRowInfo {
        DomainRowInfo::new("Items", vec![json!(id)]).with_field("Name", json!(name))
    }

    #[test]
    fn test_new_rows() {
        let mut content = content();
        let added = content.new_rows(&[item(1, "apple"), item(2, "pear")]).unwrap();
        assert_eq!(added.len(), 2);
        let table = content.table("Items").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.row(&[json!(2)]).unwrap().fields["Name"], json!("pear"));
    }

    #[test]
    fn test_failing_row_rolls_back_batch() {
        let mut content = content();
        content.new_rows(&[item(1, "apple")]).unwrap();
        let err = content.new_rows(&[item(2, "pear"), item(1, "again")]).unwrap_err();
        assert!(matches!(err, CremaError::InvalidArgument(_)));
        assert_eq!(content.table("Items").unwrap().len(), 1);

        let err = content.new_rows(&[item(3, "fig"), item(3, "fig")]).unwrap_err();
        assert!(matches!(err, CremaError::InvalidArgument(_)));
        assert_eq!(content.table("Items").unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_table_and_column() {
        let mut content = content();
        let err = content
            .new_rows(&[DomainRowInfo::new("Missing", vec![json!(1)])])
            .unwrap_err();
        assert!(matches!(err, CremaError::ItemNotFound(_)));

        let bad = DomainRowInfo::new("Items", vec![json!(1)]).with_field("Color", json!("red"));
        assert!(matches!(content.new_rows(&[bad]).unwrap_err(), CremaError::InvalidArgument(_)));

        let no_keys = DomainRowInfo::new("Items", Vec::new());
        assert!(matches!(content.new_rows(&[no_keys]).unwrap_err(), CremaError::InvalidArgument(_)));
    }

    #[test]
    fn test_set_rows_merges_fields() {
        let mut content = content();
        content.new_rows(&[item(1, "apple")]).unwrap();
        let change = DomainRowInfo::new("Items", vec![json!(1)]).with_field("Price", json!(3));
        let changed = content.set_rows(&[change]).unwrap();
        assert_eq!(changed[0].fields["Name"], json!("apple"));
        assert_eq!(changed[0].fields["Price"], json!(3));

        let missing = DomainRowInfo::new("Items", vec![json!(9)]).with_field("Price", json!(1));
        assert!(matches!(content.set_rows(&[missing]).unwrap_err(), CremaError::ItemNotFound(_)));
    }

    #[test]
    fn test_remove_rows() {
        let mut content = content();
        content.new_rows(&[item(1, "apple"), item(2, "pear")]).unwrap();
        let removed = content
            .remove_rows(&[DomainRowInfo::new("Items", vec![json!(1)])])
            .unwrap();
        assert_eq!(removed[0].fields["Name"], json!("apple"));
        assert_eq!(content.table("Items").unwrap().len(), 1);

        let twice = DomainRowInfo::new("Items", vec![json!(2)]);
        assert!(content.remove_rows(&[twice.clone(), twice]).is_err());
        assert_eq!(content.table("Items").unwrap().len(), 1);
    }

    #[test]
    fn test_properties() {
        let mut content = content();
        content.set_property("Comment", json!("draft")).unwrap();
        assert_eq!(content.properties["Comment"], json!("draft"));
        assert!(content.set_property(" ", json!(1)).is_err());
        assert_eq!(content.to_value()["properties"]["Comment"], json!("draft"));
    }

    #[test]
    fn test_table_names_are_single_components() {
        assert!(content().validate().is_ok());
        for name in ["", ".", "..", "../../escaped", "a/b", "a\\b", "/abs", "_properties"] {
            let bad = content().with_table(name, DomainTable::default());
            assert!(
                matches!(bad.validate(), Err(CremaError::InvalidArgument(_))),
                "{name:?} accepted"
            );
        }
    }
}
