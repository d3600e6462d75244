// ABOUTME: Table and column definitions for the replicated table pair
// ABOUTME: Decides which columns key a row in the target mirror

use serde::Deserialize;

/// Column added to the target when the source declares no primary key; it
/// holds the source's internal row id.
pub const INTERNAL_ID_COLUMN: &str = "internal_id";

/// A simplified column definition: name, source SQL type and key membership.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnDefinition {
    pub name: String,
    pub sql_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnDefinition {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            nullable: false,
            primary_key: false,
        }
    }
}

/// How rows of the mirror table are addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// The source's declared primary-key columns.
    PrimaryKey(Vec<String>),
    /// The source's internal row id, stored in [`INTERNAL_ID_COLUMN`].
    InternalId,
}

impl KeyStrategy {
    pub fn columns(&self) -> Vec<String> {
        match self {
            KeyStrategy::PrimaryKey(columns) => columns.clone(),
            KeyStrategy::InternalId => vec![INTERNAL_ID_COLUMN.to_string()],
        }
    }
}

/// The source table as the change stream presents it: columns in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
        }
    }

    /// Builder-style column addition.
    pub fn column(mut self, name: &str, sql_type: &str, nullable: bool, primary_key: bool) -> Self {
        self.columns.push(ColumnDefinition {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            nullable,
            primary_key,
        });
        self
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn key_strategy(&self) -> KeyStrategy {
        let keys: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect();
        if keys.is_empty() {
            KeyStrategy::InternalId
        } else {
            KeyStrategy::PrimaryKey(keys)
        }
    }

    /// Check the definition is usable: non-empty, unique names, no clash with
    /// the synthetic key column.
    pub fn verify(&self) -> Result<(), String> {
        if self.columns.is_empty() {
            return Err(format!("table {} has no columns", self.name));
        }
        for (idx, column) in self.columns.iter().enumerate() {
            if column.name.is_empty() || column.sql_type.is_empty() {
                return Err(format!(
                    "table {} has a column with an empty name or type",
                    self.name
                ));
            }
            if self.columns[..idx].iter().any(|c| c.name == column.name) {
                return Err(format!(
                    "table {} contains more than one column named {}",
                    self.name, column.name
                ));
            }
        }
        if self.key_strategy() == KeyStrategy::InternalId
            && self.columns.iter().any(|c| c.name == INTERNAL_ID_COLUMN)
        {
            return Err(format!(
                "table {} has no primary key and already uses the column name {}",
                self.name, INTERNAL_ID_COLUMN
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_strategy_falls_back_to_internal_id() {
        let table = TableDefinition::new("x_table").column("foo", "int", false, false);
        assert_eq!(table.key_strategy(), KeyStrategy::InternalId);
        assert_eq!(table.key_strategy().columns(), vec!["internal_id"]);
    }

    #[test]
    fn test_key_strategy_uses_primary_key() {
        let table = TableDefinition::new("orders")
            .column("order_id", "bigint", false, true)
            .column("item_id", "bigint", false, true)
            .column("qty", "int", true, false);
        assert_eq!(
            table.key_strategy(),
            KeyStrategy::PrimaryKey(vec!["order_id".into(), "item_id".into()])
        );
    }

    #[test]
    fn test_verify_rejects_duplicates_and_empty() {
        assert!(TableDefinition::new("t").verify().is_err());
        let dup = TableDefinition::new("t")
            .column("a", "int", false, false)
            .column("a", "text", false, false);
        assert!(dup.verify().unwrap_err().contains("more than one column"));
        let clash = TableDefinition::new("t").column("internal_id", "int", false, false);
        assert!(clash.verify().is_err());
        let ok = TableDefinition::new("t").column("id", "int", false, true);
        assert!(ok.verify().is_ok());
    }
}
