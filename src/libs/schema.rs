// schema.rs
use serde::{Deserialize, Serialize, Serializer};

/// The fixed type vocabulary every declared column type is normalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(from = "String")]
pub enum ColumnType {
    #[default]
    Text,
    Integer,
    Real,
    Blob,
}

impl ColumnType {
    /// Total mapping from a declared type string to the vocabulary.
    ///
    /// Checked in order: `INT` anywhere is integer, then `REAL`, `FLOA` or
    /// `DOUB` is real, then `BLOB` is binary. Anything else, including an
    /// empty declaration, is text.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            ColumnType::Real
        } else if upper.contains("BLOB") {
            ColumnType::Blob
        } else {
            ColumnType::Text
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
        }
    }
}

impl From<String> for ColumnType {
    fn from(declared: String) -> Self {
        ColumnType::from_declared(&declared)
    }
}

impl Serialize for ColumnType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_sql())
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Declaration as written in the schema, possibly empty.
    pub declared_type: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    /// Zero-based position; defines display and insert order.
    pub ordinal: usize,
}

/// Where a table's identity column came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Declared,
    Inferred,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    /// Declared key columns in key order, or the first column when the table
    /// declares none.
    pub primary_key: Vec<String>,
    pub key_source: KeySource,
    pub row_count: u64,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Column used to target a single row for deletion.
    ///
    /// With a composite declared key this is the first key column, so deletes
    /// may hit more than one row; the same holds for an inferred key.
    pub fn identity_column(&self) -> Option<&str> {
        self.primary_key.first().map(String::as_str)
    }

    pub fn is_declared_key(&self, column: &str) -> bool {
        self.key_source == KeySource::Declared
            && self.primary_key.iter().any(|k| k.eq_ignore_ascii_case(column))
    }
}

/// Looks a table up by exact name, falling back to the engine's
/// case-insensitive identifier matching.
pub fn find_table<'a>(catalog: &'a [TableDescriptor], name: &str) -> Option<&'a TableDescriptor> {
    catalog
        .iter()
        .find(|t| t.name == name)
        .or_else(|| catalog.iter().find(|t| t.name.eq_ignore_ascii_case(name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, ordinal: usize) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            declared_type: String::new(),
            column_type: ColumnType::Text,
            nullable: true,
            ordinal,
        }
    }

    #[test]
    fn type_affinity_prefixes() {
        assert_eq!(ColumnType::from_declared("INTEGER"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("bigint"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("UNSIGNED BIG INT"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("real"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared("FLOAT"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared("DOUBLE PRECISION"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared("BLOB"), ColumnType::Blob);
        assert_eq!(ColumnType::from_declared("VARCHAR(255)"), ColumnType::Text);
        assert_eq!(ColumnType::from_declared("NUMERIC"), ColumnType::Text);
        assert_eq!(ColumnType::from_declared(""), ColumnType::Text);
    }

    #[test]
    fn int_wins_over_later_rules() {
        // "POINT" contains "INT"
        assert_eq!(ColumnType::from_declared("POINT"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("INT_BLOB"), ColumnType::Integer);
    }

    #[test]
    fn deserializes_from_any_declaration() {
        let ty: ColumnType = serde_json::from_str("\"double\"").unwrap();
        assert_eq!(ty, ColumnType::Real);
        assert_eq!(serde_json::to_string(&ColumnType::Blob).unwrap(), "\"BLOB\"");
    }

    #[test]
    fn identity_and_lookup() {
        let table = TableDescriptor {
            name: "Users".into(),
            columns: vec![column("id", 0), column("name", 1)],
            primary_key: vec!["id".into()],
            key_source: KeySource::Inferred,
            row_count: 0,
        };
        assert_eq!(table.identity_column(), Some("id"));
        assert!(!table.is_declared_key("id"));
        assert_eq!(table.column("NAME").map(|c| c.ordinal), Some(1));

        let catalog = vec![table];
        assert!(find_table(&catalog, "users").is_some());
        assert!(find_table(&catalog, "orders").is_none());
    }
}
