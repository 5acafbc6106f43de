use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::libs::error::{Result, TablesmithError};

/// A single stored value, typed by the storage class it was read with.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl CellValue {
    /// Converts a caller-supplied JSON value.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(CellValue::Null),
            Value::Bool(b) => Ok(CellValue::Integer(i64::from(*b))),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(CellValue::Integer(i)),
                None => n
                    .as_f64()
                    .map(CellValue::Real)
                    .ok_or_else(|| TablesmithError::invalid(format!("unrepresentable number {n}"))),
            },
            Value::String(s) => Ok(CellValue::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| TablesmithError::invalid("binary values must be arrays of bytes"))
                })
                .collect::<Result<Vec<u8>>>()
                .map(CellValue::Blob),
            Value::Object(_) => Err(TablesmithError::invalid("nested objects cannot be stored")),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub(crate) fn bind_to<'q>(
        &'q self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            CellValue::Null => query.bind(None::<String>),
            CellValue::Integer(v) => query.bind(*v),
            CellValue::Real(v) => query.bind(*v),
            CellValue::Text(v) => query.bind(v.as_str()),
            CellValue::Blob(v) => query.bind(v.as_slice()),
        }
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Integer(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Real(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::Text(v)
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            CellValue::Null => serializer.serialize_unit(),
            CellValue::Integer(v) => serializer.serialize_i64(*v),
            CellValue::Real(v) => serializer.serialize_f64(*v),
            CellValue::Text(v) => serializer.serialize_str(v),
            CellValue::Blob(v) => v.serialize(serializer),
        }
    }
}

/// One retrieved record, columns in result order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowSnapshot {
    values: Vec<(String, CellValue)>,
}

impl RowSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: CellValue) {
        self.values.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.values.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.values.iter().map(|(name, v)| (name.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn decode(row: &SqliteRow) -> Result<Self> {
        let mut snapshot = RowSnapshot { values: Vec::with_capacity(row.len()) };
        for column in row.columns() {
            let i = column.ordinal();
            let raw = row.try_get_raw(i)?;
            let class = if raw.is_null() {
                StorageClass::Null
            } else {
                StorageClass::from_type_name(raw.type_info().name())
            };
            let value = match class {
                StorageClass::Null => CellValue::Null,
                StorageClass::Integer => CellValue::Integer(row.try_get(i)?),
                StorageClass::Real => CellValue::Real(row.try_get(i)?),
                StorageClass::Blob => CellValue::Blob(row.try_get(i)?),
                StorageClass::Text => CellValue::Text(lossy_text(row.try_get_unchecked(i)?)),
            };
            snapshot.push(column.name(), value);
        }
        Ok(snapshot)
    }
}

impl Serialize for RowSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<K: Into<String>> FromIterator<(K, CellValue)> for RowSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, CellValue)>>(iter: I) -> Self {
        RowSnapshot { values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect() }
    }
}

/// Text cells are not guaranteed to hold valid UTF-8; bad sequences become
/// U+FFFD instead of failing the whole read.
fn lossy_text(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes)
        .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

#[derive(Debug, Clone, Copy)]
enum StorageClass {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

impl StorageClass {
    fn from_type_name(name: &str) -> Self {
        match name {
            "NULL" => StorageClass::Null,
            "INTEGER" | "BOOLEAN" => StorageClass::Integer,
            "REAL" => StorageClass::Real,
            "BLOB" => StorageClass::Blob,
            _ => StorageClass::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_conversion() {
        assert_eq!(CellValue::from_json(&json!(null)).unwrap(), CellValue::Null);
        assert_eq!(CellValue::from_json(&json!(true)).unwrap(), CellValue::Integer(1));
        assert_eq!(CellValue::from_json(&json!(42)).unwrap(), CellValue::Integer(42));
        assert_eq!(CellValue::from_json(&json!(1.5)).unwrap(), CellValue::Real(1.5));
        assert_eq!(CellValue::from_json(&json!("Eve")).unwrap(), CellValue::Text("Eve".into()));
        assert_eq!(CellValue::from_json(&json!([0, 255])).unwrap(), CellValue::Blob(vec![0, 255]));
    }

    #[test]
    fn rejects_unstorable_json() {
        assert!(CellValue::from_json(&json!({"a": 1})).is_err());
        assert!(CellValue::from_json(&json!([256])).is_err());
        assert!(CellValue::from_json(&json!(["x"])).is_err());
    }

    #[test]
    fn invalid_utf8_text_is_replaced() {
        assert_eq!(lossy_text(b"plain".to_vec()), "plain");
        assert_eq!(lossy_text(vec![b'a', 0xff, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn row_serializes_in_column_order() {
        let row: RowSnapshot = vec![
            ("zeta", CellValue::Integer(1)),
            ("alpha", CellValue::Null),
            ("data", CellValue::Blob(vec![7])),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"zeta":1,"alpha":null,"data":[7]}"#
        );
        assert_eq!(row.get("alpha"), Some(&CellValue::Null));
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["zeta", "alpha", "data"]);
    }
}
