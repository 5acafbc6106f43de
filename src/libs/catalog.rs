//! Runtime schema discovery.
//!
//! Nothing here is cached: every call reads the live schema so callers always
//! see the effect of the last structural change.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::libs::error::{Result, TablesmithError};
use crate::libs::schema::{ColumnDescriptor, ColumnType, KeySource, TableDescriptor};
use crate::libs::statement::{quote_identifier, LIST_TABLES_SQL};

const TABLE_INFO_SQL: &str =
    r#"SELECT name, type, "notnull", pk FROM pragma_table_info(?1) ORDER BY cid"#;

#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    /// User tables in declaration order, internal `sqlite_` and shadow tables
    /// excluded.
    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn describe_table(&self, name: &str) -> Result<TableDescriptor>;

    async fn introspect(&self) -> Result<Vec<TableDescriptor>> {
        let names = self.list_tables().await?;
        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            tables.push(self.describe_table(&name).await?);
        }
        Ok(tables)
    }
}

#[async_trait]
impl SchemaCatalog for SqlitePool {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(LIST_TABLES_SQL)
            .fetch_all(self)
            .await
            .map_err(unreadable)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(unreadable))
            .collect()
    }

    async fn describe_table(&self, name: &str) -> Result<TableDescriptor> {
        let names = self.list_tables().await?;
        let name = names
            .iter()
            .find(|n| n.as_str() == name)
            .or_else(|| names.iter().find(|n| n.eq_ignore_ascii_case(name)))
            .cloned()
            .ok_or_else(|| TablesmithError::TableNotFound(name.to_string()))?;

        let info = sqlx::query(TABLE_INFO_SQL)
            .bind(name.as_str())
            .fetch_all(self)
            .await
            .map_err(unreadable)?;

        let mut columns = Vec::with_capacity(info.len());
        let mut declared_key: Vec<(i64, String)> = Vec::new();
        for (ordinal, row) in info.iter().enumerate() {
            let column_name: String = row.try_get("name").map_err(unreadable)?;
            let declared_type: Option<String> = row.try_get("type").map_err(unreadable)?;
            let not_null: i64 = row.try_get("notnull").map_err(unreadable)?;
            let pk: i64 = row.try_get("pk").map_err(unreadable)?;

            let declared_type = declared_type.unwrap_or_default();
            if pk > 0 {
                declared_key.push((pk, column_name.clone()));
            }
            columns.push(ColumnDescriptor {
                column_type: ColumnType::from_declared(&declared_type),
                name: column_name,
                declared_type,
                nullable: not_null == 0,
                ordinal,
            });
        }
        if columns.is_empty() {
            return Err(TablesmithError::StorageUnreadable(format!(
                "table {name} reports no columns"
            )));
        }

        declared_key.sort_by_key(|(position, _)| *position);
        let (primary_key, key_source) = if declared_key.is_empty() {
            (vec![columns[0].name.clone()], KeySource::Inferred)
        } else {
            (
                declared_key.into_iter().map(|(_, column)| column).collect(),
                KeySource::Declared,
            )
        };

        let count_sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(&name));
        let row_count: i64 = sqlx::query(&count_sql)
            .fetch_one(self)
            .await
            .and_then(|row| row.try_get(0))
            .map_err(unreadable)?;

        Ok(TableDescriptor {
            name,
            columns,
            primary_key,
            key_source,
            row_count: u64::try_from(row_count).unwrap_or_default(),
        })
    }
}

fn unreadable(err: sqlx::Error) -> TablesmithError {
    TablesmithError::StorageUnreadable(err.to_string())
}
