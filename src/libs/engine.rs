use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, warn};

use crate::libs::catalog::SchemaCatalog;
use crate::libs::config::EngineConfig;
use crate::libs::error::{Result, TablesmithError};
use crate::libs::schema::{ColumnDescriptor, TableDescriptor};
use crate::libs::session::{SessionHandle, SessionStore};
use crate::libs::statement::{ColumnSpec, KeyPolicy, LogicalOperation, Statement, StatementBuilder};
use crate::libs::value::{CellValue, RowSnapshot};

/// State of the working copy after an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    /// Table names in declaration order.
    pub tables: Vec<String>,
    pub data: BTreeMap<String, Vec<RowSnapshot>>,
    /// Column lists for tables with no rows, so they can still be rendered.
    pub schemas: BTreeMap<String, Vec<ColumnDescriptor>>,
}

impl Snapshot {
    pub fn rows(&self, table: &str) -> &[RowSnapshot] {
        self.data.get(table).map(Vec::as_slice).unwrap_or_default()
    }
}

pub struct Engine {
    store: SessionStore,
    key_policy: KeyPolicy,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let key_policy = config.key_policy;
        Self { store: SessionStore::new(config), key_policy }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    // -------- Session lifecycle --------

    /// Replaces the current session with `bytes` and returns its first
    /// snapshot. The snapshot is read before the swap, so an upload whose
    /// rows cannot be read leaves the previous session current.
    pub async fn upload(&self, bytes: &[u8]) -> Result<(SessionHandle, Snapshot)> {
        let staged = self.store.stage(bytes).await?;
        let snapshot = match collect_snapshot(staged.pool()).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(session = %staged.handle(), error = %err, "upload rejected");
                staged.discard().await;
                return Err(match err {
                    TablesmithError::StorageUnreadable(msg) => TablesmithError::CorruptUpload(msg),
                    other => other,
                });
            }
        };
        let handle = self.store.commit(staged).await;
        info!(session = %handle, tables = snapshot.tables.len(), "upload loaded");
        Ok((handle, snapshot))
    }

    pub async fn current_session(&self) -> Result<SessionHandle> {
        self.store.current_handle().await
    }

    pub async fn export(&self, handle: SessionHandle) -> Result<Vec<u8>> {
        self.store.export(handle).await
    }

    pub async fn expire_idle_session(&self) -> Option<SessionHandle> {
        self.store.expire_idle().await
    }

    pub async fn shutdown(&self) {
        self.store.close().await;
    }

    // -------- Reads --------

    pub async fn snapshot(&self, handle: SessionHandle) -> Result<Snapshot> {
        self.apply(handle, &LogicalOperation::ListTables).await
    }

    pub async fn list_tables(&self, handle: SessionHandle) -> Result<Vec<String>> {
        let copy = self.store.checkout(handle).await?;
        copy.pool().list_tables().await
    }

    pub async fn introspect(&self, handle: SessionHandle) -> Result<Vec<TableDescriptor>> {
        let copy = self.store.checkout(handle).await?;
        copy.pool().introspect().await
    }

    pub async fn describe_table(&self, handle: SessionHandle, table: &str) -> Result<TableDescriptor> {
        let copy = self.store.checkout(handle).await?;
        copy.pool().describe_table(table).await
    }

    /// Ordered column names of `table`.
    pub async fn table_columns(&self, handle: SessionHandle, table: &str) -> Result<Vec<String>> {
        Ok(self.describe_table(handle, table).await?.column_names())
    }

    pub async fn list_rows(&self, handle: SessionHandle, table: &str) -> Result<Vec<RowSnapshot>> {
        let copy = self.store.checkout(handle).await?;
        let descriptor = copy.pool().describe_table(table).await?;
        let statement = StatementBuilder::new(std::slice::from_ref(&descriptor))
            .build(&LogicalOperation::ListRows { table: descriptor.name.clone() })?;
        fetch_rows(copy.pool(), &statement).await
    }

    // -------- Mutations --------

    pub async fn create_table(
        &self,
        handle: SessionHandle,
        name: &str,
        columns: Vec<ColumnSpec>,
    ) -> Result<Snapshot> {
        let operation = LogicalOperation::CreateTable { name: name.to_string(), columns };
        self.apply(handle, &operation).await
    }

    pub async fn insert_row(
        &self,
        handle: SessionHandle,
        table: &str,
        values: Vec<(String, CellValue)>,
    ) -> Result<Snapshot> {
        let operation = LogicalOperation::InsertRow { table: table.to_string(), values };
        self.apply(handle, &operation).await
    }

    pub async fn delete_row(
        &self,
        handle: SessionHandle,
        table: &str,
        key_column: Option<&str>,
        key_value: CellValue,
    ) -> Result<Snapshot> {
        let operation = LogicalOperation::DeleteRow {
            table: table.to_string(),
            key_column: key_column.map(str::to_string),
            key_value,
        };
        self.apply(handle, &operation).await
    }

    pub async fn drop_table(&self, handle: SessionHandle, table: &str) -> Result<Snapshot> {
        let operation = LogicalOperation::DropTable { table: table.to_string() };
        self.apply(handle, &operation).await
    }

    /// Runs one logical operation against the working copy and returns the
    /// refreshed state. The working copy stays locked for the whole call.
    pub async fn apply(&self, handle: SessionHandle, operation: &LogicalOperation) -> Result<Snapshot> {
        let copy = self.store.checkout(handle).await?;
        let pool = copy.pool();

        if operation.is_read_only() {
            if let Some(table) = operation.target_table() {
                pool.describe_table(table).await?;
            }
        } else {
            let catalog = match operation.target_table() {
                Some(table) => vec![pool.describe_table(table).await?],
                None => pool.introspect().await?,
            };
            let statement = StatementBuilder::new(&catalog)
                .key_policy(self.key_policy)
                .build(operation)?;
            debug!(operation = operation.kind(), sql = %statement.sql, "statement built");

            let affected = execute(pool, &statement).await?;
            info!(
                session = %handle,
                operation = operation.kind(),
                rows_affected = affected,
                "operation applied"
            );
        }

        collect_snapshot(pool).await
    }
}

async fn collect_snapshot(pool: &SqlitePool) -> Result<Snapshot> {
    let catalog = pool.introspect().await?;
    let builder = StatementBuilder::new(&catalog);
    let mut snapshot = Snapshot::default();
    for table in &catalog {
        let statement = builder.build(&LogicalOperation::ListRows { table: table.name.clone() })?;
        let rows = fetch_rows(pool, &statement).await?;
        if rows.is_empty() {
            snapshot.schemas.insert(table.name.clone(), table.columns.clone());
        }
        snapshot.tables.push(table.name.clone());
        snapshot.data.insert(table.name.clone(), rows);
    }
    Ok(snapshot)
}

async fn fetch_rows(pool: &SqlitePool, statement: &Statement) -> Result<Vec<RowSnapshot>> {
    let mut query = sqlx::query(&statement.sql);
    for value in &statement.params {
        query = value.bind_to(query);
    }
    let rows = query
        .fetch_all(pool)
        .await
        .map_err(|e| TablesmithError::StorageUnreadable(e.to_string()))?;
    rows.iter().map(RowSnapshot::decode).collect()
}

async fn execute(pool: &SqlitePool, statement: &Statement) -> Result<u64> {
    let mut query = sqlx::query(&statement.sql);
    for value in &statement.params {
        query = value.bind_to(query);
    }
    let result = query
        .execute(pool)
        .await
        .map_err(TablesmithError::from_execution)?;
    Ok(result.rows_affected())
}
