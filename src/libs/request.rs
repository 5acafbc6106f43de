//! Request bodies accepted at the HTTP boundary, validated into
//! [`LogicalOperation`]s before anything reaches the engine.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::libs::error::{Result, TablesmithError};
use crate::libs::statement::{ColumnSpec, LogicalOperation};
use crate::libs::value::CellValue;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTableRequest {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InsertRowRequest {
    pub table: String,
    #[serde(default)]
    pub row: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteRowRequest {
    pub table: String,
    #[serde(default)]
    pub pk: Option<String>,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteTableRequest {
    #[serde(rename = "tableName")]
    pub table_name: String,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TablesmithError::invalid(format!("{field} is required")));
    }
    Ok(())
}

impl TryFrom<CreateTableRequest> for LogicalOperation {
    type Error = TablesmithError;

    fn try_from(req: CreateTableRequest) -> Result<Self> {
        require("table name", &req.name)?;
        for column in &req.columns {
            require("column name", &column.name)?;
        }
        Ok(LogicalOperation::CreateTable { name: req.name, columns: req.columns })
    }
}

impl TryFrom<InsertRowRequest> for LogicalOperation {
    type Error = TablesmithError;

    fn try_from(req: InsertRowRequest) -> Result<Self> {
        require("table", &req.table)?;
        let values = req
            .row
            .iter()
            .map(|(column, value)| Ok((column.clone(), CellValue::from_json(value)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(LogicalOperation::InsertRow { table: req.table, values })
    }
}

impl TryFrom<DeleteRowRequest> for LogicalOperation {
    type Error = TablesmithError;

    fn try_from(req: DeleteRowRequest) -> Result<Self> {
        require("table", &req.table)?;
        let key_column = req.pk.filter(|pk| !pk.trim().is_empty());
        Ok(LogicalOperation::DeleteRow {
            table: req.table,
            key_column,
            key_value: CellValue::from_json(&req.value)?,
        })
    }
}

impl TryFrom<DeleteTableRequest> for LogicalOperation {
    type Error = TablesmithError;

    fn try_from(req: DeleteTableRequest) -> Result<Self> {
        require("tableName", &req.table_name)?;
        Ok(LogicalOperation::DropTable { table: req.table_name })
    }
}
