use serde::Deserialize;

use crate::libs::error::{Result, TablesmithError};
use crate::libs::schema::{find_table, ColumnType, TableDescriptor};
use crate::libs::value::CellValue;

/// Ordinary and virtual tables of the main schema in declaration order.
/// Shadow tables backing virtual tables and internal `sqlite_` tables are
/// left out.
pub(crate) const LIST_TABLES_SQL: &str = r"SELECT t.name FROM pragma_table_list AS t JOIN sqlite_master AS m ON m.name = t.name AND m.type = 'table' WHERE t.schema = 'main' AND t.type IN ('table', 'virtual') AND t.name NOT LIKE 'sqlite\_%' ESCAPE '\' ORDER BY m.rowid";

pub const MAX_IDENTIFIER_LEN: usize = 64;

/// A column requested by a create-table operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self { name: name.into(), column_type }
    }
}

/// One user-intent action, independent of its statement text.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalOperation {
    ListTables,
    ListRows {
        table: String,
    },
    CreateTable {
        name: String,
        columns: Vec<ColumnSpec>,
    },
    InsertRow {
        table: String,
        values: Vec<(String, CellValue)>,
    },
    /// `key_column: None` targets the table's identity column.
    DeleteRow {
        table: String,
        key_column: Option<String>,
        key_value: CellValue,
    },
    DropTable {
        table: String,
    },
}

impl LogicalOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            LogicalOperation::ListTables => "list_tables",
            LogicalOperation::ListRows { .. } => "list_rows",
            LogicalOperation::CreateTable { .. } => "create_table",
            LogicalOperation::InsertRow { .. } => "insert_row",
            LogicalOperation::DeleteRow { .. } => "delete_row",
            LogicalOperation::DropTable { .. } => "drop_table",
        }
    }

    /// Existing table the operation acts on, if any.
    pub fn target_table(&self) -> Option<&str> {
        match self {
            LogicalOperation::ListRows { table }
            | LogicalOperation::InsertRow { table, .. }
            | LogicalOperation::DeleteRow { table, .. }
            | LogicalOperation::DropTable { table } => Some(table.as_str()),
            LogicalOperation::ListTables | LogicalOperation::CreateTable { .. } => None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, LogicalOperation::ListTables | LogicalOperation::ListRows { .. })
    }
}

/// How a delete is allowed to pick its identity column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyPolicy {
    /// Declared key if present, otherwise the first column.
    #[default]
    FirstColumnFallback,
    /// Only a declared key column may identify rows.
    DeclaredOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<CellValue>,
}

impl Statement {
    fn bare(sql: String) -> Self {
        Self { sql, params: Vec::new() }
    }
}

pub struct StatementBuilder<'a> {
    catalog: &'a [TableDescriptor],
    key_policy: KeyPolicy,
}

impl<'a> StatementBuilder<'a> {
    pub fn new(catalog: &'a [TableDescriptor]) -> Self {
        Self { catalog, key_policy: KeyPolicy::default() }
    }

    pub fn key_policy(mut self, policy: KeyPolicy) -> Self {
        self.key_policy = policy;
        self
    }

    pub fn build(&self, operation: &LogicalOperation) -> Result<Statement> {
        match operation {
            LogicalOperation::ListTables => Ok(Statement::bare(LIST_TABLES_SQL.to_string())),
            LogicalOperation::ListRows { table } => {
                let table = self.table(table)?;
                Ok(Statement::bare(format!("SELECT * FROM {}", quote_identifier(&table.name))))
            }
            LogicalOperation::CreateTable { name, columns } => self.create_table(name, columns),
            LogicalOperation::InsertRow { table, values } => self.insert_row(table, values),
            LogicalOperation::DeleteRow { table, key_column, key_value } => {
                self.delete_row(table, key_column.as_deref(), key_value)
            }
            LogicalOperation::DropTable { table } => {
                let table = self.table(table)?;
                Ok(Statement::bare(format!("DROP TABLE {}", quote_identifier(&table.name))))
            }
        }
    }

    fn table(&self, name: &str) -> Result<&'a TableDescriptor> {
        find_table(self.catalog, name)
            .ok_or_else(|| TablesmithError::invalid(format!("unknown table {name:?}")))
    }

    fn create_table(&self, name: &str, columns: &[ColumnSpec]) -> Result<Statement> {
        validate_identifier("table", name)?;
        if find_table(self.catalog, name).is_some() {
            return Err(TablesmithError::invalid(format!("table {name:?} already exists")));
        }
        if columns.is_empty() {
            return Err(TablesmithError::invalid("a table needs at least one column"));
        }

        let mut defs = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            validate_identifier("column", &column.name)?;
            if columns[..i].iter().any(|c| c.name.eq_ignore_ascii_case(&column.name)) {
                return Err(TablesmithError::invalid(format!(
                    "duplicate column {:?}",
                    column.name
                )));
            }
            defs.push(format!("{} {}", quote_identifier(&column.name), column.column_type.as_sql()));
        }

        Ok(Statement::bare(format!(
            "CREATE TABLE {} ({})",
            quote_identifier(name),
            defs.join(", ")
        )))
    }

    fn insert_row(&self, table: &str, values: &[(String, CellValue)]) -> Result<Statement> {
        let table = self.table(table)?;
        if values.is_empty() {
            return Ok(Statement::bare(format!(
                "INSERT INTO {} DEFAULT VALUES",
                quote_identifier(&table.name)
            )));
        }

        let mut cols: Vec<&str> = Vec::with_capacity(values.len());
        let mut params = Vec::with_capacity(values.len());
        for (column, value) in values {
            let descriptor = table.column(column).ok_or_else(|| {
                TablesmithError::invalid(format!("unknown column {column:?} in {}", table.name))
            })?;
            if cols.iter().any(|c| c.eq_ignore_ascii_case(&descriptor.name)) {
                return Err(TablesmithError::invalid(format!("column {column:?} given twice")));
            }
            cols.push(&descriptor.name);
            params.push(value.clone());
        }

        let quoted: Vec<String> = cols.iter().map(|c| quote_identifier(c)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(&table.name),
            quoted.join(", "),
            placeholders(params.len()).join(", ")
        );
        Ok(Statement { sql, params })
    }

    fn delete_row(
        &self,
        table: &str,
        key_column: Option<&str>,
        key_value: &CellValue,
    ) -> Result<Statement> {
        let table = self.table(table)?;
        let requested = match key_column {
            Some(column) => column,
            None => table.identity_column().ok_or_else(|| {
                TablesmithError::invalid(format!("table {} has no identity column", table.name))
            })?,
        };
        let column = table.column(requested).ok_or_else(|| {
            TablesmithError::invalid(format!("unknown column {requested:?} in {}", table.name))
        })?;

        if self.key_policy == KeyPolicy::DeclaredOnly && !table.is_declared_key(&column.name) {
            return Err(TablesmithError::invalid(format!(
                "{} is not a declared key of {}",
                column.name, table.name
            )));
        }

        let target = format!(
            "DELETE FROM {} WHERE {}",
            quote_identifier(&table.name),
            quote_identifier(&column.name)
        );
        if key_value.is_null() {
            Ok(Statement::bare(format!("{target} IS NULL")))
        } else {
            Ok(Statement { sql: format!("{target} = ?1"), params: vec![key_value.clone()] })
        }
    }
}

fn placeholders(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("?{}", i)).collect()
}

/// Accepts letters, digits and underscore, not starting with a digit.
/// Names reserved by the storage engine (`sqlite_` prefix) are refused.
pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !valid {
        return Err(TablesmithError::invalid(format!(
            "{kind} name {name:?} must use letters, digits and underscore and not start with a digit"
        )));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(TablesmithError::invalid(format!(
            "{kind} name is longer than {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if name.to_ascii_lowercase().starts_with("sqlite_") {
        return Err(TablesmithError::invalid(format!("{kind} name {name:?} is reserved")));
    }
    Ok(())
}

/// Quotes an identifier that came from the catalog or passed validation.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
