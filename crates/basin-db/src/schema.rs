//! # Application Schema
//!
//! Application tables are views over JSON storage tables. Writes go through
//! `INSTEAD OF` triggers that update storage and append to the CRUD log in
//! the same statement.
//!
//! ## Layout for `Table::new("users", [name TEXT, age INTEGER])`
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ps_data__users (id TEXT PRIMARY KEY, data TEXT)      ← storage         │
//! │        ▲                                                                │
//! │        │ json_extract(data, '$.name'), ...                              │
//! │  VIEW users (id, name, age)                           ← app reads/writes│
//! │        │                                                                │
//! │        │ INSTEAD OF INSERT / UPDATE / DELETE                            │
//! │        ▼                                                                │
//! │  ps_data__users  +  ps_crud {"op","type","id","data"}                   │
//! │                  +  ps_buckets['$local'].target_op = MAX                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Synced rows are written straight into the storage table by bucket
//! storage, bypassing the triggers, so they never re-enter the CRUD log.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use basin_core::MAX_OP_ID;

use crate::error::{DbError, DbResult};

/// Prefix of synced storage tables.
pub const DATA_PREFIX: &str = "ps_data__";
/// Prefix of local-only storage tables.
pub const LOCAL_DATA_PREFIX: &str = "ps_data_local__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn text(name: impl Into<String>) -> Self {
        Column {
            name: name.into(),
            column_type: ColumnType::Text,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Column {
            name: name.into(),
            column_type: ColumnType::Integer,
        }
    }

    pub fn real(name: impl Into<String>) -> Self {
        Column {
            name: name.into(),
            column_type: ColumnType::Real,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    /// Never uploaded, never overwritten by sync.
    #[serde(default)]
    pub local_only: bool,
    /// Writes are only recorded for upload; the view stays empty.
    #[serde(default)]
    pub insert_only: bool,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Table {
            name: name.into(),
            columns,
            local_only: false,
            insert_only: false,
        }
    }

    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    pub fn insert_only(mut self) -> Self {
        self.insert_only = true;
        self
    }

    /// Name of the backing storage table.
    pub fn internal_name(&self) -> String {
        if self.local_only {
            format!("{LOCAL_DATA_PREFIX}{}", self.name)
        } else {
            format!("{DATA_PREFIX}{}", self.name)
        }
    }

    fn validate(&self) -> DbResult<()> {
        if !is_identifier(&self.name) || self.name.starts_with("ps_") {
            return Err(DbError::InvalidSchema(format!(
                "invalid table name {:?}",
                self.name
            )));
        }
        if self.local_only && self.insert_only {
            return Err(DbError::InvalidSchema(format!(
                "table {} cannot be both local-only and insert-only",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !is_identifier(&column.name) || column.name.eq_ignore_ascii_case("id") {
                return Err(DbError::InvalidSchema(format!(
                    "invalid column {:?} in table {}",
                    column.name, self.name
                )));
            }
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(DbError::InvalidSchema(format!(
                    "duplicate column {} in table {}",
                    column.name, self.name
                )));
            }
        }
        Ok(())
    }

    /// `json_object('a', NEW."a", ...)` over every column.
    fn json_object(&self, row: &str) -> String {
        let pairs: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{}, {row}.{}", quote_str(&c.name), quote_ident(&c.name)))
            .collect();
        format!("json_object({})", pairs.join(", "))
    }

    fn crud_insert(&self, op: &str, row: &str, with_data: bool) -> String {
        let data = if with_data {
            format!(", 'data', json({})", self.json_object(row))
        } else {
            String::new()
        };
        format!(
            "INSERT INTO ps_crud (tx_id, data) \
             SELECT current_tx, json_object('op', {op}, 'type', {table}, 'id', {row}.id{data}) \
             FROM ps_tx WHERE id = 1;\n\
             INSERT INTO ps_buckets (name, target_op) VALUES ('$local', {MAX_OP_ID}) \
             ON CONFLICT (name) DO UPDATE SET target_op = {MAX_OP_ID};",
            op = quote_str(op),
            table = quote_str(&self.name),
        )
    }

    /// DDL for storage, view and triggers, in execution order.
    pub fn statements(&self) -> Vec<String> {
        let internal = quote_ident(&self.internal_name());
        let view = quote_ident(&self.name);

        let mut select = vec!["id".to_string()];
        select.extend(self.columns.iter().map(|c| {
            format!(
                "CAST(json_extract(data, {}) AS {})",
                quote_str(&format!("$.{}", c.name)),
                c.column_type.sql()
            )
        }));
        let mut view_columns = vec![quote_ident("id")];
        view_columns.extend(self.columns.iter().map(|c| quote_ident(&c.name)));

        let mut statements = vec![
            format!("CREATE TABLE IF NOT EXISTS {internal} (id TEXT PRIMARY KEY NOT NULL, data TEXT)"),
            format!("DROP VIEW IF EXISTS {view}"),
            format!(
                "CREATE VIEW {view} ({}) AS SELECT {} FROM {internal}{}",
                view_columns.join(", "),
                select.join(", "),
                if self.insert_only { " WHERE 0" } else { "" }
            ),
        ];

        let require_id = "SELECT RAISE(FAIL, 'id is required') WHERE NEW.id IS NULL;";

        if self.insert_only {
            statements.push(format!(
                "CREATE TRIGGER {} INSTEAD OF INSERT ON {view} FOR EACH ROW BEGIN\n{require_id}\n{}\nEND",
                quote_ident(&format!("ps_view_insert_{}", self.name)),
                self.crud_insert("PUT", "NEW", true),
            ));
            return statements;
        }

        let track = |op: &str, row: &str, with_data: bool| {
            if self.local_only {
                String::new()
            } else {
                self.crud_insert(op, row, with_data)
            }
        };

        statements.push(format!(
            "CREATE TRIGGER {} INSTEAD OF INSERT ON {view} FOR EACH ROW BEGIN\n\
             {require_id}\n\
             INSERT INTO {internal} (id, data) VALUES (NEW.id, {});\n\
             {}\nEND",
            quote_ident(&format!("ps_view_insert_{}", self.name)),
            self.json_object("NEW"),
            track("PUT", "NEW", true),
        ));
        statements.push(format!(
            "CREATE TRIGGER {} INSTEAD OF UPDATE ON {view} FOR EACH ROW BEGIN\n\
             SELECT RAISE(FAIL, 'Cannot update id') WHERE OLD.id != NEW.id;\n\
             UPDATE {internal} SET data = {} WHERE id = NEW.id;\n\
             {}\nEND",
            quote_ident(&format!("ps_view_update_{}", self.name)),
            self.json_object("NEW"),
            track("PATCH", "NEW", true),
        ));
        statements.push(format!(
            "CREATE TRIGGER {} INSTEAD OF DELETE ON {view} FOR EACH ROW BEGIN\n\
             DELETE FROM {internal} WHERE id = OLD.id;\n\
             {}\nEND",
            quote_ident(&format!("ps_view_delete_{}", self.name)),
            track("DELETE", "OLD", false),
        ));

        statements
    }
}

/// Set of application tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<Table>,
}

impl Schema {
    pub fn new(tables: Vec<Table>) -> Self {
        Schema { tables }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn validate(&self) -> DbResult<()> {
        let mut seen = HashSet::new();
        for table in &self.tables {
            table.validate()?;
            if !seen.insert(table.name.to_ascii_lowercase()) {
                return Err(DbError::InvalidSchema(format!(
                    "duplicate table {}",
                    table.name
                )));
            }
        }
        Ok(())
    }
}

/// Creates storage, views and triggers for `schema`. Views of tables that
/// left the schema are dropped; storage tables are kept.
///
/// Must run inside a write transaction.
pub async fn apply_schema(conn: &mut SqliteConnection, schema: &Schema) -> DbResult<()> {
    schema.validate()?;

    let existing: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'view' AND sql LIKE '%ps_data%'",
    )
    .fetch_all(&mut *conn)
    .await?;
    for (view,) in existing {
        if schema.table(&view).is_none() {
            debug!(view = %view, "Dropping view no longer in schema");
            sqlx::query(&format!("DROP VIEW IF EXISTS {}", quote_ident(&view)))
                .execute(&mut *conn)
                .await?;
        }
    }

    for table in &schema.tables {
        for statement in table.statements() {
            sqlx::query(&statement).execute(&mut *conn).await?;
        }
    }

    info!(tables = schema.tables.len(), "Schema applied");
    Ok(())
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn quote_str(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Strips a storage prefix, giving the application table name.
pub fn public_table_name(table: &str) -> &str {
    table
        .strip_prefix(LOCAL_DATA_PREFIX)
        .or_else(|| table.strip_prefix(DATA_PREFIX))
        .unwrap_or(table)
}
