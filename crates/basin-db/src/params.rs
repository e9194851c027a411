//! Dynamic SQL parameters and JSON row conversion for the untyped query API.

use serde_json::{Map, Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};

use crate::error::{DbError, DbResult};

/// One bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Integer(value)
    }
}

impl From<i32> for SqlParam {
    fn from(value: i32) -> Self {
        SqlParam::Integer(value.into())
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Real(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Integer(value.into())
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<Vec<u8>> for SqlParam {
    fn from(value: Vec<u8>) -> Self {
        SqlParam::Blob(value)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlParam::Null, Into::into)
    }
}

impl From<&Value> for SqlParam {
    /// Arrays and objects are bound as JSON text.
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlParam::Null,
            Value::Bool(b) => SqlParam::from(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlParam::Integer(i),
                None => SqlParam::Real(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlParam::Text(s.clone()),
            other => SqlParam::Text(other.to_string()),
        }
    }
}

/// Binds `params` in order.
pub fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[SqlParam],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlParam::Null => query.bind(None::<String>),
            SqlParam::Integer(v) => query.bind(*v),
            SqlParam::Real(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.clone()),
            SqlParam::Blob(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Converts a row into a JSON object keyed by column name.
///
/// Blobs become arrays of byte values.
pub fn row_to_json(row: &SqliteRow) -> DbResult<Map<String, Value>> {
    let mut object = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let i = column.ordinal();
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            match type_name.as_str() {
                "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(i)?),
                "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => Number::from_f64(row.try_get::<f64, _>(i)?)
                    .map_or(Value::Null, Value::Number),
                "BLOB" => Value::from(row.try_get::<Vec<u8>, _>(i)?),
                _ => Value::String(row.try_get::<String, _>(i)?),
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(object)
}

/// Deserializes a JSON row into `T`.
pub fn from_row<T: serde::de::DeserializeOwned>(row: &SqliteRow) -> DbResult<T> {
    let object = row_to_json(row)?;
    serde_json::from_value(Value::Object(object)).map_err(DbError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use sqlx::{Connection, SqliteConnection};

    #[tokio::test]
    async fn binds_and_reads_back_every_kind() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let params = vec![
            SqlParam::from(7_i64),
            SqlParam::from(1.5),
            SqlParam::from("hi"),
            SqlParam::Null,
        ];
        let row = bind_params(sqlx::query("SELECT ? AS i, ? AS r, ? AS t, ? AS n"), &params)
            .fetch_one(&mut conn)
            .await
            .unwrap();

        let object = row_to_json(&row).unwrap();
        assert_eq!(Value::Object(object), json!({"i": 7, "r": 1.5, "t": "hi", "n": null}));
    }

    #[tokio::test]
    async fn rows_deserialize_into_structs() {
        #[derive(Deserialize)]
        struct User {
            id: String,
            age: i64,
        }

        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let row = sqlx::query("SELECT 'u1' AS id, 36 AS age")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        let user: User = from_row(&row).unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.age, 36);
    }

    #[test]
    fn json_values_map_to_params() {
        assert_eq!(SqlParam::from(&json!(3)), SqlParam::Integer(3));
        assert_eq!(SqlParam::from(&json!(true)), SqlParam::Integer(1));
        assert_eq!(SqlParam::from(&json!("x")), SqlParam::Text("x".into()));
        assert_eq!(SqlParam::from(&json!({"a": 1})), SqlParam::Text("{\"a\":1}".into()));
        assert_eq!(SqlParam::from(None::<i64>), SqlParam::Null);
    }
}
