use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

/// A single SQLite value, used both for bind parameters and result cells.
///
/// Serializes untagged so results read naturally as JSON: `null`, numbers,
/// strings, and blobs as byte arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn display(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Real(f) => f.to_string(),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Blob(b) => format!("[{} bytes]", b.len()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Convert an arbitrary JSON value into a bind parameter.
    ///
    /// Booleans bind as 0/1 like SQLite stores them; arrays and objects bind
    /// as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Integer(i) => SqlValue::Integer(i),
            Value::Real(f) => SqlValue::Real(f),
            Value::Text(s) => SqlValue::Text(s),
            Value::Blob(b) => SqlValue::Blob(b),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Integer(i) => ValueRef::Integer(*i),
            SqlValue::Real(f) => ValueRef::Real(*f),
            SqlValue::Text(s) => ValueRef::Text(s.as_bytes()),
            SqlValue::Blob(b) => ValueRef::Blob(b),
        };
        Ok(ToSqlOutput::Borrowed(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(SqlValue::Null.display(), "NULL");
        assert_eq!(SqlValue::Integer(-100).display(), "-100");
        assert_eq!(SqlValue::Real(2.5).display(), "2.5");
        assert_eq!(SqlValue::Text("hello".into()).display(), "hello");
        assert_eq!(SqlValue::Blob(vec![1, 2, 3]).display(), "[3 bytes]");
    }

    #[test]
    fn test_json_shape() {
        let row = vec![
            SqlValue::Null,
            SqlValue::Integer(7),
            SqlValue::Text("x".into()),
        ];
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"[null,7,"x"]"#);
    }

    #[test]
    fn test_deserialize_params() {
        let params: Vec<SqlValue> = serde_json::from_str(r#"[1, 2.5, "a", null]"#).unwrap();
        assert_eq!(
            params,
            vec![
                SqlValue::Integer(1),
                SqlValue::Real(2.5),
                SqlValue::Text("a".into()),
                SqlValue::Null,
            ]
        );
    }

    #[test]
    fn test_from_json() {
        assert_eq!(
            SqlValue::from_json(&serde_json::json!(true)),
            SqlValue::Integer(1)
        );
        assert_eq!(
            SqlValue::from_json(&serde_json::json!({"a": 1})),
            SqlValue::Text(r#"{"a":1}"#.into())
        );
    }

    #[test]
    fn test_binds_through_rusqlite() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let params = [SqlValue::Integer(2), SqlValue::Text("b".into())];
        let (n, s): (i64, String) = conn
            .query_row(
                "SELECT ?1 * 2, ?2 || 'c'",
                rusqlite::params_from_iter(params.iter()),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(s, "bc");
    }
}
