use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub table_type: TableType,
    /// The CREATE statement as stored in the catalog.
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableType {
    Table,
    View,
}

impl TableType {
    pub fn label(&self) -> &'static str {
        match self {
            TableType::Table => "TABLE",
            TableType::View => "VIEW",
        }
    }
}

/// User tables and views, ordered by name. SQLite's internal tables are skipped.
pub fn get_tables(conn: &Connection) -> rusqlite::Result<Vec<TableInfo>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT name, type, sql
        FROM sqlite_master
        WHERE type IN ('table', 'view')
          AND name NOT LIKE 'sqlite_%'
        ORDER BY name
        "#,
    )?;

    let tables = stmt
        .query_map([], |row| {
            let type_str: String = row.get("type")?;
            let table_type = match type_str.as_str() {
                "view" => TableType::View,
                _ => TableType::Table,
            };
            Ok(TableInfo {
                name: row.get("name")?,
                table_type,
                sql: row.get("sql")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE accounts (id INTEGER PRIMARY KEY AUTOINCREMENT);
             CREATE VIEW named AS SELECT name FROM users;",
        )
        .unwrap();

        let tables = get_tables(&conn).unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        // sqlite_sequence is created by AUTOINCREMENT and must not show up
        assert_eq!(names, vec!["accounts", "named", "users"]);
        assert_eq!(tables[1].table_type, TableType::View);
        assert_eq!(
            tables[2].sql.as_deref(),
            Some("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
        );
    }

    #[test]
    fn test_empty_database() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(get_tables(&conn).unwrap().is_empty());
    }
}
