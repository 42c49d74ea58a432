use crate::db::{QueryResult, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Table,
    Csv,
    Tsv,
    Json,
    Sql,
}

/// Render the rows of `result`. `table_name` is only used by the SQL format.
pub fn render(result: &QueryResult, format: ExportFormat, table_name: &str) -> String {
    match format {
        ExportFormat::Table => to_table(result),
        ExportFormat::Csv => to_csv(result),
        ExportFormat::Tsv => to_tsv(result),
        ExportFormat::Json => to_json(result),
        ExportFormat::Sql => to_sql_insert(result, table_name),
    }
}

/// One line describing a finished statement, for results without rows.
pub fn summary(result: &QueryResult) -> String {
    let ms = result.execution_secs() * 1000.0;
    if let Some(error) = &result.error {
        return format!("{}: {} ({:.1} ms)", result.status.as_str(), error, ms);
    }
    match result.last_insert_id {
        Some(id) => format!(
            "{} OK, {} row(s) affected, last insert id {} ({:.1} ms)",
            result.query_type, result.affected_rows, id, ms
        ),
        None => format!(
            "{} OK, {} row(s) affected ({:.1} ms)",
            result.query_type, result.affected_rows, ms
        ),
    }
}

pub fn to_csv(result: &QueryResult) -> String {
    let mut output = String::new();

    let headers: Vec<String> = result.columns.iter().map(|c| csv_escape(c)).collect();
    output.push_str(&headers.join(","));
    output.push('\n');

    for row in &result.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| csv_escape(&cell_to_text(cell)))
            .collect();
        output.push_str(&cells.join(","));
        output.push('\n');
    }

    output
}

pub fn to_tsv(result: &QueryResult) -> String {
    let mut output = String::new();

    output.push_str(&result.columns.join("\t"));
    output.push('\n');

    for row in &result.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| cell_to_text(cell).replace('\t', " "))
            .collect();
        output.push_str(&cells.join("\t"));
        output.push('\n');
    }

    output
}

/// Rows as an array of objects keyed by column name.
pub fn to_json(result: &QueryResult) -> String {
    let rows_json: Vec<serde_json::Value> = result
        .rows
        .iter()
        .map(|row| {
            let obj = row
                .iter()
                .enumerate()
                .map(|(i, cell)| {
                    let name = result
                        .columns
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| format!("column_{}", i));
                    (name, cell_to_json(cell))
                })
                .collect();
            serde_json::Value::Object(obj)
        })
        .collect();

    serde_json::to_string_pretty(&rows_json).unwrap_or_else(|_| "[]".to_string())
}

pub fn to_sql_insert(result: &QueryResult, table_name: &str) -> String {
    if result.rows.is_empty() || result.columns.is_empty() {
        return String::new();
    }

    let mut output = String::new();
    let col_names = result.columns.join(", ");
    for row in &result.rows {
        let values: Vec<String> = row.iter().map(cell_to_sql).collect();
        output.push_str(&format!(
            "INSERT INTO {} ({}) VALUES ({});\n",
            table_name,
            col_names,
            values.join(", ")
        ));
    }

    output
}

/// Aligned text table with a row count footer.
pub fn to_table(result: &QueryResult) -> String {
    let rendered: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.iter().map(|cell| cell.display().replace('\n', " ")).collect())
        .collect();

    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.chars().count()).collect();
    for row in &rendered {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let format_line = |cells: &[String]| -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!(" {:<width$} ", cell, width = *width))
            .collect();
        padded.join("|").trim_end().to_string()
    };

    let mut output = String::new();
    output.push_str(&format_line(result.columns.as_slice()));
    output.push('\n');
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(w + 2)).collect();
    output.push_str(&separator.join("+"));
    output.push('\n');
    for row in &rendered {
        output.push_str(&format_line(row.as_slice()));
        output.push('\n');
    }
    let noun = if result.row_count == 1 { "row" } else { "rows" };
    output.push_str(&format!("({} {})\n", result.row_count, noun));
    output
}

fn cell_to_text(cell: &SqlValue) -> String {
    match cell {
        SqlValue::Null => String::new(),
        SqlValue::Blob(b) => hex(b),
        other => other.display(),
    }
}

fn cell_to_json(cell: &SqlValue) -> serde_json::Value {
    match cell {
        SqlValue::Null => serde_json::Value::Null,
        SqlValue::Integer(i) => serde_json::json!(*i),
        SqlValue::Real(f) => serde_json::json!(*f),
        SqlValue::Text(s) => serde_json::Value::String(s.clone()),
        SqlValue::Blob(b) => serde_json::Value::String(hex(b)),
    }
}

fn cell_to_sql(cell: &SqlValue) -> String {
    match cell {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) => f.to_string(),
        SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        SqlValue::Blob(b) => format!("X'{}'", hex(b)),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
