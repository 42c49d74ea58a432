use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sqlexec::config::EngineConfig;
use sqlexec::db::QueryType;
use sqlexec::engine::{ExecuteBody, SqlEngine};
use sqlexec::export::{self, ExportFormat};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Run SQL statements against a SQLite database through a pooled engine
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (default: <config dir>/sqlexec/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database path, overriding the config file
    #[arg(short, long)]
    database: Option<String>,

    /// Output format for query rows
    #[arg(short, long, value_enum, default_value_t = ExportFormat::Table)]
    format: ExportFormat,

    /// Reject statements that modify the database
    #[arg(long)]
    read_only: bool,

    /// Stop after this many rows per query
    #[arg(long)]
    row_limit: Option<usize>,

    /// Per-statement timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Pool size, overriding the config file
    #[arg(long)]
    max_connections: Option<usize>,

    /// Table name used by the sql output format
    #[arg(long, default_value = "exported")]
    table: String,

    /// Print engine metrics as JSON when done
    #[arg(long)]
    metrics: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,

    /// Statements to run. Read from stdin, separated by `;`, when omitted
    sql: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config =
        EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(database) = &cli.database {
        config.database = database.clone();
    }
    if let Some(max) = cli.max_connections {
        config.pool.max_connections = max;
        config.pool.min_connections = config.pool.min_connections.min(max);
    }

    if cli.init_config {
        let path = cli.config.clone().unwrap_or_else(EngineConfig::get_config_path);
        config
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let statements = if cli.sql.is_empty() {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("failed to read statements from stdin")?;
        split_statements(&input)
    } else {
        cli.sql.clone()
    };

    let engine = SqlEngine::start(config)
        .await
        .context("failed to start engine")?;

    let mut failures = 0;
    for sql in statements {
        let body = ExecuteBody {
            read_only: cli.read_only,
            row_limit: cli.row_limit,
            timeout: cli.timeout,
            ..ExecuteBody::new(sql)
        };
        let result = engine.execute(body).await?;
        for warning in &result.warnings {
            warn!(query_id = %result.query_id, "{}", warning);
        }

        if !result.is_success() {
            failures += 1;
            eprintln!("{}", export::summary(&result));
        } else if result.query_type == QueryType::Select {
            print!("{}", export::render(&result, cli.format, &cli.table));
        } else {
            println!("{}", export::summary(&result));
        }
    }

    if cli.metrics {
        println!("{}", serde_json::to_string_pretty(&engine.metrics())?);
    }

    engine.shutdown().await;

    if failures > 0 {
        anyhow::bail!("{} statement(s) failed", failures);
    }
    Ok(())
}

/// Split a script on `;`, ignoring semicolons inside quotes, `--` line
/// comments and `/* */` block comments. Comments are dropped.
fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = script.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    // line comment
                    for next in chars.by_ref() {
                        if next == '\n' {
                            current.push('\n');
                            break;
                        }
                    }
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    let mut prev = '\0';
                    for next in chars.by_ref() {
                        if prev == '*' && next == '/' {
                            break;
                        }
                        prev = next;
                    }
                    current.push(' ');
                }
                ';' => {
                    let statement = current.trim();
                    if !statement.is_empty() {
                        statements.push(statement.to_string());
                    }
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }

    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let script = "CREATE TABLE t (x TEXT);\nINSERT INTO t VALUES ('a;b');\n\nSELECT * FROM t";
        assert_eq!(
            split_statements(script),
            vec![
                "CREATE TABLE t (x TEXT)",
                "INSERT INTO t VALUES ('a;b')",
                "SELECT * FROM t",
            ]
        );
    }

    #[test]
    fn test_split_skips_comments_and_blanks() {
        let script = "-- setup; ignored\nSELECT 1;;\n  ;SELECT 2; -- trailing";
        assert_eq!(split_statements(script), vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_split_skips_block_comments() {
        let script = "SELECT 1 /* a; b */ + 2;\n/* header;\n spans lines */ SELECT 3; SELECT '/*;*/'";
        assert_eq!(
            split_statements(script),
            vec!["SELECT 1   + 2", "SELECT 3", "SELECT '/*;*/'"]
        );
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "sqlexec",
            "--database",
            "app.db",
            "--format",
            "csv",
            "--row-limit",
            "10",
            "--read-only",
            "SELECT 1",
        ])
        .unwrap();
        assert_eq!(cli.database.as_deref(), Some("app.db"));
        assert_eq!(cli.format, ExportFormat::Csv);
        assert_eq!(cli.row_limit, Some(10));
        assert!(cli.read_only);
        assert_eq!(cli.sql, vec!["SELECT 1"]);
    }
}
