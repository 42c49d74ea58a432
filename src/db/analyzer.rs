use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Longest query accepted without a length warning.
pub const MAX_RECOMMENDED_QUERY_LEN: usize = 100_000;

/// Statement category, decided by the leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Truncate,
    Begin,
    Commit,
    Rollback,
    Pragma,
    Explain,
    Attach,
    Detach,
    Vacuum,
    Unknown,
}

impl QueryType {
    /// Keyword table in match order. `Unknown` is the fallback and has no keyword.
    pub const KEYWORDS: [QueryType; 16] = [
        QueryType::Select,
        QueryType::Insert,
        QueryType::Update,
        QueryType::Delete,
        QueryType::Create,
        QueryType::Drop,
        QueryType::Alter,
        QueryType::Truncate,
        QueryType::Begin,
        QueryType::Commit,
        QueryType::Rollback,
        QueryType::Pragma,
        QueryType::Explain,
        QueryType::Attach,
        QueryType::Detach,
        QueryType::Vacuum,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QueryType::Select => "SELECT",
            QueryType::Insert => "INSERT",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
            QueryType::Create => "CREATE",
            QueryType::Drop => "DROP",
            QueryType::Alter => "ALTER",
            QueryType::Truncate => "TRUNCATE",
            QueryType::Begin => "BEGIN",
            QueryType::Commit => "COMMIT",
            QueryType::Rollback => "ROLLBACK",
            QueryType::Pragma => "PRAGMA",
            QueryType::Explain => "EXPLAIN",
            QueryType::Attach => "ATTACH",
            QueryType::Detach => "DETACH",
            QueryType::Vacuum => "VACUUM",
            QueryType::Unknown => "UNKNOWN",
        }
    }

    /// Statements that never modify the database.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            QueryType::Select | QueryType::Pragma | QueryType::Explain
        )
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

static QUERY_PATTERNS: Lazy<Vec<(Regex, QueryType)>> = Lazy::new(|| {
    QueryType::KEYWORDS
        .iter()
        .map(|ty| {
            let pattern = format!(r"(?i)^\s*{}\b", ty.name());
            (Regex::new(&pattern).unwrap(), *ty)
        })
        .collect()
});

const DANGEROUS_PATTERNS: [&str; 11] = [
    r";\s*DROP\b",
    r";\s*DELETE\b",
    r";\s*UPDATE\b",
    r";\s*INSERT\b",
    r";\s*CREATE\b",
    r";\s*ALTER\b",
    r"--",
    r"/\*",
    r"UNION\s+SELECT",
    r"INTO\s+OUTFILE",
    r"LOAD_FILE",
];

static DANGEROUS_REGEXES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    DANGEROUS_PATTERNS
        .iter()
        .map(|p| (Regex::new(&format!("(?i){p}")).unwrap(), *p))
        .collect()
});

/// Pattern-based statement classification and security linting.
///
/// This is intentionally not a parser: it looks at the leading keyword and
/// scans for a fixed list of suspicious fragments.
pub struct QueryAnalyzer;

impl QueryAnalyzer {
    pub fn determine_type(sql: &str) -> QueryType {
        QUERY_PATTERNS
            .iter()
            .find(|(re, _)| re.is_match(sql))
            .map(|(_, ty)| *ty)
            .unwrap_or(QueryType::Unknown)
    }

    /// Advisory warnings for `sql`. Never blocks execution.
    pub fn validate_security(sql: &str, allow_dangerous: bool) -> Vec<String> {
        let mut warnings = Vec::new();
        if !allow_dangerous {
            for (re, pattern) in DANGEROUS_REGEXES.iter() {
                if re.is_match(sql) {
                    warnings.push(format!("potentially dangerous pattern detected: {pattern}"));
                }
            }
        }
        if sql.chars().count() > MAX_RECOMMENDED_QUERY_LEN {
            warnings.push("query exceeds recommended length".to_string());
        }
        warnings
    }

    pub fn is_read_only(query_type: QueryType) -> bool {
        query_type.is_read_only()
    }
}
