//! SQL dialects and the capabilities the loader asks them about.

use crate::error::QueryErrorKind;
use crate::lock::{LockMode, LockOptions, LockTimeout};

/// SQL dialect for generating database-specific SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Properly escapes embedded quote characters by doubling them:
    /// - For Postgres/SQLite: `"` becomes `""`
    /// - For MySQL: `` ` `` becomes ``` `` ```
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Rewrite the positional `?` markers of a template into this dialect's
    /// placeholders, numbering them left to right.
    ///
    /// Markers inside single-quoted literals or quoted identifiers are left alone.
    pub fn render_placeholders(self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len() + 16);
        let mut index = 0;
        let mut quote: Option<char> = None;
        for ch in sql.chars() {
            match quote {
                Some(q) => {
                    out.push(ch);
                    if ch == q {
                        quote = None;
                    }
                }
                None => match ch {
                    '\'' | '"' | '`' => {
                        quote = Some(ch);
                        out.push(ch);
                    }
                    '?' => {
                        index += 1;
                        out.push_str(&self.placeholder(index));
                    }
                    _ => out.push(ch),
                },
            }
        }
        out
    }

    /// Can `(a, b) in ((?, ?), (?, ?))` be used for composite keys?
    pub const fn supports_row_value_constructor_in_in_list(self) -> bool {
        match self {
            Dialect::Postgres | Dialect::Mysql => true,
            Dialect::Sqlite => false,
        }
    }

    /// Maximum number of bind parameters a single statement may carry.
    pub const fn max_bind_parameters(self) -> usize {
        match self {
            Dialect::Postgres | Dialect::Mysql => 65_535,
            Dialect::Sqlite => 999,
        }
    }

    /// The strategy used to size dynamic and multi-load batches.
    pub const fn batch_load_sizing_strategy(self) -> BatchLoadSizingStrategy {
        BatchLoadSizingStrategy {
            max_parameters: self.max_bind_parameters(),
        }
    }

    /// Row lock clause appended to a select, if the mode needs one.
    ///
    /// SQLite has no row-level locks, so it never produces a clause.
    pub fn for_update_clause(self, options: &LockOptions) -> Option<String> {
        if !options.lock_mode.is_pessimistic() || self == Dialect::Sqlite {
            return None;
        }
        let mut clause = match (self, options.lock_mode) {
            (Dialect::Postgres, LockMode::PessimisticRead) => " for share".to_string(),
            (Dialect::Mysql, LockMode::PessimisticRead) => " for share".to_string(),
            _ => " for update".to_string(),
        };
        match options.timeout {
            LockTimeout::NoWait => clause.push_str(" nowait"),
            LockTimeout::SkipLocked => clause.push_str(" skip locked"),
            LockTimeout::Wait | LockTimeout::Millis(_) => {}
        }
        Some(clause)
    }

    /// Classify a database error by SQLSTATE (and vendor message where the
    /// SQLSTATE is too coarse).
    pub fn classify_error(self, sqlstate: Option<&str>, message: &str) -> QueryErrorKind {
        let Some(state) = sqlstate else {
            let lower = message.to_ascii_lowercase();
            return if lower.contains("database is locked") || lower.contains("busy") {
                QueryErrorKind::LockAcquisition
            } else if lower.contains("syntax error") {
                QueryErrorKind::Syntax
            } else if lower.contains("no such table") || lower.contains("no such column") {
                QueryErrorKind::NotFound
            } else {
                QueryErrorKind::Database
            };
        };
        match state {
            "40P01" => QueryErrorKind::Deadlock,
            "40001" if self == Dialect::Mysql => QueryErrorKind::Deadlock,
            "40001" => QueryErrorKind::Serialization,
            "55P03" => QueryErrorKind::LockAcquisition,
            "57014" => QueryErrorKind::Timeout,
            "HY000" if self == Dialect::Mysql && message.contains("Lock wait timeout") => {
                QueryErrorKind::LockAcquisition
            }
            "22001" => QueryErrorKind::DataTruncation,
            "42501" => QueryErrorKind::Permission,
            "42P01" | "42703" | "42S02" | "42S22" => QueryErrorKind::NotFound,
            s if s.starts_with("23") => QueryErrorKind::Constraint,
            s if s.starts_with("42") => QueryErrorKind::Syntax,
            _ => QueryErrorKind::Database,
        }
    }
}

/// Chooses how many identifiers to load in one round trip.
///
/// The result never drops below one and never decreases as the number of
/// outstanding keys grows; it is capped by the bind-parameter limit divided
/// by the identifier column span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLoadSizingStrategy {
    max_parameters: usize,
}

impl BatchLoadSizingStrategy {
    /// A strategy capped at `max_parameters` bind parameters per statement.
    pub const fn with_max_parameters(max_parameters: usize) -> Self {
        Self { max_parameters }
    }

    pub fn determine_optimal_batch_load_size(
        &self,
        identifier_column_span: usize,
        number_of_keys: usize,
    ) -> usize {
        let cap = (self.max_parameters / identifier_column_span.max(1)).max(1);
        number_of_keys.clamp(1, cap)
    }
}
