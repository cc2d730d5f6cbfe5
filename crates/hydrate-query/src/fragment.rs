//! Restriction fragments for loads by key.
//!
//! Parameters are written as `?` and numbered for the dialect once the whole
//! statement is assembled.

use hydrate_core::Dialect;

use crate::alias::qualify;

/// Restriction on one column: `a.id = ?` or `a.id in (?, ?, ?)`.
pub fn in_fragment(alias: &str, column: &str, count: usize) -> String {
    let column = qualify(alias, column);
    if count == 1 {
        return format!("{column} = ?");
    }
    let markers = vec!["?"; count].join(", ");
    format!("{column} in ({markers})")
}

/// Equality on every column: `a.x = ? and a.y = ?`.
pub fn condition_fragment(alias: &str, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{} = ?", qualify(alias, c)))
        .collect::<Vec<_>>()
        .join(" and ")
}

/// `count` copies of the column conjunction or-ed together:
/// `((a.x = ? and a.y = ?) or (a.x = ? and a.y = ?))`.
pub fn disjunction_fragment(alias: &str, columns: &[String], count: usize) -> String {
    let conjunction = condition_fragment(alias, columns);
    let terms = vec![format!("({conjunction})"); count].join(" or ");
    format!("({terms})")
}

/// Row-value list: `(a.x, a.y) in ((?, ?), (?, ?))`.
pub fn row_value_in_fragment(alias: &str, columns: &[String], count: usize) -> String {
    let lhs = columns
        .iter()
        .map(|c| qualify(alias, c))
        .collect::<Vec<_>>()
        .join(", ");
    let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
    let tuples = vec![tuple; count].join(", ");
    format!("({lhs}) in ({tuples})")
}

/// Restriction for a pre-sized load of `batch_size` keys.
///
/// Single columns use an IN list (`=` for one key); composite keys use a
/// conjunction, or a disjunction of conjunctions when batching.
pub fn where_fragment(alias: &str, columns: &[String], batch_size: usize) -> String {
    match columns {
        [column] => in_fragment(alias, column, batch_size),
        _ if batch_size == 1 => condition_fragment(alias, columns),
        _ => disjunction_fragment(alias, columns, batch_size),
    }
}

/// Restriction for a dynamically sized load of exactly `count` keys.
///
/// Composite keys use row-value constructors when the dialect supports them.
pub fn batch_fragment(alias: &str, columns: &[String], count: usize, dialect: Dialect) -> String {
    match columns {
        [column] => in_fragment(alias, column, count),
        _ if count == 1 => condition_fragment(alias, columns),
        _ if dialect.supports_row_value_constructor_in_in_list() => {
            row_value_in_fragment(alias, columns, count)
        }
        _ => disjunction_fragment(alias, columns, count),
    }
}
