//! Table/column alias generation and property paths.

use std::fmt;

const ALIAS_TRUNCATE_LENGTH: usize = 10;

/// Alias of the form `person0_`, derived from an entity name or collection role.
///
/// The description is unqualified (`com.acme.Person` → `Person`), truncated,
/// lowercased and stripped of leading non-letters. A trailing digit gets an
/// `x` so it cannot run into the uniquing number.
pub fn generate_alias(description: &str, unique: usize) -> String {
    format!("{}{unique}_", alias_root(description))
}

fn alias_root(description: &str) -> String {
    let unqualified = description.rsplit('.').next().unwrap_or(description);
    let truncated: String = unqualified
        .chars()
        .take(ALIAS_TRUNCATE_LENGTH)
        .map(|c| match c {
            '/' | '$' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    let cleaned = match truncated.find(|c: char| c.is_ascii_alphabetic()) {
        Some(start) => truncated[start..].to_string(),
        None => truncated,
    };
    if cleaned.is_empty() {
        return "x".to_string();
    }
    if cleaned.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{cleaned}x")
    } else {
        cleaned
    }
}

/// Result-set alias of a column selected through `table_alias`.
pub fn column_alias(table_alias: &str, column: &str) -> String {
    format!("{table_alias}_{column}")
}

/// `alias.column`
pub fn qualify(alias: &str, column: &str) -> String {
    format!("{alias}.{column}")
}

/// Dotted path of an association from the root of a walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PropertyPath {
    segments: Vec<String>,
}

impl PropertyPath {
    pub fn root() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn append(&self, property: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(property.to_string());
        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn full_path(&self) -> String {
        self.segments.join(".")
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_path())
    }
}
