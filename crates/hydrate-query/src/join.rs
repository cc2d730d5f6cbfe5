//! JOIN clause types.

use std::fmt;

use crate::alias::qualify;

/// How an association is fetched by a load statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JoinType {
    /// Not joined; fetched later by a separate select (or proxied).
    #[default]
    None,
    Inner,
    LeftOuter,
}

impl JoinType {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(&self) -> Option<&'static str> {
        match self {
            JoinType::None => None,
            JoinType::Inner => Some("inner join"),
            JoinType::LeftOuter => Some("left outer join"),
        }
    }

    pub const fn is_joined(&self) -> bool {
        !matches!(self, JoinType::None)
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("none"))
    }
}

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    /// Type of join
    pub join_type: JoinType,
    /// Table to join
    pub table: String,
    /// Table alias
    pub alias: String,
    /// Pairs of (qualified left-hand column, right-hand column)
    pub on: Vec<(String, String)>,
    /// Additional ON restriction (filters), already qualified
    pub condition: Option<String>,
}

impl Join {
    /// Join `table alias` on `lhs_alias.lhs_columns[i] = alias.rhs_columns[i]`.
    pub fn new(
        join_type: JoinType,
        table: impl Into<String>,
        alias: impl Into<String>,
        lhs_alias: &str,
        lhs_columns: &[String],
        rhs_columns: &[String],
    ) -> Self {
        let alias = alias.into();
        let on = lhs_columns
            .iter()
            .zip(rhs_columns)
            .map(|(l, r)| (qualify(lhs_alias, l), qualify(&alias, r)))
            .collect();
        Self {
            join_type,
            table: table.into(),
            alias,
            on,
            condition: None,
        }
    }

    /// Add an extra ON restriction (builder pattern).
    #[must_use]
    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        let condition = condition.into();
        if !condition.is_empty() {
            self.condition = Some(condition);
        }
        self
    }

    /// Generate SQL for this JOIN clause, or nothing for `JoinType::None`.
    pub fn to_sql(&self) -> Option<String> {
        let keyword = self.join_type.as_str()?;
        let mut on: Vec<String> = self.on.iter().map(|(l, r)| format!("{l}={r}")).collect();
        if let Some(condition) = &self.condition {
            on.push(format!("({condition})"));
        }
        Some(format!(
            " {keyword} {} {} on {}",
            self.table,
            self.alias,
            on.join(" and ")
        ))
    }
}

/// Ordered list of joins appended to a FROM clause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinFragment {
    joins: Vec<Join>,
}

impl JoinFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, join: Join) {
        self.joins.push(join);
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn to_sql(&self) -> String {
        self.joins.iter().filter_map(Join::to_sql).collect()
    }
}
