//! The SQL subset the engine emits
//!
//! Only SELECT statements with GROUP BY, ORDER BY and LIMIT [BY] are ever
//! generated, so a small builder is all that is needed.

use serde_json::Value;
use std::fmt;

/// Quote an identifier with double quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Quote a string literal with single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Render a JSON scalar as an SQL literal
pub fn json_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        other => quote_literal(&other.to_string()),
    }
}

/// Render an f64 so the store parses it back as the same number
pub fn float_literal(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// AND together predicates, `None` when there are none
pub fn and_all<I, S>(predicates: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let parts: Vec<String> = predicates
        .into_iter()
        .map(|p| p.as_ref().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next(),
        _ => Some(
            parts
                .iter()
                .map(|p| format!("({p})"))
                .collect::<Vec<_>>()
                .join(" AND "),
        ),
    }
}

/// OR together predicates, `None` when there are none
pub fn or_all<I, S>(predicates: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let parts: Vec<String> = predicates
        .into_iter()
        .map(|p| p.as_ref().to_string())
        .collect();
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next(),
        _ => Some(
            parts
                .iter()
                .map(|p| format!("({p})"))
                .collect::<Vec<_>>()
                .join(" OR "),
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Some(SortDirection::Asc),
            "desc" => Some(SortDirection::Desc),
            _ => None,
        }
    }

    fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub expr: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// A single SELECT statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectStatement {
    pub columns: Vec<String>,
    pub from: String,
    pub where_clause: Option<String>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub limit_by: Vec<String>,
}

impl SelectStatement {
    pub fn new(table: &str) -> Self {
        Self {
            from: quote_identifier(table),
            ..Self::default()
        }
    }

    pub fn column(mut self, expr: impl Into<String>) -> Self {
        self.columns.push(expr.into());
        self
    }

    pub fn filter(mut self, predicate: Option<String>) -> Self {
        self.where_clause = predicate;
        self
    }

    pub fn group_by(mut self, exprs: Vec<String>) -> Self {
        self.group_by = exprs;
        self
    }

    pub fn order_by(mut self, order: Vec<OrderBy>) -> Self {
        self.order_by = order;
        self
    }

    pub fn limit(mut self, limit: usize, by: Vec<String>) -> Self {
        self.limit = Some(limit);
        self.limit_by = by;
        self
    }
}

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT {} FROM {}", self.columns.join(", "), self.from)?;
        if let Some(predicate) = &self.where_clause {
            write!(f, " WHERE {predicate}")?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY ({})", self.group_by.join(", "))?;
        }
        if !self.order_by.is_empty() {
            let order: Vec<String> = self
                .order_by
                .iter()
                .map(|o| format!("{} {}", o.expr, o.direction.as_sql()))
                .collect();
            write!(f, " ORDER BY {}", order.join(", "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
            if !self.limit_by.is_empty() {
                write!(f, " BY {}", self.limit_by.join(", "))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quoting() {
        assert_eq!(quote_identifier("day_of_week_i"), "\"day_of_week_i\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\\\"ird\"");
        assert_eq!(quote_literal("it's"), "'it\\'s'");
        assert_eq!(quote_literal("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_json_literal() {
        assert_eq!(json_literal(&json!("x")), "'x'");
        assert_eq!(json_literal(&json!(3)), "3");
        assert_eq!(json_literal(&json!(true)), "true");
        assert_eq!(json_literal(&json!(null)), "NULL");
    }

    #[test]
    fn test_float_literal() {
        assert_eq!(float_literal(5.0), "5");
        assert_eq!(float_literal(0.25), "0.25");
    }

    #[test]
    fn test_and_or() {
        assert_eq!(and_all(Vec::<String>::new()), None);
        assert_eq!(and_all(["a = 1"]), Some("a = 1".to_string()));
        assert_eq!(
            and_all(["a = 1", "", "b = 2"]),
            Some("(a = 1) AND (b = 2)".to_string())
        );
        assert_eq!(or_all(["a", "b"]), Some("(a) OR (b)".to_string()));
    }

    #[test]
    fn test_render_group_by() {
        let sql = SelectStatement::new("t")
            .column("\"day_of_week_i\"")
            .column("count()")
            .group_by(vec!["\"day_of_week_i\"".into()])
            .order_by(vec![OrderBy::asc("\"day_of_week_i\"")])
            .to_string();
        assert_eq!(
            sql,
            "SELECT \"day_of_week_i\", count() FROM \"t\" GROUP BY (\"day_of_week_i\") ORDER BY \"day_of_week_i\" ASC"
        );
    }

    #[test]
    fn test_render_limit_by() {
        let sql = SelectStatement::new("t")
            .column("\"a\"")
            .column("\"b\"")
            .column("count()")
            .filter(Some("\"c\" = 1".into()))
            .group_by(vec!["\"a\"".into(), "\"b\"".into()])
            .order_by(vec![OrderBy::desc("count()")])
            .limit(5, vec!["\"a\"".into()])
            .to_string();
        assert!(sql.contains("WHERE \"c\" = 1 GROUP BY"));
        assert!(sql.ends_with("ORDER BY count() DESC LIMIT 5 BY \"a\""));
    }
}
