//! Query DSL translator from Elasticsearch format to SQL predicates
//!
//! Used for the request `query` and for `filter`/`filters` aggregations.
//! A translated query is `None` when it matches everything.

use crate::error::CompileError;
use crate::query::date_math;
use crate::query::sql::{and_all, json_literal, or_all, quote_identifier, quote_literal};
use crate::query::types::*;
use quarry::schema::{FieldType, SchemaLookup};
use serde_json::Value;

/// Maximum length for passthrough query strings
const MAX_QUERY_STRING_LENGTH: usize = 10_000;

/// Turns Lucene query strings into SQL predicates
pub trait LuceneParser: Send + Sync {
    fn parse(&self, query: &str, default_fields: &[String]) -> Result<String, String>;
}

/// Translates Elasticsearch Query DSL to SQL `WHERE` fragments
pub struct WhereTranslator<'a> {
    schema: &'a dyn SchemaLookup,
    table: &'a str,
    lucene: Option<&'a dyn LuceneParser>,
}

impl<'a> WhereTranslator<'a> {
    pub fn new(schema: &'a dyn SchemaLookup, table: &'a str) -> Self {
        Self {
            schema,
            table,
            lucene: None,
        }
    }

    pub fn with_lucene(mut self, lucene: Option<&'a dyn LuceneParser>) -> Self {
        self.lucene = lucene;
        self
    }

    /// Translate a query, `None` means match all
    pub fn translate(&self, query: &EsQuery) -> Result<Option<String>, CompileError> {
        match query {
            EsQuery::MatchAll(_) => Ok(None),

            EsQuery::MatchNone(_) => Ok(Some("false".to_string())),

            EsQuery::Match(fields) => {
                let parts = fields
                    .iter()
                    .map(|(field, m)| self.translate_match(field, m.query(), m.operator()))
                    .collect::<Vec<_>>();
                Ok(and_all(parts))
            }

            EsQuery::MatchPhrase(fields) => {
                let parts = fields
                    .iter()
                    .map(|(field, m)| {
                        let (column, field_type) = self.column(field);
                        match m.query() {
                            Value::String(phrase) if is_text(field_type) => {
                                format!("{column} ILIKE {}", contains_pattern(phrase))
                            }
                            other => format!("{column} = {}", self.value_literal(field_type, other)),
                        }
                    })
                    .collect::<Vec<_>>();
                Ok(and_all(parts))
            }

            EsQuery::MultiMatch(mm) => {
                let fields = match &mm.fields {
                    Some(fields) if !fields.is_empty() => fields.clone(),
                    _ => self
                        .schema
                        .fields(self.table)
                        .into_iter()
                        .filter(|f| f.searchable && f.field_type.is_full_text())
                        .map(|f| f.name)
                        .collect(),
                };
                if fields.is_empty() {
                    return Err(CompileError::InvalidQuery(
                        "multi_match has no fields to search".to_string(),
                    ));
                }
                let value = Value::String(mm.query.clone());
                let parts = fields
                    .iter()
                    .map(|f| self.translate_match(f, &value, mm.operator.as_deref()))
                    .collect::<Vec<_>>();
                Ok(or_all(parts))
            }

            EsQuery::Term(fields) => {
                let parts = fields
                    .iter()
                    .map(|(field, term)| {
                        let (column, field_type) = self.column(field);
                        format!(
                            "{column} = {}",
                            self.value_literal(field_type, term.value())
                        )
                    })
                    .collect::<Vec<_>>();
                Ok(and_all(parts))
            }

            EsQuery::Terms(fields) => {
                let parts = fields
                    .iter()
                    .map(|(field, values)| {
                        let (column, field_type) = self.column(field);
                        if values.is_empty() {
                            return "false".to_string();
                        }
                        let list: Vec<String> = values
                            .iter()
                            .map(|v| self.value_literal(field_type, v))
                            .collect();
                        format!("{column} IN ({})", list.join(", "))
                    })
                    .collect::<Vec<_>>();
                Ok(and_all(parts))
            }

            EsQuery::Range(fields) => {
                let parts = fields
                    .iter()
                    .map(|(field, params)| self.translate_range(field, params))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(and_all(parts))
            }

            EsQuery::Bool(bool_query) => self.translate_bool(bool_query),

            EsQuery::Exists(exists) => {
                let (column, _) = self.column(&exists.field);
                Ok(Some(format!("{column} IS NOT NULL")))
            }

            EsQuery::QueryString(qs) => self.translate_query_string("query_string", qs),

            EsQuery::SimpleQueryString(qs) => {
                self.translate_query_string("simple_query_string", qs)
            }

            EsQuery::Wildcard(fields) => {
                let parts = fields
                    .iter()
                    .map(|(field, params)| {
                        let (column, _) = self.column(field);
                        let op = if params.case_insensitive() { "ILIKE" } else { "LIKE" };
                        format!("{column} {op} {}", wildcard_pattern(params.value()))
                    })
                    .collect::<Vec<_>>();
                Ok(and_all(parts))
            }

            EsQuery::Prefix(fields) => {
                let parts = fields
                    .iter()
                    .map(|(field, params)| {
                        let (column, _) = self.column(field);
                        format!("startsWith({column}, {})", quote_literal(params.value()))
                    })
                    .collect::<Vec<_>>();
                Ok(and_all(parts))
            }

            EsQuery::Ids(ids) => {
                if ids.values.is_empty() {
                    return Ok(Some("false".to_string()));
                }
                let list: Vec<String> = ids.values.iter().map(|id| quote_literal(id)).collect();
                Ok(Some(format!(
                    "{} IN ({})",
                    quote_identifier("_id"),
                    list.join(", ")
                )))
            }
        }
    }

    /// Translate a query that must yield a predicate (`true` for match all)
    pub fn translate_predicate(&self, query: &EsQuery) -> Result<String, CompileError> {
        Ok(self.translate(query)?.unwrap_or_else(|| "true".to_string()))
    }

    fn column(&self, field: &str) -> (String, Option<FieldType>) {
        match self.schema.field(self.table, field) {
            Some(info) => (quote_identifier(&info.name), Some(info.field_type)),
            None => {
                tracing::debug!("Field {} not in schema of {}", field, self.table);
                (quote_identifier(field), None)
            }
        }
    }

    fn translate_match(&self, field: &str, value: &Value, operator: Option<&str>) -> String {
        let (column, field_type) = self.column(field);
        match value {
            Value::String(text) if is_text(field_type) => {
                let tokens: Vec<String> = text
                    .split_whitespace()
                    .map(|token| format!("{column} ILIKE {}", contains_pattern(token)))
                    .collect();
                let joined = if operator.is_some_and(|op| op.eq_ignore_ascii_case("and")) {
                    and_all(tokens)
                } else {
                    or_all(tokens)
                };
                joined.unwrap_or_else(|| "true".to_string())
            }
            other => format!("{column} = {}", self.value_literal(field_type, other)),
        }
    }

    fn translate_range(&self, field: &str, params: &RangeParams) -> Result<String, CompileError> {
        let (column, field_type) = self.column(field);
        let bounds = [
            (">=", &params.gte),
            (">", &params.gt),
            ("<=", &params.lte),
            ("<", &params.lt),
        ];
        let mut parts = Vec::new();
        for (op, bound) in bounds {
            if let Some(value) = bound {
                parts.push(format!(
                    "{column} {op} {}",
                    self.bound_literal(field_type, value)?
                ));
            }
        }
        if parts.is_empty() {
            return Err(CompileError::InvalidQuery(format!(
                "range query on '{field}' must have at least one bound"
            )));
        }
        Ok(parts.join(" AND "))
    }

    fn translate_bool(&self, bool_query: &BoolQuery) -> Result<Option<String>, CompileError> {
        let mut parts = Vec::new();
        let mut has_required = false;

        for clause in [&bool_query.must, &bool_query.filter].into_iter().flatten() {
            for q in clause.as_slice() {
                has_required = true;
                if let Some(p) = self.translate(q)? {
                    parts.push(p);
                }
            }
        }

        if let Some(must_not) = &bool_query.must_not {
            for q in must_not.as_slice() {
                match self.translate(q)? {
                    Some(p) => parts.push(format!("NOT ({p})")),
                    None => parts.push("false".to_string()),
                }
            }
        }

        if let Some(should) = &bool_query.should {
            let clauses: Vec<String> = should
                .as_slice()
                .iter()
                .map(|q| self.translate_predicate(q))
                .collect::<Result<_, _>>()?;
            // Without must/filter at least one should clause has to match
            let required = match &bool_query.minimum_should_match {
                Some(msm) => msm.resolve(clauses.len()),
                None if has_required => 0,
                None => 1.min(clauses.len()),
            };
            match required {
                0 => {}
                1 => parts.extend(or_all(clauses)),
                n => {
                    let sum: Vec<String> = clauses.iter().map(|c| format!("toUInt8({c})")).collect();
                    parts.push(format!("({}) >= {n}", sum.join(" + ")));
                }
            }
        }

        Ok(and_all(parts))
    }

    fn translate_query_string(
        &self,
        kind: &str,
        qs: &QueryStringQuery,
    ) -> Result<Option<String>, CompileError> {
        if qs.query.len() > MAX_QUERY_STRING_LENGTH {
            return Err(CompileError::InvalidQuery(format!(
                "{kind} exceeds maximum length of {MAX_QUERY_STRING_LENGTH} characters"
            )));
        }
        let query = qs.query.trim();
        if query.is_empty() || query == "*" {
            return Ok(None);
        }
        let lucene = self
            .lucene
            .ok_or_else(|| CompileError::UnsupportedQueryType(kind.to_string()))?;
        let fields = match (&qs.fields, &qs.default_field) {
            (Some(fields), _) => fields.clone(),
            (None, Some(field)) => vec![field.clone()],
            (None, None) => Vec::new(),
        };
        lucene
            .parse(query, &fields)
            .map(Some)
            .map_err(CompileError::InvalidQuery)
    }

    fn value_literal(&self, field_type: Option<FieldType>, value: &Value) -> String {
        match (field_type, value) {
            (Some(t), Value::String(s)) if t.is_date() => {
                format!("parseDateTime64BestEffort({})", quote_literal(s))
            }
            (Some(FieldType::Boolean), Value::String(s)) => match s.as_str() {
                "true" | "false" => s.clone(),
                _ => quote_literal(s),
            },
            _ => json_literal(value),
        }
    }

    fn bound_literal(
        &self,
        field_type: Option<FieldType>,
        value: &Value,
    ) -> Result<String, CompileError> {
        let is_date = field_type.is_some_and(|t| t.is_date());
        match value {
            Value::String(s) if date_math::is_date_math(s) => {
                Ok(date_math::parse(s)?.to_clickhouse())
            }
            Value::String(s) if is_date => {
                Ok(format!("parseDateTime64BestEffort({})", quote_literal(s)))
            }
            Value::Number(n) if is_date => Ok(format!("fromUnixTimestamp64Milli({n})")),
            other => Ok(json_literal(other)),
        }
    }
}

fn is_text(field_type: Option<FieldType>) -> bool {
    // Unknown fields are matched like text
    field_type.map_or(true, |t| t.is_full_text())
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn contains_pattern(s: &str) -> String {
    quote_literal(&format!("%{}%", escape_like(s)))
}

/// `*` and `?` become `%` and `_`, everything else is literal
fn wildcard_pattern(s: &str) -> String {
    let pattern: String = escape_like(s)
        .chars()
        .map(|c| match c {
            '*' => '%',
            '?' => '_',
            other => other,
        })
        .collect();
    quote_literal(&pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry::schema::{FieldInfo, SchemaRegistry, TableSchema};
    use serde_json::json;

    struct UpperLucene;

    impl LuceneParser for UpperLucene {
        fn parse(&self, query: &str, fields: &[String]) -> Result<String, String> {
            Ok(format!("lucene({query}, {})", fields.join("|")))
        }
    }

    fn registry() -> SchemaRegistry {
        let registry = SchemaRegistry::new();
        registry.register(
            TableSchema::new("t")
                .with_field(FieldInfo::new("message", FieldType::Text))
                .with_field(FieldInfo::new("status", FieldType::Keyword))
                .with_field(FieldInfo::new("age", FieldType::Long))
                .with_field(FieldInfo::new("ts", FieldType::Timestamp))
                .with_field(FieldInfo::new("ok", FieldType::Boolean)),
        );
        registry
    }

    fn translate(query: Value) -> Result<Option<String>, CompileError> {
        let registry = registry();
        let q: EsQuery = serde_json::from_value(query).unwrap();
        WhereTranslator::new(&registry, "t").translate(&q)
    }

    fn sql(query: Value) -> String {
        translate(query).unwrap().unwrap()
    }

    #[test]
    fn test_match_all_is_none() {
        assert_eq!(translate(json!({"match_all": {}})).unwrap(), None);
        assert_eq!(sql(json!({"match_none": {}})), "false");
    }

    #[test]
    fn test_term_query() {
        assert_eq!(sql(json!({"term": {"status": "active"}})), "\"status\" = 'active'");
        assert_eq!(sql(json!({"term": {"age": 30}})), "\"age\" = 30");
        assert_eq!(sql(json!({"term": {"ok": true}})), "\"ok\" = true");
    }

    #[test]
    fn test_keyword_subfield_uses_base_column() {
        assert_eq!(
            sql(json!({"term": {"message.keyword": "x"}})),
            "\"message\" = 'x'"
        );
    }

    #[test]
    fn test_terms_query() {
        assert_eq!(
            sql(json!({"terms": {"status": ["a", "b"]}})),
            "\"status\" IN ('a', 'b')"
        );
        assert_eq!(sql(json!({"terms": {"status": []}})), "false");
    }

    #[test]
    fn test_match_on_text_and_keyword() {
        assert_eq!(
            sql(json!({"match": {"message": "disk full"}})),
            "(\"message\" ILIKE '%disk%') OR (\"message\" ILIKE '%full%')"
        );
        assert_eq!(
            sql(json!({"match": {"message": {"query": "disk full", "operator": "and"}}})),
            "(\"message\" ILIKE '%disk%') AND (\"message\" ILIKE '%full%')"
        );
        assert_eq!(
            sql(json!({"match": {"status": "active"}})),
            "\"status\" = 'active'"
        );
    }

    #[test]
    fn test_match_phrase_escapes_like() {
        assert_eq!(
            sql(json!({"match_phrase": {"message": "100% it's"}})),
            "\"message\" ILIKE '%100\\\\% it\\'s%'"
        );
    }

    #[test]
    fn test_multi_match_defaults_to_text_fields() {
        assert_eq!(
            sql(json!({"multi_match": {"query": "boom"}})),
            "\"message\" ILIKE '%boom%'"
        );
    }

    #[test]
    fn test_range_numeric() {
        assert_eq!(
            sql(json!({"range": {"age": {"gte": 18, "lt": 65}}})),
            "\"age\" >= 18 AND \"age\" < 65"
        );
    }

    #[test]
    fn test_range_dates() {
        assert_eq!(
            sql(json!({"range": {"ts": {"gte": "now-15m", "lte": "2024-01-01T00:00:00Z"}}})),
            "\"ts\" >= subDate(now(), INTERVAL 15 minute) AND \"ts\" <= parseDateTime64BestEffort('2024-01-01T00:00:00Z')"
        );
        assert_eq!(
            sql(json!({"range": {"ts": {"gt": 1700000000000i64}}})),
            "\"ts\" > fromUnixTimestamp64Milli(1700000000000)"
        );
    }

    #[test]
    fn test_range_bad_date_math() {
        let err = translate(json!({"range": {"ts": {"gte": "now-15x"}}})).unwrap_err();
        assert!(matches!(err, CompileError::DateMath(_)));
    }

    #[test]
    fn test_range_no_bounds_error() {
        assert!(matches!(
            translate(json!({"range": {"age": {}}})),
            Err(CompileError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_bool_query() {
        assert_eq!(
            sql(json!({"bool": {
                "must": [{"term": {"status": "a"}}],
                "filter": {"exists": {"field": "age"}},
                "must_not": [{"term": {"ok": false}}]
            }})),
            "(\"status\" = 'a') AND (\"age\" IS NOT NULL) AND (NOT (\"ok\" = false))"
        );
    }

    #[test]
    fn test_bool_should_only_requires_one() {
        assert_eq!(
            sql(json!({"bool": {"should": [{"term": {"status": "a"}}, {"term": {"status": "b"}}]}})),
            "(\"status\" = 'a') OR (\"status\" = 'b')"
        );
    }

    #[test]
    fn test_bool_should_ignored_next_to_must() {
        assert_eq!(
            sql(json!({"bool": {"must": {"term": {"status": "a"}}, "should": {"term": {"age": 1}}}})),
            "\"status\" = 'a'"
        );
    }

    #[test]
    fn test_bool_minimum_should_match() {
        assert_eq!(
            sql(json!({"bool": {
                "should": [{"term": {"age": 1}}, {"term": {"age": 2}}, {"match_all": {}}],
                "minimum_should_match": 2
            }})),
            "(toUInt8(\"age\" = 1) + toUInt8(\"age\" = 2) + toUInt8(true)) >= 2"
        );
    }

    #[test]
    fn test_bool_empty_matches_all() {
        assert_eq!(translate(json!({"bool": {}})).unwrap(), None);
    }

    #[test]
    fn test_wildcard_and_prefix() {
        assert_eq!(
            sql(json!({"wildcard": {"status": "er?or*"}})),
            "\"status\" LIKE 'er_or%'"
        );
        assert_eq!(
            sql(json!({"wildcard": {"status": {"value": "a_*", "case_insensitive": true}}})),
            "\"status\" ILIKE 'a\\\\_%'"
        );
        assert_eq!(
            sql(json!({"prefix": {"status": "err"}})),
            "startsWith(\"status\", 'err')"
        );
    }

    #[test]
    fn test_ids() {
        assert_eq!(
            sql(json!({"ids": {"values": ["a", "b"]}})),
            "\"_id\" IN ('a', 'b')"
        );
    }

    #[test]
    fn test_query_string_needs_parser() {
        assert_eq!(
            translate(json!({"query_string": {"query": "*"}})).unwrap(),
            None
        );
        assert!(matches!(
            translate(json!({"query_string": {"query": "status:a"}})),
            Err(CompileError::UnsupportedQueryType(t)) if t == "query_string"
        ));

        let registry = registry();
        let q: EsQuery = serde_json::from_value(json!({
            "query_string": {"query": "status:a", "default_field": "message"}
        }))
        .unwrap();
        let lucene = UpperLucene;
        let translator = WhereTranslator::new(&registry, "t").with_lucene(Some(&lucene));
        assert_eq!(
            translator.translate(&q).unwrap(),
            Some("lucene(status:a, message)".to_string())
        );
    }

    #[test]
    fn test_query_string_length_limit() {
        let long = "a".repeat(MAX_QUERY_STRING_LENGTH + 1);
        assert!(matches!(
            translate(json!({"query_string": {"query": long}})),
            Err(CompileError::InvalidQuery(_))
        ));
    }
}
