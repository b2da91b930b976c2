//! Statement planner
//!
//! Turns a compiled aggregation tree into SQL statements. Every grouping
//! aggregation gets one statement that re-groups by all ancestor keys, so a
//! child's rows can be matched to the parent's buckets by key prefix.
//!
//! range, date_range and filters branches are either merged into one
//! statement of `-If` combinators or split into one statement per branch.
//! Pipelines never touch the store and are planned as empty entries.

use crate::aggregations::node::*;
use crate::error::PlanError;
use crate::query::sql::{and_all, OrderBy, SelectStatement, SortDirection};
use std::fmt;

/// One step from a level to a child, `branch` set for split branches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressStep {
    pub child: usize,
    pub branch: Option<usize>,
}

/// Position of a node (or one of its branches) in the tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NodeAddress(pub Vec<AddressStep>);

impl NodeAddress {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, child: usize, branch: Option<usize>) -> Self {
        let mut steps = self.0.clone();
        steps.push(AddressStep { child, branch });
        Self(steps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundSide {
    From,
    To,
}

/// What a SELECT column carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRole {
    /// Grouping key of an ancestor bucket
    PrefixKey,
    /// Grouping key of this node
    Key,
    Count { branch: Option<usize> },
    /// Sum of counts over the parent bucket, feeds `sum_other_doc_count`
    ParentCount,
    /// `part` of the metric at `child`
    Metric {
        child: usize,
        part: usize,
        branch: Option<usize>,
    },
    Bound { branch: usize, side: BoundSide },
    /// A field of a row-level metric
    Field { index: usize },
    /// Every remaining column of the row
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedColumn {
    pub expr: String,
    pub role: ColumnRole,
}

impl PlannedColumn {
    fn new(expr: impl Into<String>, role: ColumnRole) -> Self {
        Self {
            expr: expr.into(),
            role,
        }
    }
}

/// One planned statement. `sql` is `None` for entries that never reach the store.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: Option<String>,
    pub table_name: String,
    pub owner: NodeAddress,
    /// `>` separated name of the owning aggregation
    pub aggregation: String,
    pub columns: Vec<PlannedColumn>,
    pub prefix_len: usize,
    pub merged: bool,
}

impl CompiledQuery {
    pub fn is_no_db(&self) -> bool {
        self.sql.is_none()
    }

    pub fn column_index(&self, role: &ColumnRole) -> Option<usize> {
        self.columns.iter().position(|c| c.role == *role)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPlan {
    pub table: String,
    pub statements: Vec<CompiledQuery>,
}

impl QueryPlan {
    /// SQL per statement, `None` for entries the runner skips
    pub fn sql(&self) -> Vec<Option<String>> {
        self.statements.iter().map(|s| s.sql.clone()).collect()
    }

    pub fn db_statement_count(&self) -> usize {
        self.statements.iter().filter(|s| !s.is_no_db()).count()
    }

    pub fn merged_count(&self) -> usize {
        self.statements.iter().filter(|s| s.merged).count()
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, statement) in self.statements.iter().enumerate() {
            let name = &statement.aggregation;
            match &statement.sql {
                Some(sql) => writeln!(f, "[{i}] {name}: {sql}")?,
                None => writeln!(f, "[{i}] {name}: NoDBQuery")?,
            }
        }
        Ok(())
    }
}

/// Enclosing buckets of the level being planned
#[derive(Debug, Clone, Default)]
struct Context {
    address: NodeAddress,
    keys: Vec<String>,
    predicates: Vec<String>,
    path: String,
}

impl Context {
    fn nested(&self, name: &str, address: NodeAddress) -> Self {
        Self {
            address,
            keys: self.keys.clone(),
            predicates: self.predicates.clone(),
            path: if self.path.is_empty() {
                name.to_string()
            } else {
                format!("{}>{name}", self.path)
            },
        }
    }
}

pub struct QueryPlanner<'a> {
    table: &'a str,
    base_where: Option<&'a str>,
    merge_conditional: bool,
    statements: Vec<CompiledQuery>,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(table: &'a str, base_where: Option<&'a str>) -> Self {
        Self {
            table,
            base_where,
            merge_conditional: true,
            statements: Vec::new(),
        }
    }

    pub fn with_merge_conditional(mut self, merge: bool) -> Self {
        self.merge_conditional = merge;
        self
    }

    pub fn plan(mut self, tree: &AggregationTree) -> QueryPlan {
        let root = Context::default();
        let metrics = metric_columns(&tree.aggregations, None, None);
        if !metrics.is_empty() {
            let mut select = SelectStatement::new(self.table).filter(self.where_clause(&root, None));
            for column in &metrics {
                select = select.column(column.expr.clone());
            }
            // named after the metrics it serves
            let names: Vec<&str> = tree
                .aggregations
                .iter()
                .filter(|n| n.metric().is_some_and(MetricAggregation::is_aggregate))
                .map(|n| n.name.as_str())
                .collect();
            let owner = Context {
                path: names.join(","),
                ..Context::default()
            };
            self.push(&owner, root.address.clone(), select, metrics, 0, false);
        }
        self.plan_level(&tree.aggregations, &root);

        let plan = QueryPlan {
            table: self.table.to_string(),
            statements: self.statements,
        };
        tracing::debug!(
            statements = plan.statements.len(),
            db_statements = plan.db_statement_count(),
            merged = plan.merged_count(),
            "Planned aggregation statements"
        );
        quarry::metrics::record_planned_statements(plan.db_statement_count(), plan.merged_count());
        plan
    }

    fn where_clause(&self, ctx: &Context, extra: Option<&str>) -> Option<String> {
        and_all(
            self.base_where
                .into_iter()
                .chain(ctx.predicates.iter().map(String::as_str))
                .chain(extra),
        )
    }

    fn push(
        &mut self,
        ctx: &Context,
        owner: NodeAddress,
        select: SelectStatement,
        columns: Vec<PlannedColumn>,
        prefix_len: usize,
        merged: bool,
    ) {
        self.statements.push(CompiledQuery {
            sql: Some(select.to_string()),
            table_name: self.table.to_string(),
            owner,
            aggregation: ctx.path.clone(),
            columns,
            prefix_len,
            merged,
        });
    }

    fn push_no_db(&mut self, ctx: &Context, owner: NodeAddress) {
        self.statements.push(CompiledQuery {
            sql: None,
            table_name: self.table.to_string(),
            owner,
            aggregation: ctx.path.clone(),
            columns: Vec::new(),
            prefix_len: 0,
            merged: false,
        });
    }

    fn plan_level(&mut self, nodes: &[AggregationNode], ctx: &Context) {
        for (i, node) in nodes.iter().enumerate() {
            let address = ctx.address.child(i, None);
            match &node.kind {
                AggregationKind::Metric(metric) if metric.is_aggregate() => {}
                AggregationKind::Metric(metric) => {
                    self.plan_row_metric(metric, &ctx.nested(&node.name, address), ctx)
                }
                AggregationKind::Pipeline(_) => {
                    self.push_no_db(&ctx.nested(&node.name, address.clone()), address)
                }
                AggregationKind::Bucket(bucket) => self.plan_bucket(node, bucket, i, ctx),
            }
        }
    }

    fn prefix_columns(ctx: &Context) -> Vec<PlannedColumn> {
        ctx.keys
            .iter()
            .map(|k| PlannedColumn::new(k.clone(), ColumnRole::PrefixKey))
            .collect()
    }

    fn plan_bucket(&mut self, node: &AggregationNode, bucket: &BucketAggregation, index: usize, ctx: &Context) {
        if let Some(key) = bucket.key_sql() {
            self.plan_grouping(node, bucket, key, index, ctx);
        } else if bucket.branches().is_some() {
            self.plan_conditional(node, bucket, index, ctx);
        } else {
            self.plan_filter(node, index, ctx);
        }
    }

    fn plan_grouping(
        &mut self,
        node: &AggregationNode,
        bucket: &BucketAggregation,
        key: String,
        index: usize,
        ctx: &Context,
    ) {
        let address = ctx.address.child(index, None);
        let inner = ctx.nested(&node.name, address.clone());

        let mut columns = Self::prefix_columns(ctx);
        columns.push(PlannedColumn::new(key.clone(), ColumnRole::Key));
        columns.push(PlannedColumn::new("count()", ColumnRole::Count { branch: None }));
        columns.extend(metric_columns(&node.children, None, None));

        let mut group_by = ctx.keys.clone();
        group_by.push(key.clone());

        // terms never bucket missing values, nor do its descendants see them
        let present = matches!(bucket, BucketAggregation::Terms(_)).then(|| format!("{key} IS NOT NULL"));
        let mut select = SelectStatement::new(self.table)
            .filter(self.where_clause(ctx, present.as_deref()))
            .group_by(group_by);

        if let BucketAggregation::Terms(params) = bucket {
            let window = if ctx.keys.is_empty() {
                "sum(count()) OVER ()".to_string()
            } else {
                format!("sum(count()) OVER (PARTITION BY {})", ctx.keys.join(", "))
            };
            columns.push(PlannedColumn::new(window, ColumnRole::ParentCount));
            select = select
                .order_by(terms_order_by(params, &key, &node.children))
                .limit(params.size, ctx.keys.clone());
        } else {
            select = select.order_by(vec![OrderBy::asc(key.clone())]);
        }

        for column in &columns {
            select = select.column(column.expr.clone());
        }
        self.push(&inner, address, select, columns, ctx.keys.len(), false);

        let mut child_ctx = inner;
        child_ctx.predicates.extend(present);
        child_ctx.keys.push(key);
        self.plan_level(&node.children, &child_ctx);
    }

    fn plan_filter(&mut self, node: &AggregationNode, index: usize, ctx: &Context) {
        let address = ctx.address.child(index, None);
        let inner = ctx.nested(&node.name, address.clone());

        let mut columns = Self::prefix_columns(ctx);
        columns.push(PlannedColumn::new("count()", ColumnRole::Count { branch: None }));
        columns.extend(metric_columns(&node.children, None, None));

        let mut select = SelectStatement::new(self.table)
            .filter(self.where_clause(ctx, node.where_clause.as_deref()))
            .group_by(ctx.keys.clone());
        for column in &columns {
            select = select.column(column.expr.clone());
        }
        self.push(&inner, address, select, columns, ctx.keys.len(), false);

        let mut child_ctx = inner;
        child_ctx.predicates.extend(node.where_clause.clone());
        self.plan_level(&node.children, &child_ctx);
    }

    fn plan_conditional(&mut self, node: &AggregationNode, bucket: &BucketAggregation, index: usize, ctx: &Context) {
        let branches = bucket.branches().unwrap_or_default();
        if self.merge_conditional {
            match merge_precondition(node) {
                Ok(()) => return self.plan_merged(node, branches, index, ctx),
                Err(e) => tracing::debug!(error = %e, "Splitting conditional aggregation"),
            }
        }
        self.plan_split(node, branches, index, ctx);
    }

    fn plan_merged(&mut self, node: &AggregationNode, branches: &[ConditionalBranch], index: usize, ctx: &Context) {
        let address = ctx.address.child(index, None);
        let inner = ctx.nested(&node.name, address.clone());

        let mut columns = Self::prefix_columns(ctx);
        for (b, branch) in branches.iter().enumerate() {
            columns.push(PlannedColumn::new(
                format!("countIf({})", branch.predicate),
                ColumnRole::Count { branch: Some(b) },
            ));
            columns.extend(metric_columns(&node.children, Some(&branch.predicate), Some(b)));
            columns.extend(bound_columns(branch, b));
        }

        let mut select = SelectStatement::new(self.table)
            .filter(self.where_clause(ctx, None))
            .group_by(ctx.keys.clone());
        for column in &columns {
            select = select.column(column.expr.clone());
        }
        self.push(&inner, address.clone(), select, columns, ctx.keys.len(), true);

        for (c, child) in node.children.iter().enumerate() {
            if child.is_pipeline() {
                let child_address = address.child(c, None);
                self.push_no_db(&inner.nested(&child.name, child_address.clone()), child_address);
            }
        }
    }

    fn plan_split(&mut self, node: &AggregationNode, branches: &[ConditionalBranch], index: usize, ctx: &Context) {
        for (b, branch) in branches.iter().enumerate() {
            let address = ctx.address.child(index, Some(b));
            let inner = ctx.nested(&node.name, address.clone());

            let mut columns = Self::prefix_columns(ctx);
            columns.push(PlannedColumn::new("count()", ColumnRole::Count { branch: None }));
            columns.extend(metric_columns(&node.children, None, None));
            columns.extend(bound_columns(branch, b));

            let mut select = SelectStatement::new(self.table)
                .filter(self.where_clause(ctx, Some(&branch.predicate)))
                .group_by(ctx.keys.clone());
            for column in &columns {
                select = select.column(column.expr.clone());
            }
            self.push(&inner, address, select, columns, ctx.keys.len(), false);

            let mut child_ctx = inner;
            child_ctx.predicates.push(branch.predicate.clone());
            self.plan_level(&node.children, &child_ctx);
        }
    }

    /// top_hits and top_metrics read rows, ranked per enclosing bucket
    fn plan_row_metric(&mut self, metric: &MetricAggregation, inner: &Context, ctx: &Context) {
        let mut columns = Self::prefix_columns(ctx);
        let (size, order) = match metric {
            MetricAggregation::TopHits { size, sort, fields } => {
                if fields.is_empty() {
                    columns.push(PlannedColumn::new("*", ColumnRole::Wildcard));
                }
                for (index, field) in fields.iter().enumerate() {
                    columns.push(PlannedColumn::new(field.sql(), ColumnRole::Field { index }));
                }
                let order = sort.iter().map(|(field, direction)| order_by(field.sql(), *direction)).collect();
                (*size, order)
            }
            MetricAggregation::TopMetrics { size, sort, metrics } => {
                for (index, field) in metrics.iter().enumerate() {
                    columns.push(PlannedColumn::new(field.value_sql(), ColumnRole::Field { index }));
                }
                columns.push(PlannedColumn::new(
                    sort.0.value_sql(),
                    ColumnRole::Field { index: metrics.len() },
                ));
                (*size, vec![order_by(sort.0.sql(), sort.1)])
            }
            _ => return,
        };

        let mut select = SelectStatement::new(self.table)
            .filter(self.where_clause(ctx, None))
            .order_by(order)
            .limit(size, ctx.keys.clone());
        for column in &columns {
            select = select.column(column.expr.clone());
        }
        self.push(inner, inner.address.clone(), select, columns, ctx.keys.len(), false);
    }
}

fn order_by(expr: String, direction: SortDirection) -> OrderBy {
    OrderBy { expr, direction }
}

/// Aggregate columns of every metric child
fn metric_columns(children: &[AggregationNode], condition: Option<&str>, branch: Option<usize>) -> Vec<PlannedColumn> {
    let mut columns = Vec::new();
    for (child, node) in children.iter().enumerate() {
        let Some(metric) = node.metric().filter(|m| m.is_aggregate()) else {
            continue;
        };
        for (part, expr) in metric.aggregate_columns(condition).into_iter().enumerate() {
            columns.push(PlannedColumn::new(expr, ColumnRole::Metric { child, part, branch }));
        }
    }
    columns
}

fn bound_columns(branch: &ConditionalBranch, index: usize) -> Vec<PlannedColumn> {
    let BranchLabel::DateRange { from, to, .. } = &branch.label else {
        return Vec::new();
    };
    let mut columns = Vec::new();
    for (bound, side) in [(from, BoundSide::From), (to, BoundSide::To)] {
        if let Some(bound) = bound {
            columns.push(PlannedColumn::new(
                format!("toInt64(toUnixTimestamp64Milli(toDateTime64({}, 3)))", bound.sql),
                ColumnRole::Bound { branch: index, side },
            ));
        }
    }
    columns
}

fn terms_order_by(params: &TermsParams, key: &str, children: &[AggregationNode]) -> Vec<OrderBy> {
    match &params.order {
        TermsOrder::Key(direction) => vec![order_by(key.to_string(), *direction)],
        TermsOrder::Count(direction) => {
            vec![order_by("count()".to_string(), *direction), OrderBy::asc(key)]
        }
        TermsOrder::Metric {
            child,
            value,
            direction,
        } => {
            let expr = children
                .get(*child)
                .and_then(AggregationNode::metric)
                .and_then(|metric| {
                    let part = value
                        .as_ref()
                        .and_then(|v| metric.value_names().iter().position(|n| n == v))
                        .unwrap_or(0);
                    metric.aggregate_columns(None).into_iter().nth(part)
                })
                .unwrap_or_else(|| "count()".to_string());
            vec![order_by(expr, *direction), OrderBy::asc(key)]
        }
    }
}

/// Branches merge only when every child fits into `-If` columns
fn merge_precondition(node: &AggregationNode) -> Result<(), PlanError> {
    for child in &node.children {
        let fits = child.is_pipeline() || child.metric().is_some_and(|m| m.is_aggregate());
        if !fits {
            return Err(PlanError::MergePrecondition {
                name: node.name.clone(),
                reason: format!("sub-aggregation [{}] needs its own statement", child.name),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregations::compiler::AggregationCompiler;
    use quarry::schema::{FieldInfo, FieldType, SchemaRegistry, TableSchema};
    use serde_json::{json, Value};

    fn tree(aggs: Value) -> AggregationTree {
        let registry = SchemaRegistry::new();
        registry.register(
            TableSchema::new("t")
                .with_field(FieldInfo::new("ts", FieldType::Timestamp))
                .with_field(FieldInfo::new("host", FieldType::Keyword))
                .with_field(FieldInfo::new("x", FieldType::Long))
                .with_field(FieldInfo::new("price", FieldType::Float)),
        );
        let compiled = AggregationCompiler::new(&registry, "t").compile(aggs.as_object().unwrap());
        assert!(compiled.warnings.is_empty(), "{:?}", compiled.warnings);
        compiled.tree
    }

    #[test]
    fn test_histogram_statement() {
        let plan = QueryPlanner::new("t", None).plan(&tree(json!({
            "0": {"histogram": {"field": "x", "interval": 1}}
        })));
        assert_eq!(plan.statements.len(), 1);
        assert_eq!(
            plan.statements[0].sql.as_deref(),
            Some("SELECT \"x\", count() FROM \"t\" GROUP BY (\"x\") ORDER BY \"x\" ASC")
        );
        assert_eq!(plan.statements[0].prefix_len, 0);
    }

    #[test]
    fn test_root_metrics_share_one_statement() {
        let plan = QueryPlanner::new("t", Some("\"host\" = 'a'")).plan(&tree(json!({
            "a": {"avg": {"field": "price"}},
            "hosts": {"terms": {"field": "host"}},
            "m": {"max": {"field": "x"}}
        })));
        assert_eq!(plan.statements.len(), 2);
        assert_eq!(
            plan.statements[0].sql.as_deref(),
            Some("SELECT avgOrNull(\"price\"), maxOrNull(\"x\") FROM \"t\" WHERE \"host\" = 'a'")
        );
        assert_eq!(plan.statements[0].owner, NodeAddress::root());
        assert_eq!(plan.statements[1].owner, NodeAddress::root().child(1, None));
    }

    #[test]
    fn test_nested_terms_limit_by() {
        let plan = QueryPlanner::new("t", None).plan(&tree(json!({
            "per_day": {
                "date_histogram": {"field": "ts", "fixed_interval": "1d"},
                "aggs": {
                    "hosts": {
                        "terms": {"field": "host", "size": 3},
                        "aggs": {"p": {"avg": {"field": "price"}}}
                    }
                }
            }
        })));
        assert_eq!(plan.statements.len(), 2);
        let day_key = "intDiv(toUnixTimestamp64Milli(\"ts\"), 86400000)";
        let inner = &plan.statements[1];
        assert_eq!(inner.prefix_len, 1);
        assert_eq!(inner.aggregation, "per_day>hosts");
        assert_eq!(
            inner.sql.as_deref().unwrap(),
            format!(
                "SELECT {day_key}, \"host\", count(), avgOrNull(\"price\"), sum(count()) OVER (PARTITION BY {day_key}) \
                 FROM \"t\" WHERE \"host\" IS NOT NULL GROUP BY ({day_key}, \"host\") ORDER BY count() DESC, \"host\" ASC LIMIT 3 BY {day_key}"
            )
        );
        let roles: Vec<_> = inner.columns.iter().map(|c| c.role.clone()).collect();
        assert_eq!(
            roles,
            vec![
                ColumnRole::PrefixKey,
                ColumnRole::Key,
                ColumnRole::Count { branch: None },
                ColumnRole::Metric { child: 0, part: 0, branch: None },
                ColumnRole::ParentCount,
            ]
        );
    }

    #[test]
    fn test_merged_filters() {
        let plan = QueryPlanner::new("t", None).plan(&tree(json!({
            "f": {
                "filters": {"filters": {"a": {"term": {"host": "a"}}, "b": {"term": {"host": "b"}}}},
                "aggs": {"s": {"sum": {"field": "x"}}, "c": {"cumulative_sum": {"buckets_path": "s"}}}
            }
        })));
        assert_eq!(plan.statements.len(), 2);
        assert!(plan.statements[0].merged);
        assert_eq!(
            plan.statements[0].sql.as_deref(),
            Some(
                "SELECT countIf(\"host\" = 'a'), sumOrNullIf(\"x\", \"host\" = 'a'), \
                 countIf(\"host\" = 'b'), sumOrNullIf(\"x\", \"host\" = 'b') FROM \"t\""
            )
        );
        assert!(plan.statements[1].is_no_db());
        assert_eq!(plan.merged_count(), 1);
    }

    #[test]
    fn test_split_filters() {
        let plan = QueryPlanner::new("t", None)
            .with_merge_conditional(false)
            .plan(&tree(json!({
                "f": {
                    "filters": {"filters": {"a": {"term": {"host": "a"}}, "b": {"term": {"host": "b"}}}},
                    "aggs": {"s": {"sum": {"field": "x"}}}
                }
            })));
        let sql: Vec<_> = plan.sql().into_iter().flatten().collect();
        assert_eq!(
            sql,
            vec![
                "SELECT count(), sumOrNull(\"x\") FROM \"t\" WHERE \"host\" = 'a'",
                "SELECT count(), sumOrNull(\"x\") FROM \"t\" WHERE \"host\" = 'b'",
            ]
        );
        assert_eq!(plan.statements[1].owner, NodeAddress::root().child(0, Some(1)));
    }

    #[test]
    fn test_bucket_child_forces_split() {
        let plan = QueryPlanner::new("t", None).plan(&tree(json!({
            "r": {
                "range": {"field": "x", "ranges": [{"to": 10}, {"from": 10}]},
                "aggs": {"hosts": {"terms": {"field": "host", "size": 2}}}
            }
        })));
        // two branch statements, each followed by its terms statement
        assert_eq!(plan.statements.len(), 4);
        assert!(plan.statements.iter().all(|s| !s.merged));
        let terms = plan.statements[1].sql.as_deref().unwrap();
        assert!(terms.contains("WHERE (\"x\" < 10) AND (\"host\" IS NOT NULL)"), "{terms}");
        assert!(terms.ends_with("LIMIT 2"));
    }

    #[test]
    fn test_top_hits_limit_by() {
        let plan = QueryPlanner::new("t", None).plan(&tree(json!({
            "hosts": {
                "terms": {"field": "host"},
                "aggs": {"latest": {"top_hits": {"size": 1, "sort": [{"ts": {"order": "desc"}}], "_source": ["x"]}}}
            }
        })));
        assert_eq!(plan.statements.len(), 2);
        assert_eq!(
            plan.statements[1].sql.as_deref(),
            Some("SELECT \"host\", \"x\" FROM \"t\" WHERE \"host\" IS NOT NULL ORDER BY \"ts\" DESC LIMIT 1 BY \"host\"")
        );
        assert_eq!(plan.statements[1].owner, NodeAddress::root().child(0, None).child(0, None));
    }

    #[test]
    fn test_date_range_bound_columns() {
        let plan = QueryPlanner::new("t", None).plan(&tree(json!({
            "dr": {"date_range": {"field": "ts", "ranges": [{"from": "now-1h"}]}}
        })));
        let statement = &plan.statements[0];
        assert_eq!(
            statement.column_index(&ColumnRole::Bound { branch: 0, side: BoundSide::From }),
            Some(1)
        );
        assert_eq!(statement.column_index(&ColumnRole::Bound { branch: 0, side: BoundSide::To }), None);
    }

    #[test]
    fn test_plan_display() {
        let plan = QueryPlanner::new("t", None).plan(&tree(json!({
            "h": {"histogram": {"field": "x", "interval": 5}, "aggs": {"c": {"cumulative_sum": {"buckets_path": "_count"}}}}
        })));
        let text = plan.to_string();
        assert!(text.starts_with("[0] h: SELECT"));
        assert!(text.contains("[1] h>c: NoDBQuery"));
    }
}
