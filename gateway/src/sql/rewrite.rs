use std::collections::HashMap;
use std::ops::ControlFlow;

use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, Ident,
    JoinConstraint, JoinOperator, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins, Value, VisitMut, VisitorMut,
};

use crate::row_filters::{PlanKind, RowFilterPlan};
use crate::sql::validator::object_name_string;

/// Replace logical dataset identifiers with physical table names.
///
/// The whole object name is substituted: a dotted logical id such as
/// `prod.energy.solar` is one identifier, and the physical name is split on
/// dots so `dataset_api.solar_tbl` comes out schema-qualified. After
/// substitution the statement references only physical tables.
pub fn substitute_tables(statement: &mut Statement, mapping: &HashMap<String, String>) {
    if mapping.is_empty() {
        return;
    }
    let _ = statement.visit(&mut TableSubstituter { mapping });
}

struct TableSubstituter<'a> {
    mapping: &'a HashMap<String, String>,
}

impl VisitorMut for TableSubstituter<'_> {
    type Break = ();

    fn pre_visit_table_factor(
        &mut self,
        table_factor: &mut TableFactor,
    ) -> ControlFlow<Self::Break> {
        if let TableFactor::Table { name, args, .. } = table_factor {
            if args.is_none() {
                let logical = object_name_string(name);
                if let Some(physical) = self.mapping.get(&logical) {
                    tracing::debug!(logical = %logical, physical = %physical, "Mapping table");
                    name.0 = physical.split('.').map(Ident::new).collect();
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// Apply resolved row-filter plans to a statement.
///
/// A `deny` plan short-circuits: the boolean literal FALSE is added to the
/// top-level SELECT's WHERE. Otherwise every SELECT gets, for each of its
/// own FROM/join sources matching a plan's table, the plan predicate with
/// unqualified columns bound to that occurrence's alias (or the bare table
/// name). Existing WHERE clauses are extended with AND; re-applying an
/// identical predicate is a no-op.
pub fn apply_row_filter_plans(statement: &mut Statement, plans: &[RowFilterPlan]) {
    let Statement::Query(query) = statement else {
        return;
    };

    if plans.iter().any(|p| p.kind == PlanKind::Deny) {
        // Every top-level branch gets FALSE, so a UNION cannot leak rows
        // through its other arms.
        deny_set_expr(&mut query.body);
        return;
    }

    let mut by_table: HashMap<&str, Vec<&RowFilterPlan>> = HashMap::new();
    for plan in plans {
        by_table.entry(plan.table.as_str()).or_default().push(plan);
    }
    if by_table.is_empty() {
        return;
    }

    inject_query(query, &by_table);
}

type PlansByTable<'a> = HashMap<&'a str, Vec<&'a RowFilterPlan>>;

fn inject_query(query: &mut Query, plans: &PlansByTable<'_>) {
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            inject_query(&mut cte.query, plans);
        }
    }
    inject_set_expr(&mut query.body, plans);
    if let Some(order_by) = &mut query.order_by {
        for ordered in &mut order_by.exprs {
            inject_expr(&mut ordered.expr, plans);
        }
    }
}

fn inject_set_expr(body: &mut SetExpr, plans: &PlansByTable<'_>) {
    match body {
        SetExpr::Select(select) => inject_select(select, plans),
        SetExpr::Query(query) => inject_query(query, plans),
        SetExpr::SetOperation { left, right, .. } => {
            inject_set_expr(left, plans);
            inject_set_expr(right, plans);
        }
        _ => {}
    }
}

fn inject_select(select: &mut Select, plans: &PlansByTable<'_>) {
    let mut conjuncts: Vec<Expr> = Vec::new();
    for table in &mut select.from {
        collect_from_table_with_joins(table, plans, &mut conjuncts);
    }

    for item in &mut select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                inject_expr(expr, plans)
            }
            _ => {}
        }
    }
    if let Some(selection) = &mut select.selection {
        inject_expr(selection, plans);
    }
    if let Some(having) = &mut select.having {
        inject_expr(having, plans);
    }
    if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
        for expr in exprs {
            inject_expr(expr, plans);
        }
    }

    for conjunct in conjuncts {
        and_conjunct(&mut select.selection, conjunct);
    }
}

fn collect_from_table_with_joins(
    table: &mut TableWithJoins,
    plans: &PlansByTable<'_>,
    out: &mut Vec<Expr>,
) {
    collect_from_factor(&mut table.relation, plans, out);
    for join in &mut table.joins {
        collect_from_factor(&mut join.relation, plans, out);
        match &mut join.join_operator {
            JoinOperator::Inner(JoinConstraint::On(expr))
            | JoinOperator::LeftOuter(JoinConstraint::On(expr))
            | JoinOperator::RightOuter(JoinConstraint::On(expr))
            | JoinOperator::FullOuter(JoinConstraint::On(expr)) => inject_expr(expr, plans),
            _ => {}
        }
    }
}

fn collect_from_factor(factor: &mut TableFactor, plans: &PlansByTable<'_>, out: &mut Vec<Expr>) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let table_name = object_name_string(name);
            if let Some(table_plans) = plans.get(table_name.as_str()) {
                let qualifier = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .or_else(|| name.0.last().map(|i| i.value.clone()))
                    .unwrap_or(table_name);
                for plan in table_plans {
                    if let Some(template) = &plan.predicate {
                        out.push(qualify_columns(template, &qualifier));
                    }
                }
            }
        }
        TableFactor::Derived { subquery, .. } => inject_query(subquery, plans),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_from_table_with_joins(table_with_joins, plans, out),
        _ => {}
    }
}

/// Descend into expressions to reach subqueries; the filters apply wherever
/// a governed table is selected from, however deeply nested.
fn inject_expr(expr: &mut Expr, plans: &PlansByTable<'_>) {
    match expr {
        Expr::Subquery(query) => inject_query(query, plans),
        Expr::InSubquery { expr, subquery, .. } => {
            inject_expr(expr, plans);
            inject_query(subquery, plans);
        }
        Expr::BinaryOp { left, right, .. } => {
            inject_expr(left, plans);
            inject_expr(right, plans);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => inject_expr(expr, plans),
        Expr::InList { expr, list, .. } => {
            inject_expr(expr, plans);
            for item in list {
                inject_expr(item, plans);
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            inject_expr(expr, plans);
            inject_expr(low, plans);
            inject_expr(high, plans);
        }
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => inject_expr(inner, plans),
        Expr::Function(function) => match &mut function.args {
            FunctionArguments::Subquery(query) => inject_query(query, plans),
            FunctionArguments::List(list) => {
                for arg in &mut list.args {
                    if let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))
                    | FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(expr),
                        ..
                    } = arg
                    {
                        inject_expr(expr, plans);
                    }
                }
            }
            FunctionArguments::None => {}
        },
        _ => {}
    }
}

/// Bind unqualified column references in a predicate template to a FROM
/// occurrence's qualifier. Columns inside pointer-table subqueries belong
/// to the subquery's own scope and are left untouched.
fn qualify_columns(template: &Expr, qualifier: &str) -> Expr {
    let mut out = template.clone();
    qualify_in_place(&mut out, qualifier);
    out
}

fn qualify_in_place(expr: &mut Expr, qualifier: &str) {
    match expr {
        Expr::Identifier(ident) => {
            *expr = Expr::CompoundIdentifier(vec![Ident::new(qualifier), ident.clone()]);
        }
        Expr::CompoundIdentifier(_) => {}
        Expr::BinaryOp { left, right, .. } => {
            qualify_in_place(left, qualifier);
            qualify_in_place(right, qualifier);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => qualify_in_place(expr, qualifier),
        Expr::InList { expr, .. } => qualify_in_place(expr, qualifier),
        Expr::InSubquery { expr, .. } => qualify_in_place(expr, qualifier),
        Expr::Between {
            expr, low, high, ..
        } => {
            qualify_in_place(expr, qualifier);
            qualify_in_place(low, qualifier);
            qualify_in_place(high, qualifier);
        }
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => qualify_in_place(inner, qualifier),
        _ => {}
    }
}

/// Add a conjunct to a WHERE clause, creating it when absent. Adding a
/// conjunct that is already present is a no-op, which makes plan
/// application idempotent.
fn and_conjunct(selection: &mut Option<Expr>, predicate: Expr) {
    if let Some(existing) = selection {
        if flatten_and(existing).iter().any(|c| **c == predicate) {
            return;
        }
    }
    *selection = Some(match selection.take() {
        Some(existing) => Expr::BinaryOp {
            left: Box::new(existing),
            op: BinaryOperator::And,
            right: Box::new(predicate),
        },
        None => predicate,
    });
}

fn flatten_and(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = flatten_and(left);
            out.extend(flatten_and(right));
            out
        }
        _ => vec![expr],
    }
}

fn deny_set_expr(body: &mut SetExpr) {
    match body {
        SetExpr::Select(select) => {
            and_conjunct(&mut select.selection, Expr::Value(Value::Boolean(false)));
        }
        SetExpr::Query(query) => deny_set_expr(&mut query.body),
        SetExpr::SetOperation { left, right, .. } => {
            deny_set_expr(left);
            deny_set_expr(right);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row_filters::RowFilterPlan;
    use crate::sql::parse_sql_query;

    fn mapping(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    fn eq_predicate(column: &str, value: &str) -> Expr {
        Expr::BinaryOp {
            left: Box::new(Expr::Identifier(Ident::new(column))),
            op: BinaryOperator::Eq,
            right: Box::new(Expr::Value(Value::SingleQuotedString(value.to_string()))),
        }
    }

    fn rewritten(sql: &str, map: &HashMap<String, String>, plans: &[RowFilterPlan]) -> String {
        let parsed = parse_sql_query(sql).unwrap();
        let mut statement = parsed.statement().clone();
        substitute_tables(&mut statement, map);
        apply_row_filter_plans(&mut statement, plans);
        statement.to_string()
    }

    // --- substitution ---

    #[test]
    fn substitutes_simple_table() {
        let out = rewritten("SELECT * FROM ds_open", &mapping(&[("ds_open", "public.t")]), &[]);
        assert_eq!(out, "SELECT * FROM public.t");
    }

    #[test]
    fn substitutes_dotted_logical_id_as_whole() {
        let out = rewritten(
            "SELECT * FROM prod.energy.solar_readings",
            &mapping(&[("prod.energy.solar_readings", "dataset_api.solar_tbl")]),
            &[],
        );
        assert_eq!(out, "SELECT * FROM dataset_api.solar_tbl");
        assert!(!out.contains("prod"), "logical prefix must not survive: {out}");
    }

    #[test]
    fn unmapped_tables_are_left_untouched() {
        let out = rewritten(
            "SELECT * FROM ds_a JOIN ds_b ON ds_a.id = ds_b.id",
            &mapping(&[("ds_a", "public.a")]),
            &[],
        );
        assert!(out.contains("public.a"), "{out}");
        assert!(out.contains("ds_b"), "{out}");
    }

    #[test]
    fn substitution_reaches_subqueries_and_ctes() {
        let out = rewritten(
            "WITH latest AS (SELECT max(ts) AS ts FROM ds_open) \
             SELECT * FROM ds_open WHERE ts = (SELECT ts FROM latest)",
            &mapping(&[("ds_open", "public.t")]),
            &[],
        );
        assert!(!out.contains("ds_open"), "{out}");
        assert!(out.contains("latest"), "CTE alias must survive: {out}");
        assert_eq!(out.matches("public.t").count(), 1);
    }

    #[test]
    fn cte_alias_is_never_substituted() {
        // A dataset can share a name with nothing in the mapping unless it
        // was actually referenced; the CTE reference must stay intact.
        let out = rewritten(
            "WITH x AS (SELECT id FROM ds_open) SELECT * FROM x",
            &mapping(&[("ds_open", "public.t")]),
            &[],
        );
        assert!(out.contains("FROM x"), "{out}");
        assert!(out.contains("public.t"), "{out}");
    }

    #[test]
    fn substitution_preserves_everything_else() {
        let sql = "SELECT id, lower(city) AS c FROM ds_open \
                   WHERE temperature > 22 ORDER BY id";
        let parsed = parse_sql_query(sql).unwrap();
        let before = parsed.sql();
        let out = rewritten(sql, &mapping(&[("ds_open", "public.t")]), &[]);
        assert_eq!(out, before.replace("ds_open", "public.t"));
    }

    // --- predicate injection ---

    #[test]
    fn injects_predicate_creating_where() {
        let plan = RowFilterPlan::predicate("public.t", eq_predicate("owner_sub", "alice"));
        let out = rewritten("SELECT id FROM ds_m", &mapping(&[("ds_m", "public.t")]), &[plan]);
        assert_eq!(out, "SELECT id FROM public.t WHERE t.owner_sub = 'alice'");
    }

    #[test]
    fn injects_predicate_extending_existing_where_with_and() {
        let plan = RowFilterPlan::predicate("public.t", eq_predicate("owner_sub", "alice"));
        let out = rewritten(
            "SELECT id FROM ds_m WHERE temperature > 22",
            &mapping(&[("ds_m", "public.t")]),
            &[plan],
        );
        assert!(
            out.contains("temperature > 22 AND t.owner_sub = 'alice'"),
            "{out}"
        );
    }

    #[test]
    fn qualifies_with_alias_when_present() {
        let plan = RowFilterPlan::predicate("public.t", eq_predicate("owner_sub", "alice"));
        let out = rewritten(
            "SELECT m.id FROM ds_m m",
            &mapping(&[("ds_m", "public.t")]),
            &[plan],
        );
        assert!(out.contains("m.owner_sub = 'alice'"), "{out}");
    }

    #[test]
    fn each_occurrence_gets_its_own_qualified_predicate() {
        let plan = RowFilterPlan::predicate("public.t", eq_predicate("owner_sub", "alice"));
        let out = rewritten(
            "SELECT a.id FROM ds_m a JOIN ds_m b ON a.id = b.id",
            &mapping(&[("ds_m", "public.t")]),
            &[plan],
        );
        assert!(out.contains("a.owner_sub = 'alice'"), "{out}");
        assert!(out.contains("b.owner_sub = 'alice'"), "{out}");
    }

    #[test]
    fn filter_reaches_subquery_selects() {
        let plan = RowFilterPlan::predicate("public.t", eq_predicate("owner_sub", "alice"));
        let out = rewritten(
            "SELECT id FROM ds_other WHERE id IN (SELECT id FROM ds_m)",
            &mapping(&[("ds_m", "public.t"), ("ds_other", "public.o")]),
            &[plan],
        );
        assert!(
            out.contains("SELECT id FROM public.t WHERE t.owner_sub = 'alice'"),
            "{out}"
        );
    }

    #[test]
    fn filter_reaches_cte_bodies() {
        let plan = RowFilterPlan::predicate("public.t", eq_predicate("owner_sub", "alice"));
        let out = rewritten(
            "WITH base AS (SELECT id FROM ds_m) SELECT * FROM base",
            &mapping(&[("ds_m", "public.t")]),
            &[plan],
        );
        assert!(out.contains("t.owner_sub = 'alice'"), "{out}");
    }

    #[test]
    fn unrelated_tables_are_not_filtered() {
        let plan = RowFilterPlan::predicate("public.t", eq_predicate("owner_sub", "alice"));
        let out = rewritten(
            "SELECT * FROM ds_other",
            &mapping(&[("ds_other", "public.o")]),
            &[plan],
        );
        assert!(!out.contains("owner_sub"), "{out}");
    }

    #[test]
    fn subquery_template_keeps_inner_columns_unqualified() {
        // column IN (SELECT key FROM ptr WHERE user_id = 'alice'):
        // only the outer column gets the occurrence qualifier.
        let subquery_sql = "SELECT key_col FROM acl.ptr WHERE user_id = 'alice'";
        let parsed = parse_sql_query(subquery_sql).unwrap();
        let Statement::Query(query) = parsed.statement().clone() else {
            panic!("expected query");
        };
        let template = Expr::InSubquery {
            expr: Box::new(Expr::Identifier(Ident::new("sensor_id"))),
            subquery: query,
            negated: false,
        };
        let plan = RowFilterPlan::predicate("public.t", template);
        let out = rewritten(
            "SELECT id FROM ds_m m",
            &mapping(&[("ds_m", "public.t")]),
            &[plan],
        );
        assert!(out.contains("m.sensor_id IN ("), "{out}");
        assert!(out.contains("WHERE user_id = 'alice'"), "{out}");
        assert!(!out.contains("m.user_id"), "{out}");
        assert!(!out.contains("m.key_col"), "{out}");
    }

    // --- deny ---

    #[test]
    fn deny_plan_injects_false_at_top_level() {
        let plan = RowFilterPlan::deny("public.t");
        let out = rewritten("SELECT id FROM ds_m", &mapping(&[("ds_m", "public.t")]), &[plan]);
        assert_eq!(out, "SELECT id FROM public.t WHERE false");
    }

    #[test]
    fn deny_plan_ands_false_onto_existing_where() {
        let plan = RowFilterPlan::deny("public.t");
        let out = rewritten(
            "SELECT id FROM ds_m WHERE id > 3",
            &mapping(&[("ds_m", "public.t")]),
            &[plan],
        );
        assert!(out.contains("id > 3 AND false"), "{out}");
    }

    #[test]
    fn deny_reaches_every_union_branch() {
        let plan = RowFilterPlan::deny("public.t");
        let out = rewritten(
            "SELECT id FROM ds_m UNION SELECT id FROM ds_other",
            &mapping(&[("ds_m", "public.t"), ("ds_other", "public.o")]),
            &[plan],
        );
        assert_eq!(
            out.matches("false").count(),
            2,
            "both union arms must be zeroed: {out}"
        );
    }

    #[test]
    fn deny_wins_over_predicate_plans() {
        let plans = vec![
            RowFilterPlan::predicate("public.t", eq_predicate("owner_sub", "alice")),
            RowFilterPlan::deny("public.o"),
        ];
        let out = rewritten(
            "SELECT id FROM ds_m",
            &mapping(&[("ds_m", "public.t")]),
            &plans,
        );
        assert!(out.contains("false"), "{out}");
        assert!(!out.contains("owner_sub"), "{out}");
    }

    // --- idempotence ---

    #[test]
    fn applying_plans_twice_changes_nothing() {
        let plan = RowFilterPlan::predicate("public.t", eq_predicate("owner_sub", "alice"));
        let parsed = parse_sql_query("SELECT id FROM ds_m WHERE id > 1").unwrap();
        let mut statement = parsed.statement().clone();
        substitute_tables(&mut statement, &mapping(&[("ds_m", "public.t")]));
        apply_row_filter_plans(&mut statement, std::slice::from_ref(&plan));
        let once = statement.to_string();
        apply_row_filter_plans(&mut statement, std::slice::from_ref(&plan));
        assert_eq!(statement.to_string(), once, "rewriter must be idempotent");
    }

    // --- structural invariant ---

    #[test]
    fn rewrite_output_still_validates() {
        let plan = RowFilterPlan::predicate("warehouse.t", eq_predicate("owner_sub", "alice"));
        let out = rewritten(
            "SELECT m.id FROM ds_m m WHERE m.temperature > 22",
            &mapping(&[("ds_m", "warehouse.t")]),
            &[plan],
        );
        let reparsed = parse_sql_query(&out).expect("rewritten SQL must re-validate");
        assert_eq!(
            reparsed.referenced_tables().iter().next().map(|s| s.as_str()),
            Some("warehouse.t")
        );
    }
}
