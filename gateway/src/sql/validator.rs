use std::collections::BTreeSet;

use sqlparser::ast::{
    BinaryOperator, Distinct, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments,
    GroupByExpr, JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr,
    SetOperator, SetQuantifier, Statement, TableFactor, TableWithJoins, UnaryOperator, Value,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::GatewayError;
use crate::sql::ParsedSql;

pub const DEFAULT_MAX_DEPTH: usize = 50;

/// SECURITY: This is an allowlist — any new function must be reviewed before
/// adding here. Names are compared case-insensitively.
const ALLOWED_FUNCTIONS: &[&str] = &[
    // PostGIS
    "st_intersects",
    "st_within",
    "st_contains",
    "st_distance",
    "st_setsrid",
    "st_geomfromgeojson",
    "st_point",
    // PostGIS extension set
    "st_dwithin",
    "st_area",
    "st_centroid",
    "st_x",
    "st_y",
    "st_srid",
    "st_transform",
    // string
    "lower",
    "upper",
    "length",
    "trim",
    "ltrim",
    "rtrim",
    "substring",
    "replace",
    // numeric
    "abs",
    "round",
    "ceil",
    "floor",
    // comparison
    "coalesce",
    "nullif",
    "greatest",
    "least",
    // aggregation
    "min",
    "max",
    "avg",
    "sum",
    "count",
    // date
    "current_date",
    "current_timestamp",
    "date",
    "date_trunc",
    "extract",
];

/// Validate a raw SQL string against the allow-listed SELECT grammar.
///
/// Guarantees on success:
/// - single SELECT (or UNION of SELECTs) statement
/// - no statement stacking, no comments
/// - every node and function is explicitly allow-listed
/// - `referenced_tables` excludes every CTE alias at any depth
pub fn parse_sql_query(sql: &str) -> Result<ParsedSql, GatewayError> {
    parse_sql_query_with_depth(sql, DEFAULT_MAX_DEPTH)
}

pub fn parse_sql_query_with_depth(
    sql: &str,
    max_depth: usize,
) -> Result<ParsedSql, GatewayError> {
    // Absolute safety net: a parser panic must surface as a plain 400,
    // never as a crashed worker or a stack trace in a response.
    match std::panic::catch_unwind(|| validate(sql, max_depth)) {
        Ok(result) => result,
        Err(_) => {
            tracing::error!("SQL validator panicked on input");
            Err(GatewayError::invalid("Invalid SQL query"))
        }
    }
}

fn validate(sql: &str, max_depth: usize) -> Result<ParsedSql, GatewayError> {
    if sql.trim().is_empty() {
        return Err(GatewayError::invalid("Empty SQL query"));
    }

    scan_outside_strings(sql)?;

    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| {
        tracing::warn!(error = %e, "SQL parse error");
        GatewayError::invalid(format!("Invalid SQL syntax: {e}"))
    })?;

    if statements.len() != 1 {
        return Err(GatewayError::invalid(
            "Multiple SQL statements are not allowed",
        ));
    }
    let statement = statements.remove(0);

    let query = match &statement {
        Statement::Query(query) => query,
        other => {
            return Err(GatewayError::invalid(format!(
                "Only SELECT statements are allowed (got {})",
                statement_label(other)
            )));
        }
    };

    let mut walker = Walker {
        max_depth,
        depth: 0,
        tables: BTreeSet::new(),
        cte_aliases: BTreeSet::new(),
    };
    walker.query(query, true)?;

    let referenced: BTreeSet<String> = walker
        .tables
        .difference(&walker.cte_aliases)
        .cloned()
        .collect();

    Ok(ParsedSql::new(statement, referenced))
}

/// Pre-parse textual guard: any `;` or comment opener outside a
/// single-quoted literal (with `''` escapes) is fatal.
fn scan_outside_strings(sql: &str) -> Result<(), GatewayError> {
    let mut chars = sql.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                } else {
                    in_string = false;
                }
            }
            continue;
        }
        match c {
            '\'' => in_string = true,
            ';' => {
                return Err(GatewayError::invalid(
                    "Multiple SQL statements are not allowed",
                ));
            }
            '-' if chars.peek() == Some(&'-') => {
                return Err(GatewayError::invalid("SQL comments are not allowed"));
            }
            '/' if chars.peek() == Some(&'*') => {
                return Err(GatewayError::invalid("SQL comments are not allowed"));
            }
            _ => {}
        }
    }
    Ok(())
}

fn statement_label(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::CreateTable { .. } | Statement::CreateView { .. } => "CREATE",
        Statement::Drop { .. } => "DROP",
        Statement::Truncate { .. } => "TRUNCATE",
        Statement::Merge { .. } => "MERGE",
        Statement::Copy { .. } => "COPY",
        Statement::Grant { .. } => "GRANT",
        Statement::Revoke { .. } => "REVOKE",
        _ => "statement",
    }
}

pub(crate) fn object_name_string(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

struct Walker {
    max_depth: usize,
    depth: usize,
    tables: BTreeSet<String>,
    cte_aliases: BTreeSet<String>,
}

impl Walker {
    fn descend<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(GatewayError::invalid(format!(
                "Query too complex, max depth limit is {}",
                self.max_depth
            )));
        }
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn query(&mut self, query: &Query, top_level: bool) -> Result<(), GatewayError> {
        if top_level {
            if query.limit.is_some() {
                return Err(GatewayError::invalid(
                    "LIMIT not allowed in top-level query",
                ));
            }
            if query.offset.is_some() {
                return Err(GatewayError::invalid(
                    "OFFSET not allowed in top-level query",
                ));
            }
            if query.fetch.is_some() {
                return Err(GatewayError::invalid(
                    "FETCH not allowed in top-level query",
                ));
            }
        }

        if !query.locks.is_empty() || query.for_clause.is_some() {
            return Err(GatewayError::invalid(
                "Locking clauses are not allowed",
            ));
        }
        if !query.limit_by.is_empty()
            || query.settings.is_some()
            || query.format_clause.is_some()
        {
            return Err(GatewayError::invalid("Unsupported SQL construct"));
        }

        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_aliases.insert(cte.alias.name.value.clone());
                self.descend(|w| w.query(&cte.query, false))?;
            }
        }

        if let Some(limit) = &query.limit {
            self.expr(limit)?;
        }
        if let Some(offset) = &query.offset {
            self.expr(&offset.value)?;
        }

        if let Some(order_by) = &query.order_by {
            if order_by.interpolate.is_some() {
                return Err(GatewayError::invalid("Unsupported SQL construct"));
            }
            for ordered in &order_by.exprs {
                if ordered.with_fill.is_some() {
                    return Err(GatewayError::invalid("Unsupported SQL construct"));
                }
                self.expr(&ordered.expr)?;
            }
        }

        self.set_expr(&query.body)
    }

    fn set_expr(&mut self, body: &SetExpr) -> Result<(), GatewayError> {
        match body {
            SetExpr::Select(select) => self.descend(|w| w.select(select)),
            SetExpr::Query(query) => self.descend(|w| w.query(query, false)),
            SetExpr::SetOperation {
                op,
                set_quantifier,
                left,
                right,
            } => {
                if !matches!(op, SetOperator::Union) {
                    return Err(GatewayError::invalid(format!(
                        "SQL construct not allowed: {op}"
                    )));
                }
                if !matches!(
                    set_quantifier,
                    SetQuantifier::None | SetQuantifier::All | SetQuantifier::Distinct
                ) {
                    return Err(GatewayError::invalid("Unsupported SQL construct"));
                }
                self.descend(|w| w.set_expr(left))?;
                self.descend(|w| w.set_expr(right))
            }
            _ => Err(GatewayError::invalid("Unsupported SQL construct")),
        }
    }

    fn select(&mut self, select: &Select) -> Result<(), GatewayError> {
        if select.top.is_some()
            || select.into.is_some()
            || select.prewhere.is_some()
            || !select.lateral_views.is_empty()
            || !select.cluster_by.is_empty()
            || !select.distribute_by.is_empty()
            || !select.sort_by.is_empty()
            || select.value_table_mode.is_some()
            || select.connect_by.is_some()
        {
            return Err(GatewayError::invalid("Unsupported SQL construct"));
        }
        if !select.named_window.is_empty() || select.qualify.is_some() {
            return Err(GatewayError::invalid("Window functions are not allowed"));
        }
        if let Some(distinct) = &select.distinct {
            if !matches!(distinct, Distinct::Distinct) {
                return Err(GatewayError::invalid("Unsupported SQL construct"));
            }
        }
        if select.projection.is_empty() {
            return Err(GatewayError::invalid("Query must have at least a SELECT"));
        }

        for item in &select.projection {
            match item {
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {}
                SelectItem::UnnamedExpr(expr) => self.expr(expr)?,
                SelectItem::ExprWithAlias { expr, .. } => self.expr(expr)?,
            }
        }

        for table in &select.from {
            self.table_with_joins(table)?;
        }

        if let Some(selection) = &select.selection {
            self.expr(selection)?;
        }

        match &select.group_by {
            GroupByExpr::Expressions(exprs, modifiers) => {
                if !modifiers.is_empty() {
                    return Err(GatewayError::invalid("Unsupported SQL construct"));
                }
                for expr in exprs {
                    self.expr(expr)?;
                }
            }
            GroupByExpr::All(_) => {
                return Err(GatewayError::invalid("Unsupported SQL construct"));
            }
        }

        if let Some(having) = &select.having {
            self.expr(having)?;
        }

        Ok(())
    }

    fn table_with_joins(&mut self, table: &TableWithJoins) -> Result<(), GatewayError> {
        self.table_factor(&table.relation)?;
        for join in &table.joins {
            match &join.join_operator {
                JoinOperator::Inner(constraint)
                | JoinOperator::LeftOuter(constraint)
                | JoinOperator::RightOuter(constraint)
                | JoinOperator::FullOuter(constraint) => {
                    if let JoinConstraint::On(expr) = constraint {
                        self.expr(expr)?;
                    }
                }
                JoinOperator::CrossJoin => {}
                _ => {
                    return Err(GatewayError::invalid("JOIN type not allowed"));
                }
            }
            self.table_factor(&join.relation)?;
        }
        Ok(())
    }

    fn table_factor(&mut self, factor: &TableFactor) -> Result<(), GatewayError> {
        self.descend(|w| match factor {
            TableFactor::Table { name, args, .. } => {
                if args.is_some() {
                    return Err(GatewayError::invalid("Table functions are not allowed"));
                }
                w.tables.insert(object_name_string(name));
                Ok(())
            }
            TableFactor::Derived {
                lateral, subquery, ..
            } => {
                if *lateral {
                    return Err(GatewayError::invalid(
                        "LATERAL subqueries are not allowed",
                    ));
                }
                w.query(subquery, false)
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => w.table_with_joins(table_with_joins),
            _ => Err(GatewayError::invalid("Unsupported SQL construct in FROM")),
        })
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), GatewayError> {
        self.descend(|w| match expr {
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => Ok(()),
            Expr::BinaryOp { left, op, right } => {
                if !allowed_binary_op(op) {
                    return Err(GatewayError::invalid(format!(
                        "SQL operator not allowed: {op}"
                    )));
                }
                if matches!(op, BinaryOperator::Eq) && left.to_string() == right.to_string() {
                    return Err(GatewayError::invalid(
                        "Tautological predicates are not allowed",
                    ));
                }
                w.expr(left)?;
                w.expr(right)
            }
            Expr::UnaryOp { op, expr } => {
                if !matches!(
                    op,
                    UnaryOperator::Not | UnaryOperator::Minus | UnaryOperator::Plus
                ) {
                    return Err(GatewayError::invalid(format!(
                        "SQL operator not allowed: {op}"
                    )));
                }
                w.expr(expr)
            }
            Expr::Nested(inner) => w.expr(inner),
            Expr::Value(value) => match value {
                Value::Number(_, _)
                | Value::SingleQuotedString(_)
                | Value::Boolean(_)
                | Value::Null => Ok(()),
                _ => Err(GatewayError::invalid("Literal type not allowed")),
            },
            Expr::TypedString { .. } => Ok(()),
            Expr::Function(function) => w.function(function),
            Expr::InList { expr, list, .. } => {
                w.expr(expr)?;
                for item in list {
                    w.expr(item)?;
                }
                Ok(())
            }
            Expr::InSubquery { expr, subquery, .. } => {
                w.expr(expr)?;
                w.query(subquery, false)
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                w.expr(expr)?;
                w.expr(low)?;
                w.expr(high)
            }
            Expr::IsNull(inner) | Expr::IsNotNull(inner) => w.expr(inner),
            Expr::Subquery(query) => w.query(query, false),
            Expr::Extract { expr, .. } => w.expr(expr),
            Expr::Substring {
                expr,
                substring_from,
                substring_for,
                ..
            } => {
                w.expr(expr)?;
                if let Some(from) = substring_from {
                    w.expr(from)?;
                }
                if let Some(len) = substring_for {
                    w.expr(len)?;
                }
                Ok(())
            }
            Expr::Trim {
                expr,
                trim_what,
                trim_characters,
                ..
            } => {
                w.expr(expr)?;
                if let Some(what) = trim_what {
                    w.expr(what)?;
                }
                if let Some(characters) = trim_characters {
                    for c in characters {
                        w.expr(c)?;
                    }
                }
                Ok(())
            }
            Expr::Ceil { expr, .. } | Expr::Floor { expr, .. } => w.expr(expr),
            _ => Err(GatewayError::invalid("Unsupported SQL construct")),
        })
    }

    fn function(&mut self, function: &Function) -> Result<(), GatewayError> {
        let name = object_name_string(&function.name).to_lowercase();
        if !ALLOWED_FUNCTIONS.contains(&name.as_str()) {
            return Err(GatewayError::invalid(format!(
                "SQL function not allowed: {}",
                function.name
            )));
        }
        if function.over.is_some() {
            return Err(GatewayError::invalid("Window functions are not allowed"));
        }
        if function.filter.is_some() || !function.within_group.is_empty() {
            return Err(GatewayError::invalid("Unsupported SQL construct"));
        }
        if !matches!(function.parameters, FunctionArguments::None) {
            return Err(GatewayError::invalid("Unsupported SQL construct"));
        }

        match &function.args {
            FunctionArguments::None => Ok(()),
            FunctionArguments::Subquery(query) => self.descend(|w| w.query(query, false)),
            FunctionArguments::List(list) => {
                if !list.clauses.is_empty() {
                    return Err(GatewayError::invalid("Unsupported SQL construct"));
                }
                for arg in &list.args {
                    let arg_expr = match arg {
                        FunctionArg::Unnamed(arg_expr) => arg_expr,
                        FunctionArg::Named { arg, .. } => arg,
                        _ => {
                            return Err(GatewayError::invalid("Unsupported SQL construct"));
                        }
                    };
                    match arg_expr {
                        FunctionArgExpr::Expr(expr) => self.expr(expr)?,
                        FunctionArgExpr::Wildcard | FunctionArgExpr::QualifiedWildcard(_) => {}
                    }
                }
                Ok(())
            }
        }
    }
}

fn allowed_binary_op(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Plus
            | BinaryOperator::Minus
            | BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::Modulo
            | BinaryOperator::Gt
            | BinaryOperator::Lt
            | BinaryOperator::GtEq
            | BinaryOperator::LtEq
            | BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::And
            | BinaryOperator::Or
    )
}
