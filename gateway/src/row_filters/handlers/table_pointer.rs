use async_trait::async_trait;
use sqlparser::ast::{Expr, Ident, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::auth::AuthenticatedUser;
use crate::row_filters::RowFilterPlan;

use super::{HandlerError, RequestContext, RowFilterHandler, required_str_arg};

/// Row filter: pointer-table subquery.
///
/// Filters dataset rows through a separate pointer table mapping subjects to
/// permitted keys:
/// `column IN (SELECT key FROM pointer_table WHERE subject = jwt.sub)`.
///
/// Governance args:
/// - `column`: string (required) target column on the dataset table
/// - `pointer_table`: string (required) fully qualified physical table
/// - `pointer_key_column`: string (required) column matching the dataset column
/// - `pointer_subject_column`: string (optional, default `user_id`)
pub struct TablePointerHandler;

#[async_trait]
impl RowFilterHandler for TablePointerHandler {
    fn name(&self) -> &'static str {
        "table_pointer"
    }

    async fn resolve(
        &self,
        table: &str,
        user: &AuthenticatedUser,
        args: &serde_json::Map<String, serde_json::Value>,
        _ctx: &RequestContext<'_>,
    ) -> Result<RowFilterPlan, HandlerError> {
        let column = required_str_arg(args, "column", self.name())?;
        let pointer_table = required_str_arg(args, "pointer_table", self.name())?;
        let pointer_key_column = required_str_arg(args, "pointer_key_column", self.name())?;
        let pointer_subject_column = match args.get("pointer_subject_column") {
            None => "user_id".to_string(),
            Some(_) => required_str_arg(args, "pointer_subject_column", self.name())?,
        };

        for (label, value) in [
            ("column", column.as_str()),
            ("pointer_table", pointer_table.as_str()),
            ("pointer_key_column", pointer_key_column.as_str()),
            ("pointer_subject_column", pointer_subject_column.as_str()),
        ] {
            if !is_safe_identifier(value) {
                return Err(HandlerError::BadSpec(format!(
                    "table_pointer args.{label} is not a plain identifier"
                )));
            }
        }

        let subject = user.sub.replace('\'', "''");
        let subquery_sql = format!(
            "SELECT {pointer_key_column} FROM {pointer_table} \
             WHERE {pointer_subject_column} = '{subject}'"
        );
        let subquery = parse_query(&subquery_sql)?;

        let predicate = Expr::InSubquery {
            expr: Box::new(Expr::Identifier(Ident::new(column))),
            subquery,
            negated: false,
        };
        Ok(RowFilterPlan::predicate(table, predicate))
    }
}

/// Identifiers come from governance config, not from users, but they are
/// still interpolated into SQL: restrict to dot-separated word characters.
fn is_safe_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !segment.starts_with(|c: char| c.is_ascii_digit())
        })
}

fn parse_query(sql: &str) -> Result<Box<sqlparser::ast::Query>, HandlerError> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| HandlerError::BadSpec(format!("table_pointer subquery invalid: {e}")))?;
    if statements.len() != 1 {
        return Err(HandlerError::BadSpec(
            "table_pointer subquery must be a single statement".to_string(),
        ));
    }
    match statements.remove(0) {
        Statement::Query(query) => Ok(query),
        _ => Err(HandlerError::BadSpec(
            "table_pointer subquery must be a SELECT".to_string(),
        )),
    }
}
