use async_trait::async_trait;
use sqlparser::ast::{BinaryOperator, Expr, Ident, Value};

use crate::auth::AuthenticatedUser;
use crate::row_filters::RowFilterPlan;

use super::{HandlerError, RequestContext, RowFilterHandler, required_str_arg};

/// Row filter: direct match `column = jwt.sub`.
///
/// Governance args:
/// - `column`: string (required)
pub struct DirectUserMatchHandler;

#[async_trait]
impl RowFilterHandler for DirectUserMatchHandler {
    fn name(&self) -> &'static str {
        "direct_user_match"
    }

    async fn resolve(
        &self,
        table: &str,
        user: &AuthenticatedUser,
        args: &serde_json::Map<String, serde_json::Value>,
        _ctx: &RequestContext<'_>,
    ) -> Result<RowFilterPlan, HandlerError> {
        let column = required_str_arg(args, "column", self.name())?;

        let predicate = Expr::BinaryOp {
            left: Box::new(Expr::Identifier(Ident::new(column))),
            op: BinaryOperator::Eq,
            right: Box::new(Expr::Value(Value::SingleQuotedString(user.sub.clone()))),
        };
        Ok(RowFilterPlan::predicate(table, predicate))
    }
}
