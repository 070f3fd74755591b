use std::collections::{BTreeSet, HashMap};

use sqlparser::ast::Statement;

pub mod rewrite;
pub mod validator;

pub use validator::{DEFAULT_MAX_DEPTH, parse_sql_query, parse_sql_query_with_depth};

/// A validated statement plus the logical dataset ids it references.
/// Immutable: rewriting works on clones of the AST.
#[derive(Debug, Clone)]
pub struct ParsedSql {
    statement: Statement,
    referenced_tables: BTreeSet<String>,
}

impl ParsedSql {
    pub(crate) fn new(statement: Statement, referenced_tables: BTreeSet<String>) -> Self {
        Self {
            statement,
            referenced_tables,
        }
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    /// Logical table names referenced by the query, CTE aliases excluded.
    pub fn referenced_tables(&self) -> &BTreeSet<String> {
        &self.referenced_tables
    }

    /// Logical SQL rendered from the validated AST (no substitution).
    pub fn sql(&self) -> String {
        self.statement.to_string()
    }

    /// SQL with logical table names replaced by their physical names.
    pub fn to_sql(&self, tables_map: &HashMap<String, String>) -> String {
        let mut statement = self.statement.clone();
        rewrite::substitute_tables(&mut statement, tables_map);
        statement.to_string()
    }
}
