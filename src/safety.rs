//! Read-only enforcement for the served query.
//!
//! Uses sqlparser-rs with the backend's dialect to check that the configured
//! SQL cannot modify data before the gateway starts serving it.

use sqlparser::ast::{Query, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

use crate::db::DatabaseBackend;
use crate::error::{GatewayError, Result};

/// Fails unless `sql` is exactly one statement, and unless that statement is
/// read-only when `allow_writes` is false.
///
/// Every result set of a batch would be streamed into one response under
/// the first set's column names, so batches are refused even when writes
/// are allowed. SQL that cannot be parsed is rejected too.
pub fn check_query(sql: &str, backend: DatabaseBackend, allow_writes: bool) -> Result<()> {
    let statements = match backend {
        DatabaseBackend::MySql => parse(&MySqlDialect {}, sql)?,
        DatabaseBackend::Postgres => parse(&PostgreSqlDialect {}, sql)?,
    };

    let statement = match statements.as_slice() {
        [] => return Err(GatewayError::config("Query contains no SQL statement")),
        [statement] => statement,
        many => {
            return Err(GatewayError::config(format!(
                "Query contains {} statements, expected exactly one",
                many.len()
            )))
        }
    };

    if allow_writes || is_read_only(statement) {
        Ok(())
    } else {
        Err(GatewayError::config(format!(
            "Query is not read-only: {}. Set query.allow_writes to serve it anyway.",
            summarize(statement)
        )))
    }
}

fn parse(dialect: &dyn Dialect, sql: &str) -> Result<Vec<Statement>> {
    Parser::parse_sql(dialect, sql)
        .map_err(|e| GatewayError::config(format!("Could not parse query: {e}")))
}

/// Statement text, shortened for error messages.
fn summarize(stmt: &Statement) -> String {
    let text = stmt.to_string();
    match text.char_indices().nth(60) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text,
    }
}

fn is_read_only(statement: &Statement) -> bool {
    match statement {
        Statement::Query(query) => query_is_read_only(query),
        // EXPLAIN ANALYZE executes the statement it explains
        Statement::Explain {
            analyze, statement, ..
        } => !*analyze || is_read_only(statement),
        Statement::ShowVariable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. } => true,
        _ => false,
    }
}

/// A query is read-only if no CTE or nested body modifies data.
fn query_is_read_only(query: &Query) -> bool {
    let ctes_ok = query
        .with
        .as_ref()
        .map_or(true, |with| with.cte_tables.iter().all(|cte| query_is_read_only(&cte.query)));

    ctes_ok && set_expr_is_read_only(&query.body)
}

fn set_expr_is_read_only(set_expr: &SetExpr) -> bool {
    match set_expr {
        SetExpr::Select(select) => select.from.iter().all(table_is_read_only),
        SetExpr::Query(query) => query_is_read_only(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_read_only(left) && set_expr_is_read_only(right)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        // INSERT/UPDATE/DELETE bodies inside data-modifying CTEs
        _ => false,
    }
}

fn table_is_read_only(twj: &TableWithJoins) -> bool {
    factor_is_read_only(&twj.relation)
        && twj.joins.iter().all(|join| factor_is_read_only(&join.relation))
}

fn factor_is_read_only(factor: &TableFactor) -> bool {
    match factor {
        TableFactor::Derived { subquery, .. } => query_is_read_only(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => table_is_read_only(table_with_joins),
        _ => true,
    }
}
