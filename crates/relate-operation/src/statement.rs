//! Rendered statements and their completion hooks.
//!
//! Processors turn ready requests into [`Statement`]s while the operation
//! state is borrowed mutably. The driver then executes a whole wave against
//! the [`Connection`] and, once every statement settled, hands each output
//! back to the statement's [`Completion`] which updates instance state and
//! marks the requests executed.

use crate::delete::DeleteBatch;
use crate::delete_without_loading::CriteriaBatch;
use crate::loader::{LoadBatch, RetrieveBatch};
use crate::operation::OperationContext;
use crate::property_updater::BulkUpdate;
use crate::save::{InsertBatch, UpdateTarget};
use relate_core::{Connection, Cx, Dialect, Error, Outcome, QueryError, QueryErrorKind, Result, Row, Value};

/// How a statement is handed to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exec {
    /// Rows are returned (SELECT, INSERT ... RETURNING)
    Query,
    /// Only the affected row count matters
    Execute,
    /// Single-row INSERT reporting the generated id
    Insert,
}

#[derive(Debug)]
pub(crate) enum StatementOutput {
    Rows(Vec<Row>),
    Affected(u64),
    LastId(i64),
}

impl StatementOutput {
    pub(crate) fn into_rows(self, sql: &str) -> Result<Vec<Row>> {
        match self {
            StatementOutput::Rows(rows) => Ok(rows),
            other => Err(unexpected_output(sql, "rows", &other)),
        }
    }

    pub(crate) fn affected(&self, sql: &str) -> Result<u64> {
        match self {
            StatementOutput::Affected(n) => Ok(*n),
            other => Err(unexpected_output(sql, "an affected row count", other)),
        }
    }
}

fn unexpected_output(sql: &str, expected: &str, got: &StatementOutput) -> Error {
    let got = match got {
        StatementOutput::Rows(_) => "rows",
        StatementOutput::Affected(_) => "an affected row count",
        StatementOutput::LastId(_) => "a generated id",
    };
    Error::Query(QueryError {
        kind: QueryErrorKind::Database,
        sql: Some(sql.to_string()),
        sqlstate: None,
        message: format!("expected {expected} from statement, got {got}"),
        source: None,
    })
}

/// What to do with the output of a statement.
#[derive(Debug)]
pub(crate) enum Completion {
    Insert(InsertBatch),
    Update(UpdateTarget),
    Delete(DeleteBatch),
    PropertyUpdate(BulkUpdate),
    CriteriaDelete(CriteriaBatch),
    Load(LoadBatch),
    Retrieve(RetrieveBatch),
}

impl Completion {
    fn apply(self, ctx: &mut OperationContext, sql: &str, output: StatementOutput) -> Result<()> {
        match self {
            Completion::Insert(batch) => batch.complete(ctx, sql, output),
            Completion::Update(target) => target.complete(ctx, sql, &output),
            Completion::Delete(batch) => batch.complete(ctx, sql, &output),
            Completion::PropertyUpdate(update) => update.complete(ctx, sql, &output),
            Completion::CriteriaDelete(batch) => batch.complete(ctx, sql, &output),
            Completion::Load(batch) => batch.complete(ctx, sql, output),
            Completion::Retrieve(batch) => batch.complete(ctx, sql, output),
        }
    }
}

/// A rendered statement, ready to run.
#[derive(Debug)]
pub(crate) struct Statement {
    pub(crate) sql: String,
    pub(crate) params: Vec<Value>,
    pub(crate) exec: Exec,
    pub(crate) completion: Completion,
}

impl Statement {
    /// Apply the output of this statement to the operation state.
    pub(crate) fn complete(self, ctx: &mut OperationContext, output: StatementOutput) -> Result<()> {
        let Statement {
            sql, completion, ..
        } = self;
        completion.apply(ctx, &sql, output)
    }
}

/// Run one statement on the connection.
#[tracing::instrument(level = "debug", skip(cx, conn, statement), fields(sql = %statement.sql))]
pub(crate) async fn run_statement<C: Connection>(
    cx: &Cx,
    conn: &C,
    statement: &Statement,
) -> Outcome<StatementOutput, Error> {
    tracing::trace!(params = statement.params.len(), "Executing statement");
    match statement.exec {
        Exec::Query => match conn.query(cx, &statement.sql, &statement.params).await {
            Outcome::Ok(rows) => Outcome::Ok(StatementOutput::Rows(rows)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        },
        Exec::Execute => match conn.execute(cx, &statement.sql, &statement.params).await {
            Outcome::Ok(n) => Outcome::Ok(StatementOutput::Affected(n)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        },
        Exec::Insert => match conn.insert(cx, &statement.sql, &statement.params).await {
            Outcome::Ok(id) => Outcome::Ok(StatementOutput::LastId(id)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        },
    }
}

/// Incremental SQL text with numbered parameters.
#[derive(Debug)]
pub(crate) struct SqlWriter {
    dialect: Dialect,
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    pub(crate) fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    pub(crate) fn ident(&mut self, name: &str) -> &mut Self {
        let quoted = self.dialect.quote_identifier(name);
        self.sql.push_str(&quoted);
        self
    }

    /// Append a placeholder bound to `value`.
    pub(crate) fn bind(&mut self, value: Value) -> &mut Self {
        self.params.push(value);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
        self
    }

    /// `"column" IN (..)`, or a false predicate for an empty list.
    pub(crate) fn in_list(&mut self, column: &str, values: &[Value]) -> &mut Self {
        if values.is_empty() {
            return self.push("1 = 0");
        }
        self.ident(column).push(" IN (");
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.bind(value.clone());
        }
        self.push(")")
    }

    /// `"column" = $n`, or `IS NULL` for a null value.
    pub(crate) fn equals(&mut self, column: &str, value: Value) -> &mut Self {
        self.ident(column);
        if value.is_null() {
            self.push(" IS NULL")
        } else {
            self.push(" = ").bind(value)
        }
    }

    pub(crate) fn build(self, exec: Exec, completion: Completion) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
            exec,
            completion,
        }
    }

    #[cfg(test)]
    fn into_parts(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }
}
