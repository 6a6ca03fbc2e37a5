//! Statement executor contract.
//!
//! The write path never talks to a driver directly. It renders parameterized
//! statements and hands them to a [`Connection`], which reports rows, affected
//! row counts or generated ids. All operations integrate with asupersync's
//! structured concurrency via the `Cx` context.

use crate::dialect::Dialect;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// A database connection capable of executing write statements.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT * FROM teams WHERE id = $1", &[Value::BigInt(1)]).await?;
/// let affected = conn.execute(&cx, "DELETE FROM teams WHERE id IN ($1)", &[Value::BigInt(1)]).await?;
/// ```
pub trait Connection: Send + Sync {
    /// The dialect statements must be rendered in.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    ///
    /// Also used for `INSERT ... RETURNING`: rows must come back in the
    /// order the value tuples were submitted.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute a single-row INSERT and return the last inserted ID.
    ///
    /// Used for dialects without `RETURNING`.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;
}
