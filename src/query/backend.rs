//! Seam between the optimizer and the relational store.

use async_trait::async_trait;
use serde_json::Value;

use super::args::QueryArg;
use super::error::QueryError;
use super::statements::StatementHandle;

/// Result rows, one JSON object per row.
pub type Rows = Vec<Value>;

/// Implementations always execute the caller's `sql`; the handle only carries
/// the statement shape and whether it should stay prepared.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn fetch_rows(
        &self,
        sql: &str,
        statement: &StatementHandle,
        args: &[QueryArg],
    ) -> Result<Rows, QueryError>;

    async fn begin(&self) -> Result<Box<dyn QueryTransaction>, QueryError>;
}

/// An open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait QueryTransaction: Send {
    async fn fetch_rows(
        &mut self,
        sql: &str,
        statement: &StatementHandle,
        args: &[QueryArg],
    ) -> Result<Rows, QueryError>;

    async fn commit(self: Box<Self>) -> Result<(), QueryError>;

    async fn rollback(self: Box<Self>) -> Result<(), QueryError>;
}
