//! Postgres [`QueryBackend`].
//!
//! Every statement is wrapped as `SELECT to_jsonb(q) FROM (<sql>) AS q`, so
//! any read comes back as one JSON object per row regardless of its columns.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};

use super::util::map_sqlx_error;
use crate::query::{QueryArg, QueryBackend, QueryError, QueryTransaction, Rows, StatementHandle};

fn wrap(sql: &str) -> String {
    let inner = sql.trim().trim_end_matches(';');
    format!("SELECT to_jsonb(q) AS row FROM ({inner}) AS q")
}

fn bind_args<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    args: &'q [QueryArg],
) -> Query<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg {
            QueryArg::Null => query.bind(None::<String>),
            QueryArg::Bool(value) => query.bind(*value),
            QueryArg::Int(value) => query.bind(*value),
            QueryArg::Float(value) => query.bind(*value),
            QueryArg::Text(value) => query.bind(value.as_str()),
            QueryArg::Json(value) => query.bind(Json(value)),
        };
    }
    query
}

fn decode(rows: Vec<PgRow>) -> Result<Rows, QueryError> {
    rows.into_iter()
        .map(|row| {
            row.try_get::<serde_json::Value, _>(0)
                .map_err(map_sqlx_error)
        })
        .collect()
}

#[derive(Clone)]
pub struct PgQueryBackend {
    pool: PgPool,
}

impl PgQueryBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryBackend for PgQueryBackend {
    async fn fetch_rows(
        &self,
        sql: &str,
        statement: &StatementHandle,
        args: &[QueryArg],
    ) -> Result<Rows, QueryError> {
        let sql = wrap(sql);
        let query = sqlx::query(&sql).persistent(statement.is_persistent());
        let rows = bind_args(query, args)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        decode(rows)
    }

    async fn begin(&self) -> Result<Box<dyn QueryTransaction>, QueryError> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(PgQueryTransaction { tx }))
    }
}

struct PgQueryTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl QueryTransaction for PgQueryTransaction {
    async fn fetch_rows(
        &mut self,
        sql: &str,
        statement: &StatementHandle,
        args: &[QueryArg],
    ) -> Result<Rows, QueryError> {
        let sql = wrap(sql);
        let query = sqlx::query(&sql).persistent(statement.is_persistent());
        let rows = bind_args(query, args)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        decode(rows)
    }

    async fn commit(self: Box<Self>) -> Result<(), QueryError> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), QueryError> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}
