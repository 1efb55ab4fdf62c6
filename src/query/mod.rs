//! Query memoization in front of the relational store.

mod args;
mod backend;
mod config;
mod error;
mod optimizer;
mod statements;

pub use args::{QueryArg, render_args};
pub use backend::{QueryBackend, QueryTransaction, Rows};
pub use config::QueryConfig;
pub use error::QueryError;
pub use optimizer::{
    BatchQueryItem, OptimizedQuery, QueryOptimizer, QueryResult, QueryStats, decode_rows,
};
pub use statements::{StatementHandle, StatementRegistry};
