//! Shape-keyed registry of reusable statements.

use std::sync::Arc;

use dashmap::DashMap;

use crate::cache::normalize_sql;

/// Immutable description of a statement the backend may prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementHandle {
    shape: String,
    persistent: bool,
}

impl StatementHandle {
    /// One-off statement that the backend should not keep prepared.
    pub fn ad_hoc(sql: &str) -> Self {
        Self {
            shape: normalize_sql(sql),
            persistent: false,
        }
    }

    fn registered(shape: String) -> Self {
        Self {
            shape,
            persistent: true,
        }
    }

    /// Whitespace-normalized text used as the registry key.
    pub fn shape(&self) -> &str {
        &self.shape
    }

    /// Whether the backend should keep a server-side prepared statement.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
}

/// Append-only map from normalized SQL shape to its handle.
#[derive(Debug, Default)]
pub struct StatementRegistry {
    handles: DashMap<String, Arc<StatementHandle>>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for the shape of `sql`, created on first use.
    pub fn get_or_register(&self, sql: &str) -> Arc<StatementHandle> {
        let shape = normalize_sql(sql);
        if let Some(handle) = self.handles.get(&shape) {
            return handle.clone();
        }
        self.handles
            .entry(shape.clone())
            .or_insert_with(|| Arc::new(StatementHandle::registered(shape)))
            .clone()
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.handles.contains_key(&normalize_sql(sql))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
