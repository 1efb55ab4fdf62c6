use crate::query::QueryError;

pub fn map_sqlx_error(err: sqlx::Error) -> QueryError {
    match err {
        sqlx::Error::PoolTimedOut => {
            QueryError::database("timed out waiting for a database connection")
        }
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to statement timeout") =>
        {
            QueryError::database(format!("statement canceled by server: {}", db.message()))
        }
        sqlx::Error::ColumnDecode { index, source } => {
            QueryError::database(format!("failed to decode column {index}: {source}"))
        }
        other => QueryError::database(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_reported_as_database_errors() {
        let err = map_sqlx_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, QueryError::Database { .. }));
        assert!(err.to_string().contains("timed out waiting"));
    }

    #[test]
    fn other_errors_keep_their_message() {
        let err = map_sqlx_error(sqlx::Error::RowNotFound);
        assert!(matches!(err, QueryError::Database { .. }));
    }
}
