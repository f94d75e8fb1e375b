use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Pool error: {0}")]
    PoolError(#[from] deadpool_postgres::PoolError),

    #[error("{}", format_pg_error(.0))]
    PostgresError(#[from] tokio_postgres::Error),

    #[error("Build error: {0}")]
    BuildError(#[from] deadpool_postgres::BuildError),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// A stored value could not be mapped back to its domain type.
    #[error("Invalid {column} value in {table}: {value}")]
    InvalidColumn {
        table: &'static str,
        column: &'static str,
        value: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    /// Rows changed between read and write; the transaction was rolled back.
    #[error("Concurrent modification: {0}")]
    Concurrent(String),
}

impl DbError {
    pub fn invalid(table: &'static str, column: &'static str, value: impl ToString) -> Self {
        DbError::InvalidColumn {
            table,
            column,
            value: value.to_string(),
        }
    }
}

fn format_pg_error(e: &tokio_postgres::Error) -> String {
    let Some(db_err) = e.as_db_error() else {
        return format!("PostgreSQL error: {}", e);
    };
    let mut msg = format!(
        "PostgreSQL error [{}]: {}",
        db_err.code().code(),
        db_err.message()
    );
    if let Some(detail) = db_err.detail() {
        msg.push_str(&format!("\n  Detail: {}", detail));
    }
    if let Some(table) = db_err.table() {
        msg.push_str(&format!("\n  Table: {}", table));
    }
    if let Some(constraint) = db_err.constraint() {
        msg.push_str(&format!("\n  Constraint: {}", constraint));
    }
    msg
}
