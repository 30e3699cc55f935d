use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("db error")]
    Db(#[from] sqlx::Error),

    #[error("migration error")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid record: {0}")]
    InvalidRecord(&'static str),
}

impl RepoError {
    /// Whether retrying the same idempotent call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RepoError::Db(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Protocol(_)
            ),
            RepoError::Migrate(_) | RepoError::InvalidRecord(_) => false,
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;
