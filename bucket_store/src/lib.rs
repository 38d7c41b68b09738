mod directory;
mod input;
mod output;
mod record;
mod sqlite_store;
mod store;

pub use directory::*;
pub use input::*;
pub use output::*;
pub use record::*;
pub use sqlite_store::*;
pub use store::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BucketError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("offset too large: {0}")]
    OffsetTooLarge(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid param: {0}")]
    InvalidParam(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A store failure scoped to one file of one index.
    #[error("[{index_name}] [{file_name}] {message}")]
    Directory {
        index_name: String,
        file_name: String,
        message: String,
        #[source]
        source: Box<BucketError>,
    },
}

impl BucketError {
    pub fn directory(
        index_name: &str,
        file_name: &str,
        message: impl Into<String>,
        source: BucketError,
    ) -> Self {
        BucketError::Directory {
            index_name: index_name.to_string(),
            file_name: file_name.to_string(),
            message: message.into(),
            source: Box::new(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BucketError::NotFound(_))
    }
}

pub type BucketResult<T> = std::result::Result<T, BucketError>;

impl From<std::io::Error> for BucketError {
    fn from(err: std::io::Error) -> Self {
        BucketError::IoError(err.to_string())
    }
}

impl From<rusqlite::Error> for BucketError {
    fn from(err: rusqlite::Error) -> Self {
        BucketError::DbError(err.to_string())
    }
}

impl From<BucketError> for std::io::Error {
    fn from(err: BucketError) -> Self {
        let kind = match &err {
            BucketError::NotFound(_) => std::io::ErrorKind::NotFound,
            BucketError::OffsetTooLarge(_) => std::io::ErrorKind::UnexpectedEof,
            BucketError::InvalidParam(_) => std::io::ErrorKind::InvalidInput,
            BucketError::InvalidData(_) => std::io::ErrorKind::InvalidData,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
