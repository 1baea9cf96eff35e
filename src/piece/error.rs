use thiserror::Error;

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::WriterError),

    #[error("piece {index} failed SHA-1 verification")]
    HashMismatch { index: u32 },
}

pub type PieceResult<T> = std::result::Result<T, PieceError>;
