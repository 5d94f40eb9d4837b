use thiserror::Error;

pub type Result<T> = std::result::Result<T, TranscriptError>;

#[derive(Error, Debug)]
pub enum TranscriptError {
    #[error("Malformed transcript line {line}: {reason}")]
    ParseError { line: usize, reason: String },

    #[error("Transcript yielded no usable messages: {0}")]
    Empty(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid chunker configuration: {0}")]
    InvalidConfig(String),
}
