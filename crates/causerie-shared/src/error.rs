use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid user name: {0}")]
    InvalidUserId(String),

    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Profile image too large: {size} bytes (max {max})")]
    ProfileImageTooLarge { size: usize, max: usize },

    #[error("File data missing")]
    MissingFileData,

    #[error("File data is not valid base64")]
    InvalidFileData,

    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
