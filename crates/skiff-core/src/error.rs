use thiserror::Error;

pub type Result<T> = std::result::Result<T, SkiffError>;

#[derive(Error, Debug)]
pub enum SkiffError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Failed to load config from {path}: {source}")]
    ConfigLoadFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Invalid value '{value}' for {setting}")]
    InvalidSetting { setting: String, value: String },

    #[error("Identity error: {message}")]
    Identity { message: String },
}
