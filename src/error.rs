use thiserror::Error;

use crate::parser::Diagnostic;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Ruleset validation failed with {} error(s): {}", .0.len(), format_first(.0))]
    RulesetInvalid(Vec<Diagnostic>),

    #[error("Plugin error: {0}")]
    PluginError(String),

    #[error("Threshold error: {0}")]
    ThresholdError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    XmlError(#[from] quick_xml::Error),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

fn format_first(diags: &[Diagnostic]) -> String {
    diags
        .first()
        .map(|d| format!("line {}: {}", d.line, d.message))
        .unwrap_or_default()
}

// Helper constructors, mirrored across the crate's error sites
impl EngineError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        EngineError::ConfigError(msg.into())
    }

    pub fn parsing<S: Into<String>>(msg: S) -> Self {
        EngineError::ParsingError(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        EngineError::ValidationError(msg.into())
    }

    pub fn plugin<S: Into<String>>(msg: S) -> Self {
        EngineError::PluginError(msg.into())
    }

    pub fn threshold<S: Into<String>>(msg: S) -> Self {
        EngineError::ThresholdError(msg.into())
    }

    pub fn channel<S: Into<String>>(msg: S) -> Self {
        EngineError::ChannelError(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        EngineError::TimeoutError(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        EngineError::InternalError(msg.into())
    }
}
