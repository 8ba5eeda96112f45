//! Error types for the bridge.

use thiserror::Error;

/// A source-protocol feature the bridge refuses to approximate.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedFeature {
    #[error("Function calling and tools are not supported")]
    FunctionCalling,
    #[error("Function messages are not supported")]
    FunctionMessages,
    #[error("frequency_penalty is not supported")]
    FrequencyPenalty,
    #[error("Logit bias is not supported")]
    LogitBias,
}

impl UnsupportedFeature {
    /// Name of the request field that triggered the rejection.
    #[must_use]
    pub fn param(self) -> &'static str {
        match self {
            Self::FunctionCalling => "tools",
            Self::FunctionMessages => "messages",
            Self::FrequencyPenalty => "frequency_penalty",
            Self::LogitBias => "logit_bias",
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Unsupported(#[from] UnsupportedFeature),

    #[error("Translation error: {message}")]
    Translation { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
