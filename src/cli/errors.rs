//! CLI error types
//!
//! CLI errors end the process with a non-zero exit code. Errors of
//! individual requests in the serving loop are written as responses
//! instead.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::errors::{ChaosError, ErrorCategory};

/// Stable code of a CLI failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    ConfigError,
    IoError,
    AlreadyInitialized,
    NotInitialized,
    BootFailed,
}

impl CliErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "CHAOS_CLI_CONFIG_ERROR",
            Self::IoError => "CHAOS_CLI_IO_ERROR",
            Self::AlreadyInitialized => "CHAOS_CLI_ALREADY_INITIALIZED",
            Self::NotInitialized => "CHAOS_CLI_NOT_INITIALIZED",
            Self::BootFailed => "CHAOS_CLI_BOOT_FAILED",
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("CHAOS_CLI_CONFIG_ERROR: {0}")]
    Config(String),

    #[error("CHAOS_CLI_IO_ERROR: {0}")]
    Io(String),

    #[error("CHAOS_CLI_ALREADY_INITIALIZED: {} already holds a cell snapshot", .0.display())]
    AlreadyInitialized(PathBuf),

    #[error(
        "CHAOS_CLI_NOT_INITIALIZED: no cell snapshot in {}, run 'chaos-cell init' first",
        .0.display()
    )]
    NotInitialized(PathBuf),

    #[error("CHAOS_CLI_BOOT_FAILED: {0}")]
    BootFailed(String),
}

impl CliError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn already_initialized(data_dir: &Path) -> Self {
        Self::AlreadyInitialized(data_dir.to_path_buf())
    }

    pub fn not_initialized(data_dir: &Path) -> Self {
        Self::NotInitialized(data_dir.to_path_buf())
    }

    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::BootFailed(msg.into())
    }

    pub fn code(&self) -> CliErrorCode {
        match self {
            Self::Config(_) => CliErrorCode::ConfigError,
            Self::Io(_) => CliErrorCode::IoError,
            Self::AlreadyInitialized(_) => CliErrorCode::AlreadyInitialized,
            Self::NotInitialized(_) => CliErrorCode::NotInitialized,
            Self::BootFailed(_) => CliErrorCode::BootFailed,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().code()
    }

    /// Display text without the code prefix
    pub fn message(&self) -> String {
        let text = self.to_string();
        match text.split_once(": ") {
            Some((_, message)) => message.to_string(),
            None => text,
        }
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<ChaosError> for CliError {
    fn from(e: ChaosError) -> Self {
        match e.category() {
            ErrorCategory::InvalidRequest | ErrorCategory::ClockMismatch => Self::config_error(e.to_string()),
            _ => Self::boot_failed(e.to_string()),
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
