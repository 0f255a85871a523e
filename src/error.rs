use crate::lifecycle::{InstallError, UninstallError};
use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("install failed: {0}")]
    Install(#[from] InstallError),
    #[error("uninstall failed: {0}")]
    Uninstall(#[from] UninstallError),
}

/// Machine-readable failure details attached to the `--json` error envelope.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl AppError {
    pub fn details(&self) -> Option<ErrorDetails> {
        match self {
            AppError::Install(err) => Some(ErrorDetails {
                error_code: err.error_code().to_string(),
                stage: Some(err.stage().as_str().to_string()),
                exit_code: err.exit_code(),
                hint: err.hint().map(str::to_string),
            }),
            AppError::Uninstall(err) => Some(ErrorDetails {
                error_code: err.error_code().to_string(),
                stage: Some(err.stage().as_str().to_string()),
                exit_code: err.exit_code(),
                hint: None,
            }),
            _ => None,
        }
    }
}
