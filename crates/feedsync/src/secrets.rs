//! Secret resolution for credentials kept out of the config file.
//!
//! A [`SecretSource`] names up to three places a secret may live. They
//! are tried in order: inline value, file (Docker secrets style), then
//! environment variable. Empty entries are ignored.

use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source configured (need a value, a file or an env var)")]
    NoSource,

    #[error("Failed to read secret file '{}': {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{0}' is not set")]
    EnvVarNotSet(String),

    #[error("Environment variable '{0}' is not valid UTF-8")]
    EnvVarNotUnicode(String),

    #[error("Secret from {0} is empty")]
    Empty(&'static str),
}

/// Where to look for one secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretSource {
    pub value: Option<String>,
    pub file: Option<String>,
    pub env_var: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl SecretSource {
    pub fn from_env_var(name: impl Into<String>) -> Self {
        Self {
            env_var: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        non_empty(&self.value).is_some()
            || non_empty(&self.file).is_some()
            || non_empty(&self.env_var).is_some()
    }

    pub fn resolve(&self) -> Result<SecretString, SecretError> {
        if let Some(value) = non_empty(&self.value) {
            return Ok(SecretString::from(value.to_string()));
        }

        if let Some(file) = non_empty(&self.file) {
            let path = expand_home(file);
            let content = std::fs::read_to_string(&path)
                .map_err(|source| SecretError::ReadFile { path, source })?;
            let content = content.trim();
            if content.is_empty() {
                return Err(SecretError::Empty("file"));
            }
            return Ok(SecretString::from(content.to_string()));
        }

        if let Some(name) = non_empty(&self.env_var) {
            return match std::env::var(name) {
                Ok(value) if value.trim().is_empty() => Err(SecretError::Empty("env var")),
                Ok(value) => Ok(SecretString::from(value.trim().to_string())),
                Err(std::env::VarError::NotPresent) => {
                    Err(SecretError::EnvVarNotSet(name.to_string()))
                }
                Err(std::env::VarError::NotUnicode(_)) => {
                    Err(SecretError::EnvVarNotUnicode(name.to_string()))
                }
            };
        }

        Err(SecretError::NoSource)
    }

    /// Like [`resolve`](Self::resolve), but an unconfigured source is `None`.
    pub fn resolve_optional(&self) -> Result<Option<SecretString>, SecretError> {
        match self.resolve() {
            Ok(secret) => Ok(Some(secret)),
            Err(SecretError::NoSource) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Expands a leading `~` to the home directory.
pub(crate) fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        },
        _ => PathBuf::from(path),
    }
}
