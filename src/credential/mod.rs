//! Credential resolution for the Character.AI token
//! Environment variable first, then the persisted token file

pub mod helper;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::config::CredentialConfig;

/// Quote pairs stripped from the ends of a pasted token
const QUOTE_PAIRS: &[(char, char)] = &[('"', '"'), ('\'', '\''), ('“', '”'), ('‘', '’')];

/// Literal scheme prefix some users paste along with the token
const TOKEN_PREFIX: &str = "token ";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no Character.AI token found: set {env_var} or run `cai-mcp token` to save one to {path:?}")]
    NotFound { env_var: String, path: PathBuf },

    #[error("failed to access token file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Normalized bearer token
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Normalize raw input; `None` when nothing is left
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = normalize_token(raw);
        if normalized.is_empty() {
            None
        } else {
            Some(Self(normalized))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First and last four characters, for display
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}…{}", head, tail)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.masked())
    }
}

/// Trim whitespace, matching quotes and a case-insensitive `token ` prefix
///
/// Repeats until nothing changes, so normalizing twice is a no-op.
pub fn normalize_token(raw: &str) -> String {
    let mut current = raw.trim();

    loop {
        let before = current;

        for (open, close) in QUOTE_PAIRS {
            if current.chars().count() >= 2 && current.starts_with(*open) && current.ends_with(*close) {
                current = current[open.len_utf8()..current.len() - close.len_utf8()].trim();
                break;
            }
        }

        if current.len() >= TOKEN_PREFIX.len()
            && current.is_char_boundary(TOKEN_PREFIX.len())
            && current[..TOKEN_PREFIX.len()].eq_ignore_ascii_case(TOKEN_PREFIX)
        {
            current = current[TOKEN_PREFIX.len()..].trim();
        }

        if current == before {
            return current.to_string();
        }
    }
}

/// Where the token comes from
#[derive(Debug, Clone)]
pub struct CredentialSource {
    env_var: String,
    path: PathBuf,
}

impl CredentialSource {
    pub fn new(env_var: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            env_var: env_var.into(),
            path: path.into(),
        }
    }

    pub fn from_config(config: &CredentialConfig) -> Self {
        Self::new(config.env_var.clone(), config.token_file.clone())
    }

    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve the token: a non-empty environment value wins over the file
    pub fn resolve(&self) -> Result<Token, CredentialError> {
        self.resolve_with(std::env::var(&self.env_var).ok())
    }

    fn resolve_with(&self, env_value: Option<String>) -> Result<Token, CredentialError> {
        if let Some(token) = env_value.as_deref().and_then(Token::parse) {
            debug!("Using token from ${}", self.env_var);
            return Ok(token);
        }

        if let Some(token) = self.saved()? {
            debug!("Using token from {:?}", self.path);
            return Ok(token);
        }

        Err(CredentialError::NotFound {
            env_var: self.env_var.clone(),
            path: self.path.clone(),
        })
    }

    /// Token stored in the file, if any
    pub fn saved(&self) -> Result<Option<Token>, CredentialError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Token::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CredentialError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Persist a token so later runs skip the prompt
    pub fn save(&self, token: &Token) -> Result<(), CredentialError> {
        let io_err = |source| CredentialError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(&self.path, format!("{}\n", token.as_str())).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }

        Ok(())
    }
}
