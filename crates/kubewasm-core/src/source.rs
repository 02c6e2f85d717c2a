//! Guest module source resolution.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    /// Local file: file:///path/to/plugin.wasm, /abs/path.wasm or ./relative.wasm
    File { path: String },
    /// HTTP(S): https://releases.example.com/plugin.wasm
    Http { url: String, tls: bool },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("unsupported guest source scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid guest source URI: {0}")]
    InvalidUri(String),
}

impl ModuleSource {
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        let uri = uri.trim();
        if let Some(rest) = uri.strip_prefix("https://") {
            Self::require_authority(uri, rest)?;
            Ok(ModuleSource::Http {
                url: uri.to_string(),
                tls: true,
            })
        } else if let Some(rest) = uri.strip_prefix("http://") {
            Self::require_authority(uri, rest)?;
            Ok(ModuleSource::Http {
                url: uri.to_string(),
                tls: false,
            })
        } else if let Some(path) = uri.strip_prefix("file://") {
            if path.is_empty() {
                return Err(SourceError::InvalidUri(uri.to_string()));
            }
            Ok(ModuleSource::File {
                path: path.to_string(),
            })
        } else if uri.contains("://") {
            Err(SourceError::UnsupportedScheme(uri.to_string()))
        } else if uri.starts_with("./")
            || uri.starts_with("../")
            || uri.starts_with('/')
            || uri.ends_with(".wasm")
        {
            Ok(ModuleSource::File {
                path: uri.to_string(),
            })
        } else {
            Err(SourceError::UnsupportedScheme(uri.to_string()))
        }
    }

    fn require_authority(uri: &str, rest: &str) -> Result<(), SourceError> {
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            Err(SourceError::InvalidUri(uri.to_string()))
        } else {
            Ok(())
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ModuleSource::File { .. } => "file",
            ModuleSource::Http { tls: true, .. } => "https",
            ModuleSource::Http { tls: false, .. } => "http",
        }
    }
}
