use std::io;

use run_proxy_error::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputsError {
    #[error("{code}: {message}")]
    Manifest { code: String, message: String },
    #[error("{0} missing")]
    MissingRoot(&'static str),
    #[error("target escaped host root: {path}")]
    TargetEscaped { path: String },
    #[error("{apply} requires source={source_type} (item={item})")]
    SourceMismatch {
        apply: &'static str,
        source_type: &'static str,
        item: String,
    },
    #[error("zip entry filename empty")]
    ZipEmptyName,
    #[error("zip entry path is not allowed: {0}")]
    ZipPathNotAllowed(String),
    #[error("zip entry symlink is not allowed: {0}")]
    ZipSymlink(String),
    #[error("zip entry escaped output dir: {0}")]
    ZipEscaped(String),
    #[error("zip too many entries: maxEntries={max}")]
    ZipTooManyEntries { max: usize },
    #[error("zip entry too large: {name} size={size} maxFileBytes={max}")]
    ZipEntryTooLarge { name: String, size: u64, max: u64 },
    #[error("zip too large: total={total} maxTotalBytes={max}")]
    ZipTooLarge { total: u64, max: u64 },
    #[error("zip read failed: {0}")]
    Zip(String),
    #[error("SKILL_MD_MISSING")]
    SkillMdMissing,
    #[error("download failed: {status} {body}")]
    DownloadStatus { status: u16, body: String },
    #[error("download too large: contentLength={content_length} maxBytes={max}")]
    DownloadContentLength { content_length: u64, max: u64 },
    #[error("download too large: maxBytes={max}")]
    DownloadTooLarge { max: u64 },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl InputsError {
    pub(crate) fn manifest(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Manifest {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Machine-readable code. Manifest errors carry their own.
    pub fn code(&self) -> &str {
        match self {
            Self::Manifest { code, .. } => code,
            Self::MissingRoot(_) => "AGENT_INPUTS_ROOT_MISSING",
            Self::TargetEscaped { .. } => "AGENT_INPUTS_TARGET_ESCAPED",
            Self::SourceMismatch { .. } => "INVALID_AGENT_INPUTS_ITEM_PAIRING",
            Self::ZipEmptyName
            | Self::ZipPathNotAllowed(_)
            | Self::ZipSymlink(_)
            | Self::ZipEscaped(_) => "ZIP_ENTRY_NOT_ALLOWED",
            Self::ZipTooManyEntries { .. }
            | Self::ZipEntryTooLarge { .. }
            | Self::ZipTooLarge { .. } => "ZIP_LIMIT_EXCEEDED",
            Self::Zip(_) => "ZIP_READ_FAILED",
            Self::SkillMdMissing => "SKILL_MD_MISSING",
            Self::DownloadStatus { .. }
            | Self::DownloadContentLength { .. }
            | Self::DownloadTooLarge { .. }
            | Self::Http(_)
            | Self::UrlParse(_) => "DOWNLOAD_FAILED",
            Self::Io(_) | Self::Join(_) => "IO_ERROR",
        }
    }
}

impl From<InputsError> for RuntimeError {
    fn from(value: InputsError) -> Self {
        match &value {
            InputsError::Manifest { code, message } => RuntimeError::InvalidAgentInputs {
                code: code.clone(),
                message: message.clone(),
            },
            InputsError::SkillMdMissing => RuntimeError::InvalidAgentInputs {
                code: value.code().to_string(),
                message: "extracted archive has no SKILL.md".to_string(),
            },
            InputsError::TargetEscaped { path } => RuntimeError::PathEscape {
                path: path.clone(),
                message: value.to_string(),
            },
            InputsError::ZipPathNotAllowed(path)
            | InputsError::ZipSymlink(path)
            | InputsError::ZipEscaped(path) => RuntimeError::PathEscape {
                path: path.clone(),
                message: value.to_string(),
            },
            InputsError::Io(_) | InputsError::Join(_) | InputsError::Http(_) => {
                RuntimeError::StreamError {
                    message: value.to_string(),
                }
            }
            _ => RuntimeError::InvalidAgentInputs {
                code: value.code().to_string(),
                message: value.to_string(),
            },
        }
    }
}
