//! Stable agent identity: generated once per host and reused across restarts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const AGENT_ID_ENV: &str = "RUN_PROXY_AGENT_ID";
pub const IDENTITY_PATH_ENV: &str = "RUN_PROXY_IDENTITY_PATH";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("home directory not found")]
    HomeDirNotFound,
    #[error("failed to write identity {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize identity: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub agent_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub created_at: String,
}

pub fn identity_path() -> Result<PathBuf, IdentityError> {
    if let Some(raw) = std::env::var(IDENTITY_PATH_ENV)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
    {
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            return Ok(path);
        }
        let cwd = std::env::current_dir().map_err(|source| IdentityError::Write {
            path: path.display().to_string(),
            source,
        })?;
        return Ok(cwd.join(path));
    }
    let home = dirs::home_dir().ok_or(IdentityError::HomeDirNotFound)?;
    Ok(home.join(".run-proxy").join("identity.json"))
}

/// `RUN_PROXY_AGENT_ID`, else the stored id, else a freshly generated one.
pub fn load_or_create_agent_id() -> Result<String, IdentityError> {
    if let Some(id) = std::env::var(AGENT_ID_ENV)
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
    {
        return Ok(id);
    }
    load_or_create_at(&identity_path()?, &local_hostname())
}

pub fn load_or_create_at(path: &Path, hostname: &str) -> Result<String, IdentityError> {
    if let Some(id) = read_agent_id(path) {
        return Ok(id);
    }

    let identity = AgentIdentity {
        agent_id: format!("{}-{}", sanitize_hostname(hostname), uuid::Uuid::new_v4()),
        hostname: hostname.trim().to_string(),
        created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    };
    let body = serde_json::to_string_pretty(&identity)?;
    let write_err = |source| IdentityError::Write {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", uuid::Uuid::new_v4()));
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, &body).map_err(write_err)?;

    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        if let Some(id) = read_agent_id(path) {
            return Ok(id);
        }
        tracing::warn!(path = %path.display(), error = %err, "identity rename failed; writing in place");
        std::fs::write(path, &body).map_err(write_err)?;
    }

    tracing::info!(path = %path.display(), agent_id = %identity.agent_id, "created agent identity");
    Ok(identity.agent_id)
}

fn read_agent_id(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let identity: AgentIdentity = serde_json::from_str(&text).ok()?;
    let id = identity.agent_id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Collapses runs of characters outside `[a-zA-Z0-9_.-]` into `-` and trims
/// leading and trailing dashes.
pub fn sanitize_hostname(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "host".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(unix)]
pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    let result = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if result == 0 {
        let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..len]) {
            return name.to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_default()
}

#[cfg(not(unix))]
pub fn local_hostname() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_default()
}
