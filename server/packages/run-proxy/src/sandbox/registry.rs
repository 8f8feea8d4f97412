//! On-disk record of processes started outside the in-memory instance map,
//! so namespace instances survive a proxy restart in inventory reports.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use super::SandboxError;

const REGISTRY_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub instance_name: String,
    pub pid: u32,
    pub workspace_host_path: String,
    pub started_at: String,
}

#[derive(Debug, Serialize)]
struct RegistryFile<'a> {
    version: u64,
    instances: &'a [RegistryEntry],
}

#[derive(Debug)]
pub struct NativeRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl NativeRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// `<workspaceHostRoot>/.run-proxy/registry.json`
    pub fn for_workspace_root(root: &Path) -> Self {
        Self::new(root.join(".run-proxy").join("registry.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Vec<RegistryEntry> {
        let _guard = self.lock.lock().await;
        self.read_unlocked().await
    }

    pub async fn upsert(&self, entry: RegistryEntry) -> Result<(), SandboxError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_unlocked().await;
        entries.retain(|existing| existing.instance_name != entry.instance_name);
        entries.push(entry);
        self.write_unlocked(&entries).await
    }

    pub async fn remove(&self, instance_name: &str) -> Result<Option<RegistryEntry>, SandboxError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_unlocked().await;
        let removed = entries
            .iter()
            .position(|entry| entry.instance_name == instance_name)
            .map(|index| entries.remove(index));
        if removed.is_some() {
            self.write_unlocked(&entries).await?;
        }
        Ok(removed)
    }

    async fn read_unlocked(&self) -> Vec<RegistryEntry> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(_) => return Vec::new(),
        };
        if text.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => sanitize_entries(value.get("instances")),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "ignoring unreadable sandbox registry");
                Vec::new()
            }
        }
    }

    /// Writes through a temp file and rename; later duplicates win.
    async fn write_unlocked(&self, entries: &[RegistryEntry]) -> Result<(), SandboxError> {
        let mut unique: Vec<RegistryEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            unique.retain(|existing| existing.instance_name != entry.instance_name);
            unique.push(entry.clone());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(&RegistryFile {
            version: REGISTRY_VERSION,
            instances: &unique,
        })
        .map_err(|err| SandboxError::Registry(err.to_string()))?;
        let tmp = self
            .path
            .with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, body).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }
}

fn sanitize_entries(raw: Option<&Value>) -> Vec<RegistryEntry> {
    let Some(items) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let field = |key: &str| {
                item.get(key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            };
            let pid = item
                .get("pid")
                .and_then(Value::as_u64)
                .filter(|pid| *pid > 0)
                .and_then(|pid| u32::try_from(pid).ok())?;
            Some(RegistryEntry {
                instance_name: field("instanceName")?,
                pid,
                workspace_host_path: field("workspaceHostPath")?,
                started_at: field("startedAt")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// PID helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as i32, 0) };
    if result == 0 {
        return true;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(code) if code == libc::EPERM => true,
        _ => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
pub fn terminate_process(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn terminate_process(_pid: u32) {}
