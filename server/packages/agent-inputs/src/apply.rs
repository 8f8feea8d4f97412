use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use reqwest::Client;

use crate::download::{download_to_file, http_base_from_orchestrator, is_same_origin, resolve_download_url};
use crate::error::InputsError;
use crate::manifest::{AgentInputsManifest, ApplyMethod, InputItem, InputSource, TargetRoot};
use crate::paths::resolve_under;
use crate::zip_extract::{extract_zip_safe, ZipLimits};

pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 200 * 1024 * 1024;

/// Everything provisioning needs to know about one Run.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    pub run_id: String,
    pub workspace_host: Option<PathBuf>,
    pub home_host: Option<PathBuf>,
    pub orchestrator_url: String,
    pub auth_token: Option<String>,
    pub cache_dir: PathBuf,
    pub max_download_bytes: u64,
    pub zip_limits: ZipLimits,
    pub client: Client,
}

impl ApplyContext {
    fn host_root(&self, root: TargetRoot) -> Result<&Path, InputsError> {
        let (path, label) = match root {
            TargetRoot::Workspace => (self.workspace_host.as_deref(), "hostWorkspacePath"),
            TargetRoot::UserHome => (self.home_host.as_deref(), "hostUserHomePath"),
        };
        path.filter(|path| !path.as_os_str().is_empty())
            .ok_or(InputsError::MissingRoot(label))
    }
}

/// `~/.run-proxy/inputs-cache`
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".run-proxy")
        .join("inputs-cache")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

pub async fn apply_agent_inputs(
    ctx: &ApplyContext,
    manifest: &AgentInputsManifest,
) -> Result<ApplyReport, InputsError> {
    let mut report = ApplyReport::default();
    for item in &manifest.items {
        tracing::info!(
            run_id = %ctx.run_id,
            item_id = %item.id,
            apply = item.apply.as_str(),
            target_path = %item.target.path,
            "agent inputs: apply start"
        );
        let host_root = ctx.host_root(item.target.root)?;
        let host_target = resolve_under(host_root, &item.target.path)?;

        match item.apply {
            ApplyMethod::BindMount => {
                report.skipped.push(item.id.clone());
                continue;
            }
            ApplyMethod::Copy => apply_copy(item, host_target).await?,
            ApplyMethod::WriteFile => apply_write_file(item, &host_target).await?,
            ApplyMethod::DownloadExtract => apply_download_extract(ctx, item, host_target).await?,
        }
        tracing::info!(run_id = %ctx.run_id, item_id = %item.id, "agent inputs: apply done");
        report.applied.push(item.id.clone());
    }
    Ok(report)
}

async fn apply_write_file(item: &InputItem, target: &Path) -> Result<(), InputsError> {
    let InputSource::InlineText { text } = &item.source else {
        return Err(mismatch(item, "inlineText"));
    };
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, text.as_bytes()).await?;
    Ok(())
}

async fn apply_copy(item: &InputItem, target: PathBuf) -> Result<(), InputsError> {
    let InputSource::HostPath { path } = &item.source else {
        return Err(mismatch(item, "hostPath"));
    };
    let from = PathBuf::from(path);
    blocking(move || {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_path(&target)?;
        copy_recursive(&from, &target)
    })
    .await
}

async fn apply_download_extract(
    ctx: &ApplyContext,
    item: &InputItem,
    target: PathBuf,
) -> Result<(), InputsError> {
    let InputSource::HttpZip { uri, content_hash } = &item.source else {
        return Err(mismatch(item, "httpZip"));
    };

    let base = http_base_from_orchestrator(&ctx.orchestrator_url)?;
    let url = resolve_download_url(&base, uri)?;
    let zips_dir = ctx.cache_dir.join("zips");
    tokio::fs::create_dir_all(&zips_dir).await?;

    let cached_name = content_hash.as_deref().filter(|hash| is_cache_safe(hash));
    let zip_file = match cached_name {
        Some(hash) => zips_dir.join(format!("{hash}.zip")),
        None => zips_dir.join(format!("{}.zip", uuid::Uuid::new_v4().simple())),
    };

    if !tokio::fs::try_exists(&zip_file).await.unwrap_or(false) {
        let bearer = ctx.auth_token.as_deref().filter(|_| is_same_origin(&base, &url));
        tracing::info!(
            run_id = %ctx.run_id,
            item_id = %item.id,
            url = %url,
            authenticated = bearer.is_some(),
            "agent inputs: download start"
        );
        let bytes = download_to_file(&ctx.client, &url, &zip_file, bearer, ctx.max_download_bytes)
        .await?;
        tracing::info!(run_id = %ctx.run_id, item_id = %item.id, bytes, "agent inputs: download done");
    }

    let check_skill = item.target.root == TargetRoot::UserHome
        && item.target.path.contains(".codex/skills");
    let limits = ctx.zip_limits;
    let archive = zip_file.clone();
    let outcome = blocking(move || install_archive(&archive, &target, limits, check_skill)).await;

    if cached_name.is_none() {
        let _ = tokio::fs::remove_file(&zip_file).await;
    }
    if let Err(err) = &outcome {
        tracing::warn!(run_id = %ctx.run_id, item_id = %item.id, error = %err, "agent inputs: downloadExtract failed");
    }
    outcome
}

/// Extracts next to `target`, then swaps the result into place.
fn install_archive(
    zip_file: &Path,
    target: &Path,
    limits: ZipLimits,
    check_skill: bool,
) -> Result<(), InputsError> {
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "inputs".to_string());
    let staging = target.with_file_name(format!(
        "{file_name}.tmp-{}",
        uuid::Uuid::new_v4().simple()
    ));
    remove_path(&staging)?;

    let result = (|| -> Result<(), InputsError> {
        extract_zip_safe(zip_file, &staging, limits)?;
        if check_skill && !staging.join("SKILL.md").is_file() {
            return Err(InputsError::SkillMdMissing);
        }
        remove_path(target)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(&staging, target).is_err() {
            copy_recursive(&staging, target)?;
            remove_path(&staging)?;
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = remove_path(&staging);
    }
    result
}

fn is_cache_safe(hash: &str) -> bool {
    !hash.is_empty()
        && hash.len() <= 128
        && hash
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

fn mismatch(item: &InputItem, source_type: &'static str) -> InputsError {
    InputsError::SourceMismatch {
        apply: item.apply.as_str(),
        source_type,
        item: item.id.clone(),
    }
}

async fn blocking<T: Send + 'static>(
    task: impl FnOnce() -> Result<T, InputsError> + Send + 'static,
) -> Result<T, InputsError> {
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| InputsError::Join(err.to_string()))?
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn copy_recursive(from: &Path, to: &Path) -> Result<(), InputsError> {
    let meta = fs::metadata(from)?;
    if !meta.is_dir() {
        fs::copy(from, to)?;
        return Ok(());
    }
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}
