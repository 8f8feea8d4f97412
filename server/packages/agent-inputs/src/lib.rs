//! Agent inputs: the manifest that describes files and mounts a Run needs
//! before its agent starts, and the code that materializes it safely.

mod apply;
mod download;
mod error;
mod manifest;
mod paths;
mod zip_extract;

pub use apply::{apply_agent_inputs, default_cache_dir, ApplyContext, ApplyReport, DEFAULT_MAX_DOWNLOAD_BYTES};
pub use download::{
    download_to_file, http_base_from_orchestrator, is_same_origin, resolve_download_url, DOWNLOAD_TIMEOUT,
};
pub use error::InputsError;
pub use manifest::{
    parse_agent_inputs, parse_agent_inputs_from_init, Access, AgentInputsManifest, ApplyMethod,
    InputItem, InputSource, InputTarget, ManifestMount, TargetRoot, MANIFEST_VERSION,
};
pub use paths::{is_descendant, normalize_relative, resolve_under, RelativePathIssue};
pub use zip_extract::{extract_zip_safe, ExtractStats, ZipLimits};
