use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::InputsError;
use crate::paths::{normalize_relative, RelativePathIssue};

pub const MANIFEST_VERSION: u64 = 1;

const ENV_PATCH_KEYS: [&str; 3] = ["HOME", "USER", "LOGNAME"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TargetRoot {
    #[serde(rename = "WORKSPACE")]
    Workspace,
    #[serde(rename = "USER_HOME")]
    UserHome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyMethod {
    BindMount,
    DownloadExtract,
    WriteFile,
    Copy,
}

impl ApplyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BindMount => "bindMount",
            Self::DownloadExtract => "downloadExtract",
            Self::WriteFile => "writeFile",
            Self::Copy => "copy",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "bindMount" => Some(Self::BindMount),
            "downloadExtract" => Some(Self::DownloadExtract),
            "writeFile" => Some(Self::WriteFile),
            "copy" => Some(Self::Copy),
            _ => None,
        }
    }

    fn source_type(&self) -> &'static str {
        match self {
            Self::BindMount | Self::Copy => "hostPath",
            Self::DownloadExtract => "httpZip",
            Self::WriteFile => "inlineText",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Ro,
    Rw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InputSource {
    HostPath {
        path: String,
    },
    HttpZip {
        uri: String,
        #[serde(rename = "contentHash", skip_serializing_if = "Option::is_none")]
        content_hash: Option<String>,
    },
    InlineText {
        text: String,
    },
}

impl InputSource {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::HostPath { .. } => "hostPath",
            Self::HttpZip { .. } => "httpZip",
            Self::InlineText { .. } => "inlineText",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputTarget {
    pub root: TargetRoot,
    /// Normalized relative path; empty means the root itself.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputItem {
    pub id: String,
    pub apply: ApplyMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
    pub source: InputSource,
    pub target: InputTarget,
}

impl InputItem {
    pub fn read_only(&self) -> bool {
        self.access == Some(Access::Ro)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentInputsManifest {
    pub version: u64,
    #[serde(rename = "envPatch", skip_serializing_if = "BTreeMap::is_empty")]
    pub env_patch: BTreeMap<String, String>,
    pub items: Vec<InputItem>,
}

/// A bindMount item that targets a sub-path of the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestMount {
    pub item_id: String,
    pub host_path: String,
    pub workspace_relative: String,
    pub read_only: bool,
}

impl AgentInputsManifest {
    /// Host path of a bindMount covering the whole workspace, if any.
    pub fn workspace_root_bind(&self) -> Option<&str> {
        self.items.iter().find_map(|item| match (&item.apply, &item.source) {
            (ApplyMethod::BindMount, InputSource::HostPath { path })
                if item.target.root == TargetRoot::Workspace && item.target.path.is_empty() =>
            {
                Some(path.as_str())
            }
            _ => None,
        })
    }

    pub fn extra_mounts(&self) -> Vec<ManifestMount> {
        self.items
            .iter()
            .filter_map(|item| match (&item.apply, &item.source) {
                (ApplyMethod::BindMount, InputSource::HostPath { path })
                    if !item.target.path.is_empty() =>
                {
                    Some(ManifestMount {
                        item_id: item.id.clone(),
                        host_path: path.clone(),
                        workspace_relative: item.target.path.clone(),
                        read_only: item.read_only(),
                    })
                }
                _ => None,
            })
            .collect()
    }
}

/// Reads `init.agentInputs`; `Ok(None)` when the key is absent.
pub fn parse_agent_inputs_from_init(init: &Value) -> Result<Option<AgentInputsManifest>, InputsError> {
    match init.as_object().and_then(|init| init.get("agentInputs")) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => parse_agent_inputs(raw).map(Some),
    }
}

pub fn parse_agent_inputs(raw: &Value) -> Result<AgentInputsManifest, InputsError> {
    let Some(raw) = raw.as_object() else {
        return Err(InputsError::manifest(
            "INVALID_AGENT_INPUTS",
            "agentInputs must be an object",
        ));
    };

    let version = match raw.get("version") {
        Some(Value::Number(number)) => number.as_u64(),
        Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
        _ => None,
    };
    if version != Some(MANIFEST_VERSION) {
        return Err(InputsError::manifest(
            "UNSUPPORTED_AGENT_INPUTS_VERSION",
            format!("agentInputs.version must be {MANIFEST_VERSION}"),
        ));
    }

    let Some(items_raw) = raw.get("items").and_then(Value::as_array) else {
        return Err(InputsError::manifest(
            "INVALID_AGENT_INPUTS_ITEMS",
            "agentInputs.items must be an array",
        ));
    };

    let env_patch = match raw.get("envPatch") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(patch)) => parse_env_patch(patch)?,
        Some(_) => {
            return Err(InputsError::manifest(
                "INVALID_AGENT_INPUTS_ENV_PATCH",
                "agentInputs.envPatch must be an object",
            ))
        }
    };

    let items = items_raw
        .iter()
        .enumerate()
        .map(|(index, item)| parse_item(index + 1, item))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AgentInputsManifest {
        version: MANIFEST_VERSION,
        env_patch,
        items,
    })
}

fn parse_env_patch(patch: &Map<String, Value>) -> Result<BTreeMap<String, String>, InputsError> {
    let mut out = BTreeMap::new();
    for (key, value) in patch {
        let key = key.trim();
        if !ENV_PATCH_KEYS.contains(&key) {
            return Err(InputsError::manifest(
                format!("INVALID_AGENT_INPUTS_ENV_PATCH_KEY:{key}"),
                "envPatch only accepts HOME, USER and LOGNAME",
            ));
        }
        let value = match value {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

fn text_field(object: &Map<String, Value>, key: &str) -> String {
    match object.get(key) {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn parse_item(index: usize, raw: &Value) -> Result<InputItem, InputsError> {
    let Some(item) = raw.as_object() else {
        return Err(InputsError::manifest(
            format!("INVALID_AGENT_INPUTS_ITEM:{index}"),
            "item must be an object",
        ));
    };

    let id = text_field(item, "id");
    if id.is_empty() {
        return Err(InputsError::manifest(
            format!("INVALID_AGENT_INPUTS_ITEM_ID:{index}"),
            "item id is required",
        ));
    }
    let code = |suffix: &str| format!("INVALID_AGENT_INPUTS_ITEM_{suffix}:{id}");

    let apply = ApplyMethod::parse(&text_field(item, "apply"))
        .ok_or_else(|| InputsError::manifest(code("APPLY"), "unsupported apply method"))?;

    let access = match item.get("access") {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_str().map(str::trim) {
            Some("ro") => Some(Access::Ro),
            Some("rw") => Some(Access::Rw),
            _ => return Err(InputsError::manifest(code("ACCESS"), "access must be ro or rw")),
        },
    };

    let Some(target) = item.get("target").and_then(Value::as_object) else {
        return Err(InputsError::manifest(code("TARGET"), "target must be an object"));
    };
    let root = match text_field(target, "root").as_str() {
        "WORKSPACE" => TargetRoot::Workspace,
        "USER_HOME" => TargetRoot::UserHome,
        _ => {
            return Err(InputsError::manifest(
                code("TARGET_ROOT"),
                "target.root must be WORKSPACE or USER_HOME",
            ))
        }
    };
    let path = normalize_relative(&text_field(target, "path")).map_err(|issue| {
        let message = match issue {
            RelativePathIssue::Absolute => "target.path must be relative",
            RelativePathIssue::DrivePrefix | RelativePathIssue::ParentSegment => {
                "target.path must not escape root"
            }
        };
        InputsError::manifest(code("TARGET_PATH"), message)
    })?;

    let Some(source) = item.get("source").and_then(Value::as_object) else {
        return Err(InputsError::manifest(code("SOURCE"), "source must be an object"));
    };
    let source = match text_field(source, "type").as_str() {
        "hostPath" => {
            let path = text_field(source, "path");
            if path.is_empty() {
                return Err(InputsError::manifest(code("SOURCE_PATH"), "source.path is required"));
            }
            InputSource::HostPath { path }
        }
        "httpZip" => {
            let uri = text_field(source, "uri");
            if uri.is_empty() {
                return Err(InputsError::manifest(code("SOURCE_URI"), "source.uri is required"));
            }
            let content_hash = source
                .get("contentHash")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|hash| !hash.is_empty())
                .map(str::to_string);
            InputSource::HttpZip { uri, content_hash }
        }
        "inlineText" => match source.get("text") {
            Some(Value::String(text)) => InputSource::InlineText { text: text.clone() },
            None | Some(Value::Null) => InputSource::InlineText {
                text: String::new(),
            },
            Some(_) => {
                return Err(InputsError::manifest(code("SOURCE_TEXT"), "source.text must be a string"))
            }
        },
        _ => return Err(InputsError::manifest(code("SOURCE_TYPE"), "unsupported source type")),
    };

    if source.type_name() != apply.source_type() {
        return Err(InputsError::manifest(
            code("PAIRING"),
            format!("{} requires source={}", apply.as_str(), apply.source_type()),
        ));
    }
    if apply == ApplyMethod::BindMount && root != TargetRoot::Workspace {
        return Err(InputsError::manifest(
            code("PAIRING"),
            "bindMount requires target.root=WORKSPACE",
        ));
    }
    if path.is_empty() && apply != ApplyMethod::BindMount {
        return Err(InputsError::manifest(
            code("TARGET_PATH"),
            format!("{} cannot replace the root itself", apply.as_str()),
        ));
    }

    Ok(InputItem {
        id,
        apply,
        access,
        source,
        target: InputTarget { root, path },
    })
}
