use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::InputsError;

pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Maps the orchestrator websocket URL to the HTTP origin serving input archives.
pub fn http_base_from_orchestrator(orchestrator_url: &str) -> Result<Url, InputsError> {
    let url = Url::parse(orchestrator_url)?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => other,
    };
    let host = url.host_str().unwrap_or_default();
    let origin = match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}/"),
        None => format!("{scheme}://{host}/"),
    };
    Ok(Url::parse(&origin)?)
}

pub fn resolve_download_url(base: &Url, uri: &str) -> Result<Url, InputsError> {
    Ok(base.join(uri)?)
}

/// Orchestrator credentials only travel to the orchestrator's own origin.
pub fn is_same_origin(base: &Url, url: &Url) -> bool {
    base.scheme() == url.scheme()
        && base.host_str() == url.host_str()
        && base.port_or_known_default() == url.port_or_known_default()
}

/// Streams `url` into `dest`, enforcing `max_bytes` (0 disables the cap)
/// both on the declared length and on what actually arrives.
pub async fn download_to_file(
    client: &Client,
    url: &Url,
    dest: &Path,
    bearer: Option<&str>,
    max_bytes: u64,
) -> Result<u64, InputsError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut request = client.get(url.clone()).timeout(DOWNLOAD_TIMEOUT);
    if let Some(token) = bearer.map(str::trim).filter(|token| !token.is_empty()) {
        request = request.bearer_auth(token);
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(InputsError::DownloadStatus {
            status: status.as_u16(),
            body: body.trim().to_string(),
        });
    }
    if let Some(content_length) = response.content_length() {
        if max_bytes > 0 && content_length > max_bytes {
            return Err(InputsError::DownloadContentLength {
                content_length,
                max: max_bytes,
            });
        }
    }

    let tmp = dest.with_file_name(format!(
        "{}.tmp-{}",
        dest.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        uuid::Uuid::new_v4().simple()
    ));
    let result = stream_body(response, &tmp, max_bytes).await;
    match result {
        Ok(bytes) => {
            if let Err(err) = tokio::fs::rename(&tmp, dest).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(err.into());
            }
            Ok(bytes)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(err)
        }
    }
}

async fn stream_body(
    response: reqwest::Response,
    tmp: &Path,
    max_bytes: u64,
) -> Result<u64, InputsError> {
    let mut out = tokio::fs::File::create(tmp).await?;
    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        downloaded += chunk.len() as u64;
        if max_bytes > 0 && downloaded > max_bytes {
            return Err(InputsError::DownloadTooLarge { max: max_bytes });
        }
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_schemes_map_to_http() {
        assert_eq!(
            http_base_from_orchestrator("wss://orch.example.com/ws/agent")
                .expect("base")
                .as_str(),
            "https://orch.example.com/"
        );
        assert_eq!(
            http_base_from_orchestrator("ws://127.0.0.1:3000/ws")
                .expect("base")
                .as_str(),
            "http://127.0.0.1:3000/"
        );
    }

    #[test]
    fn relative_uris_resolve_against_the_base() {
        let base = http_base_from_orchestrator("ws://localhost:3000/ws").expect("base");
        assert_eq!(
            resolve_download_url(&base, "/api/skills/a.zip").expect("url").as_str(),
            "http://localhost:3000/api/skills/a.zip"
        );
        assert_eq!(
            resolve_download_url(&base, "https://cdn.example.com/a.zip")
                .expect("url")
                .as_str(),
            "https://cdn.example.com/a.zip"
        );
    }

    #[test]
    fn only_the_orchestrator_origin_gets_credentials() {
        let base = http_base_from_orchestrator("wss://orch.example.com/ws").expect("base");
        let own = resolve_download_url(&base, "/api/skills/a.zip").expect("url");
        assert!(is_same_origin(&base, &own));
        let explicit_port = Url::parse("https://orch.example.com:443/a.zip").expect("url");
        assert!(is_same_origin(&base, &explicit_port));

        for other in [
            "https://cdn.example.com/a.zip",
            "http://orch.example.com/a.zip",
            "https://orch.example.com:8443/a.zip",
        ] {
            let url = resolve_download_url(&base, other).expect("url");
            assert!(!is_same_origin(&base, &url), "{other}");
        }
    }
}
