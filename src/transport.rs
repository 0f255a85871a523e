use serde::Deserialize;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("ztgui/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// HTTP access for the release index and the downloaded artifacts.
pub trait Transport {
    fn get_text(&self, url: &str) -> Result<String, TransportError>;

    /// Streams `url` into `dest`, replacing it only once the body is complete.
    fn download(&self, url: &str, dest: &Path) -> Result<u64, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, TransportError> {
        debug!(url, "GET");
        let response = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json, */*")
            .send()
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

impl Transport for HttpTransport {
    fn get_text(&self, url: &str) -> Result<String, TransportError> {
        self.get(url)?
            .text()
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64, TransportError> {
        let mut response = self.get(url)?;
        let io_err = |source: io::Error| TransportError::Io {
            path: dest.to_path_buf(),
            source,
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let partial = partial_path(dest);
        let mut file = File::create(&partial).map_err(io_err)?;
        let written = match response.copy_to(&mut file) {
            Ok(written) => written,
            Err(source) => {
                drop(file);
                let _ = fs::remove_file(&partial);
                return Err(TransportError::Request {
                    url: url.to_string(),
                    source,
                });
            }
        };
        drop(file);
        fs::rename(&partial, dest).map_err(io_err)?;
        info!(url, bytes = written, dest = %dest.display(), "downloaded");
        Ok(written)
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!(".{name}.part"))
}

#[derive(Debug, Deserialize)]
pub struct ReleasePayload {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub tag: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("release index unavailable: {0}")]
    Index(#[from] TransportError),
    #[error("release index response is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("release {tag} has no asset named {asset}")]
    NoMatchingAsset { tag: String, asset: String },
}

/// Picks the asset whose name equals `asset_name` exactly.
pub fn select_asset(payload: &ReleasePayload, asset_name: &str) -> Option<ResolvedArtifact> {
    payload
        .assets
        .iter()
        .find(|asset| asset.name == asset_name && !asset.browser_download_url.trim().is_empty())
        .map(|asset| ResolvedArtifact {
            tag: payload.tag_name.clone(),
            name: asset.name.clone(),
            url: asset.browser_download_url.clone(),
        })
}

pub fn resolve_latest_artifact<T: Transport + ?Sized>(
    transport: &T,
    index_url: &str,
    asset_name: &str,
) -> Result<ResolvedArtifact, ReleaseError> {
    let body = transport.get_text(index_url)?;
    let payload: ReleasePayload = serde_json::from_str(&body)?;
    select_asset(&payload, asset_name).ok_or_else(|| ReleaseError::NoMatchingAsset {
        tag: payload.tag_name.clone(),
        asset: asset_name.to_string(),
    })
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    /// Serves canned bodies by exact URL; unknown URLs answer HTTP 404.
    #[derive(Default)]
    pub struct FakeTransport {
        bodies: RefCell<BTreeMap<String, Vec<u8>>>,
        requests: RefCell<Vec<String>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
            self.bodies
                .borrow_mut()
                .insert(url.to_string(), body.into());
        }

        pub fn forget(&self, url: &str) {
            self.bodies.borrow_mut().remove(url);
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.borrow().clone()
        }

        fn body(&self, url: &str) -> Result<Vec<u8>, TransportError> {
            self.requests.borrow_mut().push(url.to_string());
            self.bodies
                .borrow()
                .get(url)
                .cloned()
                .ok_or_else(|| TransportError::Status {
                    url: url.to_string(),
                    status: 404,
                })
        }
    }

    impl Transport for FakeTransport {
        fn get_text(&self, url: &str) -> Result<String, TransportError> {
            Ok(String::from_utf8_lossy(&self.body(url)?).to_string())
        }

        fn download(&self, url: &str, dest: &Path) -> Result<u64, TransportError> {
            let body = self.body(url)?;
            let io_err = |source: io::Error| TransportError::Io {
                path: dest.to_path_buf(),
                source,
            };
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
            fs::write(dest, &body).map_err(io_err)?;
            Ok(body.len() as u64)
        }
    }
}
