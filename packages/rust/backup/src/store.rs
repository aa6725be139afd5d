//! Remote asset stores for checkpoint archives.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use samplegraph_shared::{BackupConfig, Result, SampleGraphError, read_secret};

/// One stored archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Where archives live between runs.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Every asset, oldest first.
    async fn list_assets(&self) -> Result<Vec<AssetRef>>;

    /// Download `asset` into the file at `dest`.
    async fn download(&self, asset: &AssetRef, dest: &Path) -> Result<()>;

    /// Upload the file at `path` under `name`.
    async fn upload(&self, path: &Path, name: &str) -> Result<AssetRef>;

    async fn delete(&self, asset: &AssetRef) -> Result<()>;
}

/// Sort oldest first; name breaks ties between same-second uploads.
pub(crate) fn sort_assets(assets: &mut [AssetRef]) {
    assets.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.name.cmp(&b.name))
    });
}

// ---------------------------------------------------------------------------
// Release assets over REST
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Release {
    id: u64,
    #[serde(default)]
    assets: Vec<AssetRef>,
}

/// Assets attached to one tagged release of a hosted repository.
pub struct ReleaseAssetStore {
    client: reqwest::Client,
    api_base: String,
    upload_base: String,
    repository: String,
    tag: String,
    token: String,
}

impl ReleaseAssetStore {
    pub fn new(
        api_base: impl Into<String>,
        upload_base: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| SampleGraphError::BackupTransport(e.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            upload_base: upload_base.into().trim_end_matches('/').to_string(),
            repository: repository.into(),
            tag: tag.into(),
            token: token.into(),
        })
    }

    /// Build from `[backup]`, reading the token from its environment variable.
    pub fn from_config(config: &BackupConfig) -> Result<Self> {
        if config.repository.trim().is_empty() {
            return Err(SampleGraphError::config(
                "backup.repository must be set when backups are enabled",
            ));
        }
        let token = read_secret(&config.token_env)?;
        Self::new(
            &config.api_base,
            &config.upload_base,
            &config.repository,
            &config.tag,
            token,
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(USER_AGENT, "samplegraph")
    }

    async fn release(&self) -> Result<Release> {
        let url = format!(
            "{}/repos/{}/releases/tags/{}",
            self.api_base, self.repository, self.tag
        );
        let resp = self
            .request(reqwest::Method::GET, &url)
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp, "release lookup").await?;
        resp.json::<Release>()
            .await
            .map_err(|e| SampleGraphError::BackupTransport(format!("release decode: {e}")))
    }
}

#[async_trait]
impl AssetStore for ReleaseAssetStore {
    #[instrument(skip_all, fields(repo = %self.repository, tag = %self.tag))]
    async fn list_assets(&self) -> Result<Vec<AssetRef>> {
        let mut assets = self.release().await?.assets;
        sort_assets(&mut assets);
        debug!(count = assets.len(), "listed release assets");
        Ok(assets)
    }

    #[instrument(skip_all, fields(asset = %asset.name))]
    async fn download(&self, asset: &AssetRef, dest: &Path) -> Result<()> {
        let url = format!(
            "{}/repos/{}/releases/assets/{}",
            self.api_base, self.repository, asset.id
        );
        let resp = self
            .request(reqwest::Method::GET, &url)
            .header(ACCEPT, "application/octet-stream")
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp, "asset download").await?;
        let bytes = resp.bytes().await.map_err(transport)?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| SampleGraphError::io(dest, e))?;
        debug!(bytes = bytes.len(), "asset downloaded");
        Ok(())
    }

    #[instrument(skip_all, fields(asset = %name))]
    async fn upload(&self, path: &Path, name: &str) -> Result<AssetRef> {
        let release = self.release().await?;
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| SampleGraphError::io(path, e))?;
        let url = format!(
            "{}/repos/{}/releases/{}/assets",
            self.upload_base, self.repository, release.id
        );
        let resp = self
            .request(reqwest::Method::POST, &url)
            .query(&[("name", name)])
            .header(ACCEPT, "application/vnd.github+json")
            .header(CONTENT_TYPE, "application/gzip")
            .body(body)
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp, "asset upload").await?;
        resp.json::<AssetRef>()
            .await
            .map_err(|e| SampleGraphError::BackupTransport(format!("upload decode: {e}")))
    }

    #[instrument(skip_all, fields(asset = %asset.name))]
    async fn delete(&self, asset: &AssetRef) -> Result<()> {
        let url = format!(
            "{}/repos/{}/releases/assets/{}",
            self.api_base, self.repository, asset.id
        );
        let resp = self
            .request(reqwest::Method::DELETE, &url)
            .send()
            .await
            .map_err(transport)?;
        check_status(resp, "asset delete").await?;
        Ok(())
    }
}

fn transport(e: reqwest::Error) -> SampleGraphError {
    SampleGraphError::BackupTransport(e.to_string())
}

async fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SampleGraphError::BackupTransport(format!(
        "{what} failed with {status}: {body}"
    )))
}

// ---------------------------------------------------------------------------
// In-memory store for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    /// Keeps archive bytes in a map; `fail_downloads` names assets whose
    /// download errors. Uploads reject duplicate names like the release API.
    #[derive(Default)]
    pub struct MemoryStore {
        pub assets: Mutex<BTreeMap<u64, (AssetRef, Vec<u8>)>>,
        pub fail_downloads: Mutex<Vec<String>>,
        pub fail_uploads: Mutex<bool>,
        next_id: Mutex<u64>,
    }

    impl MemoryStore {
        pub fn names(&self) -> Vec<String> {
            let mut assets: Vec<AssetRef> = self
                .assets
                .lock()
                .expect("lock")
                .values()
                .map(|(a, _)| a.clone())
                .collect();
            sort_assets(&mut assets);
            assets.into_iter().map(|a| a.name).collect()
        }

        /// Insert raw bytes with an explicit creation time.
        pub fn insert(&self, name: &str, created_at: DateTime<Utc>, bytes: Vec<u8>) -> AssetRef {
            let mut next = self.next_id.lock().expect("lock");
            *next += 1;
            let asset = AssetRef {
                id: *next,
                name: name.to_string(),
                size: bytes.len() as u64,
                created_at,
            };
            self.assets
                .lock()
                .expect("lock")
                .insert(asset.id, (asset.clone(), bytes));
            asset
        }
    }

    #[async_trait]
    impl AssetStore for MemoryStore {
        async fn list_assets(&self) -> Result<Vec<AssetRef>> {
            let mut assets: Vec<AssetRef> = self
                .assets
                .lock()
                .expect("lock")
                .values()
                .map(|(a, _)| a.clone())
                .collect();
            sort_assets(&mut assets);
            Ok(assets)
        }

        async fn download(&self, asset: &AssetRef, dest: &Path) -> Result<()> {
            if self.fail_downloads.lock().expect("lock").contains(&asset.name) {
                return Err(SampleGraphError::BackupTransport(format!(
                    "download of {} refused",
                    asset.name
                )));
            }
            let bytes = self
                .assets
                .lock()
                .expect("lock")
                .get(&asset.id)
                .map(|(_, b)| b.clone())
                .ok_or_else(|| SampleGraphError::BackupTransport("no such asset".into()))?;
            std::fs::write(dest, bytes).map_err(|e| SampleGraphError::io(dest, e))
        }

        async fn upload(&self, path: &Path, name: &str) -> Result<AssetRef> {
            if *self.fail_uploads.lock().expect("lock") {
                return Err(SampleGraphError::BackupTransport("upload refused".into()));
            }
            if self.names().iter().any(|n| n == name) {
                return Err(SampleGraphError::BackupTransport(format!(
                    "asset {name} already exists"
                )));
            }
            let bytes = std::fs::read(path).map_err(|e| SampleGraphError::io(path, e))?;
            Ok(self.insert(name, Utc::now(), bytes))
        }

        async fn delete(&self, asset: &AssetRef) -> Result<()> {
            self.assets.lock().expect("lock").remove(&asset.id);
            Ok(())
        }
    }
}
