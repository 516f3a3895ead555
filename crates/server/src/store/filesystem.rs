use super::{AssociationStore, digest};
use crate::error::StoreError;
use crate::openid::{Association, nonce};
use async_trait::async_trait;
use getrandom::fill;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Associations and nonces as files under one root directory.
///
/// ```text
/// <root>/associations/<sha256(server_url)>-<sha256(handle)>
/// <root>/nonces/<timestamp>-<sha256(server_url \0 salt)>
/// <root>/temp/
/// ```
///
/// Association files are written to `temp/` and renamed into place so
/// readers never see a partial file. Nonces are claimed with an exclusive
/// create, which makes a replay lose the race atomically.
#[derive(Debug)]
pub struct FilesystemStore {
    associations: PathBuf,
    nonces: PathBuf,
    temp: PathBuf,
}

impl FilesystemStore {
    pub async fn open(root: PathBuf) -> Result<Self, StoreError> {
        let store = Self {
            associations: root.join("associations"),
            nonces: root.join("nonces"),
            temp: root.join("temp"),
        };
        for dir in [&store.associations, &store.nonces, &store.temp] {
            fs::create_dir_all(dir).await?;
        }
        debug!(root = %root.display(), "filesystem association store ready");
        Ok(store)
    }

    fn association_path(&self, server_url: &str, handle: &str) -> PathBuf {
        self.associations
            .join(format!("{}-{}", digest(server_url), digest(handle)))
    }

    async fn read_association(&self, path: &Path) -> Result<Option<Association>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(association) => Ok(Some(association)),
                Err(e) => {
                    warn!(path = %path.display(), "removing unreadable association: {e}");
                    remove_if_present(path).await?;
                    Ok(None)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self) -> Result<PathBuf, StoreError> {
        let mut suffix = [0u8; 8];
        fill(&mut suffix).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let name: String = suffix.iter().map(|b| format!("{b:02x}")).collect();
        Ok(self.temp.join(format!("tmp-{name}")))
    }
}

async fn remove_if_present(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn entries(dir: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let mut out = Vec::new();
    let mut reader = fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            out.push((name.to_string(), entry.path()));
        }
    }
    Ok(out)
}

#[async_trait]
impl AssociationStore for FilesystemStore {
    async fn store_association(
        &self,
        server_url: &str,
        association: &Association,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_vec(association)?;
        let temp = self.temp_path()?;
        fs::write(&temp, json).await?;
        let target = self.association_path(server_url, &association.handle);
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get_association(
        &self,
        server_url: &str,
        handle: Option<&str>,
    ) -> Result<Option<Association>, StoreError> {
        if let Some(handle) = handle {
            return self
                .read_association(&self.association_path(server_url, handle))
                .await;
        }

        let prefix = format!("{}-", digest(server_url));
        let now = nonce::now();
        let mut newest: Option<Association> = None;
        for (name, path) in entries(&self.associations).await? {
            if !name.starts_with(&prefix) {
                continue;
            }
            let Some(association) = self.read_association(&path).await? else {
                continue;
            };
            if association.is_expired(now) {
                remove_if_present(&path).await?;
                continue;
            }
            if newest.as_ref().is_none_or(|n| association.issued > n.issued) {
                newest = Some(association);
            }
        }
        Ok(newest)
    }

    async fn remove_association(
        &self,
        server_url: &str,
        handle: &str,
    ) -> Result<bool, StoreError> {
        remove_if_present(&self.association_path(server_url, handle)).await
    }

    async fn use_nonce(
        &self,
        server_url: &str,
        timestamp: i64,
        salt: &str,
    ) -> Result<bool, StoreError> {
        if !nonce::within_skew(timestamp, nonce::now()) {
            return Ok(false);
        }
        let path = self
            .nonces
            .join(format!("{timestamp}-{}", digest(&format!("{server_url}\0{salt}"))));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup_nonces(&self) -> Result<usize, StoreError> {
        let now = nonce::now();
        let mut removed = 0;
        for (name, path) in entries(&self.nonces).await? {
            let stale = match name.split_once('-').and_then(|(ts, _)| ts.parse::<i64>().ok()) {
                Some(ts) => !nonce::within_skew(ts, now),
                None => true,
            };
            if stale && remove_if_present(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn cleanup_associations(&self) -> Result<usize, StoreError> {
        let now = nonce::now();
        let mut removed = 0;
        for (_, path) in entries(&self.associations).await? {
            let expired = match fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<Association>(&bytes)
                    .map(|a| a.is_expired(now))
                    .unwrap_or(true),
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            };
            if expired && remove_if_present(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
