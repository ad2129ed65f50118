use std::{env, fmt::Debug, sync::Arc};

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt};
use object_store::{parse_url, path::Path, ObjectStore, WriteMultipart};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageStoreConfig {
    pub path: Option<String>,
}

impl PackageStoreConfig {
    pub fn new(path: &str) -> Self {
        PackageStoreConfig {
            path: Some(format!("file://{}", path)),
        }
    }
}

impl Default for PackageStoreConfig {
    fn default() -> Self {
        let package_store_path = format!(
            "file://{}",
            env::current_dir()
                .expect("no current directory")
                .join("kiln_storage/packages")
                .to_str()
                .expect("package store path is not valid utf-8")
        );
        info!("using package store path: {}", package_store_path);
        PackageStoreConfig {
            path: Some(package_store_path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub url: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

/// Content-addressed storage for code bundles.
///
/// Bundles land under `sha256/<digest>`, so the same content uploaded twice
/// resolves to the same key and references stay valid across re-uploads.
#[derive(Clone)]
pub struct PackageStore {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
}

impl PackageStore {
    pub fn new(config: PackageStoreConfig) -> Result<Self> {
        let url_str = config
            .path
            .ok_or(anyhow!("package store path is not configured"))?;
        let url = url_str.parse::<Url>()?;
        let (object_store, path) = parse_url(&url)?;
        Ok(Self {
            object_store: Arc::new(object_store),
            path,
        })
    }

    pub fn get_object_store(&self) -> Arc<dyn ObjectStore> {
        self.object_store.clone()
    }

    pub fn get_path(&self) -> Path {
        self.path.clone()
    }

    /// Streams a bundle into the store, hashing as it goes, and commits it
    /// under its digest. The write lands at a staging key first so a
    /// half-written upload can never be resolved by readers.
    pub async fn put(
        &self,
        data: impl futures::Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<PutResult, anyhow::Error> {
        let mut hasher = Sha256::new();
        let mut hashed_stream = data.map(|item| {
            item.map(|bytes| {
                hasher.update(&bytes);
                bytes
            })
        });

        let staging_path = self.path.child("staging").child(nanoid::nanoid!());
        let m = self.object_store.put_multipart(&staging_path).await?;
        let mut w = WriteMultipart::new(m);
        let mut size_bytes = 0;
        while let Some(chunk) = hashed_stream.next().await {
            w.wait_for_capacity(1).await?;
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            w.write(&chunk);
        }
        w.finish().await?;

        let hash = format!("{:x}", hasher.finalize());
        let final_path = self.path.child("sha256").child(hash.as_str());
        self.object_store.rename(&staging_path, &final_path).await?;
        Ok(PutResult {
            url: final_path.to_string(),
            size_bytes,
            sha256_hash: hash,
        })
    }

    pub async fn get(&self, path: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let client_clone = self.object_store.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let get_result = client_clone
            .get(&path.into())
            .await
            .map_err(|e| anyhow!("can't get package {:?}: {:?}", path, e))?;
        let path = path.to_string();
        tokio::spawn(async move {
            let mut stream = get_result.into_stream();
            while let Some(chunk) = stream.next().await {
                let _ = tx.send(
                    chunk.map_err(|e| anyhow!("error reading package {:?}: {:?}", path.clone(), e)),
                );
            }
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        let mut reader = self.get(key).await?;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes.into())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.object_store.head(&key.into()).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.object_store
            .delete(&object_store::path::Path::from(key))
            .await?;
        Ok(())
    }
}
