//! Remote stores segments are uploaded to

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{LivecastError, Result, ResultExt};

/// Resolved storage credentials, delivered by the host once its account
/// session is set up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCredentials {
    pub access_key: String,
    pub secret: String,
    pub bucket: String,
    pub region: Option<String>,
    /// S3-compatible endpoint; AWS when unset
    pub endpoint: Option<String>,
    /// Public URL prefix viewers fetch objects from
    pub public_url: Option<String>,
}

impl StorageCredentials {
    pub fn new(
        access_key: impl Into<String>,
        secret: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret: secret.into(),
            bucket: bucket.into(),
            region: None,
            endpoint: None,
            public_url: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = Some(url.into());
        self
    }

    /// URL viewers use to fetch `key`
    pub fn url_for(&self, key: &str) -> String {
        match (&self.public_url, &self.endpoint) {
            (Some(base), _) => format!("{}/{}", base.trim_end_matches('/'), key),
            (None, Some(endpoint)) => {
                format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key)
            }
            (None, None) => format!("https://{}.s3.amazonaws.com/{}", self.bucket, key),
        }
    }
}

impl std::fmt::Display for StorageCredentials {
    // never prints the secret
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bucket={} key={}", self.bucket, self.access_key)
    }
}

/// Object store the uploader writes to; one transfer at a time
pub trait RemoteStore: Send {
    fn name(&self) -> &str;

    /// Upload `source` to `key`, returning the bytes transferred
    fn put(&mut self, key: &str, source: &Path) -> Result<u64>;

    /// Public URL of `key`
    fn url_for(&self, key: &str) -> String;
}

/// Builds a store once credentials resolve
pub trait StoreProvider: Send + Sync {
    fn connect(&self, credentials: &StorageCredentials) -> Result<Box<dyn RemoteStore>>;
}

/// Mirrors uploads into a local directory
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    credentials: StorageCredentials,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>, credentials: StorageCredentials) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .context(format!("Failed to create store directory {}", root.display()))?;
        Ok(Self { root, credentials })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RemoteStore for FsStore {
    fn name(&self) -> &str {
        "fs"
    }

    fn put(&mut self, key: &str, source: &Path) -> Result<u64> {
        if key.split('/').any(|part| part == "..") {
            return Err(LivecastError::upload(format!("Refusing key outside the store: {}", key)));
        }
        let dest = self.root.join(key);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = std::fs::copy(source, &dest).map_err(|e| {
            LivecastError::upload(format!("Copy {} -> {}: {}", source.display(), dest.display(), e))
        })?;
        debug!("Stored {} ({} bytes)", key, bytes);
        Ok(bytes)
    }

    fn url_for(&self, key: &str) -> String {
        match &self.credentials.public_url {
            Some(_) => self.credentials.url_for(key),
            None => format!("file://{}", self.root.join(key).display()),
        }
    }
}

/// Connects [`FsStore`]s under `<root>/<bucket>`
#[derive(Debug, Clone)]
pub struct FsStoreProvider {
    root: PathBuf,
}

impl FsStoreProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StoreProvider for FsStoreProvider {
    fn connect(&self, credentials: &StorageCredentials) -> Result<Box<dyn RemoteStore>> {
        let root = self.root.join(&credentials.bucket);
        info!("Mirroring uploads into {:?}", root);
        Ok(Box::new(FsStore::new(root, credentials.clone())?))
    }
}

#[cfg(feature = "s3")]
pub use s3::{S3Store, S3StoreProvider};

#[cfg(feature = "s3")]
mod s3 {
    use super::*;
    use opendal::services::S3;
    use opendal::Operator;

    /// S3-compatible bucket via OpenDAL
    pub struct S3Store {
        operator: Operator,
        runtime: tokio::runtime::Runtime,
        credentials: StorageCredentials,
    }

    impl S3Store {
        pub fn connect(credentials: &StorageCredentials) -> Result<Self> {
            let mut builder = S3::default()
                .access_key_id(&credentials.access_key)
                .secret_access_key(&credentials.secret)
                .bucket(&credentials.bucket)
                .region(credentials.region.as_deref().unwrap_or("us-east-1"));
            if let Some(endpoint) = &credentials.endpoint {
                builder = builder.endpoint(endpoint);
            }
            let operator = Operator::new(builder)?.finish();

            // uploads run on the uploader thread, one at a time
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build upload runtime")?;

            info!("Connected to S3 bucket {}", credentials.bucket);
            Ok(Self {
                operator,
                runtime,
                credentials: credentials.clone(),
            })
        }
    }

    impl RemoteStore for S3Store {
        fn name(&self) -> &str {
            "s3"
        }

        fn put(&mut self, key: &str, source: &Path) -> Result<u64> {
            let data = std::fs::read(source)
                .context(format!("Failed to read {}", source.display()))?;
            let bytes = data.len() as u64;
            let content_type = content_type(key);
            self.runtime.block_on(async {
                self.operator
                    .write_with(key, data)
                    .content_type(content_type)
                    .await
            })?;
            debug!("Uploaded {} ({} bytes)", key, bytes);
            Ok(bytes)
        }

        fn url_for(&self, key: &str) -> String {
            self.credentials.url_for(key)
        }
    }

    fn content_type(key: &str) -> &'static str {
        match Path::new(key).extension().and_then(|e| e.to_str()) {
            Some("m3u8") => "application/vnd.apple.mpegurl",
            Some("ts") => "video/mp2t",
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("mp4") => "video/mp4",
            _ => "application/octet-stream",
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct S3StoreProvider;

    impl StoreProvider for S3StoreProvider {
        fn connect(&self, credentials: &StorageCredentials) -> Result<Box<dyn RemoteStore>> {
            Ok(Box::new(S3Store::connect(credentials)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let creds = StorageCredentials::new("AK", "SK", "streams");
        assert_eq!(creds.url_for("a/index.m3u8"), "https://streams.s3.amazonaws.com/a/index.m3u8");
        let creds = creds.with_endpoint("http://minio:9000/");
        assert_eq!(creds.url_for("x.ts"), "http://minio:9000/streams/x.ts");
        let creds = creds.with_public_url("https://cdn.example.com/live/");
        assert_eq!(creds.url_for("x.ts"), "https://cdn.example.com/live/x.ts");
        assert!(!creds.to_string().contains("SK"));
    }

    #[test]
    fn test_fs_store_copies_under_key() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("seg0.ts");
        std::fs::write(&src, vec![7u8; 376]).unwrap();

        let provider = FsStoreProvider::new(dir.path().join("remote"));
        let mut store = provider
            .connect(&StorageCredentials::new("a", "b", "bucket"))
            .unwrap();
        assert_eq!(store.put("session/seg0.ts", &src).unwrap(), 376);
        assert!(dir.path().join("remote/bucket/session/seg0.ts").exists());
        assert!(store.put("../escape.ts", &src).is_err());
    }
}
