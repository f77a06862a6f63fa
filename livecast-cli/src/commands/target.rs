//! Upload destination shared by `record` and `upload`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use livecast_core::config::ConfigFile;
use livecast_core::upload::{FsStoreProvider, StorageCredentials, StoreProvider};

/// Where uploads go; falls back to the `[upload]` config section
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Mirror uploads into this directory
    #[arg(long, value_name = "DIR", conflicts_with = "bucket")]
    pub upload_dir: Option<PathBuf>,

    /// S3 bucket to upload to (needs the s3 feature)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Remote key prefix (defaults to the session id)
    #[arg(long)]
    pub prefix: Option<String>,
}

/// Resolved upload destination
pub struct Target {
    pub provider: Arc<dyn StoreProvider>,
    pub credentials: StorageCredentials,
}

/// Subdirectory of `--upload-dir` uploads land in
const LOCAL_BUCKET: &str = "live";

impl TargetArgs {
    /// `None` when neither the arguments nor the config name a destination
    pub fn resolve(&self, config: &ConfigFile) -> Result<Option<Target>> {
        let local_dir = self
            .upload_dir
            .clone()
            .or_else(|| config.upload.local_dir.clone());
        let bucket = self.bucket.clone().or_else(|| config.upload.bucket.clone());

        if let Some(dir) = local_dir.filter(|_| self.bucket.is_none()) {
            let credentials = StorageCredentials::new("local", "", LOCAL_BUCKET);
            return Ok(Some(Target {
                provider: Arc::new(FsStoreProvider::new(dir)),
                credentials,
            }));
        }

        match bucket {
            Some(bucket) => s3_target(bucket, config).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(feature = "s3")]
fn s3_target(bucket: String, config: &ConfigFile) -> Result<Target> {
    use anyhow::Context;
    use livecast_core::upload::S3StoreProvider;

    let access_key = std::env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID is not set")?;
    let secret =
        std::env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY is not set")?;

    let mut credentials = StorageCredentials::new(access_key, secret, bucket);
    if let Some(region) = &config.upload.region {
        credentials = credentials.with_region(region);
    }
    if let Some(endpoint) = &config.upload.endpoint {
        credentials = credentials.with_endpoint(endpoint);
    }
    if let Some(url) = &config.upload.public_url {
        credentials = credentials.with_public_url(url);
    }
    Ok(Target {
        provider: Arc::new(S3StoreProvider),
        credentials,
    })
}

#[cfg(not(feature = "s3"))]
fn s3_target(bucket: String, _config: &ConfigFile) -> Result<Target> {
    anyhow::bail!(
        "Uploading to bucket '{}' needs S3 support; rebuild with --features s3",
        bucket
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_destination() {
        let target = TargetArgs::default().resolve(&ConfigFile::default()).unwrap();
        assert!(target.is_none());
    }

    #[test]
    fn test_upload_dir_from_config() {
        let mut config = ConfigFile::default();
        config.upload.local_dir = Some(PathBuf::from("/srv/www"));
        let target = TargetArgs::default().resolve(&config).unwrap().unwrap();
        assert_eq!(target.credentials.bucket, LOCAL_BUCKET);
        assert!(target.credentials.secret.is_empty());
    }

    #[cfg(not(feature = "s3"))]
    #[test]
    fn test_bucket_needs_s3_feature() {
        let args = TargetArgs {
            bucket: Some("streams".to_string()),
            ..Default::default()
        };
        assert!(args.resolve(&ConfigFile::default()).is_err());
    }
}
