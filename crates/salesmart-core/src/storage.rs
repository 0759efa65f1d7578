//! Object storage holding increment artifacts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::info;

use crate::config::{PipelineConfig, StorageConfig};
use crate::error::{PipelineError, Result};
use crate::types::IncrementHandle;

/// Object key of an increment file, relative to the storage root.
pub fn artifact_key(cohort: &str, nickname: &str, increment: &IncrementHandle, filename: &str) -> String {
    format!("cohort_{cohort}/{nickname}/project/{increment}/{filename}")
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Human-readable address of the artifact, used in logs and errors.
    fn location(&self, increment: &IncrementHandle, filename: &str) -> String;

    async fn fetch(&self, increment: &IncrementHandle, filename: &str) -> Result<Bytes>;
}

/// Artifacts published as plain objects under a base URL.
#[derive(Debug, Clone)]
pub struct HttpArtifactStore {
    client: Client,
    base_url: String,
    cohort: String,
    nickname: String,
}

impl HttpArtifactStore {
    pub fn new(
        base_url: impl Into<String>,
        cohort: impl Into<String>,
        nickname: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PipelineError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cohort: cohort.into(),
            nickname: nickname.into(),
        })
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    fn location(&self, increment: &IncrementHandle, filename: &str) -> String {
        format!(
            "{}/{}",
            self.base_url,
            artifact_key(&self.cohort, &self.nickname, increment, filename)
        )
    }

    async fn fetch(&self, increment: &IncrementHandle, filename: &str) -> Result<Bytes> {
        let url = self.location(increment, filename);
        info!(url = %url, "downloading increment artifact");

        let download_error = |message: String| PipelineError::Download {
            url: url.clone(),
            message,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| download_error(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(download_error(format!("HTTP {status}")));
        }
        response
            .bytes()
            .await
            .map_err(|err| download_error(err.to_string()))
    }
}

#[cfg(feature = "s3")]
pub use s3::S3ArtifactStore;

#[cfg(feature = "s3")]
mod s3 {
    use async_trait::async_trait;
    use aws_config::BehaviorVersion;
    use aws_credential_types::Credentials;
    use aws_sdk_s3::config::{Builder, Region};
    use aws_sdk_s3::{Client, Config};
    use bytes::Bytes;
    use tracing::info;

    use super::{artifact_key, ArtifactStore};
    use crate::config::S3Settings;
    use crate::error::{PipelineError, Result};
    use crate::types::IncrementHandle;

    /// Artifacts read from a private bucket with the same key layout.
    #[derive(Clone)]
    pub struct S3ArtifactStore {
        client: Client,
        bucket: String,
        cohort: String,
        nickname: String,
    }

    /// Static keys from settings. Both or neither must be present.
    pub(crate) fn static_credentials(settings: &S3Settings) -> Result<Option<Credentials>> {
        match (&settings.access_key_id, &settings.secret_access_key) {
            (Some(key), Some(secret)) => {
                Ok(Some(Credentials::new(key, secret, None, None, "salesmart-env")))
            }
            (None, None) => Ok(None),
            _ => Err(PipelineError::Config(
                "S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together".into(),
            )),
        }
    }

    /// Client configuration for `settings`; `credentials` overrides the
    /// ambient provider chain.
    pub(crate) fn client_config(settings: &S3Settings, credentials: Option<Credentials>) -> Config {
        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .force_path_style(settings.force_path_style);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if let Some(credentials) = credentials {
            builder = builder.credentials_provider(credentials);
        }
        builder.build()
    }

    impl S3ArtifactStore {
        pub async fn new(settings: &S3Settings, cohort: &str, nickname: &str) -> Result<Self> {
            if settings.bucket.is_empty() {
                return Err(PipelineError::Config("S3_BUCKET cannot be empty".into()));
            }

            let config = match static_credentials(settings)? {
                Some(credentials) => client_config(settings, Some(credentials)),
                None => {
                    let ambient = aws_config::load_defaults(BehaviorVersion::latest()).await;
                    let mut config = client_config(settings, None).to_builder();
                    if let Some(provider) = ambient.credentials_provider() {
                        config = config.credentials_provider(provider);
                    }
                    config.build()
                }
            };

            Ok(Self {
                client: Client::from_conf(config),
                bucket: settings.bucket.clone(),
                cohort: cohort.to_string(),
                nickname: nickname.to_string(),
            })
        }

        fn key(&self, increment: &IncrementHandle, filename: &str) -> String {
            artifact_key(&self.cohort, &self.nickname, increment, filename)
        }
    }

    #[async_trait]
    impl ArtifactStore for S3ArtifactStore {
        fn location(&self, increment: &IncrementHandle, filename: &str) -> String {
            format!("s3://{}/{}", self.bucket, self.key(increment, filename))
        }

        async fn fetch(&self, increment: &IncrementHandle, filename: &str) -> Result<Bytes> {
            let url = self.location(increment, filename);
            info!(url = %url, "downloading increment artifact");
            let download_error = |message: String| PipelineError::Download {
                url: url.clone(),
                message,
            };

            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(self.key(increment, filename))
                .send()
                .await
                .map_err(|err| download_error(err.to_string()))?;
            let data = output
                .body
                .collect()
                .await
                .map_err(|err| download_error(err.to_string()))?;
            Ok(data.into_bytes())
        }
    }

}

/// Builds the artifact store selected by configuration.
pub async fn build_artifact_store(config: &PipelineConfig) -> Result<Arc<dyn ArtifactStore>> {
    match &config.storage {
        StorageConfig::Http { base_url } => Ok(Arc::new(HttpArtifactStore::new(
            base_url.clone(),
            config.api.cohort.clone(),
            config.api.nickname.clone(),
            config.api.timeout,
        )?)),
        #[cfg(feature = "s3")]
        StorageConfig::S3(settings) => Ok(Arc::new(
            S3ArtifactStore::new(settings, &config.api.cohort, &config.api.nickname).await?,
        )),
        #[cfg(not(feature = "s3"))]
        StorageConfig::S3(_) => Err(PipelineError::Config(
            "S3 storage requested but salesmart was built without the `s3` feature".into(),
        )),
    }
}
