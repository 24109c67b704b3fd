//! [`Sink`] backed by an S3 compatible object store, MinIO included.
use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::fmt;
use tracing::info;

use pg_cdc::sink::Sink;

#[derive(Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Custom endpoint for S3 compatible services; path style addressing is used with it.
    pub endpoint_url: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "REDACTED"),
            )
            .finish()
    }
}

pub struct S3Sink {
    client: S3Client,
    bucket: String,
}

impl S3Sink {
    pub async fn new(config: &S3Config) -> S3Sink {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let creds = aws_sdk_s3::config::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "pg-cdc-uploader",
            );
            loader = loader.credentials_provider(creds);
        }

        let aws_config = loader.load().await;
        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint) = &config.endpoint_url {
            s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
        }

        S3Sink {
            client: S3Client::from_conf(s3_config.build()),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl Sink for S3Sink {
    async fn bucket_exists(&self) -> anyhow::Result<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => match err.as_service_error() {
                Some(service_err) if service_err.is_not_found() => Ok(false),
                _ => Err(anyhow::Error::new(err))
                    .with_context(|| format!("failed to access bucket {}", self.bucket)),
            },
        }
    }

    async fn create_bucket(&self) -> anyhow::Result<()> {
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!("Created bucket {}", self.bucket);
                Ok(())
            }
            Err(err) => match err.as_service_error() {
                Some(service_err)
                    if service_err.is_bucket_already_owned_by_you()
                        || service_err.is_bucket_already_exists() =>
                {
                    Ok(())
                }
                _ => Err(anyhow::Error::new(err))
                    .with_context(|| format!("failed to create bucket {}", self.bucket)),
            },
        }
    }

    async fn put(
        &self,
        object_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_name)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .with_context(|| format!("failed to put {}/{}", self.bucket, object_name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_secret() {
        let config = S3Config {
            endpoint_url: Some("http://minio:9000".to_string()),
            region: "us-east-1".to_string(),
            bucket: "raw".to_string(),
            access_key_id: Some("minioadmin".to_string()),
            secret_access_key: Some("topsecret".to_string()),
        };

        let printed = format!("{config:?}");
        assert!(printed.contains("minio:9000"));
        assert!(!printed.contains("topsecret"));
    }
}
