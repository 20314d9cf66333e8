//! Remote object-store provider over any S3-compatible service
//!
//! Works with AWS S3, Backblaze B2, Cloudflare R2 and generic endpoints such as
//! MinIO. Credentials are resolved once at construction; SDK errors are mapped
//! onto the provider taxonomy so the orchestrator can tell a flaky network from
//! a bucket it will never be able to write to.

use anyhow::{bail, Result};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};

use super::provider::{BackupProvider, ObjectInfo, ProviderKind};
use crate::config::S3Config;
use crate::error::ProviderError;

/// S3-compatible service flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Flavor {
    AwsS3,
    BackblazeB2,
    CloudflareR2,
    Generic,
}

impl S3Flavor {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "aws" | "s3" | "aws-s3" => S3Flavor::AwsS3,
            "b2" | "backblaze" | "backblaze-b2" => S3Flavor::BackblazeB2,
            "r2" | "cloudflare" | "cloudflare-r2" => S3Flavor::CloudflareR2,
            _ => S3Flavor::Generic,
        }
    }

    fn default_region(self) -> &'static str {
        match self {
            S3Flavor::AwsS3 | S3Flavor::Generic => "us-east-1",
            S3Flavor::BackblazeB2 => "us-west-002",
            S3Flavor::CloudflareR2 => "auto",
        }
    }
}

/// Error codes that no retry will fix
const PERMANENT_CODES: [&str; 7] = [
    "AccessDenied",
    "NoSuchBucket",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "InvalidBucketName",
    "AccountProblem",
    "AllAccessDisabled",
];

/// Map an SDK failure onto the provider taxonomy
fn classify<E, R>(err: &SdkError<E, R>, context: &str) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = err.as_service_error().and_then(|e| e.code()).map(str::to_string);
    let message = match &code {
        Some(code) => format!("{}: {} ({})", context, err, code),
        None => format!("{}: {}", context, err),
    };

    match code.as_deref() {
        Some("NoSuchKey") | Some("NotFound") => ProviderError::NotFound(context.to_string()),
        Some(code) if PERMANENT_CODES.contains(&code) => ProviderError::Permanent(message),
        _ if matches!(err, SdkError::ConstructionFailure(_)) => ProviderError::Permanent(message),
        _ => ProviderError::Transient(message),
    }
}

pub struct S3Provider {
    name: String,
    client: S3Client,
    bucket: String,
}

impl S3Provider {
    /// Build the client and probe the bucket. Fails for configurations that can
    /// never work (missing credentials, missing endpoint, rejected credentials).
    pub async fn connect(config: &S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            bail!("S3 bucket name is empty");
        }
        if config.access_key_id.is_empty() || config.secret_access_key.is_empty() {
            bail!("S3 credentials are missing for bucket {}", config.bucket);
        }

        let client = Self::create_client(config).await?;
        let provider = Self {
            name: format!("s3:{}", config.bucket),
            client,
            bucket: config.bucket.clone(),
        };

        match provider.client.head_bucket().bucket(&provider.bucket).send().await {
            Ok(_) => info!("Connected to bucket {}", provider.bucket),
            Err(e) => match classify(&e, "head bucket") {
                ProviderError::Transient(msg) => {
                    warn!("Bucket {} not reachable yet, keeping provider: {}", provider.bucket, msg)
                }
                other => bail!("Bucket {} is unusable: {}", provider.bucket, other),
            },
        }

        Ok(provider)
    }

    async fn create_client(config: &S3Config) -> Result<S3Client> {
        let flavor = S3Flavor::parse(&config.provider);

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "spread-vault",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| flavor.default_region().to_string());
        let region_provider = RegionProviderChain::first_try(Region::new(region));

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .credentials_provider(credentials)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);
        match (&config.endpoint, flavor) {
            (Some(endpoint), _) => {
                builder = builder
                    .endpoint_url(endpoint)
                    .force_path_style(config.force_path_style.unwrap_or(true));
            }
            (None, S3Flavor::AwsS3) => {
                builder = builder.force_path_style(config.force_path_style.unwrap_or(false));
            }
            (None, S3Flavor::BackblazeB2) => {
                bail!("Backblaze B2 requires an endpoint URL (e.g., https://s3.us-west-002.backblazeb2.com)");
            }
            (None, S3Flavor::CloudflareR2) => {
                bail!("Cloudflare R2 requires an endpoint URL (e.g., https://<account-id>.r2.cloudflarestorage.com)");
            }
            (None, S3Flavor::Generic) => {
                warn!("Generic S3 provider without endpoint - will use AWS S3");
            }
        }

        Ok(S3Client::from_conf(builder.build()))
    }
}

#[async_trait]
impl BackupProvider for S3Provider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    async fn store(&self, key: &str, data: Bytes) -> Result<(), ProviderError> {
        debug!("Uploading {} bytes to s3://{}/{}", data.len(), self.bucket, key);

        let content_type = if key.ends_with(".json") {
            "application/json"
        } else {
            "text/csv"
        };

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(&e, key))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, ProviderError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| classify(&e, prefix))?;

            for object in response.contents() {
                let key = match object.key() {
                    Some(key) => key.to_string(),
                    None => continue,
                };
                let modified = object
                    .last_modified()
                    .and_then(|t| Utc.timestamp_opt(t.secs(), t.subsec_nanos()).single());
                objects.push(ObjectInfo {
                    key,
                    size: object.size().unwrap_or(0).max(0) as u64,
                    modified,
                });
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        debug!("Listed {} objects under s3://{}/{}", objects.len(), self.bucket, prefix);
        Ok(objects)
    }

    async fn fetch(&self, key: &str) -> Result<Bytes, ProviderError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(&e, key))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| ProviderError::Transient(format!("{}: reading body: {}", key, e)))?
            .into_bytes();
        Ok(data)
    }

    async fn delete(&self, key: &str) -> Result<(), ProviderError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(&e, key))?;
        Ok(())
    }
}
