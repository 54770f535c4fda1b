//! Object store client.
//!
//! Thin wrapper over the AWS SDK that speaks to any S3-compatible endpoint:
//! HEAD with ETag extraction, single and multipart PUT, paginated listing,
//! and GET for restore. Multipart parts are fixed at 5 MiB so locally
//! computed multipart tags line up with what the store reports.

use anyhow::{Context, Result};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::{RetryConfig, S3Config};
use crate::etag::{self, MULTIPART_THRESHOLD, PART_SIZE};

/// One listed object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Result of a HEAD probe. A failed probe reads as "absent".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadResult {
    pub exists: bool,
    pub size: u64,
    pub etag: String,
}

pub struct ObjectStore {
    client: Client,
    bucket: String,
    retry: RetryConfig,
}

impl ObjectStore {
    pub async fn connect(cfg: &S3Config, retry: RetryConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = cfg.region.clone() {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let Some(endpoint) = cfg.endpoint.clone() {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(cfg.path_style)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: cfg.bucket.clone(),
            retry,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// HEAD the key. Any error, including missing objects and permission
    /// problems, reads as absent so callers fall through to upload.
    pub async fn head(&self, key: &str) -> HeadResult {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => HeadResult {
                exists: true,
                size: out.content_length().unwrap_or(0).max(0) as u64,
                etag: etag::normalize(out.e_tag().unwrap_or("")),
            },
            Err(e) => {
                debug!("HEAD {key} treated as absent: {}", e);
                HeadResult::default()
            }
        }
    }

    /// Upload a body, switching to multipart above the threshold. Transient
    /// failures are retried a bounded number of times with a delay.
    pub async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let result = if body.len() > MULTIPART_THRESHOLD {
                self.put_multipart(key, &body, content_type).await
            } else {
                self.put_single(key, body.clone(), content_type).await
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < self.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        "Upload of {key} failed ({e:#}), retrying in {}s (attempt {}/{})",
                        self.retry.retry_delay_seconds, attempt, self.retry.max_retries
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(
                        self.retry.retry_delay_seconds,
                    ))
                    .await;
                }
                Err(e) => return Err(e).with_context(|| format!("uploading {key}")),
            }
        }
    }

    async fn put_single(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .context("PUT object")?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, body: &[u8], content_type: &str) -> Result<()> {
        let part_count = body.len().div_ceil(PART_SIZE);
        info!("Uploading {key} in {part_count} parts of 5 MiB");

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .context("creating multipart upload")?;
        let upload_id = created
            .upload_id()
            .context("multipart upload has no id")?
            .to_string();

        match self.upload_parts(key, &upload_id, body).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .context("completing multipart upload")?;
                Ok(())
            }
            Err(e) => {
                // Abandoned parts cost money; abort before reporting.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("Failed to abort multipart upload for {key}: {abort_err}");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: &[u8],
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        for (index, chunk) in body.chunks(PART_SIZE).enumerate() {
            let part_number = (index + 1) as i32;
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .with_context(|| format!("uploading part {part_number}"))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .build(),
            );
        }
        Ok(parts)
    }

    /// List every object under a prefix, following continuation tokens.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let page = request
                .send()
                .await
                .with_context(|| format!("listing prefix {prefix}"))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                });
            }
            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(objects)
    }

    /// Download a whole object, retrying transient failures.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut attempt = 0u32;
        loop {
            match self.get_once(key).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt + 1 < self.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        "Download of {key} failed ({e:#}), retrying in {}s (attempt {}/{})",
                        self.retry.retry_delay_seconds, attempt, self.retry.max_retries
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(
                        self.retry.retry_delay_seconds,
                    ))
                    .await;
                }
                Err(e) => return Err(e).with_context(|| format!("downloading {key}")),
            }
        }
    }

    async fn get_once(&self, key: &str) -> Result<Vec<u8>> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("GET object")?;
        let data = out.body.collect().await.context("reading object body")?;
        Ok(data.into_bytes().to_vec())
    }
}
