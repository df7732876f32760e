//! Cloudflare R2 adapter over the S3-compatible API.
//!
//! Capabilities are SigV4 presigned URLs, so clients need no separate token
//! and upload with `PUT`. Multipart uploads are assembled from the ETags the
//! client got back for each part.

use crate::models::{
    capability::{DownloadCapability, HttpMethod, PartToken, UploadCapability, part_number_for},
    session::ProviderKind,
};
use crate::providers::{ProviderError, ProviderResult, StorageProvider, ensure_contiguous};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    types::{CompletedMultipartUpload, CompletedPart},
};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct R2Config {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    /// Lifetime of presigned URLs. S3 caps this at seven days.
    pub url_expiry: Duration,
    /// Overrides `https://{account_id}.r2.cloudflarestorage.com`.
    pub endpoint: Option<String>,
}

pub struct R2Provider {
    client: aws_sdk_s3::Client,
    bucket: String,
    url_expiry: Duration,
}

impl R2Provider {
    pub fn new(config: R2Config) -> Self {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.r2.cloudflarestorage.com", config.account_id));
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "r2-config",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .endpoint_url(&endpoint)
            .region(Region::new("auto"))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        info!(endpoint = %endpoint, bucket = %config.bucket, "R2 client initialized");

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket,
            url_expiry: config.url_expiry,
        }
    }

    fn presigning(&self, operation: &'static str) -> ProviderResult<PresigningConfig> {
        PresigningConfig::expires_in(self.url_expiry).map_err(|err| ProviderError::Request {
            provider: ProviderKind::R2,
            operation,
            message: format!("invalid presign config: {err}"),
        })
    }

    async fn presign_put(&self, key: &str) -> ProviderResult<UploadCapability> {
        const OPERATION: &str = "PutObject";
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(self.presigning(OPERATION)?)
            .await
            .map_err(|err| sdk_error(OPERATION, err))?;

        Ok(UploadCapability {
            chunk_index: 0,
            url: presigned.uri().to_string(),
            method: HttpMethod::Put,
            auth_token: None,
            multipart_id: None,
            part_number: None,
        })
    }

    async fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        index: i64,
    ) -> ProviderResult<UploadCapability> {
        const OPERATION: &str = "UploadPart";
        let part_number = part_number_for(index);
        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(self.presigning(OPERATION)?)
            .await
            .map_err(|err| sdk_error(OPERATION, err))?;

        Ok(UploadCapability {
            chunk_index: index,
            url: presigned.uri().to_string(),
            method: HttpMethod::Put,
            auth_token: None,
            multipart_id: Some(upload_id.to_string()),
            part_number: Some(part_number),
        })
    }

    /// Abort every open multipart upload on exactly `key`.
    async fn abort_open_uploads(&self, key: &str) -> ProviderResult<()> {
        const OPERATION: &str = "ListMultipartUploads";
        let listing = self
            .client
            .list_multipart_uploads()
            .bucket(&self.bucket)
            .prefix(key)
            .send()
            .await
            .map_err(|err| sdk_error(OPERATION, err))?;

        for upload in listing.uploads() {
            let (Some(upload_key), Some(upload_id)) = (upload.key(), upload.upload_id()) else {
                continue;
            };
            if upload_key != key {
                continue;
            }
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
                .map_err(|err| sdk_error("AbortMultipartUpload", err))?;
            debug!(key, upload_id, "aborted R2 multipart upload");
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for R2Provider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::R2
    }

    async fn issue_put_capabilities(
        &self,
        key: &str,
        chunk_count: i64,
    ) -> ProviderResult<Vec<UploadCapability>> {
        if chunk_count <= 1 {
            return Ok(vec![self.presign_put(key).await?]);
        }

        const OPERATION: &str = "CreateMultipartUpload";
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|err| sdk_error(OPERATION, err))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: ProviderKind::R2,
                operation: OPERATION,
                message: "no upload id in response".into(),
            })?
            .to_string();
        info!(key, upload_id = %upload_id, chunk_count, "created R2 multipart upload");

        let mut capabilities = Vec::with_capacity(chunk_count as usize);
        for index in 0..chunk_count {
            capabilities.push(self.presign_part(key, &upload_id, index).await?);
        }
        Ok(capabilities)
    }

    async fn reissue_put_capability(
        &self,
        key: &str,
        chunk_count: i64,
        multipart_id: Option<&str>,
        index: i64,
    ) -> ProviderResult<UploadCapability> {
        if chunk_count <= 1 {
            return self.presign_put(key).await;
        }
        let upload_id = multipart_id.ok_or(ProviderError::MissingMultipartId { index })?;
        self.presign_part(key, upload_id, index).await
    }

    async fn issue_get_capabilities(
        &self,
        key: &str,
        chunk_count: i64,
    ) -> ProviderResult<Vec<DownloadCapability>> {
        const OPERATION: &str = "GetObject";
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(self.presigning(OPERATION)?)
            .await
            .map_err(|err| sdk_error(OPERATION, err))?;
        let url = presigned.uri().to_string();

        Ok((0..chunk_count.max(1))
            .map(|index| DownloadCapability {
                chunk_index: index,
                url: url.clone(),
                method: HttpMethod::Get,
                range: None,
            })
            .collect())
    }

    async fn finalize_multipart(
        &self,
        key: &str,
        multipart_id: &str,
        parts: &[PartToken],
    ) -> ProviderResult<()> {
        ensure_contiguous(parts)?;
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|part| {
                        CompletedPart::builder()
                            .part_number(part.part_number)
                            .e_tag(&part.token)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(multipart_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|err| sdk_error("CompleteMultipartUpload", err))?;

        info!(key, upload_id = multipart_id, parts = parts.len(), "completed R2 multipart upload");
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> ProviderResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| sdk_error("DeleteObject", err))?;
        self.abort_open_uploads(key).await
    }
}

fn sdk_error<E>(operation: &'static str, err: E) -> ProviderError
where
    E: std::error::Error,
{
    ProviderError::Request {
        provider: ProviderKind::R2,
        operation,
        message: DisplayErrorContext(&err).to_string(),
    }
}
