//! Backblaze B2 adapter, speaking the native B2 API over `reqwest`.
//!
//! B2 differs from S3-style backends in three ways this module absorbs:
//! - upload URLs are plain endpoints; the client must send the separate
//!   upload authorization token as `Authorization` and use `POST`;
//! - large files are finished with the SHA-1 of every part, not ETags;
//! - every API call needs an account token obtained from
//!   `b2_authorize_account`, cached here and shared by all callers.

use crate::models::{
    capability::{DownloadCapability, HttpMethod, PartToken, UploadCapability, part_number_for},
    session::ProviderKind,
};
use crate::providers::{ProviderError, ProviderResult, StorageProvider, ensure_contiguous};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use futures::{StreamExt, TryStreamExt, stream};
use reqwest::{StatusCode, Url, header::AUTHORIZATION};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const DEFAULT_API_BASE: &str = "https://api.backblazeb2.com";

/// B2 account tokens live 24h; refresh well before that.
const AUTH_LIFETIME: Duration = Duration::from_secs(23 * 60 * 60);

/// Concurrent `b2_get_upload_part_url` calls while issuing capabilities.
const PART_URL_CONCURRENCY: usize = 8;

/// `b2_list_file_versions` page size used when deleting.
const DELETE_LIST_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct B2Config {
    pub key_id: String,
    pub application_key: String,
    pub bucket_id: String,
    pub bucket_name: String,
    /// Lifetime of download authorizations.
    pub url_expiry: Duration,
    /// Overrides the authorization endpoint (tests, private deployments).
    pub api_base: Option<String>,
}

/// Cached result of `b2_authorize_account`.
#[derive(Clone)]
struct B2Session {
    api_url: String,
    download_url: String,
    authorization_token: String,
    obtained_at: Instant,
}

pub struct B2Provider {
    http: reqwest::Client,
    config: B2Config,
    session: RwLock<Option<B2Session>>,
}

impl B2Provider {
    pub fn new(config: B2Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            session: RwLock::new(None),
        }
    }

    /// Return a valid account session, authorizing at most once per
    /// expiry window no matter how many callers race here.
    async fn session(&self) -> ProviderResult<B2Session> {
        {
            let guard = self.session.read().await;
            if let Some(session) = guard.as_ref() {
                if session.obtained_at.elapsed() < AUTH_LIFETIME {
                    return Ok(session.clone());
                }
            }
        }

        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            if session.obtained_at.elapsed() < AUTH_LIFETIME {
                return Ok(session.clone());
            }
        }

        let fresh = self.authorize().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn authorize(&self) -> ProviderResult<B2Session> {
        const OPERATION: &str = "b2_authorize_account";

        let base = self
            .config
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE);
        let credentials = general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.config.key_id, self.config.application_key
        ));

        let response = self
            .http
            .get(format!("{base}/b2api/v2/{OPERATION}"))
            .header(AUTHORIZATION, format!("Basic {credentials}"))
            .send()
            .await
            .map_err(|err| request_error(OPERATION, err))?;
        let body: AuthorizeAccountResponse = decode_response(OPERATION, response).await?;

        info!(api_url = %body.api_url, "authorized B2 account");
        Ok(B2Session {
            api_url: body.api_url,
            download_url: body.download_url,
            authorization_token: body.authorization_token,
            obtained_at: Instant::now(),
        })
    }

    /// POST a JSON body to a B2 API operation with the account token.
    async fn call<Req, Resp>(&self, operation: &'static str, body: &Req) -> ProviderResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let session = self.session().await?;
        debug!(operation, "calling B2");

        let response = self
            .http
            .post(format!("{}/b2api/v2/{operation}", session.api_url))
            .header(AUTHORIZATION, &session.authorization_token)
            .json(body)
            .send()
            .await
            .map_err(|err| request_error(operation, err))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            // Drop the cached token so the next call re-authorizes.
            warn!(operation, "B2 rejected account token; clearing cached authorization");
            *self.session.write().await = None;
        }

        decode_response(operation, response).await
    }

    async fn upload_url(&self) -> ProviderResult<UploadCapability> {
        let target: UploadUrlResponse = self
            .call(
                "b2_get_upload_url",
                &BucketRequest {
                    bucket_id: &self.config.bucket_id,
                },
            )
            .await?;

        Ok(UploadCapability {
            chunk_index: 0,
            url: target.upload_url,
            method: HttpMethod::Post,
            auth_token: Some(target.authorization_token),
            multipart_id: None,
            part_number: None,
        })
    }

    async fn part_url(&self, file_id: &str, index: i64) -> ProviderResult<UploadCapability> {
        let target: UploadUrlResponse = self
            .call("b2_get_upload_part_url", &FileIdRequest { file_id })
            .await?;

        Ok(UploadCapability {
            chunk_index: index,
            url: target.upload_url,
            method: HttpMethod::Post,
            auth_token: Some(target.authorization_token),
            multipart_id: Some(file_id.to_string()),
            part_number: Some(part_number_for(index)),
        })
    }
}

#[async_trait]
impl StorageProvider for B2Provider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::B2
    }

    async fn issue_put_capabilities(
        &self,
        key: &str,
        chunk_count: i64,
    ) -> ProviderResult<Vec<UploadCapability>> {
        if chunk_count <= 1 {
            return Ok(vec![self.upload_url().await?]);
        }

        let started: StartLargeFileResponse = self
            .call(
                "b2_start_large_file",
                &StartLargeFileRequest {
                    bucket_id: &self.config.bucket_id,
                    file_name: key,
                    content_type: "b2/x-auto",
                },
            )
            .await?;
        info!(key, file_id = %started.file_id, chunk_count, "started B2 large file");

        let file_id = started.file_id.as_str();
        stream::iter(0..chunk_count)
            .map(|index| self.part_url(file_id, index))
            .buffered(PART_URL_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn reissue_put_capability(
        &self,
        _key: &str,
        chunk_count: i64,
        multipart_id: Option<&str>,
        index: i64,
    ) -> ProviderResult<UploadCapability> {
        if chunk_count <= 1 {
            return self.upload_url().await;
        }
        let file_id = multipart_id.ok_or(ProviderError::MissingMultipartId { index })?;
        self.part_url(file_id, index).await
    }

    async fn issue_get_capabilities(
        &self,
        key: &str,
        chunk_count: i64,
    ) -> ProviderResult<Vec<DownloadCapability>> {
        const OPERATION: &str = "b2_get_download_authorization";

        let session = self.session().await?;
        let grant: DownloadAuthorizationResponse = self
            .call(
                OPERATION,
                &DownloadAuthorizationRequest {
                    bucket_id: &self.config.bucket_id,
                    file_name_prefix: key,
                    valid_duration_in_seconds: self.config.url_expiry.as_secs(),
                },
            )
            .await?;

        let mut url = Url::parse(&format!(
            "{}/file/{}/{}",
            session.download_url, self.config.bucket_name, key
        ))
        .map_err(|err| ProviderError::InvalidResponse {
            provider: ProviderKind::B2,
            operation: OPERATION,
            message: err.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("Authorization", &grant.authorization_token);
        let url = url.to_string();

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
        let sha1s: Vec<&str> = parts.iter().map(|p| p.token.as_str()).collect();

        let _: serde_json::Value = self
            .call(
                "b2_finish_large_file",
                &FinishLargeFileRequest {
                    file_id: multipart_id,
                    part_sha1_array: sha1s,
                },
            )
            .await?;
        info!(key, file_id = multipart_id, parts = parts.len(), "finished B2 large file");
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> ProviderResult<()> {
        let listing: ListFileVersionsResponse = self
            .call(
                "b2_list_file_versions",
                &ListFileVersionsRequest {
                    bucket_id: &self.config.bucket_id,
                    start_file_name: key,
                    prefix: key,
                    max_file_count: DELETE_LIST_LIMIT,
                },
            )
            .await?;

        for file in listing.files.iter().filter(|f| f.file_name == key) {
            if file.action == "start" {
                let _: serde_json::Value = self
                    .call(
                        "b2_cancel_large_file",
                        &FileIdRequest {
                            file_id: &file.file_id,
                        },
                    )
                    .await?;
                debug!(key, file_id = %file.file_id, "cancelled unfinished B2 large file");
            } else {
                let _: serde_json::Value = self
                    .call(
                        "b2_delete_file_version",
                        &DeleteFileVersionRequest {
                            file_name: &file.file_name,
                            file_id: &file.file_id,
                        },
                    )
                    .await?;
                debug!(key, file_id = %file.file_id, "deleted B2 file version");
            }
        }
        Ok(())
    }
}

fn request_error(operation: &'static str, err: reqwest::Error) -> ProviderError {
    ProviderError::Request {
        provider: ProviderKind::B2,
        operation,
        message: err.to_string(),
    }
}

/// Turn a B2 response into `Resp`, surfacing B2's `{status, code, message}`
/// error body when the call failed.
async fn decode_response<Resp: DeserializeOwned>(
    operation: &'static str,
    response: reqwest::Response,
) -> ProviderResult<Resp> {
    let status = response.status();
    if !status.is_success() {
        let message = match response.json::<B2ErrorBody>().await {
            Ok(body) => format!("{status} {}: {}", body.code, body.message),
            Err(_) => status.to_string(),
        };
        return Err(ProviderError::Request {
            provider: ProviderKind::B2,
            operation,
            message,
        });
    }

    response
        .json::<Resp>()
        .await
        .map_err(|err| ProviderError::InvalidResponse {
            provider: ProviderKind::B2,
            operation,
            message: err.to_string(),
        })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    api_url: String,
    download_url: String,
    authorization_token: String,
}

#[derive(Deserialize)]
struct B2ErrorBody {
    code: String,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketRequest<'a> {
    bucket_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileIdRequest<'a> {
    file_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlResponse {
    upload_url: String,
    authorization_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileRequest<'a> {
    bucket_id: &'a str,
    file_name: &'a str,
    content_type: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileResponse {
    file_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileRequest<'a> {
    file_id: &'a str,
    part_sha1_array: Vec<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadAuthorizationRequest<'a> {
    bucket_id: &'a str,
    file_name_prefix: &'a str,
    valid_duration_in_seconds: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadAuthorizationResponse {
    authorization_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListFileVersionsRequest<'a> {
    bucket_id: &'a str,
    start_file_name: &'a str,
    prefix: &'a str,
    max_file_count: u32,
}

#[derive(Deserialize)]
struct ListFileVersionsResponse {
    files: Vec<FileVersion>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileVersion {
    file_id: String,
    file_name: String,
    action: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteFileVersionRequest<'a> {
    file_name: &'a str,
    file_id: &'a str,
}
