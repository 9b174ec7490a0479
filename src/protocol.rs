// src/protocol.rs
//
// Client for the external multipart-upload operations.
//
// The admin service exposes one JSON endpoint driving the S3-compatible
// multipart lifecycle (create / signPart / complete / abort) plus a
// single-PUT signing endpoint for small files. Both transport-level
// failures and application errors (non-2xx with an `error` body field) are
// surfaced verbatim; the engine treats them uniformly as task failures.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};

use crate::transfer::shared_client;

/// One confirmed part in a completion request. The list sent to
/// `complete_multipart_upload` must be ascending and contiguous from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// The abstract multipart protocol the engine drives. Implemented over HTTP
/// by [`HttpMultipartClient`]; tests substitute their own.
#[async_trait]
pub trait MultipartProtocol: Send + Sync {
    /// Open a multipart upload session, returning its upload id.
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String>;

    /// Obtain a time-limited direct-upload URL for one part.
    async fn sign_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> Result<String>;

    /// Assemble the object from its parts. `parts` must be sorted ascending
    /// by part number and cover every part exactly once.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    /// Release the upload session and any partial data on the remote side.
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
    -> Result<()>;

    /// Obtain a direct-upload URL for a whole-file PUT (below-threshold path).
    async fn sign_single_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String>;
}

/// HTTP implementation posting JSON to `<base>/api/multipart` (actions
/// create / signPart / complete / abort) and `<base>/api/files` (single-PUT
/// signing).
#[derive(Debug, Clone)]
pub struct HttpMultipartClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMultipartClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: shared_client().clone(),
        }
    }

    /// Use a preconfigured client (extra default headers, timeouts, ...).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// POST a JSON body and return (status, parsed body). An undecodable
    /// response body is an empty object, so callers uniformly inspect the
    /// status and the `error` field.
    async fn post_json(&self, path: &str, what: &str, body: Value) -> Result<(StatusCode, Value)> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to fetch (POST {} {})", path, what))?;
        let status = response.status();
        let data = response.json::<Value>().await.unwrap_or_else(|_| json!({}));
        Ok((status, data))
    }
}

/// The `error` field of an application-error body, or the fallback.
fn error_message(data: &Value, fallback: String) -> String {
    data.get("error")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or(fallback)
}

#[async_trait]
impl MultipartProtocol for HttpMultipartClient {
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String> {
        let (status, data) = self
            .post_json(
                "/api/multipart",
                "create",
                json!({ "action": "create", "bucket": bucket, "key": key, "contentType": content_type }),
            )
            .await?;
        let upload_id = data.get("uploadId").and_then(|v| v.as_str());
        match upload_id {
            Some(id) if status.is_success() && !id.is_empty() => Ok(id.to_string()),
            _ => bail!(error_message(
                &data,
                format!("create multipart failed (/api/multipart {})", status.as_u16()),
            )),
        }
    }

    async fn sign_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> Result<String> {
        let (status, data) = self
            .post_json(
                "/api/multipart",
                "signPart",
                json!({
                    "action": "signPart",
                    "bucket": bucket,
                    "key": key,
                    "uploadId": upload_id,
                    "partNumber": part_number,
                }),
            )
            .await?;
        let url = data.get("url").and_then(|v| v.as_str());
        match url {
            Some(url) if status.is_success() && !url.is_empty() => Ok(url.to_string()),
            _ => bail!(error_message(
                &data,
                format!("sign part failed (/api/multipart {})", status.as_u16()),
            )),
        }
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let (status, data) = self
            .post_json(
                "/api/multipart",
                "complete",
                json!({
                    "action": "complete",
                    "bucket": bucket,
                    "key": key,
                    "uploadId": upload_id,
                    "parts": parts,
                }),
            )
            .await?;
        if !status.is_success() {
            bail!(error_message(
                &data,
                format!("complete failed (/api/multipart {})", status.as_u16()),
            ));
        }
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        let (status, data) = self
            .post_json(
                "/api/multipart",
                "abort",
                json!({ "action": "abort", "bucket": bucket, "key": key, "uploadId": upload_id }),
            )
            .await?;
        if !status.is_success() {
            bail!(error_message(
                &data,
                format!("abort failed (/api/multipart {})", status.as_u16()),
            ));
        }
        Ok(())
    }

    async fn sign_single_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String> {
        let (status, data) = self
            .post_json(
                "/api/files",
                "sign",
                json!({ "bucket": bucket, "key": key, "contentType": content_type }),
            )
            .await?;
        let url = data.get("url").and_then(|v| v.as_str());
        match url {
            Some(url) if status.is_success() && !url.is_empty() => Ok(url.to_string()),
            _ => bail!(error_message(
                &data,
                format!("sign failed (/api/files {})", status.as_u16()),
            )),
        }
    }
}
