use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::checksum::{CHECKSUM_HEADER, compute_checksum};
use crate::error::{Result, TransferClientError};
use crate::http_client::{RetryConfig, build_http_client, check_response};
use crate::interface::{ByteStream, ObjectStore};
use crate::types::{CompletedPart, Credentials, MultipartSession, ObjectHead, ObjectLocator, PartInfo};

const ACCESS_KEY_HEADER: &str = "x-access-key-id";
const SESSION_TOKEN_HEADER: &str = "x-session-token";
const COPY_SOURCE_HEADER: &str = "x-copy-source";
const COPY_SOURCE_RANGE_HEADER: &str = "x-copy-source-range";
const COPY_SOURCE_ACCESS_KEY_HEADER: &str = "x-copy-source-access-key-id";
const COPY_SOURCE_TOKEN_HEADER: &str = "x-copy-source-session-token";

#[derive(Deserialize)]
struct SessionResponse {
    upload_id: String,
    #[serde(default)]
    initiated: u64,
}

#[derive(Deserialize)]
struct SessionListResponse {
    #[serde(default)]
    sessions: Vec<SessionResponse>,
}

#[derive(Deserialize)]
struct PartListResponse {
    #[serde(default)]
    parts: Vec<PartInfo>,
}

/// Object store spoken to over plain HTTP: objects live at `<endpoint>/<bucket>/<key>` and
/// multipart sessions are addressed with `uploads`, `uploadId` and `partNumber` query
/// parameters.
pub struct HttpObjectStore {
    client: ClientWithMiddleware,
    endpoint: Url,
    retry_config: RetryConfig,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str, retry_config: RetryConfig) -> Result<Arc<Self>> {
        let endpoint = Url::parse(endpoint)?;
        if endpoint.cannot_be_a_base() {
            return Err(TransferClientError::ConfigurationError(format!("{endpoint} cannot be used as an endpoint")));
        }
        info!(%endpoint, "object store client");
        Ok(Arc::new(Self {
            client: build_http_client(&retry_config)?,
            endpoint,
            retry_config,
        }))
    }

    fn object_url(&self, locator: &ObjectLocator) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| TransferClientError::ConfigurationError(format!("{} cannot be a base url", self.endpoint)))?
            .pop_if_empty()
            .push(&locator.bucket)
            .extend(locator.key.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    fn session_url(&self, session: &MultipartSession, part_number: Option<u32>) -> Result<Url> {
        let mut url = self.object_url(&session.locator)?;
        {
            let mut q = url.query_pairs_mut();
            if let Some(n) = part_number {
                q.append_pair("partNumber", &n.to_string());
            }
            q.append_pair("uploadId", &session.upload_id);
        }
        Ok(url)
    }

    fn with_credentials(&self, builder: RequestBuilder, creds: &Credentials) -> RequestBuilder {
        builder
            .header(ACCESS_KEY_HEADER, &creds.access_key_id)
            .header(SESSION_TOKEN_HEADER, &creds.session_token)
    }

    /// Bounded timeout for requests that don't stream a large body back.
    fn bounded(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.timeout(self.retry_config.request_timeout)
    }

    fn with_copy_source(builder: RequestBuilder, source: &ObjectLocator, source_creds: &Credentials) -> RequestBuilder {
        builder
            .header(COPY_SOURCE_HEADER, format!("{}/{}", source.bucket, source.key))
            .header(COPY_SOURCE_ACCESS_KEY_HEADER, &source_creds.access_key_id)
            .header(COPY_SOURCE_TOKEN_HEADER, &source_creds.session_token)
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(&self, builder: RequestBuilder, context: &str) -> Result<T> {
        let response = check_response(builder.send().await?, context).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| TransferClientError::InvalidResponse(format!("{context}: {e}")))
    }
}

fn header_u64(response: &reqwest::Response, name: http::header::HeaderName) -> Option<u64> {
    response.headers().get(name)?.to_str().ok()?.parse().ok()
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    Some(response.headers().get(name)?.to_str().ok()?.to_owned())
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn head_object(&self, locator: &ObjectLocator, creds: &Credentials) -> Result<ObjectHead> {
        let url = self.object_url(locator)?;
        let context = format!("HEAD {locator}");
        let request = self.bounded(self.with_credentials(self.client.head(url), creds));
        let response = check_response(request.send().await?, &context).await?;
        let size = header_u64(&response, CONTENT_LENGTH)
            .ok_or_else(|| TransferClientError::InvalidResponse(format!("{context}: missing content-length")))?;
        Ok(ObjectHead {
            size,
            checksum: header_string(&response, CHECKSUM_HEADER),
        })
    }

    async fn get_object(&self, locator: &ObjectLocator, creds: &Credentials, offset: u64) -> Result<ByteStream> {
        let url = self.object_url(locator)?;
        let context = format!("GET {locator} from byte {offset}");
        let mut request = self.with_credentials(self.client.get(url), creds);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        debug!(%locator, offset, "starting ranged download");
        let response = check_response(request.send().await?, &context).await?;
        if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(TransferClientError::InvalidResponse(format!("{context}: range request not honored")));
        }
        Ok(response.bytes_stream().map(|r| r.map_err(TransferClientError::from)).boxed())
    }

    async fn put_object(&self, locator: &ObjectLocator, creds: &Credentials, data: Bytes) -> Result<String> {
        let url = self.object_url(locator)?;
        let context = format!("PUT {locator}");
        let local_checksum = compute_checksum(&data);
        let request = self.bounded(
            self.with_credentials(self.client.put(url), creds)
                .header(CHECKSUM_HEADER, &local_checksum)
                .body(data),
        );
        let response = check_response(request.send().await?, &context).await?;
        Ok(header_string(&response, CHECKSUM_HEADER).unwrap_or(local_checksum))
    }

    async fn copy_object(
        &self,
        source: &ObjectLocator,
        source_creds: &Credentials,
        destination: &ObjectLocator,
        creds: &Credentials,
    ) -> Result<ObjectHead> {
        let url = self.object_url(destination)?;
        let request = Self::with_copy_source(self.with_credentials(self.client.put(url), creds), source, source_creds);
        self.send_json(self.bounded(request), &format!("COPY {source} -> {destination}")).await
    }

    async fn create_multipart_session(&self, locator: &ObjectLocator, creds: &Credentials) -> Result<MultipartSession> {
        let mut url = self.object_url(locator)?;
        url.query_pairs_mut().append_key_only("uploads");
        let request = self.bounded(self.with_credentials(self.client.post(url), creds));
        let r: SessionResponse = self.send_json(request, &format!("CREATE SESSION {locator}")).await?;
        Ok(MultipartSession {
            upload_id: r.upload_id,
            locator: locator.clone(),
            initiated: r.initiated,
        })
    }

    async fn list_multipart_sessions(
        &self,
        locator: &ObjectLocator,
        creds: &Credentials,
    ) -> Result<Vec<MultipartSession>> {
        let mut url = self.object_url(locator)?;
        url.query_pairs_mut().append_key_only("uploads");
        let request = self.bounded(self.with_credentials(self.client.get(url), creds));
        let r: SessionListResponse = self.send_json(request, &format!("LIST SESSIONS {locator}")).await?;
        let mut sessions: Vec<_> = r
            .sessions
            .into_iter()
            .map(|s| MultipartSession {
                upload_id: s.upload_id,
                locator: locator.clone(),
                initiated: s.initiated,
            })
            .collect();
        sessions.sort_by_key(|s| s.initiated);
        Ok(sessions)
    }

    async fn list_parts(&self, session: &MultipartSession, creds: &Credentials) -> Result<Vec<PartInfo>> {
        let url = self.session_url(session, None)?;
        let request = self.bounded(self.with_credentials(self.client.get(url), creds));
        let mut r: PartListResponse = self
            .send_json(request, &format!("LIST PARTS {} ({})", session.locator, session.upload_id))
            .await?;
        r.parts.sort_by_key(|p| p.part_number);
        Ok(r.parts)
    }

    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        data: Bytes,
        creds: &Credentials,
    ) -> Result<PartInfo> {
        let url = self.session_url(session, Some(part_number))?;
        let request = self.bounded(
            self.with_credentials(self.client.put(url), creds)
                .header(CHECKSUM_HEADER, compute_checksum(&data))
                .body(data),
        );
        self.send_json(request, &format!("UPLOAD PART {part_number} of {}", session.locator))
            .await
    }

    async fn upload_part_copy(
        &self,
        session: &MultipartSession,
        part_number: u32,
        source: &ObjectLocator,
        source_creds: &Credentials,
        range: Range<u64>,
        creds: &Credentials,
    ) -> Result<PartInfo> {
        if range.is_empty() {
            return Err(TransferClientError::Other(format!("empty copy range for part {part_number}")));
        }
        let url = self.session_url(session, Some(part_number))?;
        let request = Self::with_copy_source(self.with_credentials(self.client.put(url), creds), source, source_creds)
            .header(COPY_SOURCE_RANGE_HEADER, format!("bytes={}-{}", range.start, range.end - 1));
        self.send_json(self.bounded(request), &format!("COPY PART {part_number} of {}", session.locator))
            .await
    }

    async fn complete_multipart_session(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPart],
        creds: &Credentials,
    ) -> Result<ObjectHead> {
        let url = self.session_url(session, None)?;
        let body = serde_json::to_vec(&serde_json::json!({ "parts": parts }))?;
        let request = self.bounded(
            self.with_credentials(self.client.post(url), creds)
                .header(CONTENT_TYPE, "application/json")
                .body(body),
        );
        self.send_json(request, &format!("COMPLETE {} ({})", session.locator, session.upload_id))
            .await
    }

    async fn abort_multipart_session(&self, session: &MultipartSession, creds: &Credentials) -> Result<()> {
        let url = self.session_url(session, None)?;
        let request = self.bounded(self.with_credentials(self.client.delete(url), creds));
        check_response(request.send().await?, &format!("ABORT {} ({})", session.locator, session.upload_id)).await?;
        Ok(())
    }
}
