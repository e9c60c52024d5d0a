use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

use crate::constants::METADATA_PAGE_SIZE;
use crate::error::{Result, TransferClientError};
use crate::http_client::{RetryConfig, build_http_client, check_response};
use crate::interface::MetadataService;
use crate::types::{Credentials, FileSelection, ListingPage, TransferDirection};

#[derive(Serialize)]
struct ListFilesRequest<'a> {
    selection: &'a FileSelection,
    page_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<String>,
}

#[derive(Serialize)]
struct CredentialsRequest<'a> {
    file_ids: &'a [String],
    direction: TransferDirection,
}

#[derive(Deserialize)]
struct CredentialsResponse {
    #[serde(default)]
    credentials: HashMap<String, Credentials>,
}

/// REST client for the metadata service: `POST <endpoint>/files/query` pages through a
/// listing and `POST <endpoint>/credentials` issues scoped credentials.
pub struct HttpMetadataService {
    client: ClientWithMiddleware,
    endpoint: Url,
    api_token: Option<String>,
    retry_config: RetryConfig,
}

impl HttpMetadataService {
    pub fn new(endpoint: &str, api_token: Option<String>, retry_config: RetryConfig) -> Result<Arc<Self>> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        info!(%endpoint, authenticated = api_token.is_some(), "metadata service client");
        Ok(Arc::new(Self {
            client: build_http_client(&retry_config)?,
            endpoint,
            api_token,
            retry_config,
        }))
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.endpoint.join(path)?;
        let context = format!("POST {url}");
        let mut request = self
            .client
            .post(url)
            .timeout(self.retry_config.request_timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(body)?);
        if let Some(token) = &self.api_token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = check_response(request.send().await?, &context).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| TransferClientError::InvalidResponse(format!("{context}: {e}")))
    }
}

#[async_trait]
impl MetadataService for HttpMetadataService {
    #[instrument(skip_all, fields(mode = selection.mode()))]
    async fn list_files(&self, selection: &FileSelection, page_token: Option<String>) -> Result<ListingPage> {
        let page: ListingPage = self
            .post_json(
                "files/query",
                &ListFilesRequest {
                    selection,
                    page_size: *METADATA_PAGE_SIZE,
                    page_token,
                },
            )
            .await?;
        debug!(n_files = page.files.len(), more = page.next_page.is_some(), "listing page");
        Ok(page)
    }

    #[instrument(skip_all, fields(n_ids = file_ids.len(), %direction))]
    async fn issue_credentials(
        &self,
        file_ids: &[String],
        direction: TransferDirection,
    ) -> Result<HashMap<String, Credentials>> {
        let response: CredentialsResponse = self
            .post_json("credentials", &CredentialsRequest { file_ids, direction })
            .await?;
        debug!(n_issued = response.credentials.len(), "credentials issued");
        Ok(response.credentials)
    }
}
