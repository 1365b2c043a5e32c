//! Drive v3 REST transport.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use storekeep_common::{AccessToken, Error, Result};

use crate::deadline::{with_deadline, DEFAULT_REQUEST_TIMEOUT};
use crate::snapshot::{DriveFiles, FileQuery, MultipartBody, FOLDER_MIME};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime,parents,trashed";
const LIST_FIELDS: &str = "files(id,name,mimeType,modifiedTime,parents,trashed),nextPageToken";

/// File or folder resource as returned by `files.list` and `files.get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// [`DriveFiles`] over the Drive REST API.
///
/// Every request is bounded by the configured timeout and fails with
/// [`Error::Timeout`] when it is exceeded.
pub struct DriveClient {
    http: Client,
    timeout: Duration,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("Storekeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            timeout,
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: DRIVE_UPLOAD_BASE.to_string(),
        })
    }

    /// Create a client with the default request timeout.
    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Point the client at another endpoint (e.g. a local emulator).
    pub fn with_base_urls(mut self, api_base: impl Into<String>, upload_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.upload_base = upload_base.into();
        self
    }

    async fn list_page(
        &self,
        token: &AccessToken,
        q: &str,
        page_token: Option<&str>,
    ) -> Result<ListPage> {
        let url = format!("{}/files", self.api_base);

        let mut request = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, token.bearer())
            .query(&[("q", q), ("fields", LIST_FIELDS), ("pageSize", "100")]);

        if let Some(page) = page_token {
            request = request.query(&[("pageToken", page)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to list files: {}", e)))?;

        handle_response(response).await
    }

    async fn upload(
        &self,
        request: reqwest::RequestBuilder,
        token: &AccessToken,
        body: MultipartBody,
    ) -> Result<DriveFile> {
        let response = request
            .header(header::AUTHORIZATION, token.bearer())
            .header(header::CONTENT_TYPE, body.content_type())
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .body(body.encode())
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload file: {}", e)))?;

        handle_response(response).await
    }
}

#[async_trait]
impl DriveFiles for DriveClient {
    async fn list(&self, token: &AccessToken, query: &FileQuery) -> Result<Vec<DriveFile>> {
        let q = query.to_query_string();
        with_deadline(self.timeout, "list files", async {
            let mut all_files = Vec::new();
            let mut page_token: Option<String> = None;

            loop {
                let page = self.list_page(token, &q, page_token.as_deref()).await?;
                all_files.extend(page.files);

                match page.next_page_token {
                    Some(next) => page_token = Some(next),
                    None => break,
                }
            }

            Ok(all_files)
        })
        .await
    }

    async fn create_folder(&self, token: &AccessToken, name: &str) -> Result<DriveFile> {
        let url = format!("{}/files", self.api_base);
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME,
        });

        with_deadline(self.timeout, "create folder", async {
            let response = self
                .http
                .post(&url)
                .header(header::AUTHORIZATION, token.bearer())
                .query(&[("fields", FILE_FIELDS)])
                .json(&metadata)
                .send()
                .await
                .map_err(|e| Error::Network(format!("Failed to create folder: {}", e)))?;

            handle_response(response).await
        })
        .await
    }

    async fn create_file(&self, token: &AccessToken, body: MultipartBody) -> Result<DriveFile> {
        let url = format!("{}/files", self.upload_base);
        let request = self.http.post(&url);
        with_deadline(self.timeout, "create file", self.upload(request, token, body)).await
    }

    async fn update_file(
        &self,
        token: &AccessToken,
        file_id: &str,
        body: MultipartBody,
    ) -> Result<DriveFile> {
        let url = format!("{}/files/{}", self.upload_base, file_id);
        let request = self.http.patch(&url);
        with_deadline(self.timeout, "update file", self.upload(request, token, body)).await
    }

    async fn download(&self, token: &AccessToken, file_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/files/{}", self.api_base, file_id);

        with_deadline(self.timeout, "download file", async {
            let response = self
                .http
                .get(&url)
                .header(header::AUTHORIZATION, token.bearer())
                .query(&[("alt", "media")])
                .send()
                .await
                .map_err(|e| Error::Network(format!("Failed to download file: {}", e)))?;

            let response = check_status(response).await?;
            response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| Error::Network(format!("Failed to read download response: {}", e)))
        })
        .await
    }
}

/// Map error statuses to the error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(Error::NotFound(response.url().path().to_string())),
        StatusCode::UNAUTHORIZED => Err(Error::Authentication(
            "Drive rejected the access token".to_string(),
        )),
        status => Err(Error::RemoteRejected {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        }),
    }
}

async fn handle_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    check_status(response)
        .await?
        .json()
        .await
        .map_err(|e| Error::Network(format!("Unexpected Drive response: {}", e)))
}
