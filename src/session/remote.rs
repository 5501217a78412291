//! Remote object storage for credential blobs.
//!
//! Two backends: an HTTP client for Supabase-style storage buckets and a
//! plain directory tree for local development and offline runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::bundle::{is_valid_blob_name, list_blob_names, write_blob};

/// Object store seam. Every operation is idempotent under retry.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Blob names stored under `namespace`.
    async fn list(&self, namespace: &str) -> Result<Vec<String>>;

    /// Blob content, or `None` when the blob does not exist.
    async fn download(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>>;

    /// Store a blob, overwriting any existing content.
    async fn upload(&self, namespace: &str, name: &str, content: Vec<u8>) -> Result<()>;

    /// Remove the named blobs. Missing names are not an error.
    async fn delete(&self, namespace: &str, names: &[String]) -> Result<()>;
}

const LIST_PAGE_SIZE: usize = 1000;
const STORAGE_TIMEOUT_SECS: u64 = 30;

/// Supabase Storage REST backend.
pub struct SupabaseStore {
    base_url: Url,
    api_key: String,
    bucket: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ListRequest<'a> {
    prefix: &'a str,
    limit: usize,
    offset: usize,
    #[serde(rename = "sortBy")]
    sort_by: SortBy,
}

#[derive(Serialize)]
struct SortBy {
    column: &'static str,
    order: &'static str,
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
    /// Folders come back without an id.
    #[serde(default)]
    id: Option<String>,
}

#[derive(Serialize)]
struct DeleteRequest {
    prefixes: Vec<String>,
}

impl SupabaseStore {
    pub fn new(base_url: &str, api_key: &str, bucket: &str) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("Invalid storage URL `{base_url}`"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(STORAGE_TIMEOUT_SECS))
            .build()
            .context("Failed to build storage HTTP client")?;
        Ok(Self {
            base_url,
            api_key: api_key.to_string(),
            bucket: bucket.to_string(),
            client,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("Storage URL cannot be a base"))?
            .pop_if_empty()
            .extend(["storage", "v1", "object"])
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
    }
}

#[async_trait]
impl RemoteStore for SupabaseStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>> {
        let url = self.endpoint(&["list", &self.bucket])?;
        let mut names = Vec::new();
        let mut offset = 0;

        loop {
            let body = ListRequest {
                prefix: namespace,
                limit: LIST_PAGE_SIZE,
                offset,
                sort_by: SortBy {
                    column: "name",
                    order: "asc",
                },
            };
            let response = self
                .authorized(self.client.post(url.clone()))
                .json(&body)
                .send()
                .await
                .context("Storage list request failed")?;
            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                anyhow::bail!("Storage list returned {status}: {detail}");
            }

            let page: Vec<ListEntry> = response
                .json()
                .await
                .context("Storage list returned invalid JSON")?;
            let page_len = page.len();
            names.extend(
                page.into_iter()
                    .filter(|entry| entry.id.is_some())
                    .map(|entry| entry.name),
            );

            if page_len < LIST_PAGE_SIZE {
                break;
            }
            offset += page_len;
        }

        Ok(names)
    }

    async fn download(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let url = self.endpoint(&[&self.bucket, namespace, name])?;
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .with_context(|| format!("Storage download of {name} failed"))?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            // Storage reports missing objects as 400 with a not_found body.
            if status == StatusCode::BAD_REQUEST && detail.contains("not_found") {
                return Ok(None);
            }
            anyhow::bail!("Storage download of {name} returned {status}: {detail}");
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Storage download of {name} was interrupted"))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn upload(&self, namespace: &str, name: &str, content: Vec<u8>) -> Result<()> {
        let url = self.endpoint(&[&self.bucket, namespace, name])?;
        let response = self
            .authorized(self.client.post(url))
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content)
            .send()
            .await
            .with_context(|| format!("Storage upload of {name} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("Storage upload of {name} returned {status}: {detail}");
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(&[&self.bucket])?;
        let body = DeleteRequest {
            prefixes: names
                .iter()
                .map(|name| format!("{namespace}/{name}"))
                .collect(),
        };
        let response = self
            .authorized(self.client.delete(url))
            .json(&body)
            .send()
            .await
            .context("Storage delete request failed")?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("Storage delete returned {status}: {detail}");
        }
        Ok(())
    }
}

/// Directory-tree backend: `<root>/<namespace>/<blob>`.
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf> {
        if !is_valid_blob_name(namespace) {
            anyhow::bail!("Invalid namespace `{namespace}`");
        }
        Ok(self.root.join(namespace))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RemoteStore for FilesystemStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>> {
        list_blob_names(&self.namespace_dir(namespace)?).await
    }

    async fn download(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>> {
        if !is_valid_blob_name(name) {
            anyhow::bail!("Invalid blob name `{name}`");
        }
        match tokio::fs::read(self.namespace_dir(namespace)?.join(name)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {name}")),
        }
    }

    async fn upload(&self, namespace: &str, name: &str, content: Vec<u8>) -> Result<()> {
        write_blob(&self.namespace_dir(namespace)?, name, &content).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, names: &[String]) -> Result<()> {
        let dir = self.namespace_dir(namespace)?;
        for name in names {
            if !is_valid_blob_name(name) {
                continue;
            }
            match tokio::fs::remove_file(dir.join(name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to delete {name}")),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn filesystem_store_round_trip_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(tmp.path());

        assert!(store.list("client-a").await.unwrap().is_empty());
        store
            .upload("client-a", "creds.json", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(store.list("client-a").await.unwrap(), vec!["creds.json"]);
        assert_eq!(
            store.download("client-a", "creds.json").await.unwrap(),
            Some(b"{}".to_vec())
        );

        store
            .delete("client-a", &["creds.json".into(), "absent.json".into()])
            .await
            .unwrap();
        assert_eq!(store.download("client-a", "creds.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn supabase_list_skips_folders() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/list/sessions"))
            .and(header("apikey", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "creds.json", "id": "1"},
                {"name": "nested", "id": null},
                {"name": "pre-key-1.json", "id": "2"}
            ])))
            .mount(&server)
            .await;

        let store = SupabaseStore::new(&server.uri(), "secret", "sessions").unwrap();
        let names = store.list("client-a").await.unwrap();
        assert_eq!(names, vec!["creds.json", "pre-key-1.json"]);
    }

    #[tokio::test]
    async fn supabase_download_maps_not_found_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/object/sessions/client-a/creds.json"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"statusCode":"404","error":"not_found"}"#),
            )
            .mount(&server)
            .await;

        let store = SupabaseStore::new(&server.uri(), "secret", "sessions").unwrap();
        assert_eq!(store.download("client-a", "creds.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn supabase_upload_sends_upsert_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/sessions/client-a/creds.json"))
            .and(header("x-upsert", "true"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = SupabaseStore::new(&server.uri(), "secret", "sessions").unwrap();
        store
            .upload("client-a", "creds.json", b"{}".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn supabase_upload_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = SupabaseStore::new(&server.uri(), "secret", "sessions").unwrap();
        let err = store
            .upload("client-a", "creds.json", b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn supabase_delete_prefixes_namespace() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/object/sessions"))
            .and(body_json(serde_json::json!({
                "prefixes": ["client-a/creds.json"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let store = SupabaseStore::new(&server.uri(), "secret", "sessions").unwrap();
        store
            .delete("client-a", &["creds.json".to_string()])
            .await
            .unwrap();
    }
}
