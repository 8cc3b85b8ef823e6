//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN. INT. SERVER ROOM. 3:47 AM.
//! A connector wants to sync. The scheduler wants to know who is due. The job runner wants
//! to write ten thousand documents. All of them want the same cluster, and the cluster
//! wants everyone to use `Content-Type: application/x-ndjson`. Nobody is happy. 🦆
//!
//! This module speaks plain HTTP to Elasticsearch through `reqwest`:
//! - `_bulk` for content writes (optionally gzip'd, because bytes are squishy)
//! - `_doc` / `_update` / `_search` on the connectors and jobs indices
//! - `_pit` + `search_after` to list every id in a content index
//!
//! ⚠️ No retries here. A failed call is an `Err` and the caller decides what that means.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use super::{BulkResponse, BulkWriter, ConnectorStore};
use crate::connector_settings::ConnectorSettings;
use crate::sync_job::SyncJob;

const SEARCH_PAGE_SIZE: usize = 100;
const ID_PAGE_SIZE: usize = 1000;
const PIT_KEEP_ALIVE: &str = "1m";

/// 📡 Where the cluster lives and how to get past the bouncer.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ElasticsearchConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// 🔒 "password123" is not a password. It is a confession.
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key wins over basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
    /// 🫁 gzip the `_bulk` bodies
    #[serde(default)]
    pub compress_requests: bool,
    #[serde(default = "default_connectors_index")]
    pub connectors_index: String,
    #[serde(default = "default_jobs_index")]
    pub jobs_index: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_connectors_index() -> String {
    ".elastic-connectors".to_string()
}

fn default_jobs_index() -> String {
    ".elastic-connectors-sync-jobs".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

// bulk requests can be meaty and we're not monsters
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: None,
            password: None,
            api_key: None,
            compress_requests: false,
            connectors_index: default_connectors_index(),
            jobs_index: default_jobs_index(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    found: bool,
    #[serde(rename = "_seq_no", default)]
    seq_no: Option<u64>,
    #[serde(rename = "_primary_term", default)]
    primary_term: Option<u64>,
    #[serde(rename = "_source", default)]
    source: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    pit_id: Option<String>,
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_seq_no", default)]
    seq_no: Option<u64>,
    #[serde(rename = "_primary_term", default)]
    primary_term: Option<u64>,
    #[serde(rename = "_source", default)]
    source: Option<Value>,
    #[serde(default)]
    sort: Option<Value>,
}

/// 📡 One HTTP client, reused across every call, cloned cheaply into every task.
#[derive(Debug, Clone)]
pub struct ElasticsearchStore {
    client: reqwest::Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchStore {
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("💀 The HTTP client refused to be born. We tried to build a reqwest::Client and the TLS stack said 'no'. Probably a cursed certificate store. Either way: tragic.")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ElasticsearchConfig {
        &self.config
    }

    /// 📡 "Hello? Is this thing on?" Fails loudly now instead of quietly 50,000 docs later.
    pub async fn ping(&self) -> Result<()> {
        let (status, body) = self.send_json(Method::GET, "", None).await
            .context("💀 Reached out to the cluster root and got ghosted. Check the url, check the network, check that Elasticsearch is actually running.")?;
        if !status.is_success() {
            anyhow::bail!(
                "💀 The cluster answered the ping with '{}'. Body: '{}'. Usually this is auth.",
                status,
                body
            );
        }
        debug!("✅ Elasticsearch at {} is home and accepting visitors", self.config.url);
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let request = self.client.request(method, url);
        // 🔒 api_key beats basic auth in this club
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {}", api_key))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    async fn send_json(&self, method: Method, path: &str, body: Option<&Value>) -> Result<(StatusCode, String)> {
        let mut request = self.request(method.clone(), path);
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_string(body)?);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("💀 {} /{} never made it to Elasticsearch", method, path))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("💀 {} /{} answered, but the body got lost on the way home", method, path))?;
        trace!("📡 {} /{} -> {}", method, path, status);
        Ok((status, text))
    }

    fn parse_success(status: StatusCode, body: &str, what: &str) -> Result<Value> {
        if !status.is_success() {
            anyhow::bail!(
                "💀 Elasticsearch said '{}' while we tried to {}. The body of the response read: '{}'",
                status,
                what,
                body
            );
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(body).with_context(|| format!("💀 Could not parse the response to {what}"))
    }

    async fn search_all(&self, index: &str, query: Value) -> Result<Vec<SearchHit>> {
        self.scan(index, query, true, SEARCH_PAGE_SIZE).await
    }

    /// 🔍 Every hit of `query`, read through a point in time so `from + size` never hits
    /// the result window. A missing index has no hits.
    async fn scan(&self, index: &str, query: Value, with_source: bool, page_size: usize) -> Result<Vec<SearchHit>> {
        let (status, text) = self
            .send_json(Method::POST, &format!("{index}/_pit?keep_alive={PIT_KEEP_ALIVE}"), None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            debug!("🔍 Index '{}' doesn't exist yet, so it has nothing to say", index);
            return Ok(Vec::new());
        }
        let opened = Self::parse_success(status, &text, &format!("open a point in time on '{index}'"))?;
        let mut pit_id = opened
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("💀 Elasticsearch opened a point in time without an id")?;

        let mut hits = Vec::new();
        let page = Page {
            query: &query,
            with_source,
            size: page_size,
        };
        let outcome = self.page_through(&mut pit_id, &page, &mut hits).await;

        if let Err(err) = self.send_json(Method::DELETE, "_pit", Some(&json!({"id": pit_id}))).await {
            warn!("⚠️ Could not close point in time on '{}': {}", index, err);
        }
        outcome.with_context(|| format!("💀 Couldn't page through '{index}'"))?;
        Ok(hits)
    }

    async fn get_doc(&self, index: &str, id: &str) -> Result<Option<GetResponse>> {
        let (status, text) = self.send_json(Method::GET, &format!("{index}/_doc/{id}"), None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: GetResponse = serde_json::from_value(Self::parse_success(status, &text, "fetch a document")?)?;
        Ok(doc.found.then_some(doc))
    }

    async fn partial_update(&self, index: &str, id: &str, doc: Value, condition: Option<(u64, u64)>) -> Result<bool> {
        let path = match condition {
            Some((seq_no, primary_term)) => {
                format!("{index}/_update/{id}?if_seq_no={seq_no}&if_primary_term={primary_term}&refresh=true")
            }
            None => format!("{index}/_update/{id}?refresh=true"),
        };
        let (status, text) = self.send_json(Method::POST, &path, Some(&json!({ "doc": doc }))).await?;
        if status == StatusCode::CONFLICT {
            return Ok(false);
        }
        Self::parse_success(status, &text, &format!("update '{id}' in '{index}'"))?;
        Ok(true)
    }

    /// 📜 Walk a point in time page by page. `pit_id` is kept current so the caller can close it.
    async fn page_through(&self, pit_id: &mut String, page: &Page<'_>, hits: &mut Vec<SearchHit>) -> Result<()> {
        let mut search_after: Option<Value> = None;
        loop {
            let mut body = json!({
                "query": page.query,
                "size": page.size,
                "_source": page.with_source,
                "seq_no_primary_term": page.with_source,
                "pit": {"id": pit_id, "keep_alive": PIT_KEEP_ALIVE},
                "sort": [{"_shard_doc": "asc"}],
            });
            if let Some(after) = &search_after {
                body["search_after"] = after.clone();
            }
            let (status, text) = self.send_json(Method::POST, "_search", Some(&body)).await?;
            let response: SearchResponse = serde_json::from_value(Self::parse_success(status, &text, "search")?)
                .context("💀 Search results came back in a shape we don't recognize")?;
            if let Some(next_pit) = response.pit_id {
                *pit_id = next_pit;
            }
            let page_len = response.hits.hits.len();
            search_after = response.hits.hits.last().and_then(|hit| hit.sort.clone());
            hits.extend(response.hits.hits);
            if page_len < page.size || search_after.is_none() {
                return Ok(());
            }
        }
    }
}

struct Page<'a> {
    query: &'a Value,
    with_source: bool,
    size: usize,
}

fn gzip(body: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 4), Compression::default());
    encoder.write_all(body).context("💀 gzip choked on the bulk body")?;
    encoder.finish().context("💀 gzip could not finish the bulk body")
}

#[async_trait]
impl BulkWriter for ElasticsearchStore {
    async fn bulk(&self, body: String, pipeline: Option<&str>) -> Result<BulkResponse> {
        debug!("📡 Sending {} bytes to /_bulk (pipeline: {:?})", body.len(), pipeline);
        let path = match pipeline {
            Some(pipeline) => format!("_bulk?pipeline={pipeline}"),
            None => "_bulk".to_string(),
        };
        // ⚠️ x-ndjson, not json. Elasticsearch gets weird about it.
        let request = self.request(Method::POST, &path).header(CONTENT_TYPE, "application/x-ndjson");
        let request = if self.config.compress_requests {
            request.header(CONTENT_ENCODING, "gzip").body(gzip(body.as_bytes())?)
        } else {
            request.body(body)
        };

        let response = request
            .send()
            .await
            .context("💀 The bulk request never made it to Elasticsearch. We launched the payload into the network and the network was not vibing with it. Check connectivity, check timeouts, check your feelings.")?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let parsed = Self::parse_success(status, &text, "write a bulk request")?;
        let bulk: BulkResponse = serde_json::from_value(parsed)
            .context("💀 The _bulk response came back in a shape we don't recognize")?;
        trace!("🚀 Bulk request landed: {} items, errors={}", bulk.items.len(), bulk.errors);
        Ok(bulk)
    }
}

#[async_trait]
impl ConnectorStore for ElasticsearchStore {
    async fn fetch_connector(&self, connector_id: &str) -> Result<Option<ConnectorSettings>> {
        let Some(doc) = self.get_doc(&self.config.connectors_index, connector_id).await? else {
            return Ok(None);
        };
        let settings = ConnectorSettings::from_source(
            doc.id,
            doc.source.unwrap_or_default(),
            doc.seq_no,
            doc.primary_term,
        )
        .with_context(|| format!("💀 Connector '{connector_id}' is stored in a shape we can't read"))?;
        Ok(Some(settings))
    }

    async fn fetch_native_connectors(&self) -> Result<Vec<ConnectorSettings>> {
        let hits = self
            .search_all(&self.config.connectors_index, json!({"term": {"is_native": true}}))
            .await?;
        let mut connectors = Vec::with_capacity(hits.len());
        for hit in hits {
            match ConnectorSettings::from_source(&hit.id, hit.source.unwrap_or_default(), hit.seq_no, hit.primary_term) {
                Ok(settings) => connectors.push(settings),
                // one unreadable record must not hide every other connector
                Err(err) => warn!("⚠️ Skipping connector '{}', its record doesn't parse: {}", hit.id, err),
            }
        }
        Ok(connectors)
    }

    async fn update_connector(&self, connector_id: &str, doc: Value) -> Result<()> {
        self.partial_update(&self.config.connectors_index, connector_id, doc, None)
            .await
            .map(|_| ())
    }

    async fn update_connector_if_unchanged(&self, connector: &ConnectorSettings, doc: Value) -> Result<bool> {
        let condition = connector.seq_no.zip(connector.primary_term);
        self.partial_update(&self.config.connectors_index, &connector.id, doc, condition).await
    }

    async fn create_job(&self, job: &SyncJob) -> Result<String> {
        let body = serde_json::to_value(job)?;
        let (status, text) = self
            .send_json(Method::POST, &format!("{}/_doc?refresh=true", self.config.jobs_index), Some(&body))
            .await?;
        let created = Self::parse_success(status, &text, "create a sync job")?;
        created
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("💀 Elasticsearch created the job but forgot to tell us its id")
    }

    async fn fetch_job(&self, job_id: &str) -> Result<Option<SyncJob>> {
        let Some(doc) = self.get_doc(&self.config.jobs_index, job_id).await? else {
            return Ok(None);
        };
        let job = SyncJob::from_source(doc.id, doc.source.unwrap_or_default())
            .with_context(|| format!("💀 Sync job '{job_id}' is stored in a shape we can't read"))?;
        Ok(Some(job))
    }

    async fn fetch_jobs(&self) -> Result<Vec<SyncJob>> {
        let hits = self.search_all(&self.config.jobs_index, json!({"match_all": {}})).await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| match SyncJob::from_source(&hit.id, hit.source.unwrap_or_default()) {
                Ok(job) => Some(job),
                Err(err) => {
                    warn!("⚠️ Skipping sync job '{}', its record doesn't parse: {}", hit.id, err);
                    None
                }
            })
            .collect())
    }

    async fn update_job(&self, job_id: &str, doc: Value) -> Result<()> {
        self.partial_update(&self.config.jobs_index, job_id, doc, None)
            .await
            .map(|_| ())
    }

    async fn delete_jobs(&self, job_ids: &[String]) -> Result<u64> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let body = json!({"query": {"ids": {"values": job_ids}}});
        let (status, text) = self
            .send_json(
                Method::POST,
                &format!("{}/_delete_by_query?refresh=true", self.config.jobs_index),
                Some(&body),
            )
            .await?;
        let deleted = Self::parse_success(status, &text, "delete sync jobs")?;
        Ok(deleted.get("deleted").and_then(Value::as_u64).unwrap_or_default())
    }

    async fn ensure_index_exists(&self, index_name: &str) -> Result<()> {
        let (status, _) = self.send_json(Method::HEAD, index_name, None).await?;
        if status.is_success() {
            trace!("✅ Index '{}' already exists", index_name);
            return Ok(());
        }
        if status != StatusCode::NOT_FOUND {
            anyhow::bail!("💀 Checking whether index '{}' exists returned '{}'", index_name, status);
        }

        debug!("🏗️ Creating index '{}'", index_name);
        let (status, text) = self.send_json(Method::PUT, index_name, Some(&json!({}))).await?;
        // somebody else may have created it between our HEAD and our PUT
        if status == StatusCode::BAD_REQUEST && text.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Self::parse_success(status, &text, &format!("create index '{index_name}'"))?;
        Ok(())
    }

    async fn fetch_document_ids(&self, index_name: &str) -> Result<Vec<String>> {
        let hits = self.scan(index_name, json!({"match_all": {}}), false, ID_PAGE_SIZE).await?;
        debug!("🔍 Found {} existing documents in '{}'", hits.len(), index_name);
        Ok(hits.into_iter().map(|hit| hit.id).collect())
    }
}
