//! Full-text index of page chunks, backed by Elasticsearch.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("search backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("bulk indexing failed: {0}")]
    Bulk(String),
    #[error("unexpected search response: {0}")]
    Decode(String),
}

pub type SearchResult<T> = Result<T, SearchError>;

/// One indexed chunk of a page. Field names are the index mapping's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub document_id: Uuid,
    pub version_id: Uuid,
    pub folder_id: Uuid,
    pub filename: String,
    pub filename_text: String,
    pub version_number: i32,
    pub is_latest: bool,
    pub is_deleted: bool,
    pub page_number: i32,
    pub chunk_index: usize,
    pub uploaded_at: Option<String>,
    pub text: String,
}

impl IndexEntry {
    pub fn doc_id(&self) -> String {
        format!("{}:{}:{}", self.version_id, self.page_number, self.chunk_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub q: String,
    pub folder_id: Option<Uuid>,
    pub filename: Option<String>,
    pub all_versions: bool,
    pub from: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: Option<f64>,
    pub document_id: Uuid,
    pub version_id: Uuid,
    pub folder_id: Uuid,
    pub filename: String,
    pub version_number: i32,
    pub is_latest: bool,
    pub page_number: i32,
    pub chunk_index: usize,
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SearchResults {
    pub took_ms: u64,
    pub total: u64,
    pub hits: Vec<SearchHit>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync + 'static {
    async fn index_exists(&self) -> SearchResult<bool>;

    /// Creates the index with its mapping. An index that already exists is
    /// not an error.
    async fn create_index(&self) -> SearchResult<()>;

    /// Clears `isLatest` on every chunk of `document_id`.
    async fn demote_document(&self, document_id: Uuid) -> SearchResult<()>;

    async fn bulk_upsert(&self, entries: &[IndexEntry]) -> SearchResult<usize>;

    async fn search(&self, query: &SearchQuery) -> SearchResult<SearchResults>;
}

pub struct ElasticsearchIndex {
    client: Client,
    base_url: String,
    index: String,
}

impl ElasticsearchIndex {
    pub fn new(base_url: impl Into<String>, index: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, index)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            index: index.into().trim().to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn expect_json(response: reqwest::Response) -> SearchResult<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn index_exists(&self) -> SearchResult<bool> {
        let response = self
            .client
            .head(self.url(&format!("/{}", self.index)))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(SearchError::Status {
                status: status.as_u16(),
                body: "index check failed".to_string(),
            }),
        }
    }

    async fn create_index(&self) -> SearchResult<()> {
        let response = self
            .client
            .put(self.url(&format!("/{}", self.index)))
            .json(&index_mapping())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(SearchError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn demote_document(&self, document_id: Uuid) -> SearchResult<()> {
        let response = self
            .client
            .post(self.url(&format!(
                "/{}/_update_by_query?conflicts=proceed&refresh=true",
                self.index
            )))
            .json(&demote_body(document_id))
            .send()
            .await?;
        Self::expect_json(response).await.map(|_| ())
    }

    async fn bulk_upsert(&self, entries: &[IndexEntry]) -> SearchResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let body = bulk_body(&self.index, entries)?;
        let response = self
            .client
            .post(self.url("/_bulk?refresh=true"))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let parsed = Self::expect_json(response).await?;
        if let Some(error) = first_bulk_error(&parsed) {
            return Err(SearchError::Bulk(error));
        }
        Ok(entries.len())
    }

    async fn search(&self, query: &SearchQuery) -> SearchResult<SearchResults> {
        let response = self
            .client
            .post(self.url(&format!("/{}/_search", self.index)))
            .json(&build_search_body(query))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(SearchResults::default());
        }
        let parsed = Self::expect_json(response).await?;
        parse_search_response(&parsed)
    }
}

pub fn index_mapping() -> Value {
    json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 0
        },
        "mappings": {
            "properties": {
                "documentId": { "type": "keyword" },
                "versionId": { "type": "keyword" },
                "folderId": { "type": "keyword" },
                "filename": { "type": "keyword" },
                "filenameText": { "type": "text" },
                "versionNumber": { "type": "integer" },
                "isLatest": { "type": "boolean" },
                "isDeleted": { "type": "boolean" },
                "pageNumber": { "type": "integer" },
                "chunkIndex": { "type": "integer" },
                "uploadedAt": { "type": "date" },
                "text": { "type": "text" }
            }
        }
    })
}

fn demote_body(document_id: Uuid) -> Value {
    json!({
        "script": { "lang": "painless", "source": "ctx._source.isLatest = false" },
        "query": { "term": { "documentId": document_id.to_string() } }
    })
}

fn bulk_body(index: &str, entries: &[IndexEntry]) -> SearchResult<String> {
    let mut body = String::new();
    for entry in entries {
        let action = json!({ "index": { "_index": index, "_id": entry.doc_id() } });
        body.push_str(&action.to_string());
        body.push('\n');
        let source =
            serde_json::to_string(entry).map_err(|err| SearchError::Decode(err.to_string()))?;
        body.push_str(&source);
        body.push('\n');
    }
    Ok(body)
}

/// First per-item error of a bulk response that reports `errors: true`.
pub fn first_bulk_error(response: &Value) -> Option<String> {
    if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let first = response
        .get("items")
        .and_then(Value::as_array)
        .and_then(|items| {
            items.iter().find_map(|item| {
                item.as_object()
                    .and_then(|actions| actions.values().find_map(|action| action.get("error")))
            })
        });
    Some(match first {
        Some(error) => error.to_string(),
        None => "bulk response reported errors".to_string(),
    })
}

pub fn build_search_body(query: &SearchQuery) -> Value {
    let mut filter = vec![json!({ "term": { "isDeleted": false } })];
    if !query.all_versions {
        filter.push(json!({ "term": { "isLatest": true } }));
    }
    if let Some(folder_id) = query.folder_id {
        filter.push(json!({ "term": { "folderId": folder_id.to_string() } }));
    }
    if let Some(filename) = &query.filename {
        filter.push(json!({ "term": { "filename": filename } }));
    }

    json!({
        "from": query.from,
        "size": query.size.clamp(1, MAX_PAGE_SIZE),
        "query": {
            "bool": {
                "must": [{
                    "multi_match": {
                        "query": query.q,
                        "fields": ["text", "filenameText"],
                        "operator": "and"
                    }
                }],
                "filter": filter
            }
        },
        "highlight": {
            "fields": {
                "text": {
                    "fragment_size": 160,
                    "number_of_fragments": 3,
                    "pre_tags": ["<mark>"],
                    "post_tags": ["</mark>"]
                }
            }
        },
        "sort": [{ "_score": "desc" }, { "uploadedAt": "desc" }]
    })
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score")]
    score: Option<f64>,
    #[serde(rename = "_source")]
    source: IndexEntry,
    #[serde(default)]
    highlight: Option<RawHighlight>,
}

#[derive(Deserialize, Default)]
struct RawHighlight {
    #[serde(default)]
    text: Vec<String>,
}

pub fn parse_search_response(response: &Value) -> SearchResult<SearchResults> {
    let raw_hits = response
        .pointer("/hits/hits")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));
    let raw_hits: Vec<RawHit> =
        serde_json::from_value(raw_hits).map_err(|err| SearchError::Decode(err.to_string()))?;

    let hits: Vec<SearchHit> = raw_hits
        .into_iter()
        .map(|hit| SearchHit {
            id: hit.id,
            score: hit.score,
            document_id: hit.source.document_id,
            version_id: hit.source.version_id,
            folder_id: hit.source.folder_id,
            filename: hit.source.filename,
            version_number: hit.source.version_number,
            is_latest: hit.source.is_latest,
            page_number: hit.source.page_number,
            chunk_index: hit.source.chunk_index,
            highlights: hit.highlight.unwrap_or_default().text,
        })
        .collect();

    let total = response
        .pointer("/hits/total/value")
        .and_then(Value::as_u64)
        .unwrap_or(hits.len() as u64);
    let took_ms = response.get("took").and_then(Value::as_u64).unwrap_or(0);

    Ok(SearchResults {
        took_ms,
        total,
        hits,
    })
}

/// Splits trimmed `text` into windows of `size` characters, each starting
/// `size - overlap` characters after the previous one.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.trim().chars().collect();
    if chars.is_empty() || size == 0 {
        return Vec::new();
    }
    let overlap = overlap.min(size - 1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end >= chars.len() {
            break;
        }
        start = end - overlap;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(page_number: i32, chunk_index: usize) -> IndexEntry {
        IndexEntry {
            document_id: Uuid::from_u128(1),
            version_id: Uuid::from_u128(2),
            folder_id: Uuid::from_u128(3),
            filename: "contract.pdf".to_string(),
            filename_text: "contract.pdf".to_string(),
            version_number: 2,
            is_latest: true,
            is_deleted: false,
            page_number,
            chunk_index,
            uploaded_at: None,
            text: "hello".to_string(),
        }
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        assert_eq!(chunk_text("  hello world ", 2000, 200), vec!["hello world"]);
        assert!(chunk_text("   ", 2000, 200).is_empty());
    }

    #[test]
    fn windows_overlap_by_configured_amount() {
        let text: String = ('a'..='j').collect();
        let chunks = chunk_text(&text, 4, 1);
        assert_eq!(chunks, vec!["abcd", "defg", "ghij"]);
    }

    #[test]
    fn overlap_never_stalls_progress() {
        let chunks = chunk_text("abcdef", 2, 5);
        assert_eq!(chunks, vec!["ab", "bc", "cd", "de", "ef"]);
    }

    #[test]
    fn chunks_count_characters_not_bytes() {
        let chunks = chunk_text("äöüß", 2, 0);
        assert_eq!(chunks, vec!["äö", "üß"]);
    }

    #[test]
    fn document_ids_are_stable_per_chunk() {
        assert_eq!(
            entry(4, 1).doc_id(),
            format!("{}:4:1", Uuid::from_u128(2))
        );
    }

    #[test]
    fn entries_serialize_with_mapping_field_names() {
        let value = serde_json::to_value(entry(1, 0)).expect("serialize");
        for field in ["documentId", "versionId", "folderId", "filenameText", "isLatest", "chunkIndex"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        let mapped = index_mapping();
        let properties = mapped
            .pointer("/mappings/properties")
            .and_then(Value::as_object)
            .expect("properties");
        for key in value.as_object().expect("object").keys() {
            assert!(properties.contains_key(key), "unmapped field {key}");
        }
    }

    #[test]
    fn search_body_filters_latest_unless_all_versions() {
        let folder = Uuid::from_u128(9);
        let mut query = SearchQuery {
            q: "invoice".to_string(),
            folder_id: Some(folder),
            filename: None,
            all_versions: false,
            from: 0,
            size: 500,
        };
        let body = build_search_body(&query);
        let filters = body.pointer("/query/bool/filter").expect("filters").to_string();
        assert!(filters.contains("isLatest"));
        assert!(filters.contains(&folder.to_string()));
        assert_eq!(body["size"], 100);

        query.all_versions = true;
        let body = build_search_body(&query);
        let filters = body.pointer("/query/bool/filter").expect("filters").to_string();
        assert!(!filters.contains("isLatest"));
    }

    #[test]
    fn bulk_errors_surface_first_item_error() {
        let response = json!({
            "errors": true,
            "items": [
                { "index": { "_id": "a", "status": 201 } },
                { "index": { "_id": "b", "status": 400, "error": { "type": "mapper_parsing_exception" } } },
                { "index": { "_id": "c", "status": 400, "error": { "type": "other" } } }
            ]
        });
        let error = first_bulk_error(&response).expect("error");
        assert!(error.contains("mapper_parsing_exception"));
        assert_eq!(first_bulk_error(&json!({ "errors": false, "items": [] })), None);
    }

    #[test]
    fn parses_hits_and_highlights() {
        let source = serde_json::to_value(entry(3, 0)).expect("serialize");
        let response = json!({
            "took": 7,
            "hits": {
                "total": { "value": 1 },
                "hits": [{
                    "_id": "x",
                    "_score": 1.5,
                    "_source": source,
                    "highlight": { "text": ["<mark>hello</mark>"] }
                }]
            }
        });
        let results = parse_search_response(&response).expect("parse");
        assert_eq!(results.took_ms, 7);
        assert_eq!(results.total, 1);
        assert_eq!(results.hits[0].page_number, 3);
        assert_eq!(results.hits[0].highlights, vec!["<mark>hello</mark>"]);
    }
}
