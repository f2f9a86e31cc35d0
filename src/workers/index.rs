use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

use crate::{
    config::{AppConfig, SearchSettings},
    models::{to_iso, Document, DocumentPage, DocumentVersion, Event, OcrStatus},
    schema::{document_version_pages, document_versions, documents},
    search::{chunk_text, IndexEntry, SearchError, SearchIndex},
    state::AppState,
};

use super::{EventHandler, EventOutcome, PipelineError, VersionMessage, STAGE_INDEX};

pub const SKIP_VERSION_NOT_FOUND: &str = "version_not_found";
pub const SKIP_DOCUMENT_DELETED: &str = "document_deleted";
pub const SKIP_OCR_NOT_COMPLETED: &str = "ocr_not_completed";
pub const SKIP_NO_PAGES: &str = "no_pages";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRun {
    Indexed { chunks: usize },
    Skipped(&'static str),
}

/// Writes a version's pages into the search index. The index is created on
/// first use and remembered for the lifetime of the indexer.
pub struct SearchIndexer {
    settings: SearchSettings,
    ensured: OnceCell<()>,
}

impl SearchIndexer {
    pub fn new(settings: SearchSettings) -> Self {
        Self {
            settings,
            ensured: OnceCell::new(),
        }
    }

    async fn ensure_index(&self, search: &dyn SearchIndex) -> Result<(), SearchError> {
        self.ensured
            .get_or_try_init(|| async {
                if !search.index_exists().await? {
                    search.create_index().await?;
                    info!("created search index");
                }
                Ok::<(), SearchError>(())
            })
            .await?;
        Ok(())
    }

    pub async fn index_version(
        &self,
        state: &AppState,
        version_id: Uuid,
    ) -> Result<IndexRun, PipelineError> {
        let loaded = state
            .with_conn(move |conn| {
                let row = document_versions::table
                    .inner_join(documents::table)
                    .filter(document_versions::id.eq(version_id))
                    .select((
                        document_versions::all_columns,
                        documents::all_columns,
                    ))
                    .first::<(DocumentVersion, Document)>(conn)
                    .optional()?;
                let Some((version, document)) = row else {
                    return Ok(None);
                };
                let pages: Vec<DocumentPage> = document_version_pages::table
                    .filter(document_version_pages::version_id.eq(version_id))
                    .order(document_version_pages::page_number.asc())
                    .load(conn)?;
                Ok(Some((version, document, pages)))
            })
            .await?;

        let Some((version, document, pages)) = loaded else {
            return Ok(IndexRun::Skipped(SKIP_VERSION_NOT_FOUND));
        };
        if document.is_deleted {
            return Ok(IndexRun::Skipped(SKIP_DOCUMENT_DELETED));
        }
        if version.ocr_state() != Some(OcrStatus::Completed) {
            return Ok(IndexRun::Skipped(SKIP_OCR_NOT_COMPLETED));
        }
        if pages.is_empty() {
            return Ok(IndexRun::Skipped(SKIP_NO_PAGES));
        }

        let search = state.search.as_ref();
        self.ensure_index(search).await?;
        // Reindexing a superseded version must not strip the flag from the
        // current one.
        if document.latest_version_id == Some(version.id) {
            search.demote_document(document.id).await?;
        }

        let entries = build_entries(&version, &document, &pages, &self.settings);
        let chunks = search.bulk_upsert(&entries).await?;
        Ok(IndexRun::Indexed { chunks })
    }
}

/// One entry per (page, chunk). Only the document's current version is
/// marked latest.
pub fn build_entries(
    version: &DocumentVersion,
    document: &Document,
    pages: &[DocumentPage],
    settings: &SearchSettings,
) -> Vec<IndexEntry> {
    let is_latest = document.latest_version_id == Some(version.id);
    let uploaded_at = version.uploaded_at.map(to_iso);

    pages
        .iter()
        .flat_map(|page| {
            chunk_text(&page.text, settings.chunk_size, settings.chunk_overlap)
                .into_iter()
                .enumerate()
                .map(|(chunk_index, text)| IndexEntry {
                    document_id: document.id,
                    version_id: version.id,
                    folder_id: document.folder_id,
                    filename: version.original_filename.clone(),
                    filename_text: version.original_filename.clone(),
                    version_number: version.version_number,
                    is_latest,
                    is_deleted: document.is_deleted,
                    page_number: page.page_number,
                    chunk_index,
                    uploaded_at: uploaded_at.clone(),
                    text,
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

pub struct IndexStage {
    indexer: Arc<SearchIndexer>,
    topics: Vec<String>,
    dlq_topic: String,
    consumer_group: String,
}

impl IndexStage {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            indexer: Arc::new(SearchIndexer::new(config.search.clone())),
            topics: vec![
                config.topics.ocr_completed.clone(),
                config.topics.search_index.clone(),
            ],
            dlq_topic: config.topics.search_dlq.clone(),
            consumer_group: config.consumer_group_search.clone(),
        }
    }
}

#[async_trait]
impl EventHandler for IndexStage {
    fn stage(&self) -> &'static str {
        STAGE_INDEX
    }

    fn topics(&self) -> Vec<String> {
        self.topics.clone()
    }

    fn consumer_group(&self) -> String {
        self.consumer_group.clone()
    }

    fn dlq_topic(&self) -> String {
        self.dlq_topic.clone()
    }

    async fn handle(&self, state: Arc<AppState>, event: Event) -> EventOutcome {
        let message = match VersionMessage::from_event(&event) {
            Ok(message) => message,
            Err(error) => return EventOutcome::DeadLetter { error },
        };
        let version_id = message.version_id;

        match self.indexer.index_version(&state, version_id).await {
            Ok(IndexRun::Indexed { chunks }) => {
                info!(%version_id, chunks, "version indexed");
                EventOutcome::Handled
            }
            Ok(IndexRun::Skipped(reason)) => EventOutcome::Skipped {
                reason: reason.to_string(),
            },
            Err(err) => EventOutcome::DeadLetter {
                error: err.to_string(),
            },
        }
    }
}
