use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use diesel::{pg::PgConnection, prelude::*, sql_types};
use serde_json::json;
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::{AppConfig, OcrSettings},
    error::{AppError, AppResult},
    extract::{meaningful_chars, split_text_pages, ExtractError, PdfEngine},
    models::{now_utc, DocumentVersion, Event, NewDocumentPage, OcrStatus, UploadStatus},
    schema::{document_version_pages, document_versions},
    state::AppState,
};

use super::{EventHandler, EventOutcome, PipelineError, VersionMessage, STAGE_OCR};

pub const SKIP_VERSION_NOT_FOUND: &str = "version_not_found";
pub const SKIP_NOT_UPLOADED: &str = "not_uploaded";
pub const SKIP_ALREADY_COMPLETED: &str = "already_completed";
pub const SKIP_NOT_CLAIMED: &str = "not_claimed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    Text,
    Recognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub mode: ExtractionMode,
    pub page_count: u32,
    pub pages: Vec<(i32, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcrRun {
    Completed {
        mode: ExtractionMode,
        page_count: u32,
        pages_stored: usize,
    },
    Skipped(&'static str),
}

pub struct OcrStage {
    engine: Arc<dyn PdfEngine>,
    source_topic: String,
    completed_topic: String,
    dlq_topic: String,
    consumer_group: String,
}

impl OcrStage {
    pub fn new(config: &AppConfig, engine: Arc<dyn PdfEngine>) -> Self {
        Self {
            engine,
            source_topic: config.topics.version_created.clone(),
            completed_topic: config.topics.ocr_completed.clone(),
            dlq_topic: config.topics.ocr_dlq.clone(),
            consumer_group: config.consumer_group_ocr.clone(),
        }
    }

    async fn publish_completed(&self, state: &AppState, version_id: Uuid) -> Result<(), PipelineError> {
        state
            .events
            .publish(
                &self.completed_topic,
                Some(&version_id.to_string()),
                json!({ "versionId": version_id }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for OcrStage {
    fn stage(&self) -> &'static str {
        STAGE_OCR
    }

    fn topics(&self) -> Vec<String> {
        vec![self.source_topic.clone()]
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

        match process_version(&state, self.engine.clone(), version_id).await {
            Ok(OcrRun::Completed {
                mode,
                page_count,
                pages_stored,
            }) => {
                info!(%version_id, ?mode, page_count, pages_stored, "ocr completed");
                match self.publish_completed(&state, version_id).await {
                    Ok(()) => EventOutcome::Handled,
                    Err(err) => EventOutcome::DeadLetter {
                        error: format!("failed to publish completion: {err}"),
                    },
                }
            }
            // A finished version whose completion notice may have been lost
            // is announced again so the indexer can catch up.
            Ok(OcrRun::Skipped(SKIP_ALREADY_COMPLETED)) => {
                match self.publish_completed(&state, version_id).await {
                    Ok(()) => EventOutcome::Skipped {
                        reason: SKIP_ALREADY_COMPLETED.to_string(),
                    },
                    Err(err) => EventOutcome::DeadLetter {
                        error: format!("failed to publish completion: {err}"),
                    },
                }
            }
            Ok(OcrRun::Skipped(reason)) => EventOutcome::Skipped {
                reason: reason.to_string(),
            },
            Err(err) => EventOutcome::DeadLetter {
                error: err.to_string(),
            },
        }
    }
}

/// Claims `version_id` and extracts its pages. A failure after the claim
/// leaves the version FAILED with the error recorded and is returned to the
/// caller for dead-lettering.
pub async fn process_version(
    state: &AppState,
    engine: Arc<dyn PdfEngine>,
    version_id: Uuid,
) -> Result<OcrRun, PipelineError> {
    let version = state
        .with_conn(move |conn| {
            Ok(document_versions::table
                .find(version_id)
                .first::<DocumentVersion>(conn)
                .optional()?)
        })
        .await?;

    let Some(version) = version else {
        return Ok(OcrRun::Skipped(SKIP_VERSION_NOT_FOUND));
    };
    if !version.is_uploaded() {
        return Ok(OcrRun::Skipped(SKIP_NOT_UPLOADED));
    }
    if version.ocr_state() == Some(OcrStatus::Completed) {
        return Ok(OcrRun::Skipped(SKIP_ALREADY_COMPLETED));
    }

    let claimed = state
        .with_conn(move |conn| claim_version(conn, version_id))
        .await?;
    if !claimed {
        return Ok(OcrRun::Skipped(SKIP_NOT_CLAIMED));
    }

    match run_claimed(state, engine, &version).await {
        Ok(run) => Ok(run),
        Err(err) => {
            let message = err.to_string();
            if let Err(mark_err) = state
                .with_conn(move |conn| mark_failed(conn, version_id, &message))
                .await
            {
                error!(%version_id, error = %mark_err, "failed to record OCR failure");
            }
            warn!(%version_id, error = %err, "ocr failed");
            Err(err)
        }
    }
}

/// Moves a claimable version to PROCESSING. Exactly one row must change for
/// the caller to own this attempt.
pub fn claim_version(conn: &mut PgConnection, version_id: Uuid) -> AppResult<bool> {
    let claimable: Vec<String> = OcrStatus::CLAIMABLE
        .iter()
        .map(|status| status.as_str().to_string())
        .collect();
    let updated = diesel::sql_query(
        "UPDATE document_versions \
         SET ocr_status = $2, \
             ocr_started_at = COALESCE(ocr_started_at, now()), \
             ocr_attempts = ocr_attempts + 1, \
             ocr_error = NULL, \
             updated_at = now() \
         WHERE id = $1 AND upload_status = $3 AND ocr_status = ANY($4)",
    )
    .bind::<sql_types::Uuid, _>(version_id)
    .bind::<sql_types::Text, _>(OcrStatus::Processing.as_str())
    .bind::<sql_types::Text, _>(UploadStatus::Uploaded.as_str())
    .bind::<sql_types::Array<sql_types::Text>, _>(claimable)
    .execute(conn)?;
    Ok(updated == 1)
}

fn mark_failed(conn: &mut PgConnection, version_id: Uuid, message: &str) -> AppResult<()> {
    diesel::update(document_versions::table.find(version_id))
        .set((
            document_versions::ocr_status.eq(OcrStatus::Failed.as_str()),
            document_versions::ocr_error.eq(Some(message.to_string())),
            document_versions::updated_at.eq(now_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Replaces the version's pages and marks it COMPLETED in one transaction.
pub fn store_pages_and_complete(
    conn: &mut PgConnection,
    version_id: Uuid,
    extraction: &Extraction,
) -> AppResult<usize> {
    conn.transaction::<_, AppError, _>(|conn| {
        diesel::delete(
            document_version_pages::table.filter(document_version_pages::version_id.eq(version_id)),
        )
        .execute(conn)?;

        let rows: Vec<NewDocumentPage> = extraction
            .pages
            .iter()
            .map(|(page_number, text)| NewDocumentPage {
                version_id,
                page_number: *page_number,
                text: text.clone(),
            })
            .collect();
        let stored = if rows.is_empty() {
            0
        } else {
            diesel::insert_into(document_version_pages::table)
                .values(&rows)
                .execute(conn)?
        };

        let page_count = i32::try_from(extraction.page_count).unwrap_or(i32::MAX);
        diesel::sql_query(
            "UPDATE document_versions \
             SET ocr_status = $2, \
                 ocr_completed_at = now(), \
                 ocr_error = NULL, \
                 page_count = COALESCE(page_count, $3), \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind::<sql_types::Uuid, _>(version_id)
        .bind::<sql_types::Text, _>(OcrStatus::Completed.as_str())
        .bind::<sql_types::Integer, _>(page_count)
        .execute(conn)?;

        Ok(stored)
    })
}

async fn run_claimed(
    state: &AppState,
    engine: Arc<dyn PdfEngine>,
    version: &DocumentVersion,
) -> Result<OcrRun, PipelineError> {
    let settings = state.config.ocr.clone();
    tokio::fs::create_dir_all(&settings.work_dir).await?;
    // Removed on drop, whichever way this function exits.
    let work_dir = tempfile::Builder::new()
        .prefix(&format!("{}-", version.id))
        .tempdir_in(&settings.work_dir)?;

    let pdf_path = work_dir.path().join("input.pdf");
    let bytes = state
        .storage
        .download_to_file(&version.storage_key, &pdf_path)
        .await
        .map_err(PipelineError::Storage)?;
    info!(version_id = %version.id, bytes, "downloaded version for ocr");

    let scratch: PathBuf = work_dir.path().to_path_buf();
    let extraction = task::spawn_blocking(move || {
        extract_pages(engine.as_ref(), &pdf_path, &scratch, &settings)
    })
    .await
    .map_err(|err| PipelineError::Task(err.to_string()))??;

    let version_id = version.id;
    let mode = extraction.mode;
    let page_count = extraction.page_count;
    let pages_stored = state
        .with_conn(move |conn| store_pages_and_complete(conn, version_id, &extraction))
        .await?;

    if let Err(err) = work_dir.close() {
        warn!(%version_id, error = %err, "failed to remove ocr work dir");
    }

    Ok(OcrRun::Completed {
        mode,
        page_count,
        pages_stored,
    })
}

/// Chooses between native text and recognition from a sample of the leading
/// pages. Native text drops blank pages; recognized pages are kept even when
/// empty so page numbers line up with the rendered images.
pub fn extract_pages(
    engine: &dyn PdfEngine,
    pdf: &Path,
    work_dir: &Path,
    settings: &OcrSettings,
) -> Result<Extraction, ExtractError> {
    let sample = engine.sample_text(pdf, settings.sample_pages)?;
    let is_text_pdf = meaningful_chars(&sample) >= settings.min_text_chars;
    let page_count = engine.page_count(pdf)?.max(1);

    if is_text_pdf {
        let text = engine.extract_text(pdf)?;
        return Ok(Extraction {
            mode: ExtractionMode::Text,
            page_count,
            pages: split_text_pages(&text),
        });
    }

    let images = engine.render_pages(pdf, work_dir, settings.render_dpi)?;
    let mut pages = Vec::with_capacity(images.len());
    for (index, image) in images.iter().enumerate() {
        let text = engine.recognize(image, &settings.language)?;
        pages.push((index as i32 + 1, text.trim().to_string()));
    }

    Ok(Extraction {
        mode: ExtractionMode::Recognized,
        page_count,
        pages,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct FakeEngine {
        sample: String,
        full_text: String,
        page_count: u32,
        recognized: Vec<&'static str>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeEngine {
        fn text_pdf(full_text: &str, page_count: u32) -> Self {
            Self {
                sample: full_text.to_string(),
                full_text: full_text.to_string(),
                page_count,
                recognized: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn scanned(recognized: Vec<&'static str>) -> Self {
            Self {
                sample: "  \n\u{c} ".to_string(),
                full_text: String::new(),
                page_count: recognized.len() as u32,
                recognized,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().expect("calls").push(call);
        }
    }

    impl PdfEngine for FakeEngine {
        fn sample_text(&self, _pdf: &Path, _pages: u32) -> Result<String, ExtractError> {
            self.record("sample");
            Ok(self.sample.clone())
        }

        fn extract_text(&self, _pdf: &Path) -> Result<String, ExtractError> {
            self.record("extract");
            Ok(self.full_text.clone())
        }

        fn page_count(&self, _pdf: &Path) -> Result<u32, ExtractError> {
            Ok(self.page_count)
        }

        fn render_pages(
            &self,
            _pdf: &Path,
            out_dir: &Path,
            _dpi: u32,
        ) -> Result<Vec<PathBuf>, ExtractError> {
            self.record("render");
            Ok((1..=self.recognized.len())
                .map(|page| out_dir.join(format!("page-{page}.png")))
                .collect())
        }

        fn recognize(&self, image: &Path, _language: &str) -> Result<String, ExtractError> {
            self.record("recognize");
            let name = image.file_stem().and_then(|stem| stem.to_str()).unwrap_or_default();
            let index: usize = name.trim_start_matches("page-").parse().unwrap_or(1);
            Ok(self.recognized[index - 1].to_string())
        }
    }

    fn run(engine: &FakeEngine) -> Extraction {
        extract_pages(
            engine,
            Path::new("/tmp/input.pdf"),
            Path::new("/tmp/work"),
            &OcrSettings::default(),
        )
        .expect("extraction")
    }

    #[test]
    fn text_pdf_drops_blank_pages_and_skips_recognition() {
        let engine = FakeEngine::text_pdf("Invoice 2024-001\u{c}   \u{c}Total due: 120 EUR", 3);
        let extraction = run(&engine);

        assert_eq!(extraction.mode, ExtractionMode::Text);
        assert_eq!(extraction.page_count, 3);
        assert_eq!(
            extraction.pages,
            vec![
                (1, "Invoice 2024-001".to_string()),
                (3, "Total due: 120 EUR".to_string()),
            ]
        );
        let calls = engine.calls.lock().expect("calls").clone();
        assert!(!calls.contains(&"render"));
        assert!(!calls.contains(&"recognize"));
    }

    #[test]
    fn scanned_pdf_keeps_empty_recognized_pages() {
        let engine = FakeEngine::scanned(vec!["  scanned page one \n", "", "page three"]);
        let extraction = run(&engine);

        assert_eq!(extraction.mode, ExtractionMode::Recognized);
        assert_eq!(
            extraction.pages,
            vec![
                (1, "scanned page one".to_string()),
                (2, String::new()),
                (3, "page three".to_string()),
            ]
        );
        assert!(!engine.calls.lock().expect("calls").contains(&"extract"));
    }

    #[test]
    fn short_sample_falls_back_to_recognition() {
        let mut engine = FakeEngine::scanned(vec!["ocr text"]);
        engine.sample = "p. 1".to_string();
        assert_eq!(run(&engine).mode, ExtractionMode::Recognized);
    }

    #[test]
    fn page_count_is_at_least_one() {
        let engine = FakeEngine::text_pdf("a reasonably long text page", 0);
        assert_eq!(run(&engine).page_count, 1);
    }
}
