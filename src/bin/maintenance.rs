use std::env;

use anyhow::{bail, Context, Result};
use diesel::prelude::*;
use serde_json::{json, Value};
use uuid::Uuid;

use docarchive::{
    build_state,
    config::AppConfig,
    documents::{publish_version_created, record_enqueue_failure, reset_ocr_to_pending, VersionEvent},
    events::{list_unsettled_events, mark_event_delivered},
    init_tracing,
    models::{DocumentVersion, OcrStatus, UploadStatus},
    schema::{document_versions, documents},
    state::AppState,
};

const USAGE: &str = "Usage:
  maintenance reindex <version-id>
  maintenance replay-dlq <topic> [limit]
  maintenance retry-failed-ocr [limit]";
const DEFAULT_LIMIT: i64 = 100;
/// Consumer group the replay command settles dead-letter messages under.
const REPLAY_GROUP: &str = "maintenance-replay";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        command = %command,
        "loaded configuration"
    );
    let state = build_state(config, 2).await?;

    match command.as_str() {
        "reindex" => {
            let version_id = args
                .get(1)
                .context("reindex needs a version id")?
                .parse::<Uuid>()
                .context("invalid version id")?;
            reindex(&state, version_id).await
        }
        "replay-dlq" => {
            let topic = args.get(1).context("replay-dlq needs a topic")?;
            replay_dlq(&state, topic, parse_limit(args.get(2))?).await
        }
        "retry-failed-ocr" => retry_failed_ocr(&state, parse_limit(args.get(1))?).await,
        other => {
            eprintln!("Unknown command: {other}\n{USAGE}");
            std::process::exit(1);
        }
    }
}

fn parse_limit(raw: Option<&String>) -> Result<i64> {
    match raw {
        Some(value) => {
            let limit: i64 = value.parse().context("limit must be a number")?;
            if limit <= 0 {
                bail!("limit must be positive");
            }
            Ok(limit)
        }
        None => Ok(DEFAULT_LIMIT),
    }
}

async fn reindex(state: &AppState, version_id: Uuid) -> Result<()> {
    let event_id = state
        .events
        .publish(
            &state.config.topics.search_index,
            Some(&version_id.to_string()),
            json!({ "versionId": version_id }),
        )
        .await?;
    println!("Queued reindex of {version_id} (event {event_id}).");
    Ok(())
}

/// Topic a dead-lettered message came from, falling back to the stage that
/// owns the dead-letter topic.
fn source_topic(state: &AppState, dlq_topic: &str, payload: &Value) -> Option<String> {
    if let Some(source) = payload.get("sourceTopic").and_then(Value::as_str) {
        return Some(source.to_string());
    }
    let topics = &state.config.topics;
    if dlq_topic == topics.ocr_dlq {
        Some(topics.version_created.clone())
    } else if dlq_topic == topics.search_dlq {
        Some(topics.search_index.clone())
    } else {
        None
    }
}

async fn replay_dlq(state: &AppState, topic: &str, limit: i64) -> Result<()> {
    let mut conn = state.pool.get().context("failed to get database connection")?;
    let entries = list_unsettled_events(&mut conn, topic, REPLAY_GROUP, limit)
        .context("failed to load dead-lettered messages")?;
    drop(conn);

    if entries.is_empty() {
        println!("No messages on {topic}.");
        return Ok(());
    }

    let mut replayed = 0usize;
    for entry in entries {
        let version_id = entry.payload.get("versionId").and_then(Value::as_str);
        let (Some(version_id), Some(target)) = (version_id, source_topic(state, topic, &entry.payload))
        else {
            eprintln!("Skipping {}: no versionId or source topic", entry.id);
            continue;
        };

        state
            .events
            .publish(&target, Some(version_id), json!({ "versionId": version_id }))
            .await
            .with_context(|| format!("failed to republish {}", entry.id))?;

        let mut conn = state.pool.get().context("failed to get database connection")?;
        mark_event_delivered(&mut conn, entry.id, REPLAY_GROUP)?;
        replayed += 1;
    }

    println!("Replayed {replayed} messages from {topic}.");
    Ok(())
}

async fn retry_failed_ocr(state: &AppState, limit: i64) -> Result<()> {
    let failed: Vec<(DocumentVersion, Uuid)> = {
        let mut conn = state.pool.get().context("failed to get database connection")?;
        document_versions::table
            .inner_join(documents::table)
            .filter(document_versions::ocr_status.eq(OcrStatus::Failed.as_str()))
            .filter(document_versions::upload_status.eq(UploadStatus::Uploaded.as_str()))
            .filter(documents::is_deleted.eq(false))
            .order(document_versions::updated_at.asc())
            .limit(limit)
            .select((document_versions::all_columns, documents::folder_id))
            .load(&mut conn)
            .context("failed to load failed versions")?
    };

    if failed.is_empty() {
        println!("No failed versions.");
        return Ok(());
    }

    let mut requeued = 0usize;
    for (version, folder_id) in failed {
        {
            let mut conn = state.pool.get().context("failed to get database connection")?;
            reset_ocr_to_pending(&mut conn, version.id)?;
        }
        let event = VersionEvent {
            version_id: version.id,
            document_id: version.document_id,
            folder_id,
        };
        // No connection is held while publishing.
        match publish_version_created(state, &event).await {
            Ok(_) => requeued += 1,
            Err(err) => {
                eprintln!("Failed to requeue {}: {err}", version.id);
                let mut conn = state.pool.get().context("failed to get database connection")?;
                record_enqueue_failure(&mut conn, version.id, &err.to_string())?;
            }
        }
    }

    println!("Requeued {requeued} versions for OCR.");
    Ok(())
}
