use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub cors_allowed_origin: Option<String>,
    pub aws_endpoint_url: Option<String>,
    pub aws_presign_endpoint_url: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    pub s3_bucket: String,
    pub presign_expiry_seconds: u64,
    pub elasticsearch_url: String,
    pub elasticsearch_index: String,
    pub topics: TopicConfig,
    pub consumer_group_ocr: String,
    pub consumer_group_search: String,
    pub event_lease_seconds: u64,
    pub ocr: OcrSettings,
    pub search: SearchSettings,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicConfig {
    pub version_created: String,
    pub ocr_completed: String,
    pub ocr_dlq: String,
    pub search_index: String,
    pub search_dlq: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            version_created: "document-version.created".to_string(),
            ocr_completed: "ocr.completed".to_string(),
            ocr_dlq: "ocr.dlq".to_string(),
            search_index: "search.index".to_string(),
            search_dlq: "search.dlq".to_string(),
        }
    }
}

/// Tuning for text extraction. `min_text_chars` is compared against the
/// non-whitespace character count of the first `sample_pages` pages.
#[derive(Clone, Debug)]
pub struct OcrSettings {
    pub work_dir: PathBuf,
    pub sample_pages: u32,
    pub min_text_chars: usize,
    pub render_dpi: u32,
    pub language: String,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            work_dir: env::temp_dir().join("docarchive-ocr"),
            sample_pages: 3,
            min_text_chars: 10,
            render_dpi: 150,
            language: "eng".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            chunk_size: 2000,
            chunk_overlap: 200,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let database_url = var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size =
            parse_or(&var, "DATABASE_MAX_POOL_SIZE", DEFAULT_MAX_POOL_SIZE)?;
        let server_host = var("SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let server_port = parse_or(&var, "SERVER_PORT", 3000u16)?;
        let s3_bucket = var("S3_BUCKET").context("S3_BUCKET must be set")?;

        let topic_defaults = TopicConfig::default();
        let topics = TopicConfig {
            version_created: var("TOPIC_VERSION_CREATED").unwrap_or(topic_defaults.version_created),
            ocr_completed: var("TOPIC_OCR_COMPLETED").unwrap_or(topic_defaults.ocr_completed),
            ocr_dlq: var("TOPIC_OCR_DLQ").unwrap_or(topic_defaults.ocr_dlq),
            search_index: var("TOPIC_SEARCH_INDEX").unwrap_or(topic_defaults.search_index),
            search_dlq: var("TOPIC_SEARCH_DLQ").unwrap_or(topic_defaults.search_dlq),
        };

        let ocr_defaults = OcrSettings::default();
        let ocr = OcrSettings {
            work_dir: var("OCR_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(ocr_defaults.work_dir),
            sample_pages: parse_or(&var, "OCR_SAMPLE_PAGES", ocr_defaults.sample_pages)?,
            min_text_chars: parse_or(&var, "OCR_MIN_TEXT_CHARS", ocr_defaults.min_text_chars)?,
            render_dpi: parse_or(&var, "OCR_RENDER_DPI", ocr_defaults.render_dpi)?,
            language: var("OCR_LANGUAGE").unwrap_or(ocr_defaults.language),
        };

        let search_defaults = SearchSettings::default();
        let search = SearchSettings {
            chunk_size: parse_or(&var, "SEARCH_CHUNK_SIZE", search_defaults.chunk_size)?,
            chunk_overlap: parse_or(&var, "SEARCH_CHUNK_OVERLAP", search_defaults.chunk_overlap)?,
        };
        anyhow::ensure!(search.chunk_size > 0, "SEARCH_CHUNK_SIZE must be positive");

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            cors_allowed_origin: var("CORS_ALLOWED_ORIGIN"),
            aws_endpoint_url: var("AWS_ENDPOINT_URL"),
            aws_presign_endpoint_url: var("AWS_PRESIGN_ENDPOINT_URL"),
            aws_access_key_id: var("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            aws_region: var("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            s3_bucket,
            presign_expiry_seconds: parse_or(&var, "PRESIGN_EXPIRY_SECONDS", 900u64)?,
            elasticsearch_url: var("ELASTICSEARCH_URL")
                .unwrap_or_else(|| "http://localhost:9200".to_string()),
            elasticsearch_index: var("ELASTICSEARCH_INDEX")
                .unwrap_or_else(|| "archive_pages_v1".to_string()),
            topics,
            consumer_group_ocr: var("CONSUMER_GROUP_OCR")
                .unwrap_or_else(|| "docarchive-ocr".to_string()),
            consumer_group_search: var("CONSUMER_GROUP_SEARCH")
                .unwrap_or_else(|| "docarchive-search".to_string()),
            event_lease_seconds: parse_or(&var, "EVENT_LEASE_SECONDS", 900u64)?,
            ocr,
            search,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }

    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.presign_expiry_seconds.max(1))
    }

    pub fn event_lease(&self) -> Duration {
        Duration::from_secs(self.event_lease_seconds.max(1))
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("*****"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
