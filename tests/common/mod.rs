use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use docarchive::auth::{USER_ID_HEADER, USER_ROLES_HEADER};
use docarchive::config::AppConfig;
use docarchive::db::{self, PgPool};
use docarchive::events::{deliveries_of, publish_event, EventBus, EventBusError, EventBusResult};
use docarchive::extract::{ExtractError, PdfEngine, PAGE_BREAK};
use docarchive::models::{Event, NewFolderGrant, NewOperationalRolePermission, NewRole, OperationalRole};
use docarchive::routes;
use docarchive::schema::{events, folder_role_grants, operational_role_permissions, permissions, roles};
use docarchive::search::{IndexEntry, SearchHit, SearchIndex, SearchQuery, SearchResult, SearchResults};
use docarchive::state::AppState;
use docarchive::storage::{ObjectHead, ObjectStorage, PresignedUpload};
use docarchive::{handlers_for, Worker};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
const SEED_CATALOG: &str = include_str!("../../migrations/2024-06-01-000004_seed_catalog/up.sql");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// In-memory bucket. Objects appear only when a test puts them, the way a
/// browser upload against the presigned URL would.
#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    fn bucket(&self) -> &str {
        "test-bucket"
    }

    async fn presign_put_object(
        &self,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<PresignedUpload> {
        let mut required_headers = BTreeMap::new();
        required_headers.insert("content-type".to_string(), content_type.to_string());
        Ok(PresignedUpload {
            url: format!("https://fake-storage/{key}?upload"),
            method: "PUT".to_string(),
            required_headers,
            expires_in_seconds: expires_in.as_secs(),
        })
    }

    async fn presign_get_object(
        &self,
        key: &str,
        filename: Option<&str>,
        expires_in: Duration,
    ) -> Result<String> {
        Ok(format!(
            "https://fake-storage/{key}?filename={}&expires_in={}",
            filename.unwrap_or_default(),
            expires_in.as_secs()
        ))
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("storage offline");
        }
        let guard = self.objects.lock().await;
        Ok(guard.get(key).map(|bytes| ObjectHead {
            content_type: Some("application/pdf".to_string()),
            content_length: Some(bytes.len() as i64),
        }))
    }

    async fn download_to_file(&self, key: &str, path: &Path) -> Result<u64> {
        let bytes = {
            let guard = self.objects.lock().await;
            guard
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow!("object {key} missing"))?
        };
        tokio::fs::write(path, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}

impl FakeStorage {
    pub async fn put(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        let mut guard = self.objects.lock().await;
        guard.insert(key.to_string(), bytes.into());
    }

    #[allow(dead_code)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

/// Topic log backed by the test database that can be switched off to
/// simulate a broker outage.
pub struct SwitchableEventBus {
    pool: PgPool,
    offline: AtomicBool,
}

#[async_trait]
impl EventBus for SwitchableEventBus {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: Value) -> EventBusResult<Uuid> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EventBusError::Unavailable("broker offline".to_string()));
        }
        let pool = self.pool.clone();
        let topic = topic.to_string();
        let key = key.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| EventBusError::Pool(err.to_string()))?;
            publish_event(&mut conn, &topic, key.as_deref(), payload).map(|event| event.id)
        })
        .await
        .map_err(|err| EventBusError::Task(err.to_string()))?
    }
}

impl SwitchableEventBus {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

/// Substring matching on chunk text with exact filename and folder filters,
/// the same split the Elasticsearch query makes.
#[derive(Default)]
pub struct MemorySearchIndex {
    created: AtomicBool,
    entries: Mutex<BTreeMap<String, IndexEntry>>,
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn index_exists(&self) -> SearchResult<bool> {
        Ok(self.created.load(Ordering::SeqCst))
    }

    async fn create_index(&self) -> SearchResult<()> {
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn demote_document(&self, document_id: Uuid) -> SearchResult<()> {
        let mut guard = self.entries.lock().await;
        for entry in guard.values_mut() {
            if entry.document_id == document_id {
                entry.is_latest = false;
            }
        }
        Ok(())
    }

    async fn bulk_upsert(&self, entries: &[IndexEntry]) -> SearchResult<usize> {
        let mut guard = self.entries.lock().await;
        for entry in entries {
            guard.insert(entry.doc_id(), entry.clone());
        }
        Ok(entries.len())
    }

    async fn search(&self, query: &SearchQuery) -> SearchResult<SearchResults> {
        let needle = query.q.to_lowercase();
        let guard = self.entries.lock().await;
        let matching: Vec<SearchHit> = guard
            .iter()
            .filter(|(_, entry)| !entry.is_deleted)
            .filter(|(_, entry)| query.all_versions || entry.is_latest)
            .filter(|(_, entry)| query.folder_id.map_or(true, |id| entry.folder_id == id))
            .filter(|(_, entry)| {
                query
                    .filename
                    .as_ref()
                    .map_or(true, |name| entry.filename == *name)
            })
            .filter(|(_, entry)| entry.text.to_lowercase().contains(&needle))
            .map(|(id, entry)| SearchHit {
                id: id.clone(),
                score: Some(1.0),
                document_id: entry.document_id,
                version_id: entry.version_id,
                folder_id: entry.folder_id,
                filename: entry.filename.clone(),
                version_number: entry.version_number,
                is_latest: entry.is_latest,
                page_number: entry.page_number,
                chunk_index: entry.chunk_index,
                highlights: vec![entry.text.clone()],
            })
            .collect();
        let total = matching.len() as u64;
        let hits = matching
            .into_iter()
            .skip(query.from as usize)
            .take(query.size as usize)
            .collect();
        Ok(SearchResults {
            took_ms: 0,
            total,
            hits,
        })
    }
}

impl MemorySearchIndex {
    #[allow(dead_code)]
    pub async fn entries(&self) -> Vec<IndexEntry> {
        let guard = self.entries.lock().await;
        guard.values().cloned().collect()
    }
}

/// Treats the downloaded bytes as UTF-8 text with form-feed page breaks, so a
/// test controls what "extraction" finds by what it uploads.
#[derive(Default)]
pub struct TextFilePdfEngine;

impl TextFilePdfEngine {
    fn pages(pdf: &Path) -> Result<Vec<String>, ExtractError> {
        let raw = std::fs::read_to_string(pdf)?;
        Ok(raw.split(PAGE_BREAK).map(str::to_string).collect())
    }
}

impl PdfEngine for TextFilePdfEngine {
    fn sample_text(&self, pdf: &Path, pages: u32) -> Result<String, ExtractError> {
        let sample: Vec<String> = Self::pages(pdf)?.into_iter().take(pages as usize).collect();
        Ok(sample.join("\n"))
    }

    fn extract_text(&self, pdf: &Path) -> Result<String, ExtractError> {
        Ok(std::fs::read_to_string(pdf)?)
    }

    fn page_count(&self, pdf: &Path) -> Result<u32, ExtractError> {
        Ok(Self::pages(pdf)?.len() as u32)
    }

    fn render_pages(&self, pdf: &Path, out_dir: &Path, _dpi: u32) -> Result<Vec<PathBuf>, ExtractError> {
        let mut images = Vec::new();
        for (index, page) in Self::pages(pdf)?.into_iter().enumerate() {
            let path = out_dir.join(format!("page-{:04}.png", index + 1));
            std::fs::write(&path, page)?;
            images.push(path);
        }
        Ok(images)
    }

    fn recognize(&self, image: &Path, _language: &str) -> Result<String, ExtractError> {
        Ok(std::fs::read_to_string(image)?)
    }
}

/// Identity a request is made under.
#[derive(Debug, Clone)]
pub struct TestCaller {
    pub user_id: Uuid,
    pub roles: String,
}

impl TestCaller {
    pub fn with_roles(roles: &str) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            roles: roles.to_string(),
        }
    }

    pub fn admin() -> Self {
        Self::with_roles("ADMIN")
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<FakeStorage>,
    events: Arc<SwitchableEventBus>,
    search: Arc<MemorySearchIndex>,
}

impl TestApp {
    /// `None` when `TEST_DATABASE_URL` is not set; callers skip the test.
    pub async fn new() -> Result<Option<Self>> {
        let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set, skipping integration test");
            return Ok(None);
        };

        let work_dir = env::temp_dir().join("docarchive-tests");
        let mut vars = HashMap::new();
        vars.insert("DATABASE_URL", database_url);
        vars.insert("S3_BUCKET", "test-bucket".to_string());
        vars.insert("OCR_WORK_DIR", work_dir.display().to_string());
        vars.insert("OCR_MIN_TEXT_CHARS", "10".to_string());
        let config = AppConfig::from_lookup(|key| vars.get(key).cloned())?;

        let pool = db::init_pool_with_size(&config.database_url, 4)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let events = Arc::new(SwitchableEventBus {
            pool: pool.clone(),
            offline: AtomicBool::new(false),
        });
        let search = Arc::new(MemorySearchIndex::default());
        let state = AppState::new(
            pool,
            config,
            storage.clone(),
            events.clone(),
            search.clone(),
        );
        let router = routes::create_router(state.clone());

        Ok(Some(Self {
            state,
            router,
            storage,
            events,
            search,
        }))
    }

    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    pub fn events(&self) -> Arc<SwitchableEventBus> {
        self.events.clone()
    }

    #[allow(dead_code)]
    pub fn search(&self) -> Arc<MemorySearchIndex> {
        self.search.clone()
    }

    /// Runs both pipeline stages until no stage finds work.
    #[allow(dead_code)]
    pub async fn drain_pipeline(&self) -> Result<usize> {
        let state = Arc::new(self.state.clone());
        let handlers = handlers_for(
            &state,
            &[docarchive::workers::STAGE_OCR, docarchive::workers::STAGE_INDEX],
            Arc::new(TextFilePdfEngine),
        );
        let worker = Worker::new(state, handlers, Duration::from_millis(10));
        let mut ticks = 0;
        while worker.tick().await.map_err(|err| anyhow!("worker tick failed: {err}"))? {
            ticks += 1;
            if ticks > 50 {
                bail!("pipeline did not settle");
            }
        }
        Ok(ticks)
    }

    /// Creates a role and maps `operational_role` to `permission_names` for it.
    pub async fn create_role(
        &self,
        name: &str,
        operational_role: OperationalRole,
        permission_names: &[&str],
    ) -> Result<Uuid> {
        let name = name.to_string();
        let permission_names: Vec<String> = permission_names.iter().map(|p| p.to_string()).collect();
        self.with_conn(move |conn| {
            let role = NewRole {
                id: Uuid::new_v4(),
                name,
                description: None,
            };
            diesel::insert_into(roles::table)
                .values(&role)
                .execute(conn)
                .context("failed to insert role")?;

            let permission_ids: Vec<Uuid> = permissions::table
                .filter(permissions::name.eq_any(permission_names))
                .select(permissions::id)
                .load(conn)?;
            let rows: Vec<NewOperationalRolePermission> = permission_ids
                .into_iter()
                .map(|permission_id| NewOperationalRolePermission {
                    role_id: role.id,
                    operational_role: operational_role.as_str().to_string(),
                    permission_id,
                })
                .collect();
            if !rows.is_empty() {
                diesel::insert_into(operational_role_permissions::table)
                    .values(&rows)
                    .execute(conn)
                    .context("failed to map permissions")?;
            }
            Ok(role.id)
        })
        .await
    }

    pub async fn grant(
        &self,
        folder_id: Uuid,
        role_id: Uuid,
        operational_role: OperationalRole,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            diesel::insert_into(folder_role_grants::table)
                .values(&NewFolderGrant {
                    folder_id,
                    role_id,
                    operational_role: operational_role.as_str().to_string(),
                })
                .execute(conn)
                .context("failed to insert grant")?;
            Ok(())
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn events_on(&self, topic: &str) -> Result<Vec<Event>> {
        let topic = topic.to_string();
        self.with_conn(move |conn| {
            Ok(events::table
                .filter(events::topic.eq(topic))
                .order(events::created_at.asc())
                .load::<Event>(conn)?)
        })
        .await
    }

    /// Delivery status of `event_id` for `consumer_group`, if the group has
    /// seen it.
    #[allow(dead_code)]
    pub async fn delivery_status(&self, event_id: Uuid, consumer_group: &str) -> Result<Option<String>> {
        let consumer_group = consumer_group.to_string();
        self.with_conn(move |conn| {
            Ok(deliveries_of(conn, event_id)?
                .into_iter()
                .find(|delivery| delivery.consumer_group == consumer_group)
                .map(|delivery| delivery.status))
        })
        .await
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        caller: Option<&TestCaller>,
        payload: Option<&Value>,
    ) -> Result<(u16, Value)> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(caller) = caller {
            builder = builder
                .header(USER_ID_HEADER, caller.user_id.to_string())
                .header(USER_ROLES_HEADER, caller.roles.as_str());
        }
        let body = match payload {
            Some(payload) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(payload)?)
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(builder.body(body)?)
            .await
            .expect("infallible response");
        let status = response.status().as_u16();
        let bytes = body_to_vec(response.into_body()).await?;
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).context("response is not JSON")?
        };
        Ok((status, json))
    }

    pub async fn get(&self, path: &str, caller: &TestCaller) -> Result<(u16, Value)> {
        self.request(Method::GET, path, Some(caller), None).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        caller: &TestCaller,
    ) -> Result<(u16, Value)> {
        let payload = serde_json::to_value(payload)?;
        self.request(Method::POST, path, Some(caller), Some(&payload)).await
    }

    #[allow(dead_code)]
    pub async fn post_empty(&self, path: &str, caller: &TestCaller) -> Result<(u16, Value)> {
        self.request(Method::POST, path, Some(caller), None).await
    }

    #[allow(dead_code)]
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        caller: &TestCaller,
    ) -> Result<(u16, Value)> {
        let payload = serde_json::to_value(payload)?;
        self.request(Method::PUT, path, Some(caller), Some(&payload)).await
    }

    #[allow(dead_code)]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        caller: &TestCaller,
    ) -> Result<(u16, Value)> {
        let payload = serde_json::to_value(payload)?;
        self.request(Method::PATCH, path, Some(caller), Some(&payload)).await
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, caller: &TestCaller) -> Result<(u16, Value)> {
        self.request(Method::DELETE, path, Some(caller), None).await
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

/// Reads a UUID out of a JSON response at `pointer`.
pub fn uuid_at(json: &Value, pointer: &str) -> Result<Uuid> {
    let raw = json
        .pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("no string at {pointer} in {json}"))?;
    Ok(Uuid::parse_str(raw)?)
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        reset_tables(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn reset_tables(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE event_deliveries, events, document_version_pages, document_versions, documents, \
         folder_role_grants, operational_role_permissions, role_permissions, permissions, \
         roles, folders RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    conn.batch_execute(SEED_CATALOG)
        .context("failed to re-seed catalog")?;
    Ok(())
}
