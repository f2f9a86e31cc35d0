use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Array, BigInt, Text, Timestamptz, Uuid as SqlUuid};
use serde_json::Value;
use thiserror::Error;
use tokio::task;
use uuid::Uuid;

use crate::db::PgPool;
use crate::models::{Event, EventDelivery, NewEvent, NewEventDelivery};
use crate::schema::{event_deliveries, events};

pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_DELIVERED: &str = "delivered";
pub const STATUS_DEAD_LETTERED: &str = "dead_lettered";

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("publish task failed: {0}")]
    Task(String),
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

pub type EventBusResult<T> = Result<T, EventBusError>;

/// Producer side of the topic log. Delivery to subscribers is at-least-once.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: Value)
        -> EventBusResult<Uuid>;
}

pub struct PgEventBus {
    pool: PgPool,
}

impl PgEventBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventBus for PgEventBus {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Value,
    ) -> EventBusResult<Uuid> {
        let pool = self.pool.clone();
        let topic = topic.to_string();
        let key = key.map(str::to_string);
        task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| EventBusError::Pool(err.to_string()))?;
            publish_event(&mut conn, &topic, key.as_deref(), payload).map(|event| event.id)
        })
        .await
        .map_err(|err| EventBusError::Task(err.to_string()))?
    }
}

pub fn publish_event(
    conn: &mut PgConnection,
    topic: &str,
    key: Option<&str>,
    payload: Value,
) -> EventBusResult<Event> {
    let new_event = NewEvent {
        id: Uuid::new_v4(),
        topic: topic.to_string(),
        message_key: key.map(str::to_string),
        payload,
    };

    let event = diesel::insert_into(events::table)
        .values(&new_event)
        .get_result(conn)?;
    Ok(event)
}

/// An event handed to one consumer group, with that group's delivery record.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub event: Event,
    pub delivery: EventDelivery,
}

#[derive(QueryableByName)]
struct CandidateRow {
    #[diesel(sql_type = SqlUuid)]
    id: Uuid,
}

// Every group sees every event on its topics. An event is deliverable to a
// group that never reserved it, or whose lease on it has run out.
const NEXT_FOR_GROUP_SQL: &str = "
    SELECT e.id
    FROM events e
    LEFT JOIN event_deliveries d
        ON d.event_id = e.id AND d.consumer_group = $2
    WHERE e.topic = ANY($1)
      AND (d.event_id IS NULL OR (d.status = 'processing' AND d.available_at <= $3))
    ORDER BY e.created_at ASC
    LIMIT 1
    FOR UPDATE OF e SKIP LOCKED";

/// Reserves the oldest event on `topics` that `consumer_group` has not yet
/// finished. A reservation left in `processing` past its lease is handed out
/// again, to the same group only.
pub fn reserve_event(
    conn: &mut PgConnection,
    topics: &[&str],
    consumer_group: &str,
    lease: Duration,
) -> EventBusResult<Option<Reservation>> {
    let now = Utc::now().naive_utc();
    let lease_until =
        now + ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::seconds(900));
    let topics: Vec<String> = topics.iter().map(|topic| topic.to_string()).collect();

    conn.transaction(|conn| {
        let candidate = diesel::sql_query(NEXT_FOR_GROUP_SQL)
            .bind::<Array<Text>, _>(topics)
            .bind::<Text, _>(consumer_group)
            .bind::<Timestamptz, _>(now)
            .get_result::<CandidateRow>(conn)
            .optional()?;

        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let event: Event = events::table.find(candidate.id).first(conn)?;
        let delivery = diesel::insert_into(event_deliveries::table)
            .values(&NewEventDelivery {
                event_id: event.id,
                consumer_group: consumer_group.to_string(),
                status: STATUS_PROCESSING.to_string(),
                attempts: 1,
                available_at: lease_until,
                last_error: None,
            })
            .on_conflict((event_deliveries::event_id, event_deliveries::consumer_group))
            .do_update()
            .set((
                event_deliveries::status.eq(STATUS_PROCESSING),
                event_deliveries::attempts.eq(event_deliveries::attempts + 1),
                event_deliveries::available_at.eq(lease_until),
                event_deliveries::updated_at.eq(now),
            ))
            .get_result::<EventDelivery>(conn)?;

        Ok(Some(Reservation { event, delivery }))
    })
}

/// Records the final state of `consumer_group` on an event. Works whether or
/// not the group reserved the event first.
fn settle(
    conn: &mut PgConnection,
    event_id: Uuid,
    consumer_group: &str,
    status: &str,
    error_message: Option<&str>,
) -> EventBusResult<()> {
    let now = Utc::now().naive_utc();
    let last_error = error_message.map(str::to_string);
    diesel::insert_into(event_deliveries::table)
        .values(&NewEventDelivery {
            event_id,
            consumer_group: consumer_group.to_string(),
            status: status.to_string(),
            attempts: 0,
            available_at: now,
            last_error: last_error.clone(),
        })
        .on_conflict((event_deliveries::event_id, event_deliveries::consumer_group))
        .do_update()
        .set((
            event_deliveries::status.eq(status),
            event_deliveries::last_error.eq(last_error),
            event_deliveries::updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_event_delivered(
    conn: &mut PgConnection,
    event_id: Uuid,
    consumer_group: &str,
) -> EventBusResult<()> {
    settle(conn, event_id, consumer_group, STATUS_DELIVERED, None)
}

pub fn mark_event_dead_lettered(
    conn: &mut PgConnection,
    event_id: Uuid,
    consumer_group: &str,
    error_message: &str,
) -> EventBusResult<()> {
    settle(
        conn,
        event_id,
        consumer_group,
        STATUS_DEAD_LETTERED,
        Some(error_message),
    )
}

const UNSETTLED_FOR_GROUP_SQL: &str = "
    SELECT e.id
    FROM events e
    WHERE e.topic = $1
      AND NOT EXISTS (
          SELECT 1 FROM event_deliveries d
          WHERE d.event_id = e.id
            AND d.consumer_group = $2
            AND d.status IN ('delivered', 'dead_lettered')
      )
    ORDER BY e.created_at ASC
    LIMIT $3";

/// Events on `topic` that `consumer_group` has not settled, oldest first.
pub fn list_unsettled_events(
    conn: &mut PgConnection,
    topic: &str,
    consumer_group: &str,
    limit: i64,
) -> EventBusResult<Vec<Event>> {
    let ids: Vec<Uuid> = diesel::sql_query(UNSETTLED_FOR_GROUP_SQL)
        .bind::<Text, _>(topic)
        .bind::<Text, _>(consumer_group)
        .bind::<BigInt, _>(limit.max(1))
        .load::<CandidateRow>(conn)?
        .into_iter()
        .map(|row| row.id)
        .collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(events::table
        .filter(events::id.eq_any(ids))
        .order(events::created_at.asc())
        .load(conn)?)
}

pub fn deliveries_of(conn: &mut PgConnection, event_id: Uuid) -> EventBusResult<Vec<EventDelivery>> {
    Ok(event_deliveries::table
        .filter(event_deliveries::event_id.eq(event_id))
        .order(event_deliveries::consumer_group.asc())
        .load(conn)?)
}
