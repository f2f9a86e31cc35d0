mod common;

use std::time::Duration;

use anyhow::Result;
use common::{acquire_db_lock, TestApp};
use docarchive::events::{
    deliveries_of, list_unsettled_events, mark_event_dead_lettered, mark_event_delivered,
    reserve_event, STATUS_DEAD_LETTERED, STATUS_DELIVERED, STATUS_PROCESSING,
};
use serde_json::json;

const TOPIC: &str = "document-version.audited";
const LEASE: Duration = Duration::from_secs(300);

#[tokio::test]
async fn every_consumer_group_receives_each_event() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let event_id = app
        .state
        .events
        .publish(TOPIC, None, json!({ "versionId": uuid::Uuid::new_v4() }))
        .await?;

    let (archive, archive_again, audit, audit_again) = app
        .with_conn(|conn| {
            let archive = reserve_event(conn, &[TOPIC], "archive", LEASE)?;
            let archive_again = reserve_event(conn, &[TOPIC], "archive", LEASE)?;
            let audit = reserve_event(conn, &[TOPIC], "audit", LEASE)?;
            let audit_again = reserve_event(conn, &[TOPIC], "audit", LEASE)?;
            Ok((archive, archive_again, audit, audit_again))
        })
        .await?;

    let archive = archive.expect("archive reservation");
    let audit = audit.expect("audit reservation");
    assert_eq!(archive.event.id, event_id);
    assert_eq!(audit.event.id, event_id, "a second group still sees the event");
    assert_eq!(archive.delivery.status, STATUS_PROCESSING);
    assert_eq!(audit.delivery.attempts, 1);
    assert!(archive_again.is_none(), "a leased event is not handed out twice");
    assert!(audit_again.is_none());

    let deliveries = app
        .with_conn(move |conn| {
            mark_event_delivered(conn, event_id, "archive")?;
            mark_event_dead_lettered(conn, event_id, "audit", "rejected")?;
            Ok(deliveries_of(conn, event_id)?)
        })
        .await?;
    let summary: Vec<(&str, &str)> = deliveries
        .iter()
        .map(|delivery| (delivery.consumer_group.as_str(), delivery.status.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![("archive", STATUS_DELIVERED), ("audit", STATUS_DEAD_LETTERED)]
    );
    assert_eq!(deliveries[1].last_error.as_deref(), Some("rejected"));

    let (late_joiner, settled) = app
        .with_conn(|conn| {
            let late_joiner = reserve_event(conn, &[TOPIC], "reporting", LEASE)?;
            let settled = reserve_event(conn, &[TOPIC], "archive", LEASE)?;
            Ok((late_joiner, settled))
        })
        .await?;
    assert_eq!(late_joiner.map(|reserved| reserved.event.id), Some(event_id));
    assert!(settled.is_none(), "settled events stay settled for their group");

    Ok(())
}

#[tokio::test]
async fn expired_leases_are_redelivered_to_the_same_group() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let event_id = app.state.events.publish(TOPIC, None, json!({})).await?;

    let (first, second) = app
        .with_conn(|conn| {
            let first = reserve_event(conn, &[TOPIC], "archive", Duration::ZERO)?;
            std::thread::sleep(Duration::from_millis(5));
            let second = reserve_event(conn, &[TOPIC], "archive", LEASE)?;
            Ok((first, second))
        })
        .await?;

    assert_eq!(first.map(|reserved| reserved.delivery.attempts), Some(1));
    let second = second.expect("redelivery");
    assert_eq!(second.event.id, event_id);
    assert_eq!(second.delivery.attempts, 2);

    Ok(())
}

#[tokio::test]
async fn unsettled_listing_is_per_group() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let first = app.state.events.publish("ocr.dlq", None, json!({ "n": 1 })).await?;
    let second = app.state.events.publish("ocr.dlq", None, json!({ "n": 2 })).await?;

    let (replay, other) = app
        .with_conn(move |conn| {
            mark_event_delivered(conn, first, "replay")?;
            let replay = list_unsettled_events(conn, "ocr.dlq", "replay", 10)?;
            let other = list_unsettled_events(conn, "ocr.dlq", "audit", 10)?;
            Ok((replay, other))
        })
        .await?;

    assert_eq!(replay.iter().map(|event| event.id).collect::<Vec<_>>(), vec![second]);
    assert_eq!(other.len(), 2);

    Ok(())
}
