mod common;

use anyhow::Result;
use common::{acquire_db_lock, uuid_at, TestApp, TestCaller};
use docarchive::models::OperationalRole;
use docarchive::permissions::{DOC_READ, FOLDER_READ};
use serde_json::json;

#[tokio::test]
async fn upload_commit_and_version_lifecycle() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let admin = TestCaller::admin();

    let (_, folder) = app
        .post_json("/api/folders", &json!({ "name": "Leases" }), &admin)
        .await?;
    let folder_id = uuid_at(&folder, "/folder/id")?;

    let (status, created) = app
        .post_json(
            &format!("/api/folders/{folder_id}/documents"),
            &json!({ "filename": "Lease (2024).pdf", "title": "Office lease" }),
            &admin,
        )
        .await?;
    assert_eq!(status, 201);
    let document_id = uuid_at(&created, "/document/id")?;
    let version_id = uuid_at(&created, "/version/id")?;
    assert_eq!(created["version"]["version_number"], 1);
    assert_eq!(created["version"]["upload_status"], "PENDING_UPLOAD");
    assert_eq!(created["version"]["ocr_status"], "NOT_STARTED");
    assert_eq!(created["document"]["latest_version_id"], serde_json::Value::Null);
    assert_eq!(created["upload"]["method"], "PUT");
    let key = created["upload"]["key"].as_str().unwrap_or_default().to_string();
    assert_eq!(
        key,
        format!("documents/{document_id}/v1/{version_id}-Lease__2024_.pdf")
    );

    let commit_path = format!("/api/versions/{version_id}/commit");
    let (status, body) = app.post_empty(&commit_path, &admin).await?;
    assert_eq!(status, 400, "nothing uploaded yet: {body}");
    assert_eq!(body["error"], "Uploaded object not found");

    app.storage().put(&key, b"first page of the lease".to_vec()).await;

    let (status, committed) = app.post_empty(&commit_path, &admin).await?;
    assert_eq!(status, 200);
    assert_eq!(committed["already_committed"], false);
    assert_eq!(committed["ocr_enqueued"], true);
    assert_eq!(committed["upload_status"], "UPLOADED");
    assert_eq!(committed["ocr_status"], "PENDING");
    assert_eq!(committed["size_bytes"], 23);
    assert_eq!(uuid_at(&committed, "/latest_version_id")?, version_id);

    let (status, again) = app.post_empty(&commit_path, &admin).await?;
    assert_eq!(status, 200);
    assert_eq!(again["already_committed"], true);
    assert_eq!(again["ocr_enqueued"], false);

    let published = app.events_on("document-version.created").await?;
    assert_eq!(published.len(), 1, "a repeated commit publishes nothing");
    assert_eq!(published[0].payload["versionId"], version_id.to_string());
    assert_eq!(published[0].payload["documentId"], document_id.to_string());
    assert_eq!(published[0].payload["folderId"], folder_id.to_string());

    let (status, link) = app
        .get(&format!("/api/versions/{version_id}/download"), &admin)
        .await?;
    assert_eq!(status, 200);
    assert!(link["url"].as_str().unwrap_or_default().contains(&key));

    let (status, second) = app
        .post_json(
            &format!("/api/documents/{document_id}/versions"),
            &json!({ "filename": "lease-signed.pdf" }),
            &admin,
        )
        .await?;
    assert_eq!(status, 201);
    assert_eq!(second["version"]["version_number"], 2);
    let second_id = uuid_at(&second, "/version/id")?;

    let (status, _) = app
        .get(&format!("/api/versions/{second_id}/download"), &admin)
        .await?;
    assert_eq!(status, 400, "pending uploads have nothing to download");

    let (status, versions) = app
        .get(&format!("/api/documents/{document_id}/versions"), &admin)
        .await?;
    assert_eq!(status, 200);
    let numbers: Vec<i64> = versions["versions"]
        .as_array()
        .map(|items| items.iter().filter_map(|v| v["version_number"].as_i64()).collect())
        .unwrap_or_default();
    assert_eq!(numbers, vec![2, 1]);
    assert_eq!(
        uuid_at(&versions, "/document/latest_version_id")?,
        version_id,
        "an uncommitted version does not become latest"
    );

    let (status, deleted) = app
        .delete(&format!("/api/documents/{document_id}"), &admin)
        .await?;
    assert_eq!(status, 200);
    assert_eq!(deleted["document"]["is_deleted"], true);

    let (status, _) = app
        .post_json(
            &format!("/api/documents/{document_id}/versions"),
            &json!({ "filename": "another.pdf" }),
            &admin,
        )
        .await?;
    assert_eq!(status, 400);

    let (status, listed) = app
        .get(&format!("/api/folders/{folder_id}/documents"), &admin)
        .await?;
    assert_eq!(status, 200);
    assert_eq!(listed["documents"].as_array().map(Vec::len), Some(1));

    let (status, restored) = app
        .post_empty(&format!("/api/documents/{document_id}/restore"), &admin)
        .await?;
    assert_eq!(status, 200);
    assert_eq!(restored["document"]["is_deleted"], false);

    Ok(())
}

#[tokio::test]
async fn commit_survives_a_broker_outage() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let admin = TestCaller::admin();

    let (_, created) = app
        .post_json(
            &format!("/api/folders/{}/documents", docarchive::access::ROOT_FOLDER_ID),
            &json!({ "filename": "invoice.pdf" }),
            &admin,
        )
        .await?;
    let version_id = uuid_at(&created, "/version/id")?;
    let key = created["upload"]["key"].as_str().unwrap_or_default().to_string();
    app.storage().put(&key, b"invoice".to_vec()).await;

    app.storage().set_unavailable(true);
    let (status, _) = app
        .post_empty(&format!("/api/versions/{version_id}/commit"), &admin)
        .await?;
    assert_eq!(status, 503);
    app.storage().set_unavailable(false);

    app.events().set_offline(true);
    let (status, committed) = app
        .post_empty(&format!("/api/versions/{version_id}/commit"), &admin)
        .await?;
    assert_eq!(status, 200, "the upload itself is durable");
    assert_eq!(committed["upload_status"], "UPLOADED");
    assert_eq!(committed["ocr_enqueued"], false);
    assert_eq!(committed["ocr_status"], "FAILED");
    assert!(committed["ocr_enqueue_error"].is_string());

    let (status, ocr) = app
        .get(&format!("/api/versions/{version_id}/ocr"), &admin)
        .await?;
    assert_eq!(status, 200);
    assert!(ocr["ocr_error"]
        .as_str()
        .unwrap_or_default()
        .starts_with("enqueue_failed:"));

    let (status, _) = app
        .post_empty(&format!("/api/versions/{version_id}/ocr/retry"), &admin)
        .await?;
    assert_eq!(status, 503);

    app.events().set_offline(false);
    let (status, retried) = app
        .post_empty(&format!("/api/versions/{version_id}/ocr/retry"), &admin)
        .await?;
    assert_eq!(status, 202);
    assert_eq!(retried["ocr_status"], "PENDING");
    assert_eq!(retried["enqueued"], true);
    assert_eq!(app.events_on("document-version.created").await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn readers_cannot_upload() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let admin = TestCaller::admin();
    let reader = TestCaller::with_roles("READERS");

    let role_id = app
        .create_role("READERS", OperationalRole::Viewer, &[FOLDER_READ, DOC_READ])
        .await?;
    let (_, folder) = app
        .post_json("/api/folders", &json!({ "name": "Shared" }), &admin)
        .await?;
    let folder_id = uuid_at(&folder, "/folder/id")?;
    app.grant(folder_id, role_id, OperationalRole::Viewer).await?;

    let (status, _) = app
        .post_json(
            &format!("/api/folders/{folder_id}/documents"),
            &json!({ "filename": "memo.pdf" }),
            &reader,
        )
        .await?;
    assert_eq!(status, 403);

    let (status, created) = app
        .post_json(
            &format!("/api/folders/{folder_id}/documents"),
            &json!({ "filename": "memo.pdf" }),
            &admin,
        )
        .await?;
    assert_eq!(status, 201);
    let document_id = uuid_at(&created, "/document/id")?;
    let version_id = uuid_at(&created, "/version/id")?;

    let (status, _) = app
        .get(&format!("/api/documents/{document_id}"), &reader)
        .await?;
    assert_eq!(status, 200);

    let (status, _) = app
        .post_empty(&format!("/api/versions/{version_id}/commit"), &reader)
        .await?;
    assert_eq!(status, 403);

    let (status, _) = app
        .delete(&format!("/api/documents/{document_id}"), &reader)
        .await?;
    assert_eq!(status, 403);

    let (status, _) = app
        .post_json(
            &format!("/api/folders/{folder_id}/documents"),
            &json!({ "filename": "  " }),
            &admin,
        )
        .await?;
    assert_eq!(status, 400);

    Ok(())
}
