use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = folders)]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub is_deleted: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = folders)]
pub struct NewFolder {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = roles)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = roles)]
pub struct NewRole {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = permissions)]
pub struct Permission {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = permissions)]
pub struct NewPermission {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = role_permissions)]
pub struct NewRolePermission {
    pub role_id: Uuid,
    pub permission_id: Uuid,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = operational_role_permissions)]
pub struct NewOperationalRolePermission {
    pub role_id: Uuid,
    pub operational_role: String,
    pub permission_id: Uuid,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = folder_role_grants)]
pub struct NewFolderGrant {
    pub folder_id: Uuid,
    pub role_id: Uuid,
    pub operational_role: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = documents)]
#[diesel(belongs_to(Folder, foreign_key = folder_id))]
pub struct Document {
    pub id: Uuid,
    pub folder_id: Uuid,
    pub title: Option<String>,
    pub latest_version_id: Option<Uuid>,
    pub is_deleted: bool,
    pub created_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub folder_id: Uuid,
    pub title: Option<String>,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = document_versions)]
#[diesel(belongs_to(Document))]
pub struct DocumentVersion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub version_number: i32,
    pub original_filename: String,
    pub storage_bucket: String,
    pub storage_key: String,
    pub content_type: String,
    pub size_bytes: Option<i64>,
    pub upload_status: String,
    pub uploaded_at: Option<NaiveDateTime>,
    pub uploader_id: Option<Uuid>,
    pub page_count: Option<i32>,
    pub ocr_status: String,
    pub ocr_attempts: i32,
    pub ocr_started_at: Option<NaiveDateTime>,
    pub ocr_completed_at: Option<NaiveDateTime>,
    pub ocr_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl DocumentVersion {
    pub fn is_uploaded(&self) -> bool {
        self.upload_status == UploadStatus::Uploaded.as_str()
    }

    pub fn ocr_state(&self) -> Option<OcrStatus> {
        self.ocr_status.parse().ok()
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_versions)]
pub struct NewDocumentVersion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub version_number: i32,
    pub original_filename: String,
    pub storage_bucket: String,
    pub storage_key: String,
    pub content_type: String,
    pub upload_status: String,
    pub uploader_id: Option<Uuid>,
    pub ocr_status: String,
    pub ocr_attempts: i32,
}

#[derive(Debug, Clone, Queryable, Associations)]
#[diesel(table_name = document_version_pages)]
#[diesel(belongs_to(DocumentVersion, foreign_key = version_id))]
#[diesel(primary_key(version_id, page_number))]
pub struct DocumentPage {
    pub version_id: Uuid,
    pub page_number: i32,
    pub text: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_version_pages)]
pub struct NewDocumentPage {
    pub version_id: Uuid,
    pub page_number: i32,
    pub text: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = events)]
pub struct Event {
    pub id: Uuid,
    pub topic: String,
    pub message_key: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = events)]
pub struct NewEvent {
    pub id: Uuid,
    pub topic: String,
    pub message_key: Option<String>,
    pub payload: serde_json::Value,
}

/// Progress of one consumer group on one event.
#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = event_deliveries, primary_key(event_id, consumer_group))]
pub struct EventDelivery {
    pub event_id: Uuid,
    pub consumer_group: String,
    pub status: String,
    pub attempts: i32,
    pub available_at: NaiveDateTime,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = event_deliveries)]
pub struct NewEventDelivery {
    pub event_id: Uuid,
    pub consumer_group: String,
    pub status: String,
    pub attempts: i32,
    pub available_at: NaiveDateTime,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationalRole {
    Owner,
    Viewer,
}

impl OperationalRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Viewer => "VIEWER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    PendingUpload,
    Uploaded,
}

impl UploadStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingUpload => "PENDING_UPLOAD",
            Self::Uploaded => "UPLOADED",
        }
    }
}

/// OCR lifecycle of a version. `Pending` can be re-entered from `Failed` or
/// `Completed` through an explicit retry; only the claim step moves a version
/// into `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OcrStatus {
    NotStarted,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OcrStatus {
    /// States a worker may claim a version from.
    pub const CLAIMABLE: [OcrStatus; 3] = [Self::NotStarted, Self::Pending, Self::Failed];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! impl_str_enum {
    ($ty:ty, [$($variant:expr),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let normalized = value.trim().to_ascii_uppercase();
                [$($variant),+]
                    .into_iter()
                    .find(|candidate| candidate.as_str() == normalized)
                    .ok_or_else(|| UnknownVariant(value.to_string()))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_str_enum!(OperationalRole, [OperationalRole::Owner, OperationalRole::Viewer]);
impl_str_enum!(
    UploadStatus,
    [UploadStatus::PendingUpload, UploadStatus::Uploaded]
);
impl_str_enum!(
    OcrStatus,
    [
        OcrStatus::NotStarted,
        OcrStatus::Pending,
        OcrStatus::Processing,
        OcrStatus::Completed,
        OcrStatus::Failed,
    ]
);

pub fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}

pub fn now_utc() -> NaiveDateTime {
    Utc::now().naive_utc()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_states_case_insensitively() {
        assert_eq!("processing".parse::<OcrStatus>(), Ok(OcrStatus::Processing));
        assert_eq!(" viewer ".parse::<OperationalRole>(), Ok(OperationalRole::Viewer));
        assert_eq!(
            "UPLOADED".parse::<UploadStatus>(),
            Ok(UploadStatus::Uploaded)
        );
    }

    #[test]
    fn rejects_unknown_operational_role() {
        assert!("EDITOR".parse::<OperationalRole>().is_err());
    }

    #[test]
    fn claimable_states_exclude_in_flight_and_completed() {
        assert!(!OcrStatus::CLAIMABLE.contains(&OcrStatus::Processing));
        assert!(!OcrStatus::CLAIMABLE.contains(&OcrStatus::Completed));
    }
}
