use crate::dto::proctoring_dto::EventInput;
use crate::error::{Error, Result};
use crate::models::proctoring::{
    EventSeverity, MediaChannel, MediaSegment, ProctoringEvent, ProctoringReport, RiskLevel,
};
use crate::services::storage_service::StorageService;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Hard ceiling for one decoded media segment.
pub const MAX_SEGMENT_BYTES: usize = 8 * 1024 * 1024;
/// Segments below this are accepted but logged; legitimate final flush
/// chunks can be tiny.
pub const TINY_SEGMENT_BYTES: usize = 1024;

#[derive(Clone)]
pub struct ProctoringService {
    pool: PgPool,
    storage: Arc<StorageService>,
}

/// Defaults applied to a raw event batch: unknown severity becomes low,
/// a missing timestamp becomes ingestion time.
pub fn normalize_events(batch: Vec<EventInput>) -> Vec<ProctoringEvent> {
    let now = Utc::now();
    batch
        .into_iter()
        .map(|e| ProctoringEvent {
            event_type: e.event_type,
            severity: EventSeverity::parse(e.severity.as_deref()),
            details: e.details,
            occurred_at: e.occurred_at.unwrap_or(now),
        })
        .collect()
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let mime = mime.to_ascii_lowercase();
    if mime.contains("webm") {
        "webm"
    } else if mime.contains("mp4") {
        "mp4"
    } else if mime.contains("ogg") {
        "ogg"
    } else if mime.contains("wav") {
        "wav"
    } else {
        "bin"
    }
}

impl ProctoringService {
    pub fn new(pool: PgPool, storage: Arc<StorageService>) -> Self {
        Self { pool, storage }
    }

    /// Validate, normalize and append one behavioral event batch, then
    /// rescore trust and risk. Returns (events logged, trust, risk).
    pub async fn log_events(
        &self,
        attempt_id: Uuid,
        batch: Vec<EventInput>,
    ) -> Result<(usize, i32, RiskLevel)> {
        if batch.is_empty() {
            return Err(Error::NoEventsProvided);
        }
        let events = normalize_events(batch);
        let logged = events.len();

        let (trust, risk) = self
            .update_report(attempt_id, move |report| report.apply_events(events))
            .await?;
        Ok((logged, trust, risk))
    }

    /// Persist one media segment blob and its record. The payload must
    /// already be decoded from its transport encoding. Duplicate sequence
    /// numbers are not rejected; the upload path is at-least-once and the
    /// merge engine tolerates replays.
    pub async fn store_segment(
        &self,
        attempt_id: Uuid,
        media_type: &str,
        bytes: Vec<u8>,
        mime_type: Option<String>,
        duration_ms: Option<i64>,
        sequence: Option<i64>,
    ) -> Result<MediaSegment> {
        let channel = MediaChannel::parse(media_type)
            .ok_or_else(|| Error::UnsupportedMediaType(media_type.to_string()))?;
        if bytes.is_empty() {
            return Err(Error::EmptyPayload);
        }
        if bytes.len() > MAX_SEGMENT_BYTES {
            return Err(Error::PayloadTooLarge {
                size: bytes.len(),
                limit: MAX_SEGMENT_BYTES,
            });
        }
        if bytes.len() < TINY_SEGMENT_BYTES {
            warn!(
                attempt_id = %attempt_id,
                channel = channel.as_str(),
                size = bytes.len(),
                "Suspiciously small media segment accepted"
            );
        }

        let mime_type = mime_type.unwrap_or_else(|| "video/webm".to_string());
        let segment_id = format!("{}-{}", channel.as_str(), Uuid::new_v4());
        let blob_id = format!("{}.{}", segment_id, extension_for_mime(&mime_type));

        let locator = self
            .storage
            .put(attempt_id, &blob_id, &bytes, &mime_type)
            .await?;

        let segment = MediaSegment {
            segment_id,
            channel,
            locator,
            mime_type,
            captured_at: Utc::now(),
            size_bytes: bytes.len() as i64,
            sequence,
            duration_ms,
        };

        let stored = segment.clone();
        self.update_report(attempt_id, move |report| report.record_segment(stored))
            .await?;
        Ok(segment)
    }

    pub async fn detail(&self, attempt_id: Uuid) -> Result<ProctoringReport> {
        self.get_report(attempt_id).await
    }

    pub async fn get_report(&self, attempt_id: Uuid) -> Result<ProctoringReport> {
        let value: serde_json::Value =
            sqlx::query_scalar(r#"SELECT report FROM proctoring_reports WHERE attempt_id = $1"#)
                .bind(attempt_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!("No proctoring report for attempt {}", attempt_id))
                })?;
        Ok(serde_json::from_value(value)?)
    }

    /// Terminal merge failure: stamp every channel still pending or
    /// processing as failed so no observer is left with a stale status.
    pub async fn mark_merge_failed(&self, attempt_id: Uuid, message: &str) -> Result<()> {
        let message = message.to_string();
        self.update_report(attempt_id, move |report| {
            for channel in report.unfinished_merge_channels() {
                report.set_merge_state(
                    channel,
                    crate::models::proctoring::MergeState::Failed,
                    Some(message.clone()),
                );
            }
        })
        .await
    }

    /// Read-modify-write against the current row inside one transaction.
    /// The report row is created lazily on first touch; the insert is
    /// atomic so the first writer wins and concurrent bootstraps collapse
    /// into one row.
    pub async fn update_report<F, T>(&self, attempt_id: Uuid, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut ProctoringReport) -> T,
    {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO proctoring_reports (attempt_id, report)
            VALUES ($1, $2)
            ON CONFLICT (attempt_id) DO NOTHING
            "#,
        )
        .bind(attempt_id)
        .bind(serde_json::to_value(ProctoringReport::new())?)
        .execute(&mut *tx)
        .await?;

        let value: serde_json::Value = sqlx::query_scalar(
            r#"SELECT report FROM proctoring_reports WHERE attempt_id = $1 FOR UPDATE"#,
        )
        .bind(attempt_id)
        .fetch_one(&mut *tx)
        .await?;
        let mut report: ProctoringReport = serde_json::from_value(value)?;

        let out = mutate(&mut report);

        sqlx::query(
            r#"UPDATE proctoring_reports SET report = $2, updated_at = NOW() WHERE attempt_id = $1"#,
        )
        .bind(attempt_id)
        .bind(serde_json::to_value(&report)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_defaults_severity_and_timestamp() {
        let before = Utc::now();
        let events = normalize_events(vec![
            EventInput {
                event_type: "tab_hidden".to_string(),
                severity: Some("HIGH".to_string()),
                details: None,
                occurred_at: None,
            },
            EventInput {
                event_type: "noise".to_string(),
                severity: Some("unknown-tag".to_string()),
                details: Some(serde_json::json!({"db": 42})),
                occurred_at: None,
            },
            EventInput {
                event_type: "idle".to_string(),
                severity: None,
                details: None,
                occurred_at: None,
            },
        ]);

        assert_eq!(events[0].severity, EventSeverity::High);
        assert_eq!(events[1].severity, EventSeverity::Low);
        assert_eq!(events[2].severity, EventSeverity::Low);
        assert!(events.iter().all(|e| e.occurred_at >= before));
    }

    #[test]
    fn mime_extension_mapping() {
        assert_eq!(extension_for_mime("video/webm;codecs=vp9"), "webm");
        assert_eq!(extension_for_mime("audio/WEBM"), "webm");
        assert_eq!(extension_for_mime("video/mp4"), "mp4");
        assert_eq!(extension_for_mime("application/octet-stream"), "bin");
    }
}
