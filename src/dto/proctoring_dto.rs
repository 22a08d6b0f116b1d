use crate::models::proctoring::{
    ChannelMergeStatus, Locator, MediaChannel, MediaSegment, ProctoringEvent, RiskLevel,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

// Wire contract is camelCase: these bodies are produced and consumed by
// the browser-side exam runtime.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: Option<String>,
    pub details: Option<serde_json::Value>,
    pub occurred_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LogEventsRequest {
    pub events: Vec<EventInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEventsResponse {
    pub events_logged: usize,
    pub trust_score: i32,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UploadSegmentRequest {
    /// webcam | screen | microphone
    pub media_type: String,
    /// Base64 payload, with or without a data-URL prefix.
    #[validate(length(min = 1))]
    pub data: String,
    pub mime_type: Option<String>,
    pub duration_ms: Option<i64>,
    pub sequence: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSegmentResponse {
    pub segment_id: String,
    pub size: usize,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctoringDetailResponse {
    pub attempt_id: uuid::Uuid,
    pub trust_score: i32,
    pub risk_level: RiskLevel,
    pub summary: String,
    pub recording_urls: HashMap<MediaChannel, Locator>,
    pub merge_status: HashMap<MediaChannel, ChannelMergeStatus>,
    pub events: Vec<ProctoringEvent>,
    pub media_segments: Vec<MediaSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueMergeResponse {
    pub attempt_id: uuid::Uuid,
    pub enqueued: bool,
}
