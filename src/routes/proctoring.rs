use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use base64::Engine;
use validator::Validate;

use crate::dto::proctoring_dto::{
    EnqueueMergeResponse, LogEventsRequest, LogEventsResponse, ProctoringDetailResponse,
    UploadSegmentRequest, UploadSegmentResponse,
};
use crate::error::Error;
use crate::models::proctoring::MediaChannel;
use crate::services::storage_service::parse_range_header;
use crate::AppState;

/// Decode a base64 payload that may carry a data-URL prefix
/// (`data:video/webm;base64,...`).
pub fn decode_media_payload(data: &str) -> crate::error::Result<Vec<u8>> {
    let raw = data
        .split_once("base64,")
        .map(|(_, rest)| rest)
        .unwrap_or(data);
    base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|e| Error::BadRequest(format!("Invalid base64 payload: {}", e)))
}

#[axum::debug_handler]
pub async fn log_events(
    State(state): State<AppState>,
    Path(attempt_id): Path<uuid::Uuid>,
    Json(req): Json<LogEventsRequest>,
) -> crate::error::Result<Response> {
    req.validate()?;
    let (events_logged, trust_score, risk_level) =
        state.proctoring.log_events(attempt_id, req.events).await?;
    Ok(Json(LogEventsResponse {
        events_logged,
        trust_score,
        risk_level,
    })
    .into_response())
}

#[axum::debug_handler]
pub async fn upload_segment(
    State(state): State<AppState>,
    Path(attempt_id): Path<uuid::Uuid>,
    Json(req): Json<UploadSegmentRequest>,
) -> crate::error::Result<Response> {
    req.validate()?;
    let bytes = decode_media_payload(&req.data)?;
    let segment = state
        .proctoring
        .store_segment(
            attempt_id,
            &req.media_type,
            bytes,
            req.mime_type,
            req.duration_ms,
            req.sequence,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(UploadSegmentResponse {
            segment_id: segment.segment_id,
            size: segment.size_bytes as usize,
            mime_type: segment.mime_type,
        }),
    )
        .into_response())
}

/// Multipart variant of segment upload: binary `file` field plus text
/// fields mirroring the JSON body.
#[axum::debug_handler]
pub async fn upload_segment_multipart(
    State(state): State<AppState>,
    Path(attempt_id): Path<uuid::Uuid>,
    mut multipart: Multipart,
) -> crate::error::Result<Response> {
    let mut media_type: Option<String> = None;
    let mut mime_type: Option<String> = None;
    let mut duration_ms: Option<i64> = None;
    let mut sequence: Option<i64> = None;
    let mut bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                if mime_type.is_none() {
                    mime_type = field.content_type().map(|s| s.to_string());
                }
                bytes = Some(field.bytes().await?.to_vec());
            }
            "mediaType" => media_type = Some(field.text().await?),
            "mimeType" => mime_type = Some(field.text().await?),
            "durationMs" => duration_ms = field.text().await?.trim().parse().ok(),
            "sequence" => sequence = field.text().await?.trim().parse().ok(),
            _ => {}
        }
    }

    let media_type =
        media_type.ok_or_else(|| Error::BadRequest("Missing mediaType field".to_string()))?;
    let bytes = bytes.ok_or(Error::EmptyPayload)?;

    let segment = state
        .proctoring
        .store_segment(attempt_id, &media_type, bytes, mime_type, duration_ms, sequence)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(UploadSegmentResponse {
            segment_id: segment.segment_id,
            size: segment.size_bytes as usize,
            mime_type: segment.mime_type,
        }),
    )
        .into_response())
}

#[axum::debug_handler]
pub async fn get_proctoring_detail(
    State(state): State<AppState>,
    Path(attempt_id): Path<uuid::Uuid>,
) -> crate::error::Result<Response> {
    let report = state.proctoring.detail(attempt_id).await?;
    Ok(Json(ProctoringDetailResponse {
        attempt_id,
        trust_score: report.trust_score,
        risk_level: report.risk_level,
        summary: report.summary,
        recording_urls: report.recording_urls,
        merge_status: report.merge_status,
        events: report.events,
        media_segments: report.media_segments,
    })
    .into_response())
}

/// Stream the channel's latest recording from whichever backend holds
/// it, honoring single-range requests with 206 responses.
#[axum::debug_handler]
pub async fn stream_media(
    State(state): State<AppState>,
    Path((attempt_id, channel)): Path<(uuid::Uuid, String)>,
    headers: HeaderMap,
) -> crate::error::Result<Response> {
    let channel =
        MediaChannel::parse(&channel).ok_or_else(|| Error::UnsupportedMediaType(channel))?;
    let report = state.proctoring.get_report(attempt_id).await?;
    let locator = report
        .recording_urls
        .get(&channel)
        .cloned()
        .ok_or_else(|| {
            Error::NotFound(format!("No recording for channel {}", channel.as_str()))
        })?;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    let read = state.storage.get(&locator, range).await?;
    let content_type = read
        .content_type
        .clone()
        .unwrap_or_else(|| content_type_for_key(&locator.key).to_string());

    let mut builder = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, content_type);
    builder = match read.range {
        Some((start, end)) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, read.total_size),
            )
            .header(header::CONTENT_LENGTH, end - start + 1),
        None => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, read.total_size),
    };
    builder
        .body(read.body)
        .map_err(|e| Error::Internal(format!("Failed to build media response: {}", e)))
}

/// Operator-facing (re-)enqueue; the exam-runtime collaborator calls the
/// same `MergeQueue::enqueue` directly on submission.
#[axum::debug_handler]
pub async fn enqueue_merge(
    State(state): State<AppState>,
    Path(attempt_id): Path<uuid::Uuid>,
) -> crate::error::Result<Response> {
    let enqueued = state.merge_queue.enqueue(attempt_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueMergeResponse {
            attempt_id,
            enqueued,
        }),
    )
        .into_response())
}

#[axum::debug_handler]
pub async fn queue_stats(State(state): State<AppState>) -> crate::error::Result<Response> {
    Ok(Json(state.merge_queue.stats()).into_response())
}

pub fn content_type_for_key(key: &str) -> &'static str {
    if key.ends_with(".mp4") {
        "video/mp4"
    } else if key.ends_with(".m4a") {
        "audio/mp4"
    } else if key.ends_with(".webm") {
        "video/webm"
    } else if key.ends_with(".ogg") {
        "audio/ogg"
    } else {
        "application/octet-stream"
    }
}
