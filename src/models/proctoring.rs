use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Oldest events are evicted once the report holds this many.
pub const EVENT_CAP: usize = 120;
/// Oldest segment records are evicted once the report holds this many.
pub const SEGMENT_CAP: usize = 24;
pub const INITIAL_TRUST_SCORE: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Low,
    Medium,
    High,
}

impl EventSeverity {
    /// Unknown or missing severities are treated as low.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("high") => EventSeverity::High,
            Some("medium") => EventSeverity::Medium,
            _ => EventSeverity::Low,
        }
    }

    /// Fixed trust-score deduction per event of this severity.
    pub fn deduction(self) -> i32 {
        match self {
            EventSeverity::Low => 2,
            EventSeverity::Medium => 7,
            EventSeverity::High => 15,
        }
    }

    pub fn rank(self) -> usize {
        match self {
            EventSeverity::Low => 0,
            EventSeverity::Medium => 1,
            EventSeverity::High => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventSeverity::Low => "low",
            EventSeverity::Medium => "medium",
            EventSeverity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Rank-indexed lookup table so a numeric rank maps back to its level
/// without relying on map iteration order.
const RISK_LEVELS: [RiskLevel; 3] = [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High];

impl RiskLevel {
    pub fn rank(self) -> usize {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
        }
    }

    pub fn from_rank(rank: usize) -> Self {
        RISK_LEVELS[rank.min(RISK_LEVELS.len() - 1)]
    }

    /// Level implied by the current trust-score trajectory.
    pub fn from_trust_score(score: i32) -> Self {
        if score < 40 {
            RiskLevel::High
        } else if score < 70 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaChannel {
    Webcam,
    Screen,
    Microphone,
}

impl MediaChannel {
    /// Fixed processing order for merges.
    pub const ALL: [MediaChannel; 3] = [
        MediaChannel::Webcam,
        MediaChannel::Screen,
        MediaChannel::Microphone,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "webcam" => Some(MediaChannel::Webcam),
            "screen" => Some(MediaChannel::Screen),
            "microphone" => Some(MediaChannel::Microphone),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaChannel::Webcam => "webcam",
            MediaChannel::Screen => "screen",
            MediaChannel::Microphone => "microphone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    S3,
    Local,
}

/// Opaque reference to a stored blob: an object key (S3) or an absolute
/// path (local), plus a directly fetchable URL when one exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Locator {
    pub backend: StorageKind,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

impl Locator {
    /// Public URL when available, otherwise the raw key/path.
    pub fn best_url(&self) -> &str {
        self.public_url.as_deref().unwrap_or(&self.key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctoringEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: EventSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSegment {
    pub segment_id: String,
    pub channel: MediaChannel,
    pub locator: Locator,
    pub mime_type: String,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeState {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMergeStatus {
    pub state: MergeState,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-attempt proctoring state, stored as one JSONB document.
///
/// Mutated by three independent actors (event ingestion, media ingestion,
/// merge engine); all persistence goes through read-modify-write against
/// the current row, never a cached copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctoringReport {
    pub events: Vec<ProctoringEvent>,
    pub trust_score: i32,
    pub risk_level: RiskLevel,
    pub summary: String,
    pub media_segments: Vec<MediaSegment>,
    #[serde(default)]
    pub recording_urls: HashMap<MediaChannel, Locator>,
    #[serde(default)]
    pub merge_status: HashMap<MediaChannel, ChannelMergeStatus>,
}

impl Default for ProctoringReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ProctoringReport {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            trust_score: INITIAL_TRUST_SCORE,
            risk_level: RiskLevel::Low,
            summary: String::new(),
            media_segments: Vec::new(),
            recording_urls: HashMap::new(),
            merge_status: HashMap::new(),
        }
    }

    /// Append a batch of already-normalized events, deduct trust score,
    /// raise (never lower) the risk level, and evict past the cap.
    pub fn apply_events(&mut self, batch: Vec<ProctoringEvent>) -> (i32, RiskLevel) {
        let mut max_rank = self.risk_level.rank();
        for event in batch {
            self.trust_score = (self.trust_score - event.severity.deduction()).max(0);
            max_rank = max_rank.max(event.severity.rank());
            self.events.push(event);
        }
        max_rank = max_rank.max(RiskLevel::from_trust_score(self.trust_score).rank());
        self.risk_level = RiskLevel::from_rank(max_rank);

        if self.events.len() > EVENT_CAP {
            let excess = self.events.len() - EVENT_CAP;
            self.events.drain(..excess);
        }
        self.rebuild_summary();
        (self.trust_score, self.risk_level)
    }

    /// Append a segment record, point the channel's recording locator at
    /// it, and evict past the cap.
    pub fn record_segment(&mut self, segment: MediaSegment) {
        self.recording_urls
            .insert(segment.channel, segment.locator.clone());
        self.media_segments.push(segment);
        if self.media_segments.len() > SEGMENT_CAP {
            let excess = self.media_segments.len() - SEGMENT_CAP;
            self.media_segments.drain(..excess);
        }
    }

    pub fn set_merge_state(
        &mut self,
        channel: MediaChannel,
        state: MergeState,
        error: Option<String>,
    ) {
        self.merge_status.insert(
            channel,
            ChannelMergeStatus {
                state,
                updated_at: Utc::now(),
                error,
            },
        );
    }

    /// Channels still marked pending or processing, used when a merge run
    /// dies mid-flight and must leave a terminal status behind.
    pub fn unfinished_merge_channels(&self) -> Vec<MediaChannel> {
        MediaChannel::ALL
            .into_iter()
            .filter(|ch| {
                matches!(
                    self.merge_status.get(ch).map(|s| s.state),
                    Some(MergeState::Pending) | Some(MergeState::Processing)
                )
            })
            .collect()
    }

    /// Drop segment records whose underlying chunk files were consumed
    /// by a successful merge. A channel with no remaining eligible
    /// segments is skipped by later merges, leaving its completed
    /// status in place.
    pub fn purge_segments(&mut self, segment_ids: &[String]) {
        self.media_segments
            .retain(|s| !segment_ids.contains(&s.segment_id));
    }

    /// Locally staged segments for one channel that carry a sequence
    /// number, in ascending sequence order. Segments without a sequence
    /// cannot be ordered and are excluded; already-durable remote
    /// segments are left as-is.
    pub fn segments_for_merge(&self, channel: MediaChannel) -> Vec<MediaSegment> {
        let mut eligible: Vec<MediaSegment> = self
            .media_segments
            .iter()
            .filter(|s| {
                s.channel == channel
                    && s.locator.backend == StorageKind::Local
                    && s.sequence.is_some()
            })
            .cloned()
            .collect();
        eligible.sort_by_key(|s| s.sequence);
        eligible
    }

    fn rebuild_summary(&mut self) {
        let high = self
            .events
            .iter()
            .filter(|e| e.severity == EventSeverity::High)
            .count();
        let medium = self
            .events
            .iter()
            .filter(|e| e.severity == EventSeverity::Medium)
            .count();
        self.summary = format!(
            "{} events recorded ({} high, {} medium); trust score {}; risk {}",
            self.events.len(),
            high,
            medium,
            self.trust_score,
            self.risk_level.as_str()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(severity: EventSeverity) -> ProctoringEvent {
        ProctoringEvent {
            event_type: "tab_hidden".to_string(),
            severity,
            details: None,
            occurred_at: Utc::now(),
        }
    }

    fn local_segment(channel: MediaChannel, sequence: Option<i64>, size: i64) -> MediaSegment {
        MediaSegment {
            segment_id: format!("{}-{}", channel.as_str(), uuid::Uuid::new_v4()),
            channel,
            locator: Locator {
                backend: StorageKind::Local,
                key: format!("/tmp/{}", uuid::Uuid::new_v4()),
                public_url: None,
            },
            mime_type: "video/webm".to_string(),
            captured_at: Utc::now(),
            size_bytes: size,
            sequence,
            duration_ms: Some(3000),
        }
    }

    #[test]
    fn severity_deductions_are_fixed_and_floored() {
        let mut report = ProctoringReport::new();
        report.apply_events(vec![event(EventSeverity::Low)]);
        assert_eq!(report.trust_score, 98);
        report.apply_events(vec![event(EventSeverity::Medium)]);
        assert_eq!(report.trust_score, 91);
        report.apply_events(vec![event(EventSeverity::High)]);
        assert_eq!(report.trust_score, 76);

        for _ in 0..20 {
            report.apply_events(vec![event(EventSeverity::High)]);
        }
        assert_eq!(report.trust_score, 0);
    }

    #[test]
    fn risk_level_never_decreases() {
        let mut report = ProctoringReport::new();
        let (_, risk) = report.apply_events(vec![event(EventSeverity::High)]);
        assert_eq!(risk, RiskLevel::High);
        let (_, risk) = report.apply_events(vec![event(EventSeverity::Low)]);
        assert_eq!(risk, RiskLevel::High);
    }

    #[test]
    fn trust_score_trajectory_raises_risk() {
        let mut report = ProctoringReport::new();
        // 16 low events, no single one above "low", but trust drops to 68.
        let batch: Vec<_> = (0..16).map(|_| event(EventSeverity::Low)).collect();
        let (score, risk) = report.apply_events(batch);
        assert_eq!(score, 68);
        assert_eq!(risk, RiskLevel::Medium);
    }

    #[test]
    fn risk_from_rank_is_table_driven_and_clamped() {
        assert_eq!(RiskLevel::from_rank(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_rank(1), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_rank(2), RiskLevel::High);
        assert_eq!(RiskLevel::from_rank(99), RiskLevel::High);
    }

    #[test]
    fn events_evict_oldest_past_cap() {
        let mut report = ProctoringReport::new();
        for i in 0..(EVENT_CAP + 10) {
            let mut e = event(EventSeverity::Low);
            e.event_type = format!("event_{}", i);
            report.apply_events(vec![e]);
        }
        assert_eq!(report.events.len(), EVENT_CAP);
        assert_eq!(report.events[0].event_type, "event_10");
    }

    #[test]
    fn segments_evict_oldest_past_cap() {
        let mut report = ProctoringReport::new();
        for i in 0..(SEGMENT_CAP + 4) {
            report.record_segment(local_segment(MediaChannel::Webcam, Some(i as i64), 1024));
        }
        assert_eq!(report.media_segments.len(), SEGMENT_CAP);
        assert_eq!(report.media_segments[0].sequence, Some(4));
    }

    #[test]
    fn merge_eligibility_orders_by_sequence_and_drops_unordered() {
        let mut report = ProctoringReport::new();
        report.record_segment(local_segment(MediaChannel::Webcam, Some(2), 10 * 1024));
        report.record_segment(local_segment(MediaChannel::Webcam, Some(0), 12 * 1024));
        report.record_segment(local_segment(MediaChannel::Webcam, None, 512));
        report.record_segment(local_segment(MediaChannel::Webcam, Some(1), 9 * 1024));
        report.record_segment(local_segment(MediaChannel::Screen, Some(0), 2048));

        let eligible = report.segments_for_merge(MediaChannel::Webcam);
        let sequences: Vec<_> = eligible.iter().map(|s| s.sequence.unwrap()).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        let total: i64 = eligible.iter().map(|s| s.size_bytes).sum();
        assert_eq!(total, 31 * 1024);
    }

    #[test]
    fn purged_segments_leave_no_merge_work_behind() {
        let mut report = ProctoringReport::new();
        for i in 0..3 {
            report.record_segment(local_segment(MediaChannel::Webcam, Some(i), 2048));
        }
        report.set_merge_state(MediaChannel::Webcam, MergeState::Completed, None);

        let consumed: Vec<String> = report
            .media_segments
            .iter()
            .map(|s| s.segment_id.clone())
            .collect();
        report.purge_segments(&consumed);

        // No eligible segments left: a re-enqueued merge skips the
        // channel and the completed status survives.
        assert!(report.segments_for_merge(MediaChannel::Webcam).is_empty());
        assert_eq!(
            report.merge_status[&MediaChannel::Webcam].state,
            MergeState::Completed
        );
    }

    #[test]
    fn remote_segments_are_excluded_from_merge() {
        let mut report = ProctoringReport::new();
        let mut remote = local_segment(MediaChannel::Screen, Some(0), 4096);
        remote.locator.backend = StorageKind::S3;
        report.record_segment(remote);
        assert!(report.segments_for_merge(MediaChannel::Screen).is_empty());
    }

    #[test]
    fn recording_url_tracks_latest_segment() {
        let mut report = ProctoringReport::new();
        let first = local_segment(MediaChannel::Webcam, Some(0), 2048);
        let second = local_segment(MediaChannel::Webcam, Some(1), 2048);
        let second_key = second.locator.key.clone();
        report.record_segment(first);
        report.record_segment(second);
        assert_eq!(
            report.recording_urls[&MediaChannel::Webcam].key,
            second_key
        );
    }

    #[test]
    fn report_round_trips_through_json() {
        let mut report = ProctoringReport::new();
        report.apply_events(vec![event(EventSeverity::Medium)]);
        report.record_segment(local_segment(MediaChannel::Webcam, Some(0), 2048));
        report.set_merge_state(MediaChannel::Webcam, MergeState::Pending, None);

        let value = serde_json::to_value(&report).expect("serialize");
        assert_eq!(value["trustScore"], 93);
        assert_eq!(value["riskLevel"], "medium");
        let back: ProctoringReport = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back.trust_score, report.trust_score);
        assert_eq!(back.media_segments.len(), 1);
    }
}
