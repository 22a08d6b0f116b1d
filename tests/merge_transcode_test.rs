use chrono::Utc;
use proctoring_backend::models::proctoring::{Locator, MediaChannel, MediaSegment, StorageKind};
use proctoring_backend::services::merge_service::{
    concatenate_segments, merged_file_name, probe_duration, run_transcode,
};
use tokio::process::Command;
use uuid::Uuid;

// Full media round trip against a real ffmpeg: generate a clip of known
// duration, split its bytes into sequenced chunks the way the capture
// client delivers them, concatenate in sequence order, transcode, and
// probe the merged file. Skipped quietly when no ffmpeg is installed.

const CLIP_SECS: f64 = 2.0;

async fn tool_available(path: &str) -> bool {
    Command::new(path)
        .arg("-version")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn merged_duration_matches_the_source_clip() {
    if !tool_available("ffmpeg").await || !tool_available("ffprobe").await {
        eprintln!("ffmpeg/ffprobe not installed, skipping");
        return;
    }

    let dir = std::env::temp_dir().join(format!("transcode-test-{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await.expect("mkdir");

    // A 2s sine clip stands in for the client's microphone capture.
    let source = dir.join("source.m4a");
    let generated = Command::new("ffmpeg")
        .args([
            "-y",
            "-f",
            "lavfi",
            "-i",
            &format!("sine=frequency=440:duration={}", CLIP_SECS),
            "-c:a",
            "aac",
        ])
        .arg(&source)
        .output()
        .await
        .expect("spawn ffmpeg");
    if !generated.status.success() {
        eprintln!("ffmpeg here cannot encode aac, skipping");
        return;
    }

    // Byte-split into three chunks recorded out of arrival order; only
    // the full concatenation is a valid container stream again.
    let bytes = tokio::fs::read(&source).await.expect("read source");
    let third = bytes.len() / 3;
    let parts: [(i64, &[u8]); 3] = [
        (1, &bytes[third..2 * third]),
        (0, &bytes[..third]),
        (2, &bytes[2 * third..]),
    ];
    let mut segments = Vec::new();
    for (sequence, chunk) in parts {
        let path = dir.join(format!("microphone-seq{}.bin", sequence));
        tokio::fs::write(&path, chunk).await.expect("write chunk");
        segments.push(MediaSegment {
            segment_id: format!("microphone-seq{}", sequence),
            channel: MediaChannel::Microphone,
            locator: Locator {
                backend: StorageKind::Local,
                key: path.to_string_lossy().into_owned(),
                public_url: None,
            },
            mime_type: "audio/mp4".to_string(),
            captured_at: Utc::now(),
            size_bytes: chunk.len() as i64,
            sequence: Some(sequence),
            duration_ms: None,
        });
    }
    segments.sort_by_key(|s| s.sequence);

    let concat = dir.join("microphone-concat.bin");
    concatenate_segments(&segments, &concat).await.expect("concat");
    assert_eq!(tokio::fs::read(&concat).await.expect("read concat"), bytes);

    let output = dir.join(merged_file_name(MediaChannel::Microphone));
    run_transcode("ffmpeg", MediaChannel::Microphone, &concat, &output)
        .await
        .expect("transcode");

    let duration = probe_duration("ffprobe", &output)
        .await
        .expect("probe duration");
    assert!(
        (duration - CLIP_SECS).abs() < 1.0,
        "merged duration {} strayed from the {}s source",
        duration,
        CLIP_SECS
    );

    tokio::fs::remove_dir_all(&dir).await.ok();
}
