use crate::error::{Error, Result};
use crate::models::proctoring::{Locator, MediaChannel, MediaSegment, MergeState, StorageKind};
use crate::services::proctoring_service::{extension_for_mime, ProctoringService};
use crate::services::storage_service::StorageService;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Cap on transcoder diagnostics carried into error messages.
const DIAGNOSTIC_LIMIT: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub media_root: PathBuf,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Opt-in deletion of the original chunk files after a fully
    /// successful merge. Destructive and irreversible.
    pub cleanup_segments: bool,
}

impl MergeSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            media_root: PathBuf::from(&config.media_root),
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
            cleanup_segments: config.cleanup_segments_after_merge,
        }
    }
}

/// Verify the transcoder binary is runnable. Merge-capable processes
/// treat a missing binary as a fatal configuration error at startup.
pub async fn check_transcoder(ffmpeg_path: &str) -> Result<()> {
    let output = Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .await
        .map_err(|e| Error::Config(format!("Transcoder '{}' is not available: {}", ffmpeg_path, e)))?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "Transcoder '{}' exited with {}",
            ffmpeg_path, output.status
        )));
    }
    Ok(())
}

/// Argument vector for the per-channel transcode. Always an exec-style
/// invocation; paths never pass through a shell.
pub fn transcode_args(channel: MediaChannel, input: &Path, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-fflags".into(),
        "+genpts".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
    ];
    let profile: &[&str] = match channel {
        MediaChannel::Webcam => &[
            "-c:v", "libx264", "-preset", "fast", "-b:v", "1000k", "-c:a", "aac", "-b:a", "128k",
        ],
        MediaChannel::Screen => &["-c:v", "libx264", "-preset", "fast", "-b:v", "1500k", "-an"],
        MediaChannel::Microphone => &["-vn", "-c:a", "aac", "-b:a", "128k"],
    };
    args.extend(profile.iter().map(|s| s.to_string()));
    args.push(output.to_string_lossy().into_owned());
    args
}

pub fn merged_file_name(channel: MediaChannel) -> &'static str {
    match channel {
        MediaChannel::Webcam => "webcam-recording.mp4",
        MediaChannel::Screen => "screen-recording.mp4",
        MediaChannel::Microphone => "microphone-recording.m4a",
    }
}

fn merged_content_type(channel: MediaChannel) -> &'static str {
    match channel {
        MediaChannel::Microphone => "audio/mp4",
        _ => "video/mp4",
    }
}

/// Concatenate segment payloads in the given order into one file. The
/// capture format emits headerless continuation chunks after the first,
/// so only the full concatenation is a valid container stream.
pub async fn concatenate_segments(segments: &[MediaSegment], dest: &Path) -> Result<u64> {
    let mut blob: Vec<u8> = Vec::new();
    for segment in segments {
        let bytes = tokio::fs::read(&segment.locator.key).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to read segment {}: {}",
                segment.segment_id, e
            ))
        })?;
        blob.extend_from_slice(&bytes);
    }
    tokio::fs::write(dest, &blob).await?;
    Ok(blob.len() as u64)
}

/// Run the per-channel transcode. Non-zero exit carries a bounded slice
/// of ffmpeg's stderr in the error.
pub async fn run_transcode(
    ffmpeg_path: &str,
    channel: MediaChannel,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let args = transcode_args(channel, input, output);
    let result = Command::new(ffmpeg_path)
        .args(&args)
        .output()
        .await
        .map_err(|e| Error::Transcode(format!("Failed to spawn {}: {}", ffmpeg_path, e)))?;
    if !result.status.success() {
        let tail = &result.stderr[..result.stderr.len().min(DIAGNOSTIC_LIMIT)];
        let stderr = String::from_utf8_lossy(tail);
        return Err(Error::Transcode(format!(
            "ffmpeg exited with {} for {} channel: {}",
            result.status,
            channel.as_str(),
            stderr
        )));
    }
    Ok(())
}

/// Best-effort duration check; a probe failure never fails the merge.
pub async fn probe_duration(ffprobe_path: &str, path: &Path) -> Option<f64> {
    let result = Command::new(ffprobe_path)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await;
    match result {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().parse().ok()
        }
        Ok(output) => {
            warn!(
                path = %path.display(),
                status = %output.status,
                "ffprobe failed, merged file may still be usable"
            );
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = ?e, "Could not run ffprobe");
            None
        }
    }
}

/// Turns an attempt's locally staged segments into one durable recording
/// per channel. Runs only inside the merge queue's single worker.
#[derive(Clone)]
pub struct MergeService {
    proctoring: ProctoringService,
    storage: Arc<StorageService>,
    settings: Arc<MergeSettings>,
}

impl MergeService {
    pub fn new(
        proctoring: ProctoringService,
        storage: Arc<StorageService>,
        settings: MergeSettings,
    ) -> Self {
        Self {
            proctoring,
            storage,
            settings: Arc::new(settings),
        }
    }

    /// Merge every channel with at least one eligible segment. Channels
    /// with none are skipped without touching their merge status. On
    /// failure the current channel's status is recorded before the error
    /// propagates to the queue's retry accounting.
    pub async fn merge_attempt(&self, attempt_id: Uuid) -> Result<()> {
        let report = self.proctoring.get_report(attempt_id).await?;
        let mut merged: Vec<(MediaChannel, Vec<MediaSegment>)> = Vec::new();

        for channel in MediaChannel::ALL {
            let segments = report.segments_for_merge(channel);
            if segments.is_empty() {
                continue;
            }
            if let Err(e) = self.merge_channel(attempt_id, channel, &segments).await {
                let message = e.to_string();
                let record = self
                    .proctoring
                    .update_report(attempt_id, move |r| {
                        r.set_merge_state(channel, MergeState::Failed, Some(message.clone()));
                    })
                    .await;
                if let Err(record_err) = record {
                    error!(
                        attempt_id = %attempt_id,
                        channel = channel.as_str(),
                        error = ?record_err,
                        "Failed to record merge failure status"
                    );
                }
                return Err(e);
            }
            merged.push((channel, segments));
        }

        // Reaching this point means no channel failed; only then is the
        // destructive chunk cleanup allowed to run.
        if self.settings.cleanup_segments && !merged.is_empty() {
            let mut consumed: Vec<String> = Vec::new();
            for (channel, segments) in &merged {
                for segment in segments {
                    if let Err(e) = tokio::fs::remove_file(&segment.locator.key).await {
                        warn!(
                            attempt_id = %attempt_id,
                            channel = channel.as_str(),
                            segment_id = %segment.segment_id,
                            error = ?e,
                            "Failed to delete merged source chunk"
                        );
                    }
                    consumed.push(segment.segment_id.clone());
                }
            }
            // The chunk records go with the files: a stale record would
            // make a later operator re-enqueue read a deleted path and
            // downgrade a completed channel to failed.
            if let Err(e) = self
                .proctoring
                .update_report(attempt_id, move |r| r.purge_segments(&consumed))
                .await
            {
                warn!(
                    attempt_id = %attempt_id,
                    error = ?e,
                    "Failed to drop merged chunk records after cleanup"
                );
            }
        }
        Ok(())
    }

    async fn merge_channel(
        &self,
        attempt_id: Uuid,
        channel: MediaChannel,
        segments: &[MediaSegment],
    ) -> Result<()> {
        self.proctoring
            .update_report(attempt_id, move |r| {
                r.set_merge_state(channel, MergeState::Processing, None);
            })
            .await?;

        let dir = self.settings.media_root.join(attempt_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let concat_path = dir.join(format!(
            "{}-concat.{}",
            channel.as_str(),
            extension_for_mime(&segments[0].mime_type)
        ));
        let concat_size = concatenate_segments(segments, &concat_path).await?;
        info!(
            attempt_id = %attempt_id,
            channel = channel.as_str(),
            segments = segments.len(),
            bytes = concat_size,
            "Concatenated channel segments"
        );

        let output_path = dir.join(merged_file_name(channel));
        let transcode =
            run_transcode(&self.settings.ffmpeg_path, channel, &concat_path, &output_path).await;
        // The intermediate artifact is removed even when the transcode
        // failed, to bound disk usage.
        tokio::fs::remove_file(&concat_path).await.ok();
        transcode?;

        if let Some(duration) = probe_duration(&self.settings.ffprobe_path, &output_path).await {
            info!(
                attempt_id = %attempt_id,
                channel = channel.as_str(),
                duration_secs = duration,
                "Merged recording probed"
            );
        }

        let locator = self.upload_recording(attempt_id, channel, &output_path).await;
        self.proctoring
            .update_report(attempt_id, move |r| {
                r.recording_urls.insert(channel, locator);
                r.set_merge_state(channel, MergeState::Completed, None);
            })
            .await?;
        Ok(())
    }

    /// Push the merged file to durable storage when configured. Upload
    /// failures keep the local copy and surface the local locator.
    async fn upload_recording(
        &self,
        attempt_id: Uuid,
        channel: MediaChannel,
        output_path: &Path,
    ) -> Locator {
        let local_locator = Locator {
            backend: StorageKind::Local,
            key: output_path.to_string_lossy().into_owned(),
            public_url: None,
        };
        if self.storage.backend() != StorageKind::S3 {
            return local_locator;
        }
        match self
            .storage
            .put_named_file(
                attempt_id,
                merged_file_name(channel),
                output_path,
                merged_content_type(channel),
            )
            .await
        {
            Ok(locator) => {
                tokio::fs::remove_file(output_path).await.ok();
                locator
            }
            Err(e) => {
                warn!(
                    attempt_id = %attempt_id,
                    channel = channel.as_str(),
                    error = ?e,
                    "Upload of merged recording failed, keeping local copy"
                );
                local_locator
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::proctoring::ProctoringReport;
    use chrono::Utc;

    #[test]
    fn webcam_profile_carries_audio_screen_does_not() {
        let input = Path::new("/tmp/in.webm");
        let output = Path::new("/tmp/out.mp4");

        let webcam = transcode_args(MediaChannel::Webcam, input, output);
        assert!(webcam.contains(&"aac".to_string()));
        assert!(webcam.contains(&"1000k".to_string()));
        assert!(!webcam.contains(&"-an".to_string()));

        let screen = transcode_args(MediaChannel::Screen, input, output);
        assert!(screen.contains(&"-an".to_string()));
        assert!(screen.contains(&"1500k".to_string()));

        let microphone = transcode_args(MediaChannel::Microphone, input, output);
        assert!(microphone.contains(&"-vn".to_string()));
    }

    #[test]
    fn transcode_args_are_an_argument_vector_not_a_shell_line() {
        let input = Path::new("/tmp/evil; rm -rf $HOME/in.webm");
        let args = transcode_args(MediaChannel::Screen, input, Path::new("/tmp/out.mp4"));
        // The path stays one argument, shell metacharacters and all.
        assert!(args.contains(&"/tmp/evil; rm -rf $HOME/in.webm".to_string()));
    }

    #[test]
    fn merged_file_names_per_channel() {
        assert_eq!(merged_file_name(MediaChannel::Webcam), "webcam-recording.mp4");
        assert_eq!(merged_file_name(MediaChannel::Screen), "screen-recording.mp4");
        assert_eq!(
            merged_file_name(MediaChannel::Microphone),
            "microphone-recording.m4a"
        );
    }

    #[tokio::test]
    async fn concatenation_follows_sequence_order_not_arrival_order() {
        let dir = std::env::temp_dir().join(format!("merge-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.expect("mkdir");

        // Arrival order [2, 0, 1] with sizes 10KB / 12KB / 9KB.
        let chunks: [(i64, u8, usize); 3] =
            [(2, b'c', 10 * 1024), (0, b'a', 12 * 1024), (1, b'b', 9 * 1024)];
        let mut report = ProctoringReport::new();
        for (sequence, fill, size) in chunks {
            let path = dir.join(format!("webcam-seq{}.webm", sequence));
            tokio::fs::write(&path, vec![fill; size]).await.expect("write chunk");
            report.record_segment(MediaSegment {
                segment_id: format!("webcam-seq{}", sequence),
                channel: MediaChannel::Webcam,
                locator: Locator {
                    backend: StorageKind::Local,
                    key: path.to_string_lossy().into_owned(),
                    public_url: None,
                },
                mime_type: "video/webm".to_string(),
                captured_at: Utc::now(),
                size_bytes: size as i64,
                sequence: Some(sequence),
                duration_ms: Some(3000),
            });
        }

        let ordered = report.segments_for_merge(MediaChannel::Webcam);
        let dest = dir.join("webcam-concat.webm");
        let total = concatenate_segments(&ordered, &dest).await.expect("concat");
        assert_eq!(total, 31 * 1024);

        let merged = tokio::fs::read(&dest).await.expect("read concat");
        assert_eq!(merged.len(), 31 * 1024);
        assert!(merged[..12 * 1024].iter().all(|&b| b == b'a'));
        assert!(merged[12 * 1024..21 * 1024].iter().all(|&b| b == b'b'));
        assert!(merged[21 * 1024..].iter().all(|&b| b == b'c'));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
