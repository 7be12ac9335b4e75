//! Video descriptors supplied by the media pipeline, plus position checks and
//! timecode rendering.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::VideoId;

/// Highest frame rate accepted in a descriptor.
pub const MAX_FRAME_RATE: f64 = 240.0;

/// What the transcoding pipeline tells us about a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoDescriptor {
    pub video_id: VideoId,
    pub url: String,
    /// `None` while the pipeline has not probed the file yet.
    pub duration_ms: Option<i64>,
    pub frame_rate: Option<f64>,
}

impl VideoDescriptor {
    /// Validate descriptor fields.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.video_id.trim().is_empty() {
            return Err(CoreError::Validation("video_id must not be empty".to_string()));
        }
        if self.url.trim().is_empty() {
            return Err(CoreError::Validation("url must not be empty".to_string()));
        }
        if let Some(duration) = self.duration_ms {
            if duration < 0 {
                return Err(CoreError::Validation(format!(
                    "duration_ms must be >= 0, got {duration}"
                )));
            }
        }
        if let Some(fps) = self.frame_rate {
            if !fps.is_finite() || fps <= 0.0 || fps > MAX_FRAME_RATE {
                return Err(CoreError::Validation(format!(
                    "frame_rate must be in (0, {MAX_FRAME_RATE}], got {fps}"
                )));
            }
        }
        Ok(())
    }

    /// Check a media position against this video.
    ///
    /// Returns `Ok(true)` when the position could not be verified because the
    /// duration is unknown (the annotation is accepted but flagged).
    pub fn check_position(&self, timestamp_ms: i64) -> Result<bool, CoreError> {
        crate::annotation::validate_timestamp(timestamp_ms)?;
        match self.duration_ms {
            Some(duration) if timestamp_ms > duration => Err(CoreError::Validation(format!(
                "timestamp_ms {timestamp_ms} is beyond the video duration of {duration} ms"
            ))),
            Some(_) => Ok(false),
            None => Ok(true),
        }
    }
}

/// Render a media position for humans.
///
/// With a known frame rate this is `HH:MM:SS:FF`; otherwise `HH:MM:SS.mmm`.
pub fn format_timecode(timestamp_ms: i64, frame_rate: Option<f64>) -> String {
    let ms = timestamp_ms.max(0);
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = ms % 1000;

    match frame_rate {
        Some(fps) if fps.is_finite() && fps > 0.0 => {
            let frame = ((millis as f64) * fps / 1000.0).floor() as i64;
            format!("{hours:02}:{minutes:02}:{seconds:02}:{frame:02}")
        }
        _ => format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}"),
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Lookup of video descriptors owned by the media pipeline.
pub trait VideoDirectory: Send + Sync {
    fn describe(&self, video_id: &str) -> Option<VideoDescriptor>;
}

/// Process-local directory, fed by the pipeline's registration calls.
#[derive(Default)]
pub struct InMemoryVideoDirectory {
    videos: RwLock<HashMap<VideoId, VideoDescriptor>>,
}

impl InMemoryVideoDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a descriptor. Returns `true` if it was new.
    pub fn register(&self, descriptor: VideoDescriptor) -> Result<bool, CoreError> {
        descriptor.validate()?;
        let mut videos = self.videos.write().unwrap_or_else(PoisonError::into_inner);
        Ok(videos
            .insert(descriptor.video_id.clone(), descriptor)
            .is_none())
    }

    pub fn len(&self) -> usize {
        self.videos.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VideoDirectory for InMemoryVideoDirectory {
    fn describe(&self, video_id: &str) -> Option<VideoDescriptor> {
        self.videos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(video_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(duration_ms: Option<i64>) -> VideoDescriptor {
        VideoDescriptor {
            video_id: "v1".to_string(),
            url: "https://cdn.example.com/v1.m3u8".to_string(),
            duration_ms,
            frame_rate: Some(24.0),
        }
    }

    #[test]
    fn position_within_duration_is_verified() {
        assert!(!descriptor(Some(60_000)).check_position(5_000).unwrap());
        assert!(!descriptor(Some(60_000)).check_position(60_000).unwrap());
    }

    #[test]
    fn position_beyond_known_duration_rejected() {
        let err = descriptor(Some(60_000)).check_position(60_001).unwrap_err();
        assert!(err.to_string().contains("beyond the video duration"));
    }

    #[test]
    fn unknown_duration_accepts_and_flags() {
        assert!(descriptor(None).check_position(9_999_999).unwrap());
    }

    #[test]
    fn negative_position_rejected_even_without_duration() {
        assert!(descriptor(None).check_position(-5).is_err());
    }

    #[test]
    fn descriptor_validation() {
        assert!(descriptor(Some(1000)).validate().is_ok());

        let mut bad = descriptor(Some(-1));
        assert!(bad.validate().is_err());

        bad = descriptor(None);
        bad.frame_rate = Some(0.0);
        assert!(bad.validate().is_err());

        bad = descriptor(None);
        bad.url = "  ".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn timecode_with_frame_rate() {
        assert_eq!(format_timecode(0, Some(24.0)), "00:00:00:00");
        assert_eq!(format_timecode(5_500, Some(24.0)), "00:00:05:12");
        assert_eq!(format_timecode(3_723_000, Some(30.0)), "01:02:03:00");
    }

    #[test]
    fn timecode_without_frame_rate() {
        assert_eq!(format_timecode(5_000, None), "00:00:05.000");
        assert_eq!(format_timecode(61_042, None), "00:01:01.042");
    }

    #[test]
    fn directory_register_and_describe() {
        let directory = InMemoryVideoDirectory::new();
        assert!(directory.describe("v1").is_none());

        assert!(directory.register(descriptor(Some(1000))).unwrap());
        assert!(!directory.register(descriptor(Some(2000))).unwrap());

        let found = directory.describe("v1").unwrap();
        assert_eq!(found.duration_ms, Some(2000));
        assert_eq!(directory.len(), 1);
    }
}
