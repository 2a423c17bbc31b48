//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::TrackKind;

/// Bitrate bounds for one media kind, in bits per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateConfig {
    pub default: u64,
    pub min: u64,
    pub max: u64,
}

impl BitrateConfig {
    #[must_use]
    pub const fn clamp(&self, rate: u64) -> u64 {
        if rate < self.min {
            self.min
        } else if rate > self.max {
            self.max
        } else {
            rate
        }
    }
}

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Size of the buffer used to read one inbound RTP packet
    pub mtu: usize,
    /// Session size used when the join payload asks for 0
    pub default_size: usize,
    /// Upper bound on participants per session
    pub max_size: usize,
    /// Session duration (seconds) used when the join payload asks for 0
    pub default_duration_secs: u64,
    /// Upper bound on session duration (seconds)
    pub max_duration_secs: u64,
    pub audio_bitrate: BitrateConfig,
    pub video_bitrate: BitrateConfig,
    /// How often a slice pushes its target bitrate to the pipeline
    pub encoder_control_period_ms: u64,
    /// How often a slice folds bit counters into bitrates
    pub stats_period_ms: u64,
    /// How often a video slice logs its target bitrate
    pub bitrate_log_period_ms: u64,
    /// Minimum spacing between two keyframe requests to the same peer
    pub pli_throttle_ms: u64,
    /// Backoff between two failed renegotiation rounds
    pub signaling_retry_ms: u64,
    /// Delay before the renegotiation triggered by the last outbound track
    pub signaling_settle_ms: u64,
    /// Time between the end of a session and its deletion
    pub end_grace_ms: u64,
    /// Seconds before the end at which peers get an `ending` notice
    pub ending_notice_secs: u64,
    /// Tear the session down if its tracks are not all ready within this
    /// many seconds (disabled when unset)
    pub abort_after_secs: Option<u64>,
    pub interpolator_step_ms: u64,
    pub max_interpolator_duration_ms: u64,
    pub default_width: u32,
    pub default_height: u32,
    pub default_frame_rate: u32,
    pub default_video_format: String,
    pub default_recording_mode: String,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            default_size: 2,
            max_size: 8,
            default_duration_secs: 30,
            max_duration_secs: 1200,
            audio_bitrate: BitrateConfig {
                default: 48_000,
                min: 16_000,
                max: 64_000,
            },
            video_bitrate: BitrateConfig {
                default: 300_000,
                min: 150_000,
                max: 600_000,
            },
            encoder_control_period_ms: 1000,
            stats_period_ms: 3000,
            bitrate_log_period_ms: 7300,
            pli_throttle_ms: 300,
            signaling_retry_ms: 2000,
            signaling_settle_ms: 100,
            end_grace_ms: 3000,
            ending_notice_secs: 15,
            abort_after_secs: None,
            interpolator_step_ms: 30,
            max_interpolator_duration_ms: 5000,
            default_width: 800,
            default_height: 600,
            default_frame_rate: 30,
            default_video_format: "H264".to_string(),
            default_recording_mode: "muxed".to_string(),
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn bitrate(&self, kind: TrackKind) -> BitrateConfig {
        match kind {
            TrackKind::Audio => self.audio_bitrate,
            TrackKind::Video => self.video_bitrate,
        }
    }

    #[must_use]
    pub const fn encoder_control_period(&self) -> Duration {
        Duration::from_millis(self.encoder_control_period_ms)
    }

    #[must_use]
    pub const fn stats_period(&self) -> Duration {
        Duration::from_millis(self.stats_period_ms)
    }

    #[must_use]
    pub const fn bitrate_log_period(&self) -> Duration {
        Duration::from_millis(self.bitrate_log_period_ms)
    }

    #[must_use]
    pub const fn pli_throttle(&self) -> Duration {
        Duration::from_millis(self.pli_throttle_ms)
    }

    #[must_use]
    pub const fn signaling_retry(&self) -> Duration {
        Duration::from_millis(self.signaling_retry_ms)
    }

    #[must_use]
    pub const fn signaling_settle(&self) -> Duration {
        Duration::from_millis(self.signaling_settle_ms)
    }

    #[must_use]
    pub const fn end_grace(&self) -> Duration {
        Duration::from_millis(self.end_grace_ms)
    }

    #[must_use]
    pub const fn interpolator_step(&self) -> Duration {
        Duration::from_millis(self.interpolator_step_ms)
    }

    #[must_use]
    pub const fn max_interpolator_duration(&self) -> Duration {
        Duration::from_millis(self.max_interpolator_duration_ms)
    }

    /// Validate configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.mtu == 0 {
            errors.push("sfu.mtu must be greater than 0".to_string());
        }
        if self.default_size == 0 || self.default_size > self.max_size {
            errors.push(format!(
                "sfu.default_size must be within 1..={}",
                self.max_size
            ));
        }
        if self.default_duration_secs == 0 || self.default_duration_secs > self.max_duration_secs {
            errors.push(format!(
                "sfu.default_duration_secs must be within 1..={}",
                self.max_duration_secs
            ));
        }
        for (name, bounds) in [("audio", self.audio_bitrate), ("video", self.video_bitrate)] {
            if bounds.min > bounds.max || bounds.default < bounds.min || bounds.default > bounds.max {
                errors.push(format!(
                    "sfu.{name}_bitrate must satisfy min <= default <= max"
                ));
            }
        }
        for (name, period) in [
            ("encoder_control_period_ms", self.encoder_control_period_ms),
            ("stats_period_ms", self.stats_period_ms),
            ("bitrate_log_period_ms", self.bitrate_log_period_ms),
            ("signaling_retry_ms", self.signaling_retry_ms),
            ("interpolator_step_ms", self.interpolator_step_ms),
        ] {
            if period == 0 {
                errors.push(format!("sfu.{name} must be greater than 0"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
