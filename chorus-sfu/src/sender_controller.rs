//! Per-destination loss-based bitrate control
//!
//! Each outbound track sent to a participant gets a [`SenderController`]
//! fed with the RTCP that participant returns. Receiver reports drive an
//! AIMD estimate of the bitrate the path can sustain:
//!
//! - under 2% loss (`fraction_lost < 5`) the estimate grows by 269/256
//! - over 10% loss (`fraction_lost > 25`) it shrinks by `(512 - loss) / 512`
//! - in between it holds
//!
//! The estimate always stays within the media kind's bitrate bounds.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, trace};
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::receiver_report::ReceiverReport;

use crate::config::BitrateConfig;
use crate::peer::PeerHandle;
use crate::signal::Signal;
use crate::transport::RtpSender;
use crate::types::{TrackKind, UserId};

/// What a single RTCP packet meant for the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpAction {
    /// The receiver asked for a keyframe
    KeyframeRequested,
    /// A receiver report for our SSRC updated the estimate
    RateUpdated(u64),
    Ignored,
}

pub struct SenderController {
    ssrc: u32,
    kind: TrackKind,
    from_user: UserId,
    to_user: UserId,
    bounds: BitrateConfig,
    max_bitrate: u64,
    optimal_bitrate: Mutex<u64>,
}

impl SenderController {
    #[must_use]
    pub const fn new(
        ssrc: u32,
        kind: TrackKind,
        from_user: UserId,
        to_user: UserId,
        bounds: BitrateConfig,
    ) -> Self {
        Self {
            ssrc,
            kind,
            from_user,
            to_user,
            bounds,
            max_bitrate: bounds.max,
            optimal_bitrate: Mutex::new(bounds.default),
        }
    }

    /// Start from `rate` instead of the kind's default
    #[must_use]
    pub fn with_optimal_bitrate(self, rate: u64) -> Self {
        *self.optimal_bitrate.lock() = self.bounds.clamp(rate).min(self.max_bitrate);
        self
    }

    /// Lower the ceiling below the kind's maximum
    #[must_use]
    pub fn with_max_bitrate(mut self, max: u64) -> Self {
        self.max_bitrate = max.min(self.bounds.max);
        self
    }

    #[must_use]
    pub const fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[must_use]
    pub const fn to_user(&self) -> &UserId {
        &self.to_user
    }

    #[must_use]
    pub fn optimal_bitrate(&self) -> u64 {
        *self.optimal_bitrate.lock()
    }

    /// Apply one receiver report `fraction_lost` value (0..=255)
    pub fn update_rate_from_loss(&self, fraction_lost: u8) -> u64 {
        let loss = u64::from(fraction_lost);
        let mut optimal = self.optimal_bitrate.lock();
        let previous = *optimal;

        let next = if loss < 5 {
            (previous * 269 / 256).min(self.bounds.max)
        } else if loss > 25 {
            let reduced = (previous * (512 - loss) / 512).max(self.bounds.min);
            info!(
                from_user = %self.from_user,
                to_user = %self.to_user,
                kind = %self.kind,
                fraction_lost,
                previous_kbps = previous / 1000,
                next_kbps = reduced / 1000,
                "Loss above threshold, lowering bitrate"
            );
            reduced
        } else {
            previous
        };

        *optimal = self.bounds.clamp(next).min(self.max_bitrate);
        *optimal
    }

    pub fn handle_rtcp(&self, packet: &(dyn RtcpPacket + Send + Sync)) -> RtcpAction {
        let any = packet.as_any();

        if any.downcast_ref::<PictureLossIndication>().is_some() {
            return RtcpAction::KeyframeRequested;
        }

        if let Some(report) = any.downcast_ref::<ReceiverReport>() {
            let mut action = RtcpAction::Ignored;
            for reception in report.reports.iter().filter(|r| r.ssrc == self.ssrc) {
                action = RtcpAction::RateUpdated(self.update_rate_from_loss(reception.fraction_lost));
            }
            return action;
        }

        if any
            .downcast_ref::<ReceiverEstimatedMaximumBitrate>()
            .is_some()
        {
            trace!(to_user = %self.to_user, "Ignoring REMB");
        }
        RtcpAction::Ignored
    }

    /// Drain RTCP from `sender` until `done` fires or the sender goes away
    pub async fn run_listener(&self, sender: Arc<dyn RtpSender>, done: Signal, from_peer: Arc<PeerHandle>) {
        loop {
            let packets = tokio::select! {
                () = done.wait() => break,
                read = sender.read_rtcp() => match read {
                    Ok(packets) => packets,
                    Err(e) => {
                        debug!(to_user = %self.to_user, error = %e, "RTCP read ended");
                        break;
                    }
                },
            };

            for packet in &packets {
                match self.handle_rtcp(packet.as_ref()) {
                    RtcpAction::KeyframeRequested => {
                        debug!(from_user = %self.from_user, to_user = %self.to_user, "PLI received");
                        from_peer.throttled_pli_request().await;
                    }
                    RtcpAction::RateUpdated(rate) => {
                        trace!(to_user = %self.to_user, rate, "Optimal bitrate updated");
                    }
                    RtcpAction::Ignored => {}
                }
            }
        }
        debug!(from_user = %self.from_user, to_user = %self.to_user, "Sender listener stopped");
    }
}
