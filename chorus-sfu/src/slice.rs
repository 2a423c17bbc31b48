//! Processing of one inbound track and its fan-out
//!
//! A [`MixerSlice`] reads a participant's inbound track, pushes it through a
//! [`Pipeline`] and writes the processed RTP to an outbound track that the
//! [`crate::Mixer`] attaches to every other participant. One
//! [`SenderController`] per destination feeds back the bitrate the slice
//! should encode at.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument, Span};
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::util::marshal::Unmarshal;

use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::interpolator::{InterpolatorHandle, LinearInterpolator};
use crate::peer::PeerHandle;
use crate::pipeline::{PacketSink, Pipeline, PipelineFactory, PipelineSpec};
use crate::sender_controller::SenderController;
use crate::signal::Signal;
use crate::transport::{InboundTrack, RtpSender};
use crate::types::{ControlPayload, TrackId, TrackKind, UserId};

/// Effect value of `fx` that bypasses the pipeline entirely
const FORWARD_FX: &str = "forward";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RampKey {
    kind: TrackKind,
    name: String,
    property: String,
}

#[derive(Debug)]
struct BitrateStats {
    input_bits: u64,
    output_bits: u64,
    input_bitrate: u64,
    output_bitrate: u64,
    last_tick: Instant,
}

/// Bitrates computed at the last stats tick, in bits per second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceBitrates {
    pub input: u64,
    pub output: u64,
    pub target: u64,
}

pub struct MixerSlice {
    id: TrackId,
    kind: TrackKind,
    from_peer: Arc<PeerHandle>,
    input: Arc<dyn InboundTrack>,
    output: Arc<TrackLocalStaticRTP>,
    config: Arc<SfuConfig>,
    span: Span,
    session_ended: Signal,
    controllers: Mutex<HashMap<UserId, Arc<SenderController>>>,
    stats: Mutex<BitrateStats>,
    target_bitrate: AtomicU64,
    pipeline: Mutex<Option<Arc<dyn Pipeline>>>,
    file_prefix: String,
    ramps: Mutex<HashMap<RampKey, InterpolatorHandle>>,
    done: Signal,
}

impl MixerSlice {
    /// The outbound track reuses the inbound track id and the sending
    /// participant's stream id, so audio and video stay paired.
    #[must_use]
    pub fn new(
        from_peer: Arc<PeerHandle>,
        input: Arc<dyn InboundTrack>,
        session_ended: Signal,
        config: Arc<SfuConfig>,
        file_prefix: String,
        span: Span,
    ) -> Arc<Self> {
        let id = input.id();
        let kind = input.kind();
        let output = Arc::new(TrackLocalStaticRTP::new(
            input.codec(),
            id.to_string(),
            from_peer.stream_id().to_string(),
        ));

        info!(
            parent: &span,
            track_id = %id,
            codec = %input.codec().mime_type,
            "Created mixer slice"
        );

        Arc::new(Self {
            id,
            kind,
            from_peer,
            input,
            output,
            config,
            span,
            session_ended,
            controllers: Mutex::new(HashMap::new()),
            stats: Mutex::new(BitrateStats {
                input_bits: 0,
                output_bits: 0,
                input_bitrate: 0,
                output_bitrate: 0,
                last_tick: Instant::now(),
            }),
            target_bitrate: AtomicU64::new(0),
            pipeline: Mutex::new(None),
            file_prefix,
            ramps: Mutex::new(HashMap::new()),
            done: Signal::new(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn from_user(&self) -> &UserId {
        self.from_peer.user()
    }

    #[must_use]
    pub fn output(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.output)
    }

    /// Fires once the slice loop has ended
    #[must_use]
    pub const fn done(&self) -> &Signal {
        &self.done
    }

    #[must_use]
    pub fn target_bitrate(&self) -> u64 {
        self.target_bitrate.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn bitrates(&self) -> SliceBitrates {
        let stats = self.stats.lock();
        SliceBitrates {
            input: stats.input_bitrate,
            output: stats.output_bitrate,
            target: self.target_bitrate(),
        }
    }

    #[must_use]
    pub fn controller(&self, to_user: &UserId) -> Option<Arc<SenderController>> {
        self.controllers.lock().get(to_user).cloned()
    }

    #[must_use]
    pub fn controller_count(&self) -> usize {
        self.controllers.lock().len()
    }

    /// Attach the outbound sender created for `to_user`.
    ///
    /// Only single-encoding senders are supported; anything else is rejected
    /// without creating a controller.
    pub async fn add_sender(self: &Arc<Self>, sender: Arc<dyn RtpSender>, to_user: UserId) -> Result<()> {
        let ssrcs = sender.encoding_ssrcs().await;
        let [ssrc] = ssrcs[..] else {
            warn!(
                parent: &self.span,
                to_user = %to_user,
                encodings = ssrcs.len(),
                "Rejecting sender with unexpected encodings"
            );
            return Err(Error::UnsupportedSender(format!(
                "{} encodings for track {}",
                ssrcs.len(),
                self.id
            )));
        };

        let controller = Arc::new(SenderController::new(
            ssrc,
            self.kind,
            self.from_user().clone(),
            to_user.clone(),
            self.config.bitrate(self.kind),
        ));
        self.controllers
            .lock()
            .insert(to_user.clone(), Arc::clone(&controller));

        let slice = Arc::clone(self);
        tokio::spawn(
            async move {
                controller
                    .run_listener(sender, slice.done.clone(), Arc::clone(&slice.from_peer))
                    .await;
                slice.remove_controller(&to_user, &controller);
            }
            .instrument(self.span.clone()),
        );
        Ok(())
    }

    fn remove_controller(&self, to_user: &UserId, controller: &Arc<SenderController>) {
        let mut controllers = self.controllers.lock();
        if controllers
            .get(to_user)
            .is_some_and(|current| Arc::ptr_eq(current, controller))
        {
            controllers.remove(to_user);
        }
    }

    /// Push the lowest destination estimate to the pipeline.
    ///
    /// Returns the new target when it changed.
    pub fn update_target_bitrate(&self) -> Option<u64> {
        let pipeline = self.pipeline.lock().clone()?;
        let lowest = self
            .controllers
            .lock()
            .values()
            .map(|controller| controller.optimal_bitrate())
            .min()?;
        if lowest == 0 || self.target_bitrate.swap(lowest, Ordering::AcqRel) == lowest {
            return None;
        }
        pipeline.set_encoding_rate(lowest);
        debug!(parent: &self.span, kbps = lowest / 1000, "Target bitrate updated");
        Some(lowest)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn update_stats(&self, now: Instant) {
        let mut stats = self.stats.lock();
        let elapsed = now.duration_since(stats.last_tick).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        stats.input_bitrate = (stats.input_bits as f64 / elapsed) as u64;
        stats.output_bitrate = (stats.output_bits as f64 / elapsed) as u64;
        stats.input_bits = 0;
        stats.output_bits = 0;
        stats.last_tick = now;

        debug!(
            parent: &self.span,
            input_kbps = stats.input_bitrate / 1000,
            output_kbps = stats.output_bitrate / 1000,
            target_kbps = self.target_bitrate() / 1000,
            "Slice bitrates"
        );
    }

    async fn run_tickers(self: Arc<Self>) {
        let start = Instant::now();
        let every = |period: Duration| {
            let mut ticker = interval_at(start + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        };
        let mut encoder = every(self.config.encoder_control_period());
        let mut stats = every(self.config.stats_period());
        let mut log = every(self.config.bitrate_log_period());
        let is_video = self.kind == TrackKind::Video;

        loop {
            tokio::select! {
                () = self.done.wait() => break,
                _ = encoder.tick() => {
                    self.update_target_bitrate();
                }
                tick = stats.tick() => self.update_stats(tick),
                _ = log.tick(), if is_video => {
                    info!(
                        parent: &self.span,
                        kbps = self.target_bitrate() / 1000,
                        "Video target bitrate"
                    );
                }
            }
        }
    }

    /// Run the slice until its input ends, the session ends or the sending
    /// participant leaves. Returns the recording files of the pipeline.
    pub async fn run(self: Arc<Self>, factory: Arc<dyn PipelineFactory>) -> Vec<String> {
        tokio::spawn(Arc::clone(&self).run_tickers().instrument(self.span.clone()));

        let slice = Arc::clone(&self);
        let result = tokio::spawn(
            async move { slice.process(factory.as_ref()).await }.instrument(self.span.clone()),
        )
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(parent: &self.span, error = %e, "Slice input ended"),
            Err(e) if e.is_panic() => error!(parent: &self.span, "Slice loop panicked"),
            Err(e) => warn!(parent: &self.span, error = %e, "Slice loop aborted"),
        }

        self.teardown()
    }

    async fn process(self: &Arc<Self>, factory: &dyn PipelineFactory) -> Result<()> {
        if self.from_peer.join().fx(self.kind) == FORWARD_FX {
            return self.forward().await;
        }

        let join = self.from_peer.join();
        let spec = PipelineSpec {
            kind: self.kind,
            codec: self.input.codec(),
            user: self.from_user().clone(),
            fx: join.fx(self.kind).to_string(),
            video_format: join.video_format.clone(),
            recording_mode: join.recording_mode.clone(),
            width: join.width,
            height: join.height,
            frame_rate: join.framerate,
            gpu: join.gpu,
            overlay: join.overlay,
            file_prefix: self.file_prefix.clone(),
        };
        let pipeline = factory.create(spec, Arc::new(SliceSink::new(self)))?;
        pipeline.start()?;
        *self.pipeline.lock() = Some(Arc::clone(&pipeline));
        info!(parent: &self.span, "Pipeline started");

        let mut buf = vec![0u8; self.config.mtu];
        loop {
            let n = tokio::select! {
                () = self.session_ended.wait() => break,
                () = self.from_peer.closed().wait() => break,
                read = self.input.read(&mut buf) => read?,
            };
            pipeline.push(&buf[..n]);
            self.stats.lock().input_bits += n as u64 * 8;
        }
        Ok(())
    }

    /// Echo inbound RTP to the outbound track without processing
    async fn forward(&self) -> Result<()> {
        info!(parent: &self.span, "Forwarding without pipeline");
        let mut buf = vec![0u8; self.config.mtu];
        loop {
            let n = tokio::select! {
                () = self.session_ended.wait() => break,
                () = self.from_peer.closed().wait() => break,
                read = self.input.read(&mut buf) => read?,
            };
            self.stats.lock().input_bits += n as u64 * 8;
            if let Err(e) = self.write(&buf[..n]).await {
                debug!(parent: &self.span, error = %e, "Dropping unparsable packet");
            }
        }
        Ok(())
    }

    fn teardown(&self) -> Vec<String> {
        self.done.fire();
        for (_, ramp) in self.ramps.lock().drain() {
            ramp.stop();
        }
        let files = match self.pipeline.lock().take() {
            Some(pipeline) => {
                pipeline.stop();
                pipeline.recording_files()
            }
            None => Vec::new(),
        };
        info!(parent: &self.span, track_id = %self.id, "Out track stopped");
        files
    }

    /// Write one processed RTP packet to the outbound track
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        let mut reader = buf;
        let packet = Packet::unmarshal(&mut reader)?;
        self.output.write_rtp(&packet).await?;
        self.stats.lock().output_bits += packet.payload.len() as u64 * 8;
        Ok(())
    }

    /// Apply an effect change, immediately or as a ramp.
    ///
    /// A new request for the same effect property replaces any ramp still
    /// running for it.
    pub fn control_fx(self: &Arc<Self>, payload: ControlPayload) {
        let Some(pipeline) = self.pipeline.lock().clone() else {
            debug!(parent: &self.span, name = %payload.name, "No pipeline to control");
            return;
        };

        let key = RampKey {
            kind: self.kind,
            name: payload.name.clone(),
            property: payload.property.clone(),
        };
        let ramp = (payload.duration > 0).then(|| {
            let duration = Duration::from_millis(payload.duration)
                .min(self.config.max_interpolator_duration());
            let initial = pipeline.get_fx_property(&payload.name, &payload.property);
            LinearInterpolator::new(
                initial,
                payload.value,
                duration,
                self.config.interpolator_step(),
            )
        });

        // every handle leaving the map is stopped
        let previous = {
            let mut ramps = self.ramps.lock();
            match &ramp {
                Some(interpolator) => ramps.insert(key.clone(), interpolator.handle()),
                None => ramps.remove(&key),
            }
        };
        if let Some(previous) = previous {
            previous.stop();
        }

        let Some(mut interpolator) = ramp else {
            pipeline.set_fx_property(&payload.name, &payload.property, payload.value);
            return;
        };

        let slice = Arc::clone(self);
        tokio::spawn(
            async move {
                loop {
                    let value = tokio::select! {
                        () = slice.session_ended.wait() => break,
                        () = slice.from_peer.closed().wait() => break,
                        () = slice.done.wait() => break,
                        value = interpolator.next() => match value {
                            Some(value) => value,
                            None => break,
                        },
                    };
                    pipeline.set_fx_property(&payload.name, &payload.property, value);
                }
                interpolator.stop();

                let mut ramps = slice.ramps.lock();
                if ramps.get(&key).is_some_and(InterpolatorHandle::is_stopped) {
                    ramps.remove(&key);
                }
            }
            .instrument(self.span.clone()),
        );
    }
}

/// Pipeline output bound to a slice without keeping it alive
struct SliceSink {
    slice: Weak<MixerSlice>,
    runtime: Handle,
}

impl SliceSink {
    fn new(slice: &Arc<MixerSlice>) -> Self {
        Self {
            slice: Arc::downgrade(slice),
            runtime: Handle::current(),
        }
    }
}

#[async_trait]
impl PacketSink for SliceSink {
    async fn write(&self, buf: &[u8]) -> Result<()> {
        match self.slice.upgrade() {
            Some(slice) => slice.write(buf).await,
            None => Err(Error::TrackClosed),
        }
    }

    fn request_keyframe(&self) {
        if let Some(slice) = self.slice.upgrade() {
            let peer = Arc::clone(&slice.from_peer);
            self.runtime.spawn(async move {
                peer.throttled_pli_request().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{MockPipeline, MockPipelineFactory, PassthroughFactory};
    use crate::testing::{rtp_packet, FakeSender, FakeSignaling, FakeTrack, FakeTransport};
    use crate::types::JoinPayload;
    use tokio::sync::mpsc;
    use webrtc::track::track_local::TrackLocal;

    struct Fixture {
        slice: Arc<MixerSlice>,
        peer: Arc<PeerHandle>,
        transport: Arc<FakeTransport>,
        packets: mpsc::UnboundedSender<Vec<u8>>,
        ended: Signal,
    }

    fn fixture(kind: TrackKind, fx: &str) -> Fixture {
        fixture_with(
            kind,
            JoinPayload {
                user_id: "alice".to_string(),
                audio_fx: fx.to_string(),
                video_fx: fx.to_string(),
                ..Default::default()
            },
            SfuConfig::default(),
        )
    }

    fn fixture_with(kind: TrackKind, join: JoinPayload, config: SfuConfig) -> Fixture {
        let transport = Arc::new(FakeTransport::default());
        let config = Arc::new(config);
        let peer = Arc::new(PeerHandle::new(
            join,
            transport.clone(),
            Arc::new(FakeSignaling::default()),
            &config,
        ));
        let (track, packets) = FakeTrack::new("track-1", kind, 77);
        peer.add_inbound_track(kind, 77);
        let ended = Signal::new();
        let slice = MixerSlice::new(
            Arc::clone(&peer),
            track,
            ended.clone(),
            config,
            "test-alice-1".to_string(),
            Span::none(),
        );
        Fixture {
            slice,
            peer,
            transport,
            packets,
            ended,
        }
    }

    fn factory_with(pipeline: MockPipeline) -> Arc<dyn PipelineFactory> {
        let pipeline: Arc<dyn Pipeline> = Arc::new(pipeline);
        let mut factory = MockPipelineFactory::new();
        factory
            .expect_create()
            .returning(move |_, _| Ok(Arc::clone(&pipeline)));
        Arc::new(factory)
    }

    fn quiet_pipeline() -> MockPipeline {
        let mut pipeline = MockPipeline::new();
        pipeline.expect_start().returning(|| Ok(()));
        pipeline.expect_stop().return_const(());
        pipeline.expect_push().return_const(());
        pipeline.expect_recording_files().returning(Vec::new);
        pipeline
    }

    #[tokio::test]
    async fn test_output_track_reuses_ids() {
        let f = fixture(TrackKind::Video, "");
        assert_eq!(f.slice.id().as_str(), "track-1");
        assert_eq!(f.slice.output().stream_id(), f.peer.stream_id());
        assert_eq!(f.slice.from_user().as_str(), "alice");
    }

    #[tokio::test]
    async fn test_add_sender_requires_single_encoding() {
        let f = fixture(TrackKind::Video, "");

        let (multi, _rtcp) = FakeSender::new(vec![1, 2, 3]);
        assert!(matches!(
            f.slice.add_sender(multi, UserId::from("bob")).await,
            Err(Error::UnsupportedSender(_))
        ));
        assert_eq!(f.slice.controller_count(), 0);

        let (single, _rtcp) = FakeSender::new(vec![9]);
        f.slice.add_sender(single, UserId::from("bob")).await.unwrap();
        let controller = f.slice.controller(&UserId::from("bob")).unwrap();
        assert_eq!(controller.ssrc(), 9);
        assert_eq!(controller.optimal_bitrate(), 300_000);
    }

    #[tokio::test]
    async fn test_controller_removed_when_sender_ends() {
        let f = fixture(TrackKind::Audio, "");
        let (sender, rtcp) = FakeSender::new(vec![5]);
        f.slice.add_sender(sender, UserId::from("bob")).await.unwrap();
        assert_eq!(f.slice.controller_count(), 1);

        drop(rtcp);
        tokio::time::timeout(Duration::from_secs(1), async {
            while f.slice.controller_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_encoder_tick_pushes_lowest_rate() {
        let f = fixture(TrackKind::Video, "");
        let mut pipeline = quiet_pipeline();
        pipeline
            .expect_set_encoding_rate()
            .withf(|rate| *rate == 150_585)
            .times(1)
            .return_const(());
        let factory = factory_with(pipeline);

        let (to_bob, _bob_rtcp) = FakeSender::new(vec![1]);
        let (to_carol, _carol_rtcp) = FakeSender::new(vec![2]);
        f.slice.add_sender(to_bob, UserId::from("bob")).await.unwrap();
        f.slice.add_sender(to_carol, UserId::from("carol")).await.unwrap();
        f.slice
            .controller(&UserId::from("carol"))
            .unwrap()
            .update_rate_from_loss(255);

        let run = tokio::spawn(Arc::clone(&f.slice).run(factory));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(f.slice.target_bitrate(), 150_585);

        f.ended.fire();
        run.await.unwrap();
        assert!(f.slice.done().is_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_writes_and_counts_bits() {
        let f = fixture(TrackKind::Video, "forward");
        let run = tokio::spawn(Arc::clone(&f.slice).run(Arc::new(PassthroughFactory)));

        for seq in 0..10 {
            f.packets.send(rtp_packet(seq, 100)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(3100)).await;

        let bitrates = f.slice.bitrates();
        assert!(bitrates.input > 0);
        assert!(bitrates.output > 0);
        assert!(bitrates.input > bitrates.output);

        drop(f.packets);
        let files = run.await.unwrap();
        assert!(files.is_empty());
        assert!(f.slice.done().is_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_receives_input_and_stops_on_peer_close() {
        let f = fixture(TrackKind::Audio, "");
        let mut pipeline = MockPipeline::new();
        pipeline.expect_start().times(1).returning(|| Ok(()));
        pipeline.expect_push().times(3).return_const(());
        pipeline.expect_stop().times(1).return_const(());
        pipeline
            .expect_recording_files()
            .returning(|| vec!["alice-audio.ogg".to_string()]);
        let factory = factory_with(pipeline);

        let run = tokio::spawn(Arc::clone(&f.slice).run(factory));
        for seq in 0..3 {
            f.packets.send(rtp_packet(seq, 20)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        f.peer.close("left").await;
        let files = run.await.unwrap();
        assert_eq!(files, vec!["alice-audio.ogg".to_string()]);
        assert_eq!(f.transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_spec_carries_join_options() {
        let f = fixture_with(
            TrackKind::Video,
            JoinPayload {
                user_id: "alice".to_string(),
                video_format: "VP8".to_string(),
                gpu: true,
                overlay: true,
                ..Default::default()
            },
            SfuConfig::default(),
        );
        let pipeline: Arc<dyn Pipeline> = Arc::new(quiet_pipeline());
        let mut factory = MockPipelineFactory::new();
        factory
            .expect_create()
            .withf(|spec, _| {
                spec.gpu
                    && spec.overlay
                    && spec.kind == TrackKind::Video
                    && spec.video_format == "VP8"
                    && spec.file_prefix == "test-alice-1"
            })
            .times(1)
            .returning(move |_, _| Ok(Arc::clone(&pipeline)));

        let run = tokio::spawn(Arc::clone(&f.slice).run(Arc::new(factory)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.peer.close("left").await;
        assert!(run.await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_fx_immediate_and_ramp() {
        let f = fixture(TrackKind::Audio, "pitch");
        let mut pipeline = quiet_pipeline();
        pipeline
            .expect_set_fx_property()
            .withf(|name, property, value| {
                name == "pitch" && property == "pitch" && (*value - 0.5).abs() < 1e-3
            })
            .times(1)
            .return_const(());
        pipeline
            .expect_get_fx_property()
            .times(1)
            .return_const(1.0_f32);
        pipeline
            .expect_set_fx_property()
            .withf(|name, _, value| name == "pitch" && *value > 1.0)
            .times(4)
            .return_const(());
        let factory = factory_with(pipeline);

        let run = tokio::spawn(Arc::clone(&f.slice).run(factory));
        tokio::time::sleep(Duration::from_millis(10)).await;

        f.slice.control_fx(ControlPayload {
            kind: TrackKind::Audio,
            name: "pitch".to_string(),
            property: "pitch".to_string(),
            value: 0.5,
            duration: 0,
        });
        f.slice.control_fx(ControlPayload {
            kind: TrackKind::Audio,
            name: "pitch".to_string(),
            property: "pitch".to_string(),
            value: 2.0,
            duration: 120,
        });
        tokio::time::sleep(Duration::from_millis(500)).await;

        f.ended.fire();
        run.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_ramp_cancels_previous() {
        let f = fixture(TrackKind::Video, "blur");
        let mut pipeline = quiet_pipeline();
        pipeline.expect_get_fx_property().return_const(0.0_f32);
        // the first ramp (to -1.0) is replaced before its first step
        pipeline
            .expect_set_fx_property()
            .withf(|_, _, value| *value < 0.0)
            .times(0)
            .return_const(());
        pipeline
            .expect_set_fx_property()
            .withf(|_, _, value| *value >= 0.0)
            .return_const(());
        let factory = factory_with(pipeline);

        let run = tokio::spawn(Arc::clone(&f.slice).run(factory));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ramp = |value: f32| ControlPayload {
            kind: TrackKind::Video,
            name: "blur".to_string(),
            property: "sigma".to_string(),
            value,
            duration: 1000,
        };
        f.slice.control_fx(ramp(-1.0));
        f.slice.control_fx(ramp(1.0));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(f.slice.ramps.lock().is_empty());

        f.ended.fire();
        run.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ramps_leave_one_running() {
        let f = fixture_with(
            TrackKind::Audio,
            JoinPayload {
                user_id: "alice".to_string(),
                audio_fx: "volume".to_string(),
                ..Default::default()
            },
            SfuConfig {
                interpolator_step_ms: 400,
                ..Default::default()
            },
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = quiet_pipeline();
        pipeline.expect_get_fx_property().return_const(0.0_f32);
        let recorded = Arc::clone(&seen);
        pipeline
            .expect_set_fx_property()
            .returning(move |_, _, value| recorded.lock().push(value));
        let factory = factory_with(pipeline);

        let run = tokio::spawn(Arc::clone(&f.slice).run(factory));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ramp = |value: f32| ControlPayload {
            kind: TrackKind::Audio,
            name: "volume".to_string(),
            property: "gain".to_string(),
            value,
            duration: 4000,
        };
        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let racers: Vec<_> = (1..=8)
            .map(|i| {
                let slice = Arc::clone(&f.slice);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    slice.control_fx(ramp(-(i as f32)));
                })
            })
            .collect();
        for racer in racers {
            racer.await.unwrap();
        }
        // replaces whichever racer won; every other one was already stopped
        f.slice.control_fx(ramp(1.0));
        assert_eq!(f.slice.ramps.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let values = seen.lock().clone();
        assert!(!values.is_empty());
        assert!(values.iter().all(|value| *value >= 0.0), "{values:?}");

        f.ended.fire();
        run.await.unwrap();
    }
}
