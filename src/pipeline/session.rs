use std::{collections::BTreeMap, sync::Arc, time::Instant};

use chrono::Utc;
use image::RgbImage;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{decide, Cooldown, Decision, PipelineStats, VerificationOutcome};
use crate::{
    camera::{run_frame_reader, CameraTarget, FrameSource, JpegFrame},
    config::Config,
    detect::{screen_detections, BoundingBox, Candidate, Detector, Screening},
    events::{CameraInfo, ConfirmedFire, FireReport, PipelineEvent, VerificationSummary},
    frame::{self, Frame},
    notify::BackendClient,
    recorder::{self, RecordError, Recorder},
    verify::{self, VerificationQueue, Verdict, Verifier, VerifyResult},
};

const FRAME_BUFFER: usize = 2;
const MAX_PENDING: usize = 8;
const BOX_VERIFIED: [u8; 3] = [0, 255, 0];
const BOX_UNVERIFIED: [u8; 3] = [255, 0, 0];
const SNAPSHOT_QUALITY: u8 = 90;

/// How verification is used for this run
#[derive(Clone)]
pub enum VerifierMode {
    Disabled,
    /// Enabled but failed the startup check: alerts need high detector confidence
    Unavailable,
    Ready(Arc<dyn Verifier>),
}

/// Everything a session needs that outlives it
pub struct SessionContext {
    pub cfg: Arc<Config>,
    pub detector: Arc<dyn Detector>,
    pub verifier: VerifierMode,
    pub http: reqwest::Client,
    pub backend: Option<Arc<BackendClient>>,
    pub events: mpsc::Sender<PipelineEvent>,
    pub alerts: mpsc::Sender<ConfirmedFire>,
    pub stats: Arc<PipelineStats>,
}

pub struct SessionHandle {
    pub session: u64,
    stop: oneshot::Sender<String>,
    join: JoinHandle<()>,
}

impl SessionHandle {
    /// Asks the session to stop and waits for it to wind down
    pub async fn stop(self, reason: &str) {
        let _ = self.stop.send(reason.to_string());
        if let Err(e) = self.join.await {
            error!(session = self.session, error=%e, "Session task failed");
        }
    }
}

/// Starts a detection session for the camera. Its exit is reported on `ended`.
pub fn spawn_session(
    ctx: Arc<SessionContext>,
    target: CameraTarget,
    session: u64,
    ended: mpsc::UnboundedSender<(u64, String)>,
) -> SessionHandle {
    let (stop_tx, stop_rx) = oneshot::channel::<String>();
    let span = info_span!("Session", session, camera=%target.camera.id);
    let join = tokio::spawn(
        async move {
            let reason = run_session(ctx, target, stop_rx).await;
            info!(reason=%reason, "Detection session ended");
            let _ = ended.send((session, reason));
        }
        .instrument(span),
    );
    SessionHandle {
        session,
        stop: stop_tx,
        join,
    }
}

async fn run_session(
    ctx: Arc<SessionContext>,
    target: CameraTarget,
    mut stop: oneshot::Receiver<String>,
) -> String {
    let source = tokio::select! {
        res = FrameSource::open(ctx.http.clone(), &target, &ctx.cfg.camera) => match res {
            Ok(source) => source,
            Err(e) => {
                warn!(error=%e, "Unable to open camera");
                return format!("unable to open camera: {}", e);
            }
        },
        reason = &mut stop => return reason.unwrap_or_else(|_| "stopped".into()),
    };
    let (frame_tx, frame_rx) = mpsc::channel::<JpegFrame>(FRAME_BUFFER);
    let reader = tokio::spawn(
        run_frame_reader(source, frame_tx, ctx.cfg.camera.clone(), target.manual)
            .in_current_span(),
    );
    let reason = run_detection_loop(&ctx, &target.camera, frame_rx, stop).await;
    if !reason.is_empty() {
        reader.abort();
        return reason;
    }
    reader
        .await
        .unwrap_or_else(|e| format!("frame reader failed: {}", e))
}

struct Pending {
    frame: Frame,
    candidate: Candidate,
}

struct Processed {
    frame: Frame,
    raw_detections: usize,
    screening: Screening,
    verify_jpeg: Option<Vec<u8>>,
}

/// The per-frame loop. Returns an empty string when the frame source ended on its own.
pub(crate) async fn run_detection_loop(
    ctx: &SessionContext,
    camera: &CameraInfo,
    mut frames: mpsc::Receiver<JpegFrame>,
    mut stop: oneshot::Receiver<String>,
) -> String {
    let cfg = &ctx.cfg;
    let mut alert_cooldown = Cooldown::from_secs(cfg.alerts.cooldown_secs);
    let mut verify_cooldown = Cooldown::new(cfg.verification.cooldown());
    let mut recorder = cfg.recording.enabled.then(|| Recorder::new(&cfg.recording));
    let (mut queue, mut results) = match &ctx.verifier {
        VerifierMode::Ready(v) => {
            let (q, r) = VerificationQueue::spawn(v.clone(), cfg.verification.queue_depth);
            (Some(q), Some(r))
        }
        _ => (None, None),
    };
    let mut pending: BTreeMap<u64, Pending> = BTreeMap::new();
    let mut received = 0u64;

    let _ = ctx
        .events
        .send(PipelineEvent::DetectionStarted {
            camera: camera.clone(),
        })
        .await;
    info!("Detection started");

    let reason = loop {
        tokio::select! {
            biased;
            reason = &mut stop => break reason.unwrap_or_else(|_| "stopped".into()),
            result = recv_optional(&mut results) => match result {
                Some(result) => {
                    handle_verification(ctx, camera, result, &mut pending, &mut alert_cooldown, &mut recorder).await;
                }
                None => {
                    error!("Verification worker stopped, continuing without verification");
                    results = None;
                    queue = None;
                    pending.clear();
                }
            },
            frame = frames.recv() => {
                let frame = match frame {
                    Some(f) => f,
                    None => break String::new(),
                };
                received += 1;
                if let Some(rec) = recorder.as_mut() {
                    feed_recorder(ctx, rec, &frame.jpeg).await;
                }
                if (received - 1) % cfg.detection.process_every_n_frames as u64 != 0 {
                    continue;
                }
                let processed = match process_frame(ctx, frame, queue.is_some()).await {
                    Some(p) => p,
                    None => continue,
                };
                let now = Instant::now();
                let best = match processed.screening.best() {
                    Some(best) => best.clone(),
                    None => continue,
                };
                if !alert_cooldown.ready(now) {
                    debug!(remaining=?alert_cooldown.remaining(now), confidence=best.detection.confidence, "Alert cooling down");
                    continue;
                }
                match (&ctx.verifier, queue.as_mut()) {
                    (_, Some(queue)) => {
                        if !verify_cooldown.try_acquire(now) {
                            continue;
                        }
                        let jpeg = match processed.verify_jpeg {
                            Some(j) => j,
                            None => continue,
                        };
                        match queue.try_submit(jpeg, best.detection.confidence) {
                            Some(id) => {
                                debug!(id, confidence=best.detection.confidence, "Candidate sent for verification");
                                if pending.len() >= MAX_PENDING {
                                    let oldest = pending.keys().next().copied();
                                    if let Some(oldest) = oldest {
                                        pending.remove(&oldest);
                                    }
                                }
                                pending.insert(id, Pending { frame: processed.frame, candidate: best });
                            }
                            None => PipelineStats::incr(&ctx.stats.verification_dropped),
                        }
                    }
                    (mode, None) => {
                        let outcome = match mode {
                            VerifierMode::Disabled => VerificationOutcome::Disabled,
                            _ => VerificationOutcome::Unavailable,
                        };
                        match decide(best.detection.confidence, &outcome, &cfg.verification) {
                            Decision::Confirm(summary) => {
                                if alert_cooldown.try_acquire(now) {
                                    confirm_fire(ctx, camera, processed.frame, best, summary, &mut recorder).await;
                                }
                            }
                            Decision::Discard { reason } => {
                                debug!(reason=%reason, confidence=best.detection.confidence, "Candidate discarded");
                            }
                        }
                    }
                }
            }
        }
    };

    if let Some(rec) = recorder.as_mut() {
        match rec.stop(Instant::now()).await {
            Ok(Some(clip)) => finish_clip(ctx, clip),
            Ok(None) => {}
            Err(e) => warn!(error=%e, "Unable to close recording"),
        }
    }
    let _ = ctx
        .events
        .send(PipelineEvent::DetectionStopped {
            camera: camera.clone(),
            reason: if reason.is_empty() {
                "camera stream ended".into()
            } else {
                reason.clone()
            },
        })
        .await;
    reason
}

/// Resolves to the next item, or never when there is no receiver
async fn recv_optional<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

/// Decodes, detects and screens a frame on the blocking pool
async fn process_frame(ctx: &SessionContext, frame: JpegFrame, want_verify: bool) -> Option<Processed> {
    let detector = ctx.detector.clone();
    let cfg = ctx.cfg.clone();
    let res = tokio::task::spawn_blocking(move || -> Result<Processed, String> {
        let mut decoded = Frame::from_jpeg(frame.jpeg, frame.seq).map_err(|e| e.to_string())?;
        decoded.captured_at = frame.captured_at;
        let detections = detector.detect(&decoded.image).map_err(|e| e.to_string())?;
        let raw_detections = detections.len();
        let screening = screen_detections(&decoded.image, detections, &cfg.detection);
        let verify_jpeg = match (want_verify, screening.best()) {
            (true, Some(best)) => {
                verify::prepare_image(&decoded.image, &best.detection.bbox, &cfg.verification).ok()
            }
            _ => None,
        };
        Ok(Processed {
            frame: decoded,
            raw_detections,
            screening,
            verify_jpeg,
        })
    })
    .await;

    let stats = &ctx.stats;
    match res {
        Ok(Ok(processed)) => {
            PipelineStats::incr(&stats.frames_processed);
            PipelineStats::add(&stats.yolo_detections, processed.raw_detections as u64);
            PipelineStats::add(&stats.color_rejected, processed.screening.color_rejected as u64);
            if let Some(best) = processed.screening.best() {
                debug!(
                    seq = processed.frame.seq,
                    confidence = best.detection.confidence,
                    area = best.area,
                    candidates = processed.screening.candidates.len(),
                    "Fire candidate"
                );
            }
            Some(processed)
        }
        Ok(Err(e)) => {
            warn!(error=%e, "Frame processing failed");
            None
        }
        Err(e) => {
            error!(error=%e, "Detection worker panicked");
            None
        }
    }
}

async fn handle_verification(
    ctx: &SessionContext,
    camera: &CameraInfo,
    result: VerifyResult,
    pending: &mut BTreeMap<u64, Pending>,
    alert_cooldown: &mut Cooldown,
    recorder: &mut Option<Recorder>,
) {
    let stats = &ctx.stats;
    match &result.verdict {
        Verdict::Verified { .. } => PipelineStats::incr(&stats.gemini_verified),
        Verdict::Rejected { .. } => PipelineStats::incr(&stats.gemini_rejected),
        Verdict::QuotaExceeded | Verdict::Failed { .. } => PipelineStats::incr(&stats.gemini_errors),
    }
    let item = match pending.remove(&result.id) {
        Some(p) => p,
        None => {
            debug!(id = result.id, "Verification result for an expired candidate");
            return;
        }
    };
    let confidence = item.candidate.detection.confidence;
    info!(
        id = result.id,
        score=?result.verdict.score(),
        verdict=?result.verdict,
        elapsed_ms = result.elapsed.as_millis() as u64,
        "Verification result"
    );
    match decide(confidence, &VerificationOutcome::Done(result.verdict), &ctx.cfg.verification) {
        Decision::Confirm(summary) => {
            if alert_cooldown.try_acquire(Instant::now()) {
                confirm_fire(ctx, camera, item.frame, item.candidate, summary, recorder).await;
            } else {
                debug!("Confirmed fire inside alert cooldown, not re-alerting");
            }
        }
        Decision::Discard { reason } => info!(reason=%reason, confidence, "Candidate discarded"),
    }
}

async fn confirm_fire(
    ctx: &SessionContext,
    camera: &CameraInfo,
    frame: Frame,
    candidate: Candidate,
    verification: VerificationSummary,
    recorder: &mut Option<Recorder>,
) {
    let bbox = candidate.detection.bbox;
    let verified = verification.verified;
    let detected_at = frame.captured_at;
    let image = frame.image;
    let rendered = tokio::task::spawn_blocking(move || annotate(image, &bbox, verified))
        .await
        .map_err(|e| e.to_string())
        .and_then(|r| r.map_err(|e| e.to_string()));
    let snapshot = snapshot_or_raw(rendered, frame.jpeg);

    let report = FireReport {
        camera: camera.clone(),
        detected_at,
        model: ctx.detector.name().to_string(),
        class_name: candidate.detection.class_name.clone(),
        confidence: candidate.detection.confidence,
        bbox,
        area: candidate.area,
        color: candidate.color,
        verification,
    };
    warn!(
        confidence = report.confidence,
        verified = report.verification.verified,
        fallback = report.verification.fallback,
        "FIRE CONFIRMED"
    );

    if let Some(rec) = recorder.as_mut() {
        match rec.start(Instant::now(), Utc::now(), camera.address.clone()).await {
            Ok(path) => debug!(path=%path.display(), "Recording alert clip"),
            Err(RecordError::CoolingDown(left)) => debug!(remaining=?left, "Recording cooling down"),
            Err(RecordError::AlreadyRecording) => {}
            Err(e) => warn!(error=%e, "Unable to start recording"),
        }
    }

    if let Err(e) = ctx.alerts.try_send(ConfirmedFire { report, snapshot }) {
        warn!(error=%e, "Alert dispatcher busy, alert dropped");
    }
}

/// Draws the detection on the frame and encodes it for sharing
pub(crate) fn annotate(
    mut image: RgbImage,
    bbox: &BoundingBox,
    verified: bool,
) -> Result<Vec<u8>, frame::FrameError> {
    let color = if verified { BOX_VERIFIED } else { BOX_UNVERIFIED };
    frame::draw_box(&mut image, bbox, color, 3);
    frame::encode_jpeg(&image, SNAPSHOT_QUALITY)
}

fn snapshot_or_raw(rendered: Result<Vec<u8>, String>, raw: Vec<u8>) -> Vec<u8> {
    match rendered {
        Ok(jpeg) => jpeg,
        Err(e) => {
            warn!(error=%e, "Unable to annotate alert snapshot, sending the camera frame");
            raw
        }
    }
}

async fn feed_recorder(ctx: &SessionContext, rec: &mut Recorder, jpeg: &[u8]) {
    if !rec.is_recording() {
        return;
    }
    match rec.write_frame(jpeg, Instant::now()).await {
        Ok(Some(clip)) => finish_clip(ctx, clip),
        Ok(None) => {}
        Err(e) => warn!(error=%e, "Unable to write recording frame"),
    }
}

fn finish_clip(ctx: &SessionContext, clip: recorder::FinishedClip) {
    PipelineStats::incr(&ctx.stats.videos_recorded);
    let upload = ctx.cfg.recording.upload;
    match (&ctx.backend, upload) {
        (Some(backend), true) => {
            tokio::spawn(
                recorder::upload_clip(backend.clone(), clip, ctx.stats.clone()).in_current_span(),
            );
        }
        _ => info!(path=%clip.path.display(), "Recording kept locally"),
    }
}

#[cfg(test)]
mod test {
    use std::{path::PathBuf, sync::Arc, time::Duration};

    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use tokio::sync::{mpsc, oneshot};

    use super::{annotate, run_detection_loop, snapshot_or_raw, SessionContext, VerifierMode};
    use crate::{
        camera::JpegFrame,
        config::*,
        detect::{BoundingBox, DetectError, Detection, Detector},
        events::{CameraInfo, PipelineEvent},
        frame,
        pipeline::PipelineStats,
        verify::{Verdict, Verifier},
    };

    struct FixedDetector(f32);

    impl Detector for FixedDetector {
        fn name(&self) -> &str {
            "fixed.onnx"
        }
        fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>, DetectError> {
            Ok(vec![Detection {
                class_id: 0,
                class_name: "fire".into(),
                confidence: self.0,
                bbox: BoundingBox::new(0.0, 0.0, 40.0, 40.0),
            }])
        }
    }

    struct ConfirmAll;

    #[async_trait]
    impl Verifier for ConfirmAll {
        fn name(&self) -> &str {
            "confirm"
        }
        async fn verify(&self, _jpeg: &[u8], _confidence: f32) -> Verdict {
            Verdict::Verified {
                score: 0.92,
                reason: "open flames".into(),
            }
        }
    }

    struct RejectAll;

    #[async_trait]
    impl Verifier for RejectAll {
        fn name(&self) -> &str {
            "reject"
        }
        async fn verify(&self, _jpeg: &[u8], _confidence: f32) -> Verdict {
            Verdict::Rejected {
                score: 0.1,
                reason: "a lamp".into(),
            }
        }
    }

    fn test_config() -> Config {
        Config {
            system: ConfigSystem::default(),
            mqtt: ConfigMqtt {
                address: "localhost".into(),
                port: 1883,
                username: String::new(),
                password: String::new(),
                client_prefix: "fire_sink".into(),
                topics: MqttTopicsConfig::default(),
            },
            camera: ConfigCamera::default(),
            detection: ConfigDetection {
                model_path: PathBuf::from("fixed.onnx"),
                input_size: 640,
                class_names: vec!["fire".into()],
                confidence_threshold: 0.35,
                iou_threshold: 0.45,
                min_area: 200,
                process_every_n_frames: 1,
                color: ConfigColor::default(),
            },
            verification: ConfigVerification::default(),
            alerts: ConfigAlerts::default(),
            recording: ConfigRecording {
                enabled: false,
                ..Default::default()
            },
            backend: ConfigBackend::default(),
            whatsapp: ConfigWhatsapp::default(),
        }
    }

    fn orange_frame(seq: u64) -> JpegFrame {
        let img = RgbImage::from_pixel(64, 64, Rgb([255, 120, 0]));
        JpegFrame {
            jpeg: frame::encode_jpeg(&img, 95).unwrap(),
            seq,
            captured_at: chrono::Utc::now(),
        }
    }

    struct Harness {
        ctx: SessionContext,
        events: mpsc::Receiver<PipelineEvent>,
        alerts: mpsc::Receiver<crate::events::ConfirmedFire>,
    }

    fn harness(confidence: f32, verifier: VerifierMode) -> Harness {
        harness_with(test_config(), confidence, verifier)
    }

    fn harness_with(cfg: Config, confidence: f32, verifier: VerifierMode) -> Harness {
        let (events_tx, events) = mpsc::channel(64);
        let (alerts_tx, alerts) = mpsc::channel(8);
        Harness {
            ctx: SessionContext {
                cfg: Arc::new(cfg),
                detector: Arc::new(FixedDetector(confidence)),
                verifier,
                http: reqwest::Client::new(),
                backend: None,
                events: events_tx,
                alerts: alerts_tx,
                stats: Arc::new(PipelineStats::new()),
            },
            events,
            alerts,
        }
    }

    fn camera() -> CameraInfo {
        CameraInfo {
            id: "cam".into(),
            address: Some("10.0.0.5".into()),
        }
    }

    #[tokio::test]
    async fn test_unverified_alert_and_cooldown() {
        let mut h = harness(0.9, VerifierMode::Disabled);
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = oneshot::channel();
        frame_tx.send(orange_frame(1)).await.unwrap();
        frame_tx.send(orange_frame(2)).await.unwrap();
        drop(frame_tx);

        let reason = run_detection_loop(&h.ctx, &camera(), frame_rx, stop_rx).await;
        assert_eq!(reason, "");

        let fire = h.alerts.recv().await.unwrap();
        assert_eq!(fire.report.camera.id, "cam");
        assert_eq!(fire.report.model, "fixed.onnx");
        assert!(!fire.report.verification.verified);
        assert_eq!(&fire.snapshot[..2], &[0xFF, 0xD8]);
        // Second frame falls inside the alert cooldown
        assert!(h.alerts.try_recv().is_err());

        let snap = h.ctx.stats.snapshot();
        assert_eq!(snap.frames_processed, 2);
        assert_eq!(snap.yolo_detections, 2);

        assert!(matches!(h.events.recv().await, Some(PipelineEvent::DetectionStarted { .. })));
        match h.events.recv().await {
            Some(PipelineEvent::DetectionStopped { reason, .. }) => {
                assert_eq!(reason, "camera stream ended")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unavailable_verifier_needs_high_confidence() {
        let mut h = harness(0.6, VerifierMode::Unavailable);
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = oneshot::channel();
        frame_tx.send(orange_frame(1)).await.unwrap();
        drop(frame_tx);
        run_detection_loop(&h.ctx, &camera(), frame_rx, stop_rx).await;
        assert!(h.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejected_by_verifier() {
        let mut h = harness(0.95, VerifierMode::Ready(Arc::new(RejectAll)));
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = oneshot::channel();
        frame_tx.send(orange_frame(1)).await.unwrap();

        let stats = h.ctx.stats.clone();
        let waiter = async move {
            tokio::time::timeout(Duration::from_secs(10), async {
                while stats.snapshot().gemini_rejected == 0 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();
            stop_tx.send("test done".to_string()).unwrap();
        };
        let cam = camera();
        let (reason, ()) = tokio::join!(
            run_detection_loop(&h.ctx, &cam, frame_rx, stop_rx),
            waiter
        );
        assert_eq!(reason, "test done");
        assert!(h.alerts.try_recv().is_err());
        drop(frame_tx);
    }

    #[tokio::test]
    async fn test_verified_fire_dispatched_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            recording: ConfigRecording {
                enabled: true,
                directory: dir.path().join("clips"),
                upload: false,
                ..Default::default()
            },
            ..test_config()
        };
        let Harness {
            ctx,
            events: _events,
            mut alerts,
        } = harness_with(cfg, 0.7, VerifierMode::Ready(Arc::new(ConfirmAll)));
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = oneshot::channel();
        frame_tx.send(orange_frame(1)).await.unwrap();

        let stats = ctx.stats.clone();
        let driver = async move {
            let fire = tokio::time::timeout(Duration::from_secs(10), alerts.recv())
                .await
                .unwrap()
                .unwrap();
            // Recording started with the alert, the next frame lands in the clip
            frame_tx.send(orange_frame(2)).await.unwrap();
            tokio::time::timeout(Duration::from_secs(10), async {
                while stats.snapshot().frames_processed < 2 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();
            stop_tx.send("test done".to_string()).unwrap();
            fire
        };
        let cam = camera();
        let (reason, fire) = tokio::join!(
            run_detection_loop(&ctx, &cam, frame_rx, stop_rx),
            driver
        );
        assert_eq!(reason, "test done");

        let report = &fire.report;
        assert!(report.verification.verified);
        assert!(!report.verification.fallback);
        assert_eq!(report.verification.score, Some(0.92));
        assert_eq!(report.verification.reason.as_deref(), Some("open flames"));
        assert_eq!(report.camera.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(&fire.snapshot[..2], &[0xFF, 0xD8]);

        let snap = ctx.stats.snapshot();
        assert_eq!(snap.gemini_verified, 1);
        assert_eq!(snap.videos_recorded, 1);
        let clips: Vec<_> = std::fs::read_dir(dir.path().join("clips"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].extension().unwrap(), "avi");
        let avi = std::fs::read(&clips[0]).unwrap();
        assert_eq!(&avi[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([avi[48], avi[49], avi[50], avi[51]]), 1);
    }

    #[test]
    fn test_snapshot_falls_back_to_camera_frame() {
        let raw = vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9];
        assert_eq!(snapshot_or_raw(Err("encoder failed".into()), raw.clone()), raw);
        assert_eq!(snapshot_or_raw(Ok(vec![1, 2]), raw), vec![1, 2]);
    }

    #[test]
    fn test_annotate_colors() {
        let img = RgbImage::new(50, 50);
        let jpeg = annotate(img, &BoundingBox::new(10.0, 10.0, 40.0, 40.0), true).unwrap();
        let decoded = frame::decode_jpeg(&jpeg).unwrap();
        let px = decoded.get_pixel(10, 25).0;
        assert!(px[1] > 120 && px[1] > px[0] + 60, "{:?}", px);
    }
}
