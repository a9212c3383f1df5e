use std::{path::PathBuf, sync::Arc, time::Duration};

use structopt::StructOpt;
use tokio::{sync::mpsc, time::Instant};
use tracing::{error, info, trace, warn};

#[macro_use]
extern crate quick_error;

mod camera;
mod config;
mod detect;
mod events;
mod frame;
mod mqtt;
mod notify;
mod pipeline;
mod recorder;
mod verify;

use camera::{CameraTracker, TrackerAction, TrackerState};
use config::{CliOverrides, Config, ConfigSystem, ConfigVerification, LogFormat};
use detect::{Detector, YoloDetector};
use events::{LogLevel, PipelineEvent, ServiceStatus};
use notify::{BackendClient, Dispatcher, Gallery, GowaClient, Messenger};
use pipeline::{spawn_session, PipelineStats, SessionContext, SessionHandle, VerifierMode};
use verify::{Availability, GeminiVerifier};

const STATS_INTERVAL: Duration = Duration::from_secs(10);
const MQTT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, StructOpt)]
#[structopt(
    name = "fire_sink",
    about = "Fire detection for ESP32-CAM streams with MQTT, WhatsApp and gallery alerts."
)]
struct CliArgs {
    #[structopt(
        parse(from_os_str),
        short = "c",
        long = "config",
        default_value = "config.toml",
        help = "Path to configuration file. See sample_config.toml for format.",
        env = "FIRESINK_CONFIG"
    )]
    config: PathBuf,
    #[structopt(long, help = "Fixed MJPEG stream URL. Disables MQTT discovery.")]
    stream_url: Option<String>,
    #[structopt(long, help = "Fixed camera IP. Disables MQTT discovery.")]
    camera_ip: Option<String>,
    #[structopt(long, parse(from_os_str), help = "Path to the ONNX detection model")]
    model: Option<PathBuf>,
    #[structopt(long = "conf", help = "Detector confidence threshold (0-1)")]
    confidence: Option<f32>,
    #[structopt(long = "no-gemini", help = "Alert on the detector alone")]
    no_verification: bool,
    #[structopt(long = "no-record", help = "Do not record clips after an alert")]
    no_recording: bool,
    #[structopt(long, help = "Do not send WhatsApp alerts")]
    no_whatsapp: bool,
    #[structopt(long, help = "Log at debug level")]
    debug: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            stream_url: self.stream_url.clone(),
            camera_ip: self.camera_ip.clone(),
            model: self.model.clone(),
            confidence: self.confidence,
            no_verification: self.no_verification,
            no_recording: self.no_recording,
            no_whatsapp: self.no_whatsapp,
            debug: self.debug,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::from_args();
    let mut cfg = match config::load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Unable to load configuration {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };
    cfg.apply_overrides(&args.overrides());

    if let Err(e) = init_tracing(&cfg.system) {
        eprintln!("Unable to initialise logging: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = cfg.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "FireSink running");
    trace!("Config: {:?}", cfg);

    if let Err(e) = run(cfg).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn init_tracing(system: &ConfigSystem) -> Result<(), String> {
    let filter = tracing_subscriber::EnvFilter::try_new(&system.log_level)
        .map_err(|e| format!("invalid log level {:?}: {}", system.log_level, e))?;
    let builder = tracing_subscriber::fmt()
        // Filter from user
        .with_env_filter(filter);
    match system.log_format {
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    }
    .map_err(|e| e.to_string())
}

async fn verifier_mode(cfg: &ConfigVerification) -> VerifierMode {
    if !cfg.enabled {
        info!("Verification disabled, alerting on detector confidence");
        return VerifierMode::Disabled;
    }
    let verifier = match GeminiVerifier::new(cfg) {
        Ok(v) => v,
        Err(e) => {
            warn!(error=%e, "Unable to create verification client");
            return VerifierMode::Unavailable;
        }
    };
    match verifier.check_availability().await {
        Availability::Available => VerifierMode::Ready(Arc::new(verifier)),
        // Quota resets over time, each request falls back on its own
        Availability::QuotaExceeded => VerifierMode::Ready(Arc::new(verifier)),
        Availability::InvalidKey | Availability::Unavailable(_) => {
            warn!(
                fallback = cfg.fallback_confidence,
                "Alerts need detector confidence above the fallback threshold"
            );
            VerifierMode::Unavailable
        }
    }
}

async fn run(cfg: Config) -> Result<(), String> {
    let cfg = Arc::new(cfg);
    let stats = Arc::new(PipelineStats::new());

    let model_cfg = cfg.detection.clone();
    let detector = tokio::task::spawn_blocking(move || YoloDetector::load(&model_cfg))
        .await
        .map_err(|e| format!("Model loader failed: {}", e))?
        .map_err(|e| format!("Unable to load detection model: {}", e))?;
    info!(model=%detector.name(), classes=?cfg.detection.class_names, "Detection model loaded");

    let verifier = verifier_mode(&cfg.verification).await;

    let backend = if cfg.backend.enabled {
        Some(Arc::new(
            BackendClient::new(&cfg.backend).map_err(|e| e.to_string())?,
        ))
    } else {
        None
    };
    let gowa = if cfg.whatsapp.enabled {
        let gowa = GowaClient::new(&cfg.whatsapp).map_err(|e| e.to_string())?;
        gowa.log_health().await;
        Some(Arc::new(gowa))
    } else {
        None
    };
    let http = reqwest::Client::builder()
        .connect_timeout(cfg.camera.request_timeout())
        .build()
        .map_err(|e| format!("Unable to create camera client: {}", e))?;

    // Connect to MQTT
    let mut link = mqtt::initiate_connection(&cfg);
    let events = link.events.clone();
    let _ = events
        .send(PipelineEvent::Log {
            category: "system".into(),
            level: LogLevel::Info,
            message: format!("FireSink {} started", env!("CARGO_PKG_VERSION")),
        })
        .await;

    let alerts = Dispatcher::new(
        events.clone(),
        backend.clone().map(|b| b as Arc<dyn Gallery>),
        gowa.map(|g| g as Arc<dyn Messenger>),
        cfg.whatsapp.clone(),
        cfg.backend.upload_cooldown_secs,
        stats.clone(),
    )
    .spawn();

    let ctx = Arc::new(SessionContext {
        cfg: cfg.clone(),
        detector: Arc::new(detector),
        verifier,
        http,
        backend,
        events: events.clone(),
        alerts,
        stats: stats.clone(),
    });
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<(u64, String)>();
    let mut supervisor = Supervisor {
        ctx,
        tracker: CameraTracker::new(cfg.camera.clone()),
        session: None,
        retry_at: None,
        ended: ended_tx,
    };

    let mut heartbeat = tokio::time::interval(cfg.camera.heartbeat_check());
    let mut stats_interval = tokio::time::interval(STATS_INTERVAL);
    let mut discovery_deadline = cfg
        .camera
        .discovery_timeout_secs
        .filter(|_| !cfg.camera.is_manual())
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    let actions = supervisor.tracker.start(std::time::Instant::now());
    supervisor.apply(actions).await;

    let mut terminate = Terminate::register();
    let result = loop {
        let actions = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break Ok(());
            }
            _ = terminate.recv() => {
                info!("Terminated, shutting down");
                break Ok(());
            }
            presence = link.presence.recv() => match presence {
                Some(presence) => supervisor.tracker.on_presence(presence, std::time::Instant::now()),
                None => break Err("MQTT connection task stopped".to_string()),
            },
            Some((session, reason)) = ended_rx.recv() => {
                supervisor.session_ended(session);
                supervisor.tracker.session_ended(session, &reason)
            }
            _ = heartbeat.tick() => supervisor.tracker.tick(std::time::Instant::now()),
            _ = sleep_until(supervisor.retry_at) => {
                supervisor.retry_at = None;
                supervisor.tracker.retry(std::time::Instant::now())
            }
            _ = sleep_until(discovery_deadline) => {
                discovery_deadline = None;
                if matches!(supervisor.tracker.state(), TrackerState::Waiting) {
                    break Err(format!(
                        "No usable camera discovered within {}s ({} announced)",
                        cfg.camera.discovery_timeout_secs.unwrap_or_default(),
                        supervisor.tracker.known_cameras().count()
                    ));
                }
                Vec::new()
            }
            _ = stats_interval.tick() => {
                let snapshot = stats.snapshot();
                info!(
                    camera_online = supervisor.tracker.is_online(),
                    frames = snapshot.frames_processed,
                    detections = snapshot.yolo_detections,
                    color_rejected = snapshot.color_rejected,
                    verified = snapshot.gemini_verified,
                    rejected = snapshot.gemini_rejected,
                    alerts = snapshot.alerts_sent,
                    "Pipeline stats"
                );
                let _ = events.send(PipelineEvent::Stats(snapshot)).await;
                Vec::new()
            }
        };
        supervisor.apply(actions).await;
    };

    // Shutdown: stop detection, flush recordings and leave an offline status behind
    supervisor.tracker.shutdown();
    if let Some(handle) = supervisor.session.take() {
        handle.stop("shutting down").await;
    }
    if let Err(e) = &result {
        let _ = events
            .send(PipelineEvent::Log {
                category: "system".into(),
                level: LogLevel::Error,
                message: e.clone(),
            })
            .await;
    }
    let _ = events.send(PipelineEvent::Stats(stats.snapshot())).await;
    let _ = events
        .send(PipelineEvent::Status {
            status: ServiceStatus::Offline,
            message: "Service stopped".into(),
            camera_online: false,
        })
        .await;
    link.shutdown.run(MQTT_SHUTDOWN_TIMEOUT).await;
    info!(stats=?stats.snapshot(), "FireSink stopped");
    result
}

/// Owns the running session and carries out what the tracker decides
struct Supervisor {
    ctx: Arc<SessionContext>,
    tracker: CameraTracker,
    session: Option<SessionHandle>,
    retry_at: Option<Instant>,
    ended: mpsc::UnboundedSender<(u64, String)>,
}

impl Supervisor {
    async fn apply(&mut self, actions: Vec<TrackerAction>) {
        for action in actions {
            match action {
                TrackerAction::StartSession { target, session } => {
                    if let Some(old) = self.session.take() {
                        old.stop("replaced by a new session").await;
                    }
                    info!(session, camera=%target.camera.id, mode=%target.mode, "Starting detection session");
                    self.session = Some(spawn_session(
                        self.ctx.clone(),
                        target,
                        session,
                        self.ended.clone(),
                    ));
                }
                TrackerAction::StopSession { session, reason } => match self.session.take() {
                    Some(handle) if handle.session == session => {
                        info!(session, reason=%reason, "Stopping detection session");
                        handle.stop(&reason).await;
                    }
                    other => self.session = other,
                },
                TrackerAction::RetryAfter(delay) => {
                    info!(delay=?delay, "Retrying camera later");
                    self.retry_at = Some(Instant::now() + delay);
                }
                TrackerAction::Status {
                    status,
                    message,
                    camera_online,
                } => {
                    let _ = self
                        .ctx
                        .events
                        .send(PipelineEvent::Status {
                            status,
                            message,
                            camera_online,
                        })
                        .await;
                }
            }
        }
    }

    /// Forgets the handle of a session that exited on its own
    fn session_ended(&mut self, session: u64) {
        if self.session.as_ref().map(|s| s.session) == Some(session) {
            self.session = None;
        }
    }
}

/// Sleeps until the deadline, or forever without one
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// SIGTERM listener, registered once for the whole run
struct Terminate {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl Terminate {
    #[cfg(unix)]
    fn register() -> Terminate {
        use tokio::signal::unix::{signal, SignalKind};
        let signal = match signal(SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error=%e, "Unable to listen for SIGTERM");
                None
            }
        };
        Terminate { signal }
    }

    #[cfg(not(unix))]
    fn register() -> Terminate {
        Terminate {}
    }

    /// Resolves on SIGTERM. Never resolves where the signal cannot be received.
    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(signal) = self.signal.as_mut() {
            if signal.recv().await.is_some() {
                return;
            }
        }
        futures::future::pending::<()>().await
    }
}

#[cfg(test)]
mod test {
    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_survives_cancelled_polls() {
        use std::time::Duration;

        let mut terminate = super::Terminate::register();
        // Losing the select race must not drop the handler
        for _ in 0..3 {
            assert!(tokio::time::timeout(Duration::from_millis(10), terminate.recv())
                .await
                .is_err());
        }
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
        tokio::time::timeout(Duration::from_secs(5), terminate.recv())
            .await
            .unwrap();
    }
}
