use std::{sync::Arc, time::Duration, time::Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{format_phone, format_whatsapp_alert, Gallery, Messenger};
use crate::{
    config::ConfigWhatsapp,
    events::{ConfirmedFire, LogLevel, PipelineEvent},
    pipeline::{Cooldown, PipelineStats},
};

/// Fans a confirmed fire out to MQTT, the gallery and WhatsApp
pub struct Dispatcher {
    events: mpsc::Sender<PipelineEvent>,
    backend: Option<Arc<dyn Gallery>>,
    gowa: Option<Arc<dyn Messenger>>,
    whatsapp: ConfigWhatsapp,
    stats: Arc<PipelineStats>,
    upload_cooldown: Cooldown,
    whatsapp_cooldown: Cooldown,
}

impl Dispatcher {
    pub fn new(
        events: mpsc::Sender<PipelineEvent>,
        backend: Option<Arc<dyn Gallery>>,
        gowa: Option<Arc<dyn Messenger>>,
        whatsapp: ConfigWhatsapp,
        upload_cooldown_secs: u64,
        stats: Arc<PipelineStats>,
    ) -> Dispatcher {
        let whatsapp_cooldown = Cooldown::from_secs(whatsapp.cooldown_secs);
        Dispatcher {
            events,
            backend,
            gowa,
            whatsapp,
            stats,
            upload_cooldown: Cooldown::from_secs(upload_cooldown_secs),
            whatsapp_cooldown,
        }
    }

    /// Runs the dispatcher on its own task
    pub fn spawn(mut self) -> mpsc::Sender<ConfirmedFire> {
        let (tx, mut rx) = mpsc::channel::<ConfirmedFire>(4);
        tokio::spawn(
            async move {
                while let Some(fire) = rx.recv().await {
                    self.handle(fire, Instant::now()).await;
                }
                debug!("Dispatcher stopped");
            }
            .instrument(info_span!("Dispatcher")),
        );
        tx
    }

    pub async fn handle(&mut self, fire: ConfirmedFire, now: Instant) {
        let Dispatcher {
            events,
            backend,
            gowa,
            whatsapp,
            stats,
            upload_cooldown,
            whatsapp_cooldown,
        } = self;
        let report = &fire.report;
        info!(
            camera=%report.camera.id,
            confidence=report.confidence,
            verified=report.verification.verified,
            fallback=report.verification.fallback,
            "Dispatching fire alert"
        );
        if events.send(PipelineEvent::Alert(report.clone())).await.is_err() {
            error!("MQTT event channel closed, alert not published");
        }
        PipelineStats::incr(&stats.alerts_sent);

        let upload = async {
            let backend = match backend.as_deref() {
                Some(b) => b,
                None => return,
            };
            if !upload_cooldown.try_acquire(now) {
                debug!(remaining=?upload_cooldown.remaining(now), "Gallery upload cooling down");
                return;
            }
            match backend.upload_detection(report, fire.snapshot.clone()).await {
                Ok(id) => {
                    PipelineStats::incr(&stats.photos_uploaded);
                    info!(id=?id, "Snapshot uploaded to gallery");
                }
                Err(e) => warn!(error=%e, "Gallery upload failed"),
            }
        };

        let notify = async {
            let gowa = match gowa.as_deref() {
                Some(g) => g,
                None => return,
            };
            if !whatsapp_cooldown.ready(now) {
                debug!(remaining=?whatsapp_cooldown.remaining(now), "WhatsApp cooling down");
                return;
            }
            let caption = format_whatsapp_alert(report, whatsapp, &chrono::Local);
            let sent = broadcast(gowa, backend.as_deref(), whatsapp, &fire.snapshot, &caption).await;
            if sent > 0 {
                whatsapp_cooldown.mark(now);
                PipelineStats::add(&stats.whatsapp_sent, sent);
                info!(sent, "WhatsApp alerts sent");
            } else {
                warn!("No WhatsApp alert could be delivered");
            }
        };

        tokio::join!(upload, notify);

        let _ = events
            .send(PipelineEvent::Log {
                category: "alert".into(),
                level: LogLevel::Warning,
                message: format!(
                    "Fire detected on camera {} ({:.0}%)",
                    report.camera.id,
                    report.confidence * 100.0
                ),
            })
            .await;
    }
}

/// Sends the alert to every enabled recipient and group. Returns the number delivered.
async fn broadcast(
    gowa: &dyn Messenger,
    backend: Option<&dyn Gallery>,
    cfg: &ConfigWhatsapp,
    jpeg: &[u8],
    caption: &str,
) -> u64 {
    let mut targets: Vec<(String, String)> = Vec::new();
    if let Some(backend) = backend {
        match backend.recipients().await {
            Ok(recipients) => targets.extend(
                recipients
                    .into_iter()
                    .map(|r| (format_phone(&r.phone), r.name)),
            ),
            Err(e) => warn!(error=%e, "Unable to fetch WhatsApp recipients"),
        }
    }
    let groups = match backend {
        Some(backend) => backend.alert_groups(cfg.groups_fallback_file.as_deref()).await,
        None => match &cfg.groups_fallback_file {
            Some(path) => super::backend::load_groups_file(path).await,
            None => Ok(Default::default()),
        },
    };
    match groups {
        Ok(groups) => targets.extend(
            groups
                .active()
                .into_iter()
                .map(|g| (g.jid.clone(), g.name.clone())),
        ),
        Err(e) => warn!(error=%e, "Unable to load WhatsApp groups"),
    }
    if targets.is_empty() {
        warn!("No WhatsApp recipients configured");
        return 0;
    }

    let delay = Duration::from_millis(cfg.send_delay_ms);
    let mut sent = 0;
    for (i, (to, name)) in targets.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(delay).await;
        }
        let result = match gowa.send_image(to, jpeg, caption).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Text fallback when the media upload is rejected
                debug!(to=%to, error=%e, "Image send failed, falling back to text");
                gowa.send_message(to, caption).await
            }
        };
        match result {
            Ok(()) => {
                sent += 1;
                debug!(to=%to, name=%name, "WhatsApp alert delivered");
            }
            Err(e) => warn!(to=%to, name=%name, error=%e, "WhatsApp alert failed"),
        }
    }
    sent
}
