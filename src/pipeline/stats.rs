use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use serde::{Deserialize, Serialize};

/// Counters shared by the session, the dispatcher and the uploaders
#[derive(Debug)]
pub struct PipelineStats {
    started: Instant,
    pub frames_processed: AtomicU64,
    pub yolo_detections: AtomicU64,
    pub color_rejected: AtomicU64,
    pub gemini_verified: AtomicU64,
    pub gemini_rejected: AtomicU64,
    pub gemini_errors: AtomicU64,
    pub verification_dropped: AtomicU64,
    pub alerts_sent: AtomicU64,
    pub photos_uploaded: AtomicU64,
    pub videos_recorded: AtomicU64,
    pub videos_uploaded: AtomicU64,
    pub whatsapp_sent: AtomicU64,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Default)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub frames_processed: u64,
    pub yolo_detections: u64,
    pub color_rejected: u64,
    pub gemini_verified: u64,
    pub gemini_rejected: u64,
    pub gemini_errors: u64,
    pub verification_dropped: u64,
    pub alerts_sent: u64,
    pub photos_uploaded: u64,
    pub videos_recorded: u64,
    pub videos_uploaded: u64,
    pub whatsapp_sent: u64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        PipelineStats::new()
    }
}

impl PipelineStats {
    pub fn new() -> PipelineStats {
        PipelineStats {
            started: Instant::now(),
            frames_processed: AtomicU64::new(0),
            yolo_detections: AtomicU64::new(0),
            color_rejected: AtomicU64::new(0),
            gemini_verified: AtomicU64::new(0),
            gemini_rejected: AtomicU64::new(0),
            gemini_errors: AtomicU64::new(0),
            verification_dropped: AtomicU64::new(0),
            alerts_sent: AtomicU64::new(0),
            photos_uploaded: AtomicU64::new(0),
            videos_recorded: AtomicU64::new(0),
            videos_uploaded: AtomicU64::new(0),
            whatsapp_sent: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            frames_processed: get(&self.frames_processed),
            yolo_detections: get(&self.yolo_detections),
            color_rejected: get(&self.color_rejected),
            gemini_verified: get(&self.gemini_verified),
            gemini_rejected: get(&self.gemini_rejected),
            gemini_errors: get(&self.gemini_errors),
            verification_dropped: get(&self.verification_dropped),
            alerts_sent: get(&self.alerts_sent),
            photos_uploaded: get(&self.photos_uploaded),
            videos_recorded: get(&self.videos_recorded),
            videos_uploaded: get(&self.videos_uploaded),
            whatsapp_sent: get(&self.whatsapp_sent),
        }
    }
}
