mod avi;

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{info, warn};

use self::avi::AviWriter;
use crate::{
    config::ConfigRecording,
    notify::BackendClient,
    pipeline::{Cooldown, PipelineStats},
};

/// A clip that has been closed and is ready for upload
#[derive(Debug, PartialEq, Clone)]
pub struct FinishedClip {
    pub path: PathBuf,
    pub camera_ip: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub frames: u64,
    pub bytes: u64,
}

enum RecorderState {
    Idle,
    Recording {
        writer: AviWriter,
        path: PathBuf,
        camera_ip: Option<String>,
        started: Instant,
        started_at: DateTime<Utc>,
        frames: u64,
        bytes: u64,
    },
}

/// Writes the JPEG frames following an alert into a Motion JPEG AVI clip
pub struct Recorder {
    directory: PathBuf,
    duration: Duration,
    cooldown: Cooldown,
    state: RecorderState,
}

impl Recorder {
    pub fn new(cfg: &ConfigRecording) -> Recorder {
        Recorder {
            directory: cfg.directory.clone(),
            duration: Duration::from_secs(cfg.duration_secs),
            cooldown: Cooldown::from_secs(cfg.cooldown_secs),
            state: RecorderState::Idle,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, RecorderState::Recording { .. })
    }

    pub async fn start(
        &mut self,
        now: Instant,
        wall: DateTime<Utc>,
        camera_ip: Option<String>,
    ) -> Result<PathBuf, RecordError> {
        if self.is_recording() {
            return Err(RecordError::AlreadyRecording);
        }
        if !self.cooldown.ready(now) {
            return Err(RecordError::CoolingDown(self.cooldown.remaining(now)));
        }
        fs::create_dir_all(&self.directory).await?;
        let path = self.directory.join(clip_file_name(wall));
        let writer = AviWriter::create(&path).await?;
        self.cooldown.mark(now);
        info!(path=%path.display(), duration=?self.duration, "Recording started");
        self.state = RecorderState::Recording {
            writer,
            path: path.clone(),
            camera_ip,
            started: now,
            started_at: wall,
            frames: 0,
            bytes: 0,
        };
        Ok(path)
    }

    /// Appends a frame. Returns the clip once the recording duration has elapsed.
    pub async fn write_frame(
        &mut self,
        jpeg: &[u8],
        now: Instant,
    ) -> Result<Option<FinishedClip>, RecordError> {
        let expired = match &mut self.state {
            RecorderState::Idle => return Ok(None),
            RecorderState::Recording {
                writer,
                started,
                frames,
                bytes,
                ..
            } => {
                writer.write_frame(jpeg).await?;
                *frames += 1;
                *bytes += jpeg.len() as u64;
                now.saturating_duration_since(*started) >= self.duration
            }
        };
        if expired {
            self.finish(now).await
        } else {
            Ok(None)
        }
    }

    /// Closes the current clip early
    pub async fn stop(&mut self, now: Instant) -> Result<Option<FinishedClip>, RecordError> {
        self.finish(now).await
    }

    async fn finish(&mut self, now: Instant) -> Result<Option<FinishedClip>, RecordError> {
        match std::mem::replace(&mut self.state, RecorderState::Idle) {
            RecorderState::Idle => Ok(None),
            RecorderState::Recording {
                writer,
                path,
                camera_ip,
                started,
                started_at,
                frames,
                bytes,
            } => {
                let duration = now.saturating_duration_since(started);
                writer.finish(duration).await?;
                let clip = FinishedClip {
                    path,
                    camera_ip,
                    started_at,
                    duration,
                    frames,
                    bytes,
                };
                info!(path=%clip.path.display(), frames, bytes, "Recording finished");
                Ok(Some(clip))
            }
        }
    }
}

pub fn clip_file_name(wall: DateTime<Utc>) -> String {
    format!("fire_detection_{}.avi", wall.format("%Y%m%d_%H%M%S"))
}

/// Uploads a finished clip and removes the local copy once the backend has it
pub async fn upload_clip(backend: Arc<BackendClient>, clip: FinishedClip, stats: Arc<PipelineStats>) {
    if clip.frames == 0 {
        warn!(path=%clip.path.display(), "Discarding empty recording");
        let _ = fs::remove_file(&clip.path).await;
        return;
    }
    match backend.upload_video(&clip).await {
        Ok(stored) => {
            PipelineStats::incr(&stats.videos_uploaded);
            info!(stored=%stored, "Recording uploaded");
            if let Err(e) = fs::remove_file(&clip.path).await {
                warn!(path=%clip.path.display(), error=%e, "Unable to delete uploaded recording");
            }
        }
        Err(e) => {
            warn!(path=%clip.path.display(), error=%e, "Recording upload failed, keeping local file")
        }
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum RecordError {
        AlreadyRecording {
            display("A recording is already in progress")
        }
        CoolingDown(remaining: Duration) {
            display("Recording cooldown active for another {:.0}s", remaining.as_secs_f32())
        }
        Io(error: std::io::Error) {
            display("Recording file error: {}", error)
            source(error)
            from()
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use chrono::{TimeZone, Utc};

    use super::{clip_file_name, RecordError, Recorder};
    use crate::config::ConfigRecording;

    fn recorder(dir: &std::path::Path) -> Recorder {
        Recorder::new(&ConfigRecording {
            directory: dir.join("clips"),
            duration_secs: 30,
            cooldown_secs: 60,
            ..Default::default()
        })
    }

    #[test]
    fn test_file_name() {
        let wall = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(clip_file_name(wall), "fire_detection_20240309_140507.avi");
    }

    #[tokio::test]
    async fn test_records_for_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        let t0 = Instant::now();

        // Frames are ignored while idle
        assert_eq!(rec.write_frame(b"ignored", t0).await.unwrap(), None);

        let path = rec.start(t0, Utc::now(), Some("10.0.0.5".into())).await.unwrap();
        assert!(rec.is_recording());
        assert!(matches!(
            rec.start(t0, Utc::now(), None).await,
            Err(RecordError::AlreadyRecording)
        ));

        assert_eq!(rec.write_frame(b"frame-1", t0 + Duration::from_secs(1)).await.unwrap(), None);
        let clip = rec
            .write_frame(b"frame-2", t0 + Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(!rec.is_recording());
        assert_eq!(clip.path, path);
        assert_eq!(clip.frames, 2);
        assert_eq!(clip.bytes, 14);
        assert_eq!(clip.duration, Duration::from_secs(30));
        assert_eq!(clip.camera_ip.as_deref(), Some("10.0.0.5"));

        let avi = std::fs::read(&path).unwrap();
        assert_eq!(&avi[0..4], b"RIFF");
        assert_eq!(&avi[8..12], b"AVI ");
        // Total frames in the main header
        assert_eq!(u32::from_le_bytes([avi[48], avi[49], avi[50], avi[51]]), 2);
        for payload in [b"frame-1", b"frame-2"] {
            // Odd sized payloads are padded to an even length
            let size = 7u32.to_le_bytes();
            let parts: [&[u8]; 4] = [b"00dc", &size, payload, &[0]];
            let chunk = parts.concat();
            assert!(avi.windows(chunk.len()).any(|w| w == chunk.as_slice()));
        }
    }

    #[tokio::test]
    async fn test_cooldown_between_clips() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        let t0 = Instant::now();
        rec.start(t0, Utc::now(), None).await.unwrap();
        let clip = rec.stop(t0 + Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(clip.frames, 0);

        match rec.start(t0 + Duration::from_secs(20), Utc::now(), None).await {
            Err(RecordError::CoolingDown(left)) => assert_eq!(left, Duration::from_secs(40)),
            other => panic!("unexpected {:?}", other),
        }
        let wall = Utc.with_ymd_and_hms(2024, 3, 9, 14, 6, 0).unwrap();
        assert!(rec.start(t0 + Duration::from_secs(60), wall, None).await.is_ok());
    }
}
