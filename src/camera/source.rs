use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::CameraTarget;
use crate::config::{CameraMode, ConfigCamera};

/// Anything smaller is an error page or a truncated capture
const MIN_CAPTURE_BYTES: usize = 1000;
const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// A JPEG as received from the camera, not yet decoded
#[derive(Debug, Clone)]
pub struct JpegFrame {
    pub jpeg: Vec<u8>,
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
}

type PartStream = Pin<
    Box<
        dyn futures::Stream<Item = Result<multipart_stream::Part, multipart_stream::parser::Error>>
            + Send,
    >,
>;

/// Reads an MJPEG (`multipart/x-mixed-replace`) stream part by part
pub struct MjpegStream {
    stream: PartStream,
    idle_timeout: Duration,
}

impl MjpegStream {
    /// `idle_timeout` bounds the wait for each part, so a camera that stops sending is noticed
    pub async fn connect(
        client: &reqwest::Client,
        url: &str,
        idle_timeout: Duration,
    ) -> Result<MjpegStream, SourceError> {
        let res = client
            .get(url)
            .send()
            .await
            .map_err(SourceError::ConnectionError)?;
        if !res.status().is_success() {
            return Err(SourceError::BadStatus(res.status().as_u16()));
        }
        let content_type: mime::Mime = res
            .headers()
            .get(header::CONTENT_TYPE)
            .ok_or_else(|| SourceError::StreamInvalid("Content type header missing on stream".into()))?
            .to_str()
            .map_err(|e| {
                SourceError::StreamInvalid(format!("Content type header invalid string: {}", e))
            })?
            .parse()
            .map_err(|e| SourceError::StreamInvalid(format!("Content type invalid format: {}", e)))?;
        if content_type.type_() != "multipart" {
            return Err(SourceError::StreamInvalid(format!(
                "Content type on stream should have been multipart. Instead it was {}",
                content_type
            )));
        }
        let boundary = content_type.get_param(mime::BOUNDARY).ok_or_else(|| {
            SourceError::StreamInvalid("Multipart stream has no boundary set".to_string())
        })?;
        // Some firmwares put the leading dashes into the parameter itself
        let boundary = boundary.as_str().trim_start_matches("--").to_string();
        debug!(url, boundary=%boundary, "MJPEG stream opened");

        Ok(MjpegStream {
            stream: Box::pin(multipart_stream::parse(res.bytes_stream(), &boundary)),
            idle_timeout,
        })
    }

    pub async fn next_jpeg(&mut self) -> Result<Vec<u8>, SourceError> {
        let part = tokio::time::timeout(self.idle_timeout, self.stream.next())
            .await
            .map_err(|_| SourceError::Stalled(self.idle_timeout))?
            .ok_or(SourceError::ConnectionClosed)?
            .map_err(|e| SourceError::StreamInvalid(format!("Couldn't get next part of stream: {}", e)))?;
        if part.body.len() > MAX_JPEG_BYTES {
            return Err(SourceError::NotAJpeg(format!("{} byte part", part.body.len())));
        }
        let (start, end) = find_jpeg_bounds(&part.body)
            .ok_or_else(|| SourceError::NotAJpeg(format!("{} byte part without JPEG markers", part.body.len())))?;
        trace!(bytes = end - start, "Stream frame");
        Ok(part.body[start..end].to_vec())
    }
}

/// Polls single captures, trying each URL in order until one answers
pub struct SnapshotPoller {
    client: reqwest::Client,
    urls: Vec<String>,
    timeout: Duration,
}

impl SnapshotPoller {
    pub fn new(client: reqwest::Client, urls: Vec<String>, timeout: Duration) -> SnapshotPoller {
        SnapshotPoller {
            client,
            urls,
            timeout,
        }
    }

    pub async fn capture(&self) -> Result<Vec<u8>, SourceError> {
        for url in &self.urls {
            match fetch_capture(&self.client, url, self.timeout).await {
                Ok(jpeg) => {
                    trace!(url=%url, bytes=jpeg.len(), "Capture received");
                    return Ok(jpeg);
                }
                Err(e) => debug!(url=%url, error=%e, "Capture source failed"),
            }
        }
        Err(SourceError::AllSourcesFailed(self.urls.len()))
    }
}

async fn fetch_capture(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<u8>, SourceError> {
    let res = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(SourceError::ConnectionError)?;
    if res.status() != 200 {
        return Err(SourceError::BadStatus(res.status().as_u16()));
    }
    let body = res.bytes().await.map_err(SourceError::ConnectionError)?;
    check_capture(&body)?;
    Ok(body.to_vec())
}

fn check_capture(body: &[u8]) -> Result<(), SourceError> {
    if body.len() <= MIN_CAPTURE_BYTES {
        return Err(SourceError::NotAJpeg(format!("only {} bytes", body.len())));
    }
    if body[..2] != [0xFF, 0xD8] {
        return Err(SourceError::NotAJpeg("missing start of image marker".into()));
    }
    Ok(())
}

/// Locates the first complete JPEG (SOI to EOI) in a buffer
pub(crate) fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .rposition(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

/// Where the frame reader gets its JPEGs from
#[async_trait]
pub trait FrameFeed: Send {
    async fn next_jpeg(&mut self) -> Result<Vec<u8>, SourceError>;
    /// Drops and reopens the connection
    async fn reconnect(&mut self) -> Result<(), SourceError>;
    fn is_snapshot(&self) -> bool;
}

pub enum FrameSource {
    Stream {
        client: reqwest::Client,
        url: String,
        idle_timeout: Duration,
        stream: Option<MjpegStream>,
    },
    Snapshot {
        poller: SnapshotPoller,
        interval: tokio::time::Interval,
    },
}

impl FrameSource {
    /// Opens the camera, retrying the initial connection a few times
    pub async fn open(
        client: reqwest::Client,
        target: &CameraTarget,
        cfg: &ConfigCamera,
    ) -> Result<FrameSource, SourceError> {
        match target.mode {
            CameraMode::Stream => {
                let url = target
                    .stream_url
                    .clone()
                    .ok_or(SourceError::AllSourcesFailed(0))?;
                let mut source = FrameSource::Stream {
                    client,
                    url,
                    idle_timeout: cfg.request_timeout(),
                    stream: None,
                };
                let attempts = cfg.connect_retries.max(1);
                let mut last_err = None;
                for attempt in 1..=attempts {
                    match source.reconnect().await {
                        Ok(()) => return Ok(source),
                        Err(e) => {
                            warn!(attempt, attempts, error=%e, "Stream connection failed");
                            last_err = Some(e);
                            if attempt < attempts {
                                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                            }
                        }
                    }
                }
                Err(last_err.unwrap_or(SourceError::ConnectionClosed))
            }
            CameraMode::Snapshot => {
                if target.capture_urls.is_empty() {
                    return Err(SourceError::AllSourcesFailed(0));
                }
                let mut interval = tokio::time::interval(cfg.snapshot_interval());
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                Ok(FrameSource::Snapshot {
                    poller: SnapshotPoller::new(
                        client,
                        target.capture_urls.clone(),
                        cfg.request_timeout(),
                    ),
                    interval,
                })
            }
        }
    }

}

#[async_trait]
impl FrameFeed for FrameSource {
    async fn next_jpeg(&mut self) -> Result<Vec<u8>, SourceError> {
        match self {
            FrameSource::Stream { stream, .. } => match stream {
                Some(s) => {
                    let res = s.next_jpeg().await;
                    if matches!(
                        res,
                        Err(SourceError::ConnectionClosed)
                            | Err(SourceError::StreamInvalid(_))
                            | Err(SourceError::Stalled(_))
                    ) {
                        *stream = None;
                    }
                    res
                }
                None => Err(SourceError::ConnectionClosed),
            },
            FrameSource::Snapshot { poller, interval } => {
                interval.tick().await;
                poller.capture().await
            }
        }
    }

    /// A no-op for snapshot polling
    async fn reconnect(&mut self) -> Result<(), SourceError> {
        if let FrameSource::Stream {
            client,
            url,
            idle_timeout,
            stream,
        } = self
        {
            *stream = None;
            *stream = Some(MjpegStream::connect(client, url, *idle_timeout).await?);
            info!(url=%url, "Connected to camera stream");
        }
        Ok(())
    }

    fn is_snapshot(&self) -> bool {
        matches!(self, FrameSource::Snapshot { .. })
    }
}

/// Pulls frames off the camera and hands them to the session.
///
/// Frames are dropped when the session has not consumed the previous ones yet, so detection
/// always works on a recent image. Returns the reason reading stopped.
pub async fn run_frame_reader<F: FrameFeed>(
    mut source: F,
    tx: mpsc::Sender<JpegFrame>,
    cfg: ConfigCamera,
    manual: bool,
) -> String {
    let mut seq = 0u64;
    let mut failures = 0u32;
    loop {
        match source.next_jpeg().await {
            Ok(jpeg) => {
                failures = 0;
                seq += 1;
                let frame = JpegFrame {
                    jpeg,
                    seq,
                    captured_at: Utc::now(),
                };
                match tx.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => trace!(seq, "Session busy, frame dropped"),
                    Err(mpsc::error::TrySendError::Closed(_)) => return "session closed".into(),
                }
            }
            Err(e) => {
                failures += 1;
                if source.is_snapshot() {
                    warn!(failures, max=cfg.max_snapshot_failures, error=%e, "Capture failed");
                    if failures >= cfg.max_snapshot_failures.max(1) {
                        return format!("{} consecutive capture failures", failures);
                    }
                    continue;
                }
                warn!(failures, error=%e, "Stream read failed, reconnecting");
                if tx.is_closed() {
                    return "session closed".into();
                }
                if failures >= cfg.reconnect_limit.max(1) {
                    if !manual {
                        return format!("stream lost after {} reconnect attempts", failures);
                    }
                    warn!(pause=?cfg.reconnect_pause(), "Too many reconnect attempts, pausing");
                    tokio::time::sleep(cfg.reconnect_pause()).await;
                    failures = 0;
                } else {
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                if let Err(e) = source.reconnect().await {
                    debug!(error=%e, "Reconnect attempt failed");
                }
            }
        }
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum SourceError {
        ConnectionError(error: reqwest::Error) {
            display("Unable to connect to camera: {}", error)
            source(error)
        }
        BadStatus(status: u16) {
            display("Camera answered with HTTP {}", status)
        }
        StreamInvalid(error: String) {
            display("Stream could not be resolved to a multipart form: {}", error)
        }
        NotAJpeg(error: String) {
            display("Camera returned something that is not a JPEG: {}", error)
        }
        ConnectionClosed {
            display("Camera closed connection")
        }
        Stalled(idle: Duration) {
            display("No data from camera for {:?}", idle)
        }
        AllSourcesFailed(count: usize) {
            display("All {} capture sources failed", count)
        }
    }
}
