mod announcement;
mod source;
mod tracker;

pub use announcement::{CameraAnnouncement, CameraEvent};
pub use source::{run_frame_reader, FrameSource, JpegFrame};
pub use tracker::{CameraTarget, CameraTracker, Presence, TrackerAction, TrackerState};
