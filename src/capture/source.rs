//! Frame source contracts consumed by the streaming session

use async_trait::async_trait;

use crate::capture::Frame;
use crate::error::CaptureError;

/// Anything that produces frames on demand.
///
/// `read` returns `None` once the source is exhausted (end of stream) or has
/// timed out waiting for a frame; the session treats both as terminal.
#[async_trait]
pub trait FrameSource: Send {
    async fn read(&mut self) -> Option<Frame>;

    /// Release the underlying handle. Must be safe to call more than once.
    async fn stop(&mut self) -> Result<(), CaptureError>;
}

/// A pollable, rewindable stream handle (decoded file, camera, animation).
///
/// Calls happen on the capture thread, so implementations may block.
pub trait MediaStream: Send + 'static {
    /// Next frame, `Ok(None)` at end of stream
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Seek back to the first frame
    fn rewind(&mut self) -> Result<(), CaptureError>;

    /// Native frame rate if the container reports one
    fn frame_rate(&self) -> Option<f64> {
        None
    }

    fn release(&mut self) {}
}
