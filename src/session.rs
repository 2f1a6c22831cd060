//! Fixed-cadence streaming loop and its shutdown sequence

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

use crate::capture::FrameSource;
use crate::error::ConfigError;
use crate::streamer::StreamManager;

/// Why the send loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The source returned no frame (end of stream or read timeout)
    EndOfStream,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames: u64,
    /// Frames whose processing overran the frame budget
    pub late_frames: u64,
    /// Frames where at least one destination failed
    pub fanout_failures: u64,
    pub end: SessionEnd,
}

pub struct StreamSession {
    frame_interval: Duration,
    span: Span,
}

impl StreamSession {
    pub fn new(fps: u32, span: Span) -> Result<Self, ConfigError> {
        if fps == 0 {
            return Err(ConfigError::Invalid("fps must be a positive integer".into()));
        }
        Ok(Self {
            frame_interval: Duration::from_secs_f64(1.0 / f64::from(fps)),
            span,
        })
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    /// Pulls, fans out and paces frames until the source ends or `cancel`
    /// fires, then stops the source and closes every streamer, in that order.
    pub async fn run<S>(
        &self,
        source: &mut S,
        manager: &mut StreamManager,
        cancel: CancellationToken,
    ) -> SessionSummary
    where
        S: FrameSource + ?Sized,
    {
        debug!(parent: &self.span, interval = ?self.frame_interval, "Streaming loop started");
        let mut frames = 0;
        let mut late_frames = 0;
        let mut fanout_failures = 0;

        let end = loop {
            let started = Instant::now();

            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                frame = source.read() => frame,
            };
            let Some(frame) = frame else {
                warn!(parent: &self.span, "Received no frame, stopping streaming");
                break SessionEnd::EndOfStream;
            };

            if let Err(e) = manager.process_and_send_frame(&frame).await {
                warn!(parent: &self.span, "Frame {}: {}", frame.meta.sequence, e);
                fanout_failures += 1;
            }
            frames += 1;

            let elapsed = started.elapsed();
            metrics::histogram!("ledcast_frame_process_us").record(elapsed.as_micros() as f64);

            match self.frame_interval.checked_sub(elapsed) {
                Some(wait) if !wait.is_zero() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break SessionEnd::Cancelled,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                _ => {
                    late_frames += 1;
                    metrics::counter!("ledcast_frame_late_total").increment(1);
                    debug!(
                        parent: &self.span,
                        "Processing took longer than frame interval: {:?}",
                        elapsed
                    );
                }
            }
        };

        debug!(parent: &self.span, ?end, "Streaming loop terminating");
        if let Err(e) = source.stop().await {
            error!(parent: &self.span, "Stopping source failed: {}", e);
        }
        if let Err(e) = manager.close_all().await {
            error!(parent: &self.span, "Closing streamers failed: {}", e);
        }

        let summary = SessionSummary {
            frames,
            late_frames,
            fanout_failures,
            end,
        };
        info!(parent: &self.span, ?summary, "Streaming stopped");
        summary
    }

    /// Runs the loop on its own task
    pub fn spawn(
        self,
        mut source: Box<dyn FrameSource>,
        mut manager: StreamManager,
    ) -> SessionHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(source.as_mut(), &mut manager, token).await });
        SessionHandle { cancel, task }
    }
}

/// Control handle for a spawned session
pub struct SessionHandle {
    cancel: CancellationToken,
    task: JoinHandle<SessionSummary>,
}

impl SessionHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the loop and waits for the shutdown sequence to complete
    pub async fn stop(self) -> Result<SessionSummary, tokio::task::JoinError> {
        self.cancel.cancel();
        self.task.await
    }

    /// Waits for the session to end on its own
    pub async fn join(self) -> Result<SessionSummary, tokio::task::JoinError> {
        self.task.await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, ImageSource};
    use crate::error::{CaptureError, StreamError};
    use crate::pipeline::{DeviceGeometry, FrameTransformer};
    use crate::streamer::{DeviceStreamer, TransformSettings};
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Yields `remaining` frames then ends; logs lifecycle events
    struct CountingSource {
        remaining: usize,
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl FrameSource for CountingSource {
        async fn read(&mut self) -> Option<Frame> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            Some(Frame::from_rgb_image(
                RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])),
                self.remaining as u64,
            ))
        }

        async fn stop(&mut self) -> Result<(), CaptureError> {
            self.events.lock().unwrap().push("source.stop");
            Ok(())
        }
    }

    struct CountingStreamer {
        transformer: FrameTransformer,
        sent: Arc<AtomicUsize>,
        events: Arc<Mutex<Vec<&'static str>>>,
        open: bool,
    }

    #[async_trait]
    impl DeviceStreamer for CountingStreamer {
        fn target(&self) -> &str {
            "counting"
        }

        fn transformer(&self) -> &FrameTransformer {
            &self.transformer
        }

        fn is_closed(&self) -> bool {
            !self.open
        }

        async fn send(&mut self, _image: &RgbImage) -> Result<(), StreamError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn query_geometry(&mut self) -> Result<DeviceGeometry, StreamError> {
            Ok(self.transformer.geometry())
        }

        async fn close(&mut self) -> Result<(), StreamError> {
            self.open = false;
            self.events.lock().unwrap().push("manager.close");
            Ok(())
        }
    }

    fn manager(events: &Arc<Mutex<Vec<&'static str>>>) -> (StreamManager, Arc<AtomicUsize>) {
        let sent = Arc::new(AtomicUsize::new(0));
        let streamer = CountingStreamer {
            transformer: TransformSettings::default()
                .build(DeviceGeometry::new(2, 2))
                .unwrap(),
            sent: sent.clone(),
            events: events.clone(),
            open: true,
        };
        (StreamManager::new(vec![Box::new(streamer)], Span::none()), sent)
    }

    #[test]
    fn zero_fps_is_rejected() {
        assert!(StreamSession::new(0, Span::none()).is_err());
        let session = StreamSession::new(50, Span::none()).unwrap();
        assert_eq!(session.frame_interval(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn end_of_stream_runs_shutdown_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut source = CountingSource {
            remaining: 3,
            events: events.clone(),
        };
        let (mut manager, sent) = manager(&events);

        let session = StreamSession::new(200, Span::none()).unwrap();
        let summary = session
            .run(&mut source, &mut manager, CancellationToken::new())
            .await;

        assert_eq!(summary.end, SessionEnd::EndOfStream);
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.fanout_failures, 0);
        assert_eq!(sent.load(Ordering::SeqCst), 3);
        assert_eq!(*events.lock().unwrap(), vec!["source.stop", "manager.close"]);
    }

    #[tokio::test]
    async fn loop_keeps_cadence() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut source = CountingSource {
            remaining: 5,
            events: events.clone(),
        };
        let (mut manager, _) = manager(&events);

        let session = StreamSession::new(50, Span::none()).unwrap();
        let started = Instant::now();
        session
            .run(&mut source, &mut manager, CancellationToken::new())
            .await;
        // Five paced iterations at 20ms each
        assert!(started.elapsed() >= Duration::from_millis(95));
    }

    #[tokio::test]
    async fn stop_signal_halts_a_spawned_session() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (manager, sent) = manager(&events);
        let source = ImageSource::from_frame(Frame::from_rgb_image(
            RgbImage::from_pixel(8, 8, Rgb([9, 9, 9])),
            0,
        ));

        let handle = StreamSession::new(100, Span::none())
            .unwrap()
            .spawn(Box::new(source), manager);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let summary = handle.stop().await.unwrap();

        assert_eq!(summary.end, SessionEnd::Cancelled);
        assert!(summary.frames >= 1);
        assert_eq!(sent.load(Ordering::SeqCst) as u64, summary.frames);
        assert_eq!(*events.lock().unwrap(), vec!["manager.close"]);
    }
}
