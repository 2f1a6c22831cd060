//! Fans one source frame out to every configured destination

use futures::future::join_all;
use tracing::{debug, info, info_span, instrument, warn, Span};

use crate::capture::Frame;
use crate::error::{FanoutError, StreamError};
use crate::streamer::{connect, DeviceStreamer, TransformSettings, Transport};

/// Owns one streamer per physical destination, in configuration order
pub struct StreamManager {
    streamers: Vec<Box<dyn DeviceStreamer>>,
    span: Span,
}

impl StreamManager {
    pub fn new(streamers: Vec<Box<dyn DeviceStreamer>>, span: Span) -> Self {
        Self { streamers, span }
    }

    /// Opens every destination in order. If one fails, those already opened
    /// are closed before the error is returned.
    pub async fn connect_all(
        destinations: &[(Transport, TransformSettings)],
        span: Span,
    ) -> Result<Self, StreamError> {
        let mut manager = Self::new(Vec::with_capacity(destinations.len()), span);

        for (index, (transport, settings)) in destinations.iter().enumerate() {
            let child = info_span!(parent: &manager.span, "streamer", index);
            debug!(parent: &manager.span, ?transport, "Initializing streamer {}", index);
            match connect(transport, settings, child).await {
                Ok(streamer) => manager.streamers.push(streamer),
                Err(e) => {
                    if let Err(close_err) = manager.close_all().await {
                        warn!(parent: &manager.span, "Cleanup after failed init: {}", close_err);
                    }
                    return Err(e);
                }
            }
        }

        info!(parent: &manager.span, "{} streamer(s) ready", manager.streamers.len());
        Ok(manager)
    }

    /// Transforms and sends `frame` through every streamer concurrently.
    ///
    /// A failing destination never stops the others; all failures come back
    /// together with their destination index.
    #[instrument(level = "trace", parent = &self.span, skip_all, fields(sequence = frame.meta.sequence))]
    pub async fn process_and_send_frame(&mut self, frame: &Frame) -> Result<(), FanoutError> {
        let results = join_all(
            self.streamers
                .iter_mut()
                .enumerate()
                .map(|(index, streamer)| async move {
                    (index, streamer.process_and_send(frame).await)
                }),
        )
        .await;

        let failures: Vec<(usize, StreamError)> = results
            .into_iter()
            .filter_map(|(index, result)| result.err().map(|e| (index, e)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FanoutError { failures })
        }
    }

    /// Closes every streamer, continuing past failures. Safe to call twice.
    pub async fn close_all(&mut self) -> Result<(), FanoutError> {
        let Self { streamers, span } = self;
        let mut failures = Vec::new();
        for (index, streamer) in streamers.iter_mut().enumerate() {
            if streamer.is_closed() {
                continue;
            }
            debug!(parent: &*span, "Closing streamer {} ({})", index, streamer.target());
            if let Err(e) = streamer.close().await {
                warn!(parent: &*span, "Closing {} failed: {}", streamer.target(), e);
                failures.push((index, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FanoutError { failures })
        }
    }

    pub fn len(&self) -> usize {
        self.streamers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streamers.is_empty()
    }

    pub fn streamers(&self) -> &[Box<dyn DeviceStreamer>] {
        &self.streamers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{DeviceGeometry, FrameTransformer};
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records sent frames; optionally fails every send or close
    struct RecordingStreamer {
        target: String,
        transformer: FrameTransformer,
        fail_send: bool,
        fail_close: bool,
        open: bool,
        sent: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl RecordingStreamer {
        fn boxed(
            width: u32,
            fail_send: bool,
            fail_close: bool,
        ) -> (Box<dyn DeviceStreamer>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let sent = Arc::new(AtomicUsize::new(0));
            let closes = Arc::new(AtomicUsize::new(0));
            let streamer = Self {
                target: format!("mock-{}", width),
                transformer: TransformSettings::default()
                    .build(DeviceGeometry::new(width, 4))
                    .unwrap(),
                fail_send,
                fail_close,
                open: true,
                sent: sent.clone(),
                closes: closes.clone(),
            };
            (Box::new(streamer), sent, closes)
        }
    }

    #[async_trait]
    impl DeviceStreamer for RecordingStreamer {
        fn target(&self) -> &str {
            &self.target
        }

        fn transformer(&self) -> &FrameTransformer {
            &self.transformer
        }

        fn is_closed(&self) -> bool {
            !self.open
        }

        async fn send(&mut self, image: &RgbImage) -> Result<(), StreamError> {
            let geometry = self.transformer.geometry();
            assert_eq!(image.dimensions(), (geometry.width, geometry.height));
            if self.fail_send {
                return Err(StreamError::Transport(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn query_geometry(&mut self) -> Result<DeviceGeometry, StreamError> {
            Ok(self.transformer.geometry())
        }

        async fn close(&mut self) -> Result<(), StreamError> {
            self.open = false;
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(StreamError::Transport(std::io::ErrorKind::Other.into()));
            }
            Ok(())
        }
    }

    fn frame() -> Frame {
        Frame::from_rgb_image(RgbImage::from_pixel(32, 18, Rgb([10, 20, 30])), 1)
    }

    #[tokio::test]
    async fn failing_destination_does_not_block_others() {
        let (a, sent_a, _) = RecordingStreamer::boxed(8, false, false);
        let (b, sent_b, _) = RecordingStreamer::boxed(16, true, false);
        let (c, sent_c, _) = RecordingStreamer::boxed(5, false, false);
        let mut manager = StreamManager::new(vec![a, b, c], Span::none());

        let err = manager.process_and_send_frame(&frame()).await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].0, 1);
        assert_eq!(sent_a.load(Ordering::SeqCst), 1);
        assert_eq!(sent_b.load(Ordering::SeqCst), 0);
        assert_eq!(sent_c.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_all_is_idempotent_and_tolerates_failures() {
        let (a, _, closes_a) = RecordingStreamer::boxed(8, false, true);
        let (b, _, closes_b) = RecordingStreamer::boxed(8, false, false);
        let mut manager = StreamManager::new(vec![a, b], Span::none());

        let err = manager.close_all().await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(closes_b.load(Ordering::SeqCst), 1);

        manager.close_all().await.unwrap();
        assert_eq!(closes_a.load(Ordering::SeqCst), 1);
        assert_eq!(closes_b.load(Ordering::SeqCst), 1);

        let err = manager.process_and_send_frame(&frame()).await.unwrap_err();
        assert!(err
            .failures
            .iter()
            .all(|(_, e)| matches!(e, StreamError::Closed)));
    }
}
