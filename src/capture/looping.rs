//! Threaded pull loop around a [`MediaStream`] with bounded buffering and looping

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use flume::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn, Span};

use crate::capture::colorspace::ColorConversion;
use crate::capture::source::{FrameSource, MediaStream};
use crate::capture::Frame;
use crate::error::CaptureError;

/// Queue depth for bufferable (file-like) streams
pub const DEFAULT_BUFFER_CAPACITY: usize = 96;

/// How long `read` waits when no timeout is configured
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How often a blocked producer re-checks the termination flag
const SEND_POLL: Duration = Duration::from_millis(50);

/// `None` on the channel is the end-of-stream sentinel
type Pulled = Option<Frame>;

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Rewind to the first frame on end of stream instead of finishing
    pub loop_stream: bool,
    /// Keep a FIFO of decoded frames (file-like sources). When false only the
    /// most recent frame is kept and stale frames are dropped.
    pub buffered: bool,
    pub buffer_capacity: usize,
    /// Upper bound on how long `read` blocks; `None` means [`DEFAULT_READ_TIMEOUT`]
    pub read_timeout: Option<Duration>,
    pub colorspace: Option<ColorConversion>,
    /// Pull as fast as possible instead of at the stream's native rate
    pub nosync: bool,
    /// Warm-up delay before the first frame is pulled
    pub time_delay: Option<Duration>,
    pub span: Span,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            loop_stream: false,
            buffered: true,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            read_timeout: None,
            colorspace: None,
            nosync: false,
            time_delay: None,
            span: Span::none(),
        }
    }
}

/// Background capture around a pollable stream.
///
/// The first frame is pulled during construction so an unusable source fails
/// fast. `start` launches the pull thread, `read` takes frames off a bounded
/// channel and `stop` joins the thread after it has released the stream.
pub struct LoopingCapture {
    stream: Option<Box<dyn MediaStream>>,
    tx: Option<Sender<Pulled>>,
    rx: Receiver<Pulled>,
    terminate: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    options: CaptureOptions,
    finished: bool,
}

impl LoopingCapture {
    pub fn new(
        mut stream: Box<dyn MediaStream>,
        mut options: CaptureOptions,
    ) -> Result<Self, CaptureError> {
        let span = options.span.clone();
        let _enter = span.enter();

        if let Some(delay) = options.time_delay {
            thread::sleep(delay);
        }

        let first = match stream.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                stream.release();
                return Err(CaptureError::SourceUnavailable(
                    "stream ended before the first frame".into(),
                ));
            }
            Err(e) => {
                stream.release();
                return Err(CaptureError::SourceUnavailable(e.to_string()));
            }
        };

        let first = match options.colorspace {
            Some(conversion) => match conversion.apply(&first) {
                Ok(converted) => converted,
                Err(e) => {
                    warn!("Disabling colorspace conversion: {}", e);
                    options.colorspace = None;
                    first
                }
            },
            None => first,
        };

        let capacity = if options.buffered {
            options.buffer_capacity.max(1)
        } else {
            1
        };
        let (tx, rx) = bounded::<Pulled>(capacity);
        // Capacity is at least one and nothing else holds the channel yet
        let _ = tx.try_send(Some(first));

        info!(
            buffered = options.buffered,
            capacity,
            loop_stream = options.loop_stream,
            "Capture initialized"
        );

        Ok(Self {
            stream: Some(stream),
            tx: Some(tx),
            rx,
            terminate: Arc::new(AtomicBool::new(false)),
            handle: None,
            options,
            finished: false,
        })
    }

    /// Launch the background pull thread
    pub fn start(&mut self) -> Result<(), CaptureError> {
        let (Some(stream), Some(tx)) = (self.stream.take(), self.tx.take()) else {
            return Ok(());
        };

        let period = match stream.frame_rate() {
            Some(fps) if fps > 1.0 && !self.options.nosync => {
                Some(Duration::from_secs_f64(1.0 / fps))
            }
            _ => None,
        };

        let puller = Puller {
            stream,
            tx,
            evict: (!self.options.buffered).then(|| self.rx.clone()),
            terminate: self.terminate.clone(),
            loop_stream: self.options.loop_stream,
            colorspace: self.options.colorspace,
            period,
        };
        let span = self.options.span.clone();

        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let _enter = span.enter();
                puller.run();
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Blocking read for callers outside the async runtime
    pub fn read_blocking(&mut self) -> Option<Frame> {
        if self.finished {
            return None;
        }
        let outcome = match self.rx.recv_timeout(self.read_timeout()) {
            Ok(pulled) => Some(pulled),
            Err(RecvTimeoutError::Disconnected) => Some(None),
            Err(RecvTimeoutError::Timeout) => None,
        };
        self.settle(outcome)
    }

    /// Signal termination, drain the buffer and join the pull thread
    pub fn stop_blocking(&mut self) -> Result<(), CaptureError> {
        self.terminate.store(true, Ordering::SeqCst);
        self.drain();

        let result = match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| CaptureError::ThreadPanicked),
            None => {
                // Never started: the stream is still ours to release
                if let Some(mut stream) = self.stream.take() {
                    stream.release();
                }
                Ok(())
            }
        };

        self.drain();
        self.tx = None;
        self.finished = true;
        debug!("Capture stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn read_timeout(&self) -> Duration {
        self.options.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT)
    }

    /// `None` here covers the sentinel, a disconnected channel and a timeout
    fn settle(&mut self, outcome: Option<Pulled>) -> Option<Frame> {
        match outcome {
            Some(Some(frame)) => Some(frame),
            Some(None) => {
                debug!("End of stream reached");
                self.finished = true;
                None
            }
            None => {
                warn!("No frame available within {:?}", self.read_timeout());
                None
            }
        }
    }

    fn drain(&self) {
        for _ in self.rx.drain() {}
    }
}

#[async_trait]
impl FrameSource for LoopingCapture {
    async fn read(&mut self) -> Option<Frame> {
        if self.finished {
            return None;
        }
        let outcome = tokio::time::timeout(self.read_timeout(), self.rx.recv_async())
            .await
            .ok()
            .map(|received| received.unwrap_or(None));
        self.settle(outcome)
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        self.terminate.store(true, Ordering::SeqCst);
        self.drain();

        if let Some(handle) = self.handle.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                self.stop_blocking()?;
                return Err(CaptureError::ThreadPanicked);
            }
        }
        self.stop_blocking()
    }
}

impl Drop for LoopingCapture {
    fn drop(&mut self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.drain();
    }
}

/// State owned by the pull thread
struct Puller {
    stream: Box<dyn MediaStream>,
    tx: Sender<Pulled>,
    /// Receiver clone used to drop the stale frame in unbuffered mode
    evict: Option<Receiver<Pulled>>,
    terminate: Arc<AtomicBool>,
    loop_stream: bool,
    colorspace: Option<ColorConversion>,
    period: Option<Duration>,
}

impl Puller {
    fn run(mut self) {
        // The first frame was pulled at construction
        let mut since_rewind: u64 = 1;

        while !self.terminated() {
            // A freshly rewound stream reads its first frame without waiting
            if let Some(period) = self.period.filter(|_| since_rewind > 0) {
                thread::sleep(period);
                if self.terminated() {
                    break;
                }
            }

            let frame = match self.stream.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if self.rewind_or_finish(since_rewind) {
                        since_rewind = 0;
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    warn!("Read error, treating as end of stream: {}", e);
                    if self.rewind_or_finish(since_rewind) {
                        since_rewind = 0;
                        continue;
                    }
                    break;
                }
            };
            since_rewind += 1;

            let frame = self.convert(frame);
            if !self.push(Some(frame)) {
                break;
            }
        }

        if !self.terminated() {
            self.push(None);
        }
        self.stream.release();
        debug!("Capture thread exiting");
    }

    fn terminated(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// True when the stream was rewound and pulling should continue
    fn rewind_or_finish(&mut self, since_rewind: u64) -> bool {
        if !self.loop_stream {
            return false;
        }
        if since_rewind == 0 {
            warn!("Stream produced no frames after rewinding, giving up");
            return false;
        }
        match self.stream.rewind() {
            Ok(()) => {
                debug!("Looping stream");
                true
            }
            Err(e) => {
                warn!("Rewind failed: {}", e);
                false
            }
        }
    }

    fn convert(&mut self, frame: Frame) -> Frame {
        let Some(conversion) = self.colorspace else {
            return frame;
        };
        match conversion.apply(&frame) {
            Ok(converted) => converted,
            Err(e) => {
                warn!("Disabling colorspace conversion: {}", e);
                self.colorspace = None;
                frame
            }
        }
    }

    /// False once the consumer is gone or termination was requested
    fn push(&self, item: Pulled) -> bool {
        match &self.evict {
            // The end-of-stream marker queues behind the newest frame
            Some(evict) if item.is_some() => {
                let mut item = item;
                loop {
                    match self.tx.try_send(item) {
                        Ok(()) => return true,
                        Err(TrySendError::Full(back)) => {
                            let _ = evict.try_recv();
                            item = back;
                        }
                        Err(TrySendError::Disconnected(_)) => return false,
                    }
                }
            }
            _ => {}
        }

        let mut item = item;
        loop {
            match self.tx.send_timeout(item, SEND_POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.terminated() {
                        return false;
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::sync::atomic::AtomicUsize;

    /// Fixed list of single-pixel frames whose red channel is the frame number
    struct ScriptedStream {
        frames: Vec<u8>,
        cursor: usize,
        rate: Option<f64>,
        released: Arc<AtomicUsize>,
    }

    impl ScriptedStream {
        fn new(count: u8) -> (Self, Arc<AtomicUsize>) {
            let released = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    frames: (1..=count).collect(),
                    cursor: 0,
                    rate: None,
                    released: released.clone(),
                },
                released,
            )
        }
    }

    impl MediaStream for ScriptedStream {
        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            let Some(&value) = self.frames.get(self.cursor) else {
                return Ok(None);
            };
            self.cursor += 1;
            Ok(Frame::new(
                vec![value, 0, 0],
                1,
                1,
                PixelFormat::Rgb24,
                self.cursor as u64,
            ))
        }

        fn rewind(&mut self) -> Result<(), CaptureError> {
            self.cursor = 0;
            Ok(())
        }

        fn frame_rate(&self) -> Option<f64> {
            self.rate
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn options(loop_stream: bool) -> CaptureOptions {
        CaptureOptions {
            loop_stream,
            read_timeout: Some(Duration::from_secs(2)),
            ..CaptureOptions::default()
        }
    }

    fn red(frame: Option<Frame>) -> Option<u8> {
        frame.map(|f| f.data[0])
    }

    #[test]
    fn looping_cycles_through_frames() {
        let (stream, _) = ScriptedStream::new(3);
        let mut capture = LoopingCapture::new(Box::new(stream), options(true)).unwrap();
        capture.start().unwrap();

        let seen: Vec<_> = (0..8).map(|_| red(capture.read_blocking())).collect();
        assert_eq!(
            seen,
            vec![1, 2, 3, 1, 2, 3, 1, 2].into_iter().map(Some).collect::<Vec<_>>()
        );
        capture.stop_blocking().unwrap();
    }

    #[test]
    fn non_looping_ends_after_last_frame() {
        let (stream, released) = ScriptedStream::new(3);
        let mut capture = LoopingCapture::new(Box::new(stream), options(false)).unwrap();
        capture.start().unwrap();

        assert_eq!(red(capture.read_blocking()), Some(1));
        assert_eq!(red(capture.read_blocking()), Some(2));
        assert_eq!(red(capture.read_blocking()), Some(3));
        assert_eq!(red(capture.read_blocking()), None);
        assert_eq!(red(capture.read_blocking()), None);

        capture.stop_blocking().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_stream_is_unavailable() {
        let (stream, released) = ScriptedStream::new(0);
        let result = LoopingCapture::new(Box::new(stream), options(false));
        assert!(matches!(result, Err(CaptureError::SourceUnavailable(_))));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_unblocks_a_full_buffer() {
        let (stream, released) = ScriptedStream::new(5);
        let opts = CaptureOptions {
            buffer_capacity: 2,
            ..options(true)
        };
        let mut capture = LoopingCapture::new(Box::new(stream), opts).unwrap();
        capture.start().unwrap();
        // Producer is now parked on the full queue
        thread::sleep(Duration::from_millis(100));

        capture.stop_blocking().unwrap();
        assert!(!capture.is_running());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(capture.read_blocking().is_none());
    }

    #[test]
    fn repeated_stop_is_harmless() {
        let (stream, released) = ScriptedStream::new(3);
        let mut capture = LoopingCapture::new(Box::new(stream), options(true)).unwrap();
        capture.start().unwrap();
        capture.stop_blocking().unwrap();
        capture.stop_blocking().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_without_start_releases_stream() {
        let (stream, released) = ScriptedStream::new(3);
        let mut capture = LoopingCapture::new(Box::new(stream), options(false)).unwrap();
        capture.stop_blocking().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unbuffered_keeps_only_the_newest_frame() {
        let (stream, released) = ScriptedStream::new(5);
        let opts = CaptureOptions {
            buffered: false,
            ..options(false)
        };
        let mut capture = LoopingCapture::new(Box::new(stream), opts).unwrap();
        capture.start().unwrap();
        // Let the puller run through every frame
        thread::sleep(Duration::from_millis(100));

        assert_eq!(red(capture.read_blocking()), Some(5));
        assert_eq!(red(capture.read_blocking()), None);

        capture.stop_blocking().unwrap();
        assert!(!capture.is_running());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rewind_does_not_add_a_frame_period() {
        let (mut stream, _) = ScriptedStream::new(2);
        stream.rate = Some(10.0);
        let mut capture = LoopingCapture::new(Box::new(stream), options(true)).unwrap();
        let started = std::time::Instant::now();
        capture.start().unwrap();

        assert_eq!(red(capture.read_blocking()), Some(1));
        assert_eq!(red(capture.read_blocking()), Some(2));
        assert_eq!(red(capture.read_blocking()), Some(1));
        // Two paced pulls; the pull after the rewind is not delayed
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(180), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(280), "{:?}", elapsed);
        capture.stop_blocking().unwrap();
    }

    #[test]
    fn failed_conversion_falls_back_to_raw_frames() {
        let (stream, _) = ScriptedStream::new(2);
        let opts = CaptureOptions {
            colorspace: Some(ColorConversion::BgrToRgb),
            ..options(false)
        };
        let mut capture = LoopingCapture::new(Box::new(stream), opts).unwrap();
        capture.start().unwrap();
        assert_eq!(red(capture.read_blocking()), Some(1));
        assert_eq!(red(capture.read_blocking()), Some(2));
        capture.stop_blocking().unwrap();
    }

    #[tokio::test]
    async fn async_read_and_stop() {
        let (stream, released) = ScriptedStream::new(2);
        let mut capture = LoopingCapture::new(Box::new(stream), options(false)).unwrap();
        capture.start().unwrap();

        assert_eq!(red(capture.read().await), Some(1));
        assert_eq!(red(capture.read().await), Some(2));
        assert_eq!(red(capture.read().await), None);

        capture.stop().await.unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
