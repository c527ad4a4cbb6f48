//! Video stream reader with background capture.

use crate::ring::{CaptureEnd, FrameRing};
use crate::{is_livestream, StreamError, DEFAULT_BUFFER_SIZE, DEFAULT_FPS};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use video_analytics_common::Frame;

/// How often a pending `read` re-checks the ring.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reader tuning knobs.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Capture ring capacity in frames; the oldest frame is dropped on
    /// overflow.
    pub buffer_size: usize,

    /// Capture rate; the capture thread sleeps `1000 / fps` ms between
    /// decoded frames.
    pub fps: u32,

    /// Wall-clock bound on opening the source; a hung open counts as a
    /// connection failure.
    pub open_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            fps: DEFAULT_FPS,
            open_timeout: Duration::from_secs(10),
        }
    }
}

/// Probed properties of an opened source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
}

impl VideoInfo {
    /// Frame size as (width, height).
    #[must_use]
    pub fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Reads frames from a live or file source.
///
/// `open` starts a capture thread that decodes into a bounded ring;
/// `read` hands out batches in capture order. A broken livestream surfaces
/// as [`StreamError::Connection`]; an exhausted file drains the ring and
/// then surfaces [`StreamError::EndOfVideo`].
pub struct StreamReader {
    config: ReaderConfig,
    ring: Arc<FrameRing>,
    stop: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    info: Option<VideoInfo>,
    url: String,
    livestream: bool,
}

impl StreamReader {
    #[must_use]
    pub fn new(config: ReaderConfig) -> Self {
        let capacity = config.buffer_size;
        Self {
            config,
            ring: Arc::new(FrameRing::new(capacity)),
            stop: Arc::new(AtomicBool::new(false)),
            capture: None,
            info: None,
            url: String::new(),
            livestream: false,
        }
    }

    /// Open `url` and start capturing.
    ///
    /// Fails with [`StreamError::Connection`] if the demuxer/decoder cannot
    /// be set up within the configured timeout, and with
    /// [`StreamError::AlreadyOpen`] on a second open.
    pub async fn open(&mut self, url: &str) -> Result<(), StreamError> {
        if self.capture.is_some() {
            return Err(StreamError::AlreadyOpen);
        }
        info!(url, "opening video source");

        // Fresh ring and stop flag per open; a reader can be reused after
        // release().
        self.ring = Arc::new(FrameRing::new(self.config.buffer_size));
        self.stop = Arc::new(AtomicBool::new(false));
        self.url = url.to_string();
        self.livestream = is_livestream(url);

        let (ready_tx, ready_rx) = mpsc::channel();
        let thread = {
            let url = self.url.clone();
            let fps = self.config.fps;
            let livestream = self.livestream;
            let ring = Arc::clone(&self.ring);
            let stop = Arc::clone(&self.stop);
            std::thread::Builder::new()
                .name("stream-capture".into())
                .spawn(move || capture_loop(&url, fps, livestream, &ring, &stop, &ready_tx))
                .map_err(|e| StreamError::Connection(format!("{url}: {e}")))?
        };

        let timeout = self.config.open_timeout;
        let ready = tokio::task::spawn_blocking(move || ready_rx.recv_timeout(timeout))
            .await
            .map_err(|e| StreamError::Connection(format!("{url}: {e}")))?;

        match ready {
            Ok(Ok(video_info)) => {
                debug!(?video_info, "capture thread started");
                self.info = Some(video_info);
                self.capture = Some(thread);
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                // The open is stuck inside native code; tell the thread to
                // bail out whenever it returns and abandon it.
                self.stop.store(true, Ordering::Relaxed);
                drop(thread);
                Err(StreamError::Connection(format!(
                    "{url}: open timed out after {timeout:?}"
                )))
            }
        }
    }

    /// Probed source properties; `None` before a successful open.
    #[must_use]
    pub fn video_info(&self) -> Option<VideoInfo> {
        self.info
    }

    /// Read up to `batch_size` frames in capture order.
    ///
    /// Waits (polling) until the ring holds a full batch or capture has
    /// terminated. On end-of-video the remaining frames are drained before
    /// [`StreamError::EndOfVideo`] is surfaced; a broken connection discards
    /// the buffer and surfaces immediately.
    pub async fn read(&mut self, batch_size: usize) -> Result<Vec<Frame>, StreamError> {
        if self.capture.is_none() {
            return Err(StreamError::NotOpen);
        }
        let batch_size = batch_size.max(1);

        loop {
            let available = self.ring.len();
            let terminated = self.capture.as_ref().is_some_and(|t| t.is_finished());

            if available < batch_size && !terminated {
                tokio::time::sleep(READ_POLL_INTERVAL).await;
                continue;
            }

            return match self.ring.end() {
                Some(CaptureEnd::ConnectionLost) => {
                    self.ring.clear();
                    Err(StreamError::Connection(self.url.clone()))
                }
                Some(CaptureEnd::EndOfVideo) => {
                    if available == 0 {
                        Err(StreamError::EndOfVideo)
                    } else if available <= batch_size {
                        Ok(self.ring.drain())
                    } else {
                        Ok(self.ring.pop(batch_size))
                    }
                }
                None if available >= batch_size => Ok(self.ring.pop(batch_size)),
                None => {
                    // Capture thread gone without a recorded cause; classify
                    // by source kind, like a mid-read failure.
                    if self.livestream {
                        self.ring.clear();
                        Err(StreamError::Connection(self.url.clone()))
                    } else if available > 0 {
                        Ok(self.ring.drain())
                    } else {
                        Err(StreamError::EndOfVideo)
                    }
                }
            };
        }
    }

    /// Stop the capture thread and drop any buffered frames.
    ///
    /// Safe to call on every exit path, including before `open`.
    pub fn release(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.capture.take() {
            if let Err(e) = thread.join() {
                warn!("capture thread panicked: {e:?}");
            }
        }
        self.ring.clear();
        self.info = None;
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.release();
    }
}

/// Initialise FFmpeg once per process.
fn init_ffmpeg() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            warn!("ffmpeg init failed: {e}");
        }
    });
}

/// Open the source and capture frames until stopped or the stream ends.
///
/// Runs on its own thread: the demuxer open and every decode are blocking
/// native calls. The setup result is reported once through `ready`; after
/// that the reader only observes the ring.
fn capture_loop(
    url: &str,
    fps: u32,
    livestream: bool,
    ring: &FrameRing,
    stop: &AtomicBool,
    ready: &mpsc::Sender<Result<VideoInfo, StreamError>>,
) {
    init_ffmpeg();

    let mut ictx = match ffmpeg::format::input(&url.to_string()) {
        Ok(ictx) => ictx,
        Err(e) => {
            let _ = ready.send(Err(StreamError::Connection(format!("{url}: {e}"))));
            return;
        }
    };

    let (stream_index, mut decoder) = {
        let stream = match ictx.streams().best(ffmpeg::media::Type::Video) {
            Some(stream) => stream,
            None => {
                let _ = ready.send(Err(StreamError::Connection(format!(
                    "{url}: no video stream"
                ))));
                return;
            }
        };
        let index = stream.index();
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video());
        match decoder {
            Ok(decoder) => (index, decoder),
            Err(e) => {
                let _ = ready.send(Err(StreamError::Connection(format!("{url}: {e}"))));
                return;
            }
        }
    };

    let (width, height) = (decoder.width(), decoder.height());
    if width == 0 || height == 0 {
        let _ = ready.send(Err(StreamError::Connection(format!(
            "{url}: decoder reported zero frame size"
        ))));
        return;
    }

    let mut scaler = match ffmpeg::software::scaling::Context::get(
        decoder.format(),
        width,
        height,
        ffmpeg::format::Pixel::RGB24,
        width,
        height,
        ffmpeg::software::scaling::Flags::BILINEAR,
    ) {
        Ok(scaler) => scaler,
        Err(e) => {
            let _ = ready.send(Err(StreamError::Connection(format!("{url}: {e}"))));
            return;
        }
    };

    if stop.load(Ordering::Relaxed) {
        // Abandoned by an open timeout.
        return;
    }
    let _ = ready.send(Ok(VideoInfo { width, height }));

    let capture_interval = Duration::from_millis(u64::from(1000 / fps.max(1)));
    let mut decoded = ffmpeg::util::frame::Video::empty();
    let mut rgb = ffmpeg::util::frame::Video::empty();
    let mut sent_eof = false;

    while !stop.load(Ordering::Relaxed) {
        // Pull packets until the decoder yields the next frame.
        let produced = loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            if decoder.receive_frame(&mut decoded).is_ok() {
                break true;
            }
            if sent_eof {
                break false;
            }
            match ictx.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() == stream_index && decoder.send_packet(&packet).is_err() {
                        break false;
                    }
                }
                None => {
                    sent_eof = true;
                    let _ = decoder.send_eof();
                }
            }
        };

        if !produced {
            end_capture(ring, livestream, url);
            return;
        }

        if scaler.run(&decoded, &mut rgb).is_err() {
            end_capture(ring, livestream, url);
            return;
        }

        if let Some(image) = rgb_frame_to_image(&rgb, width, height) {
            ring.push(Frame::captured_now(image));
        }

        std::thread::sleep(capture_interval);
    }
    debug!(url, "capture thread stopped");
}

fn end_capture(ring: &FrameRing, livestream: bool, url: &str) {
    if livestream {
        warn!(url, "livestream connection lost");
        ring.set_end(CaptureEnd::ConnectionLost);
    } else {
        info!(url, "end of video");
        ring.set_end(CaptureEnd::EndOfVideo);
    }
}

/// Copy an RGB24 FFmpeg frame into an owned image, honouring the row stride.
fn rgb_frame_to_image(frame: &ffmpeg::util::frame::Video, width: u32, height: u32) -> Option<RgbImage> {
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_len = width as usize * 3;

    let mut buffer = Vec::with_capacity(row_len * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let row = data.get(start..start + row_len)?;
        buffer.extend_from_slice(row);
    }
    RgbImage::from_raw(width, height, buffer)
}
