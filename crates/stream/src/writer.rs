//! Background-flushed H.264/MP4 clip writer.

use crate::WriterError;
use ffmpeg_next as ffmpeg;
use ffmpeg::util::rational::Rational;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing::{debug, info};
use video_analytics_common::Frame;

/// Writes frames to an MP4 file through a background flush thread.
///
/// `write` enqueues without blocking; the flush thread scales RGB frames to
/// YUV420P and drives the encoder. `end` drains the queue, flushes the
/// encoder, writes the container trailer and joins the thread; it is
/// idempotent. Single producer, single consumer.
pub struct StreamWriter {
    tx: Option<mpsc::Sender<Frame>>,
    flush: Option<JoinHandle<Result<(), WriterError>>>,
    path: PathBuf,
}

impl StreamWriter {
    /// Open `path` for encoded output at `fps` with frame size `(w, h)`.
    ///
    /// Encoder setup happens on the flush thread (FFmpeg contexts stay on
    /// the thread that uses them); this call blocks briefly until setup has
    /// succeeded or failed.
    pub fn open(path: &Path, fps: u32, size: (u32, u32)) -> Result<Self, WriterError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WriterError::Open {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        }

        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread_path = path.to_path_buf();
        let flush = std::thread::Builder::new()
            .name("clip-writer".into())
            .spawn(move || flush_loop(&thread_path, fps, size, &rx, &ready_tx))
            .map_err(|e| WriterError::Open {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(path = %path.display(), fps, ?size, "clip writer opened");
                Ok(Self {
                    tx: Some(tx),
                    flush: Some(flush),
                    path: path.to_path_buf(),
                })
            }
            Ok(Err(e)) => {
                let _ = flush.join();
                Err(e)
            }
            Err(_) => Err(WriterError::Terminated),
        }
    }

    /// Enqueue one frame for encoding. Never blocks.
    pub fn write(&self, frame: &Frame) -> Result<(), WriterError> {
        match &self.tx {
            Some(tx) => tx.send(frame.clone()).map_err(|_| WriterError::Terminated),
            None => Err(WriterError::Terminated),
        }
    }

    /// Enqueue a batch of frames in order.
    pub fn write_batch(&self, frames: &[Frame]) -> Result<(), WriterError> {
        for frame in frames {
            self.write(frame)?;
        }
        Ok(())
    }

    /// Drain the queue, finalise the file and join the flush thread.
    pub fn end(&mut self) -> Result<(), WriterError> {
        // Dropping the sender lets the flush thread consume what is queued
        // and then finalise.
        self.tx.take();
        match self.flush.take() {
            Some(thread) => match thread.join() {
                Ok(result) => {
                    debug!(path = %self.path.display(), "clip writer closed");
                    result
                }
                Err(_) => Err(WriterError::Terminated),
            },
            None => Ok(()),
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        let _ = self.end();
    }
}

/// Encoder state owned by the flush thread.
struct Encoder {
    octx: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::video::Encoder,
    scaler: ffmpeg::software::scaling::Context,
    frame_tb: Rational,
    stream_tb: Rational,
    width: u32,
    height: u32,
    next_pts: i64,
}

fn flush_loop(
    path: &Path,
    fps: u32,
    size: (u32, u32),
    rx: &mpsc::Receiver<Frame>,
    ready: &mpsc::Sender<Result<(), WriterError>>,
) -> Result<(), WriterError> {
    let mut enc = match open_encoder(path, fps, size) {
        Ok(enc) => {
            let _ = ready.send(Ok(()));
            enc
        }
        Err(e) => {
            let _ = ready.send(Err(open_error(path, &e)));
            return Err(open_error(path, &e));
        }
    };

    // Runs until the producer half is dropped; every queued frame is
    // consumed before finalising.
    while let Ok(frame) = rx.recv() {
        encode_frame(&mut enc, &frame).map_err(|e| WriterError::Encode(e.to_string()))?;
    }

    finish(&mut enc).map_err(|e| WriterError::Encode(e.to_string()))
}

fn open_error(path: &Path, e: &ffmpeg::Error) -> WriterError {
    WriterError::Open {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn open_encoder(path: &Path, fps: u32, size: (u32, u32)) -> Result<Encoder, ffmpeg::Error> {
    init_ffmpeg();
    let (width, height) = size;
    let fps = fps.max(1);

    let mut octx = ffmpeg::format::output(&path)?;
    let global_header = octx
        .format()
        .flags()
        .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

    let codec =
        ffmpeg::encoder::find(ffmpeg::codec::Id::H264).ok_or(ffmpeg::Error::EncoderNotFound)?;
    let mut ost = octx.add_stream(codec)?;

    let mut video = ffmpeg::codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()?;
    let frame_tb = Rational::new(1, fps as i32);
    video.set_width(width);
    video.set_height(height);
    video.set_format(ffmpeg::format::Pixel::YUV420P);
    video.set_time_base(frame_tb);
    video.set_frame_rate(Some(Rational::new(fps as i32, 1)));
    if global_header {
        video.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
    }

    let mut options = ffmpeg::Dictionary::new();
    options.set("crf", "23");
    options.set("preset", "veryfast");
    let encoder = video.open_with(options)?;

    ost.set_parameters(&encoder);
    octx.write_header()?;

    let stream_tb = octx
        .stream(0)
        .map(|s| s.time_base())
        .unwrap_or(frame_tb);

    let scaler = ffmpeg::software::scaling::Context::get(
        ffmpeg::format::Pixel::RGB24,
        width,
        height,
        ffmpeg::format::Pixel::YUV420P,
        width,
        height,
        ffmpeg::software::scaling::Flags::BILINEAR,
    )?;

    Ok(Encoder {
        octx,
        encoder,
        scaler,
        frame_tb,
        stream_tb,
        width,
        height,
        next_pts: 0,
    })
}

fn encode_frame(enc: &mut Encoder, frame: &Frame) -> Result<(), ffmpeg::Error> {
    let mut src =
        ffmpeg::util::frame::Video::new(ffmpeg::format::Pixel::RGB24, enc.width, enc.height);
    fill_rgb_frame(&mut src, frame);

    let mut yuv = ffmpeg::util::frame::Video::empty();
    enc.scaler.run(&src, &mut yuv)?;
    yuv.set_pts(Some(enc.next_pts));
    enc.next_pts += 1;

    enc.encoder.send_frame(&yuv)?;
    drain_packets(enc)
}

/// Copy interleaved RGB pixels into an FFmpeg frame, honouring the stride.
///
/// Frames whose size differs from the writer's are cropped to the common
/// top-left region; in practice every frame of one analyzer shares the
/// probed source size.
fn fill_rgb_frame(dst: &mut ffmpeg::util::frame::Video, frame: &Frame) {
    let width = dst.width() as usize;
    let height = dst.height() as usize;
    let stride = dst.stride(0);
    let row_len = (width.min(frame.image.width() as usize)) * 3;
    let rows = height.min(frame.image.height() as usize);
    let src_stride = frame.image.width() as usize * 3;
    let src = frame.image.as_raw();
    let data = dst.data_mut(0);

    for y in 0..rows {
        let dst_start = y * stride;
        let src_start = y * src_stride;
        data[dst_start..dst_start + row_len].copy_from_slice(&src[src_start..src_start + row_len]);
    }
}

fn drain_packets(enc: &mut Encoder) -> Result<(), ffmpeg::Error> {
    let mut packet = ffmpeg::Packet::empty();
    while enc.encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(0);
        packet.rescale_ts(enc.frame_tb, enc.stream_tb);
        packet.write_interleaved(&mut enc.octx)?;
    }
    Ok(())
}

fn finish(enc: &mut Encoder) -> Result<(), ffmpeg::Error> {
    enc.encoder.send_eof()?;
    drain_packets(enc)?;
    enc.octx.write_trailer()
}

fn init_ffmpeg() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = ffmpeg::init();
    });
}
