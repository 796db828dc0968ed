//! `DecodeEngine` backed by libavcodec through `ffmpeg-next`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use ffmpeg_next::Rational;

use crate::engine::{
    AccessUnit, DecodeEngine, DecodedOutput, EngineFactory, OpenRequest, Retrieved,
};
use crate::format::NegotiatedFormat;
use crate::frame::{BufferId, BufferRelease, FrameFlags};
use crate::hw;
use crate::mime::{self, MediaKind};

/// Timestamps cross the engine boundary in microseconds.
const MICROS: Rational = Rational(1, 1_000_000);

enum DecoderType {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

enum RawFrame {
    Video(ffmpeg_next::frame::Video),
    Audio(ffmpeg_next::frame::Audio),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Video(u32, u32, ffmpeg_next::format::Pixel),
    Audio(u32, u32),
}

impl DecoderType {
    fn send_packet(&mut self, packet: &ffmpeg_next::Packet) -> Result<(), ffmpeg_next::Error> {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.send_packet(packet),
            DecoderType::Audio(audio_decoder) => audio_decoder.send_packet(packet),
        }
    }

    fn send_eof(&mut self) -> Result<(), ffmpeg_next::Error> {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.send_eof(),
            DecoderType::Audio(audio_decoder) => audio_decoder.send_eof(),
        }
    }

    fn receive_frame(&mut self) -> Result<RawFrame, ffmpeg_next::Error> {
        match self {
            DecoderType::Video(video_decoder) => {
                let mut frame = ffmpeg_next::frame::Video::empty();
                video_decoder.receive_frame(&mut frame)?;
                Ok(RawFrame::Video(frame))
            }
            DecoderType::Audio(audio_decoder) => {
                let mut frame = ffmpeg_next::frame::Audio::empty();
                audio_decoder.receive_frame(&mut frame)?;
                Ok(RawFrame::Audio(frame))
            }
        }
    }

    fn flush(&mut self) {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.flush(),
            DecoderType::Audio(audio_decoder) => audio_decoder.flush(),
        }
    }

    fn shape(&self) -> Shape {
        match self {
            DecoderType::Video(video_decoder) => Shape::Video(
                video_decoder.width(),
                video_decoder.height(),
                video_decoder.format(),
            ),
            DecoderType::Audio(audio_decoder) => {
                let channels = unsafe { (*audio_decoder.as_ptr()).ch_layout.nb_channels };
                Shape::Audio(audio_decoder.rate(), channels.max(0) as u32)
            }
        }
    }
}

struct RetainedFrame(ffmpeg_next::frame::Video);

unsafe impl Send for RetainedFrame {}

/// Decoded frames handed out by id in zero-copy mode, kept alive until released.
#[derive(Default)]
pub struct FrameTable {
    frames: Mutex<HashMap<BufferId, RetainedFrame>>,
}

impl FrameTable {
    fn insert(&self, id: BufferId, frame: ffmpeg_next::frame::Video) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, RetainedFrame(frame));
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl BufferRelease for FrameTable {
    fn release(&self, id: BufferId) {
        let removed = self
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_none() {
            log::debug!("buffer {} already returned", id);
        }
    }
}

pub struct FfmpegEngine {
    inner: DecoderType,
    codec_name: String,
    zero_copy: bool,
    table: Arc<FrameTable>,
    next_id: u64,
    shape: Shape,
    backlog: VecDeque<ffmpeg_next::Packet>,
    pending: Option<Retrieved>,
    has_extradata: bool,
}

unsafe impl Send for FfmpegEngine {}

/// In-band codec config is redundant once the same bytes were installed as extradata;
/// otherwise the decoder needs it as a packet.
fn skip_in_band_config(flags: FrameFlags, has_extradata: bool) -> bool {
    has_extradata && flags.contains(FrameFlags::CODEC_CONFIG)
}

impl FfmpegEngine {
    /// Opens a decoder for the request, hardware first when preferred.
    pub fn open(request: &OpenRequest) -> anyhow::Result<Self> {
        let codec_id = mime::codec_id(&request.mime)
            .ok_or_else(|| anyhow::anyhow!("no codec for mime {}", request.mime))?;
        let codec = hw::select_decoder(codec_id, request.prefer_hardware)
            .ok_or_else(|| anyhow::anyhow!("decoder not found for {:?}", codec_id))?;

        match Self::open_with(codec, request) {
            Ok(engine) => Ok(engine),
            Err(err) if hw::is_hw_decoder(codec.name()) => {
                log::warn!(
                    "hardware decoder {} failed ({:#}), falling back to software",
                    codec.name(),
                    err
                );
                let software = ffmpeg_next::decoder::find(codec_id).ok_or_else(|| {
                    anyhow::anyhow!("software decoder not found for {:?}", codec_id)
                })?;
                Self::open_with(software, request)
            }
            Err(err) => Err(err),
        }
    }

    fn open_with(codec: ffmpeg_next::Codec, request: &OpenRequest) -> anyhow::Result<Self> {
        let mut decoder_ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        let config = request.codec_config.as_ref().filter(|c| !c.is_empty());
        unsafe {
            let ptr = decoder_ctx.as_mut_ptr();
            (*ptr).time_base = MICROS.into();
            (*ptr).pkt_timebase = MICROS.into();
            if request.kind == MediaKind::Video {
                (*ptr).width = request.width as i32;
                (*ptr).height = request.height as i32;
            }
            if let Some(config) = config {
                let padding = ffmpeg_next::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                let buf = ffmpeg_next::ffi::av_mallocz(config.len() + padding) as *mut u8;
                if buf.is_null() {
                    anyhow::bail!("failed to allocate codec extradata");
                }
                std::ptr::copy_nonoverlapping(config.as_ptr(), buf, config.len());
                (*ptr).extradata = buf;
                (*ptr).extradata_size = config.len() as i32;
            }
        }

        let opened = decoder_ctx.decoder().open_as(codec)?;
        let inner = match request.kind {
            MediaKind::Video => DecoderType::Video(opened.video()?),
            MediaKind::Audio => DecoderType::Audio(opened.audio()?),
        };
        let shape = inner.shape();
        let zero_copy = request.surface_attached && request.kind == MediaKind::Video;
        log::info!(
            "opened decoder {} for {} (zero-copy: {})",
            codec.name(),
            request.mime,
            zero_copy
        );

        Ok(Self {
            inner,
            codec_name: codec.name().to_string(),
            zero_copy,
            table: Arc::new(FrameTable::default()),
            next_id: 0,
            shape,
            backlog: VecDeque::new(),
            pending: None,
            has_extradata: config.is_some(),
        })
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    fn wrap(&mut self, frame: RawFrame) -> Retrieved {
        match frame {
            RawFrame::Video(frame) => {
                let timestamp = frame.timestamp().or(frame.pts()).unwrap_or(-1);
                let flags = if frame.is_key() {
                    FrameFlags::SYNC_POINT
                } else {
                    FrameFlags::NONE
                };
                let output = if self.zero_copy {
                    let id = BufferId(self.next_id);
                    self.next_id += 1;
                    self.table.insert(id, frame);
                    DecodedOutput::External(id)
                } else {
                    let mut data = BytesMut::new();
                    for plane in 0..frame.planes() {
                        data.extend_from_slice(frame.data(plane));
                    }
                    DecodedOutput::Bytes(data.freeze())
                };
                Retrieved::Decoded {
                    output,
                    timestamp,
                    flags,
                }
            }
            RawFrame::Audio(frame) => {
                let timestamp = frame.timestamp().or(frame.pts()).unwrap_or(-1);
                let data = if frame.planes() == 1 {
                    Bytes::copy_from_slice(frame.data(0))
                } else {
                    let mut data = BytesMut::new();
                    for plane in 0..frame.planes() {
                        data.extend_from_slice(frame.data(plane));
                    }
                    data.freeze()
                };
                Retrieved::Decoded {
                    output: DecodedOutput::Bytes(data),
                    timestamp,
                    flags: FrameFlags::NONE,
                }
            }
        }
    }

    fn frame_shape(frame: &RawFrame) -> Shape {
        match frame {
            RawFrame::Video(frame) => Shape::Video(frame.width(), frame.height(), frame.format()),
            RawFrame::Audio(frame) => {
                let channels = unsafe { (*frame.as_ptr()).ch_layout.nb_channels };
                Shape::Audio(frame.rate(), channels.max(0) as u32)
            }
        }
    }
}

impl DecodeEngine for FfmpegEngine {
    fn submit(&mut self, unit: AccessUnit) -> anyhow::Result<()> {
        match unit {
            AccessUnit::Data {
                payload,
                timestamp,
                flags,
            } => {
                if skip_in_band_config(flags, self.has_extradata) {
                    log::debug!("codec config already applied, skipping {} bytes", payload.len());
                    return Ok(());
                }
                let mut packet = ffmpeg_next::Packet::copy(&payload);
                packet.set_pts(Some(timestamp));
                packet.set_dts(Some(timestamp));
                if flags.contains(FrameFlags::SYNC_POINT) {
                    packet.set_flags(ffmpeg_next::packet::Flags::KEY);
                }
                if !self.backlog.is_empty() {
                    self.backlog.push_back(packet);
                    return Ok(());
                }
                match self.inner.send_packet(&packet) {
                    Ok(()) => Ok(()),
                    Err(ffmpeg_next::Error::Other { errno })
                        if errno == ffmpeg_next::util::error::EAGAIN =>
                    {
                        self.backlog.push_back(packet);
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                }
            }
            AccessUnit::EndOfStream => {
                while let Some(packet) = self.backlog.pop_front() {
                    if let Err(err) = self.inner.send_packet(&packet) {
                        log::warn!("dropping queued packet at end of stream: {}", err);
                    }
                }
                self.inner.send_eof()?;
                Ok(())
            }
        }
    }

    fn retrieve(&mut self) -> Retrieved {
        if let Some(pending) = self.pending.take() {
            return pending;
        }
        loop {
            match self.inner.receive_frame() {
                Ok(frame) => {
                    let shape = Self::frame_shape(&frame);
                    let decoded = self.wrap(frame);
                    if shape != self.shape {
                        log::info!(
                            "{} output changed: {:?} -> {:?}",
                            self.codec_name,
                            self.shape,
                            shape
                        );
                        self.shape = shape;
                        self.pending = Some(decoded);
                        return Retrieved::FormatChanged;
                    }
                    return decoded;
                }
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    match self.backlog.pop_front() {
                        Some(packet) => {
                            if let Err(err) = self.inner.send_packet(&packet) {
                                log::warn!("queued packet rejected: {}", err);
                                return Retrieved::Error(i32::from(err));
                            }
                        }
                        None => return Retrieved::TryAgain,
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Retrieved::EndOfStream,
                Err(err) => {
                    log::warn!("{} decode error: {}", self.codec_name, err);
                    return Retrieved::Error(i32::from(err));
                }
            }
        }
    }

    fn negotiated_format(&self) -> Option<NegotiatedFormat> {
        match self.shape {
            Shape::Video(width, height, pixel) => Some(NegotiatedFormat::Video {
                width: width as i32,
                height: height as i32,
                color_format: Some(ffmpeg_next::ffi::AVPixelFormat::from(pixel) as i32),
                component: Some(self.codec_name.clone()),
                crop: None,
                rotation: None,
            }),
            Shape::Audio(rate, channels) if rate > 0 && channels > 0 => {
                Some(NegotiatedFormat::Audio {
                    sample_rate: Some(rate),
                    channel_count: Some(channels),
                    component: Some(self.codec_name.clone()),
                })
            }
            Shape::Audio(..) => None,
        }
    }

    fn buffer_owner(&self) -> Arc<dyn BufferRelease> {
        self.table.clone()
    }

    fn renders_to_surface(&self) -> bool {
        self.zero_copy
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.inner.flush();
        self.backlog.clear();
        self.pending = None;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.backlog.clear();
        self.pending = None;
        self.table.clear();
        log::info!("decoder {} shut down", self.codec_name);
    }
}

pub struct FfmpegEngineFactory;

impl EngineFactory for FfmpegEngineFactory {
    fn create(&self, request: &OpenRequest) -> anyhow::Result<Box<dyn DecodeEngine>> {
        Ok(Box::new(FfmpegEngine::open(request)?))
    }
}
