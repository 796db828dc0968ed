//! Demuxes access units for one elementary stream of a media file.

use std::path::Path;

use bytes::Bytes;
use ffmpeg_next::{Rational, Rescale, codec::Parameters};

use crate::frame::FrameFlags;
use crate::mime::{self, MediaKind};

const MICROS: Rational = Rational(1, 1_000_000);

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub mime: String,
    pub kind: MediaKind,
    pub width: u32,
    pub height: u32,
    pub codec_config: Option<Bytes>,
    pub time_base: Rational,
}

#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub payload: Bytes,
    pub timestamp: i64,
    pub flags: FrameFlags,
}

/// Reads extradata from codec parameters via the raw AVCodecParameters pointer.
fn extradata(parameters: &Parameters) -> Option<Bytes> {
    unsafe {
        let p = parameters.as_ptr();
        let data = (*p).extradata;
        let size = (*p).extradata_size;
        if data.is_null() || size <= 0 {
            return None;
        }
        Some(Bytes::copy_from_slice(std::slice::from_raw_parts(data, size as usize)))
    }
}

fn dimensions(parameters: &Parameters) -> (u32, u32) {
    unsafe {
        let p = parameters.as_ptr();
        ((*p).width.max(0) as u32, (*p).height.max(0) as u32)
    }
}

pub struct AvSource {
    inner: ffmpeg_next::format::context::Input,
    info: StreamInfo,
}

unsafe impl Send for AvSource {}

impl AvSource {
    /// Opens `path` and selects the first stream of `kind` with a known mime type.
    pub fn open(path: impl AsRef<Path>, kind: MediaKind) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let input = ffmpeg_next::format::input(path)?;
        let medium = match kind {
            MediaKind::Video => ffmpeg_next::media::Type::Video,
            MediaKind::Audio => ffmpeg_next::media::Type::Audio,
        };

        let info = input
            .streams()
            .filter(|s| s.parameters().medium() == medium)
            .find_map(|stream| {
                let parameters = stream.parameters();
                let mime = mime::mime_for(parameters.id())?;
                let (width, height) = dimensions(&parameters);
                Some(StreamInfo {
                    index: stream.index(),
                    mime: mime.to_string(),
                    kind,
                    width,
                    height,
                    codec_config: extradata(&parameters),
                    time_base: stream.time_base(),
                })
            })
            .ok_or_else(|| {
                anyhow::anyhow!("no supported {:?} stream in {}", kind, path.display())
            })?;

        log::info!(
            "source {}: stream {} {} {}x{} config {} bytes",
            path.display(),
            info.index,
            info.mime,
            info.width,
            info.height,
            info.codec_config.as_ref().map(|c| c.len()).unwrap_or_default()
        );
        Ok(Self { inner: input, info })
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Next access unit of the selected stream, or None at end of file.
    pub fn read_unit(&mut self) -> Option<SourceUnit> {
        loop {
            let (stream, packet) = self.inner.packets().next()?;
            if stream.index() != self.info.index {
                continue;
            }
            let Some(data) = packet.data() else {
                continue;
            };
            let timestamp = packet
                .pts()
                .or(packet.dts())
                .map(|ts| ts.rescale(self.info.time_base, MICROS))
                .unwrap_or(-1);
            let flags = if packet.is_key() {
                FrameFlags::SYNC_POINT
            } else {
                FrameFlags::NONE
            };
            return Some(SourceUnit {
                payload: Bytes::copy_from_slice(data),
                timestamp,
                flags,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    /// Path to scripts/test.mp4 relative to workspace root (parent of decode-bus).
    fn test_mp4_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .join("scripts")
            .join("test.mp4")
    }

    #[test]
    fn test_missing_file_fails() {
        crate::init().unwrap();
        assert!(AvSource::open("/nonexistent/clip.mp4", MediaKind::Video).is_err());
    }

    /// Requires scripts/test.mp4.
    #[test]
    fn test_reads_video_units_in_order() -> anyhow::Result<()> {
        let path = test_mp4_path();
        if !path.exists() {
            eprintln!("skip: {} not found", path.display());
            return Ok(());
        }
        crate::init()?;
        let mut source = AvSource::open(&path, MediaKind::Video)?;
        assert!(source.info().mime.starts_with("video/"));
        assert!(source.info().width > 0);

        let first = source.read_unit().unwrap();
        assert!(first.flags.contains(FrameFlags::SYNC_POINT));
        let mut count = 1;
        while source.read_unit().is_some() {
            count += 1;
        }
        assert!(count > 1);
        Ok(())
    }
}
