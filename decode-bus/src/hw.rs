//! Hardware-accelerated decoder discovery.
//!
//! Video codecs are probed against CUDA/QSV/V4L2M2M wrappers, audio codecs against the
//! platform's offload decoders. Callers fall back to the software decoder when nothing is found.

fn hw_decoder_names(codec_id: ffmpeg_next::codec::Id) -> &'static [&'static str] {
    match codec_id {
        ffmpeg_next::codec::Id::H264 => &["h264_cuvid", "h264_qsv", "h264_v4l2m2m"],
        ffmpeg_next::codec::Id::HEVC => &["hevc_cuvid", "hevc_qsv", "hevc_v4l2m2m"],
        ffmpeg_next::codec::Id::VP8 => &["vp8_cuvid", "vp8_qsv", "vp8_v4l2m2m"],
        ffmpeg_next::codec::Id::VP9 => &["vp9_cuvid", "vp9_qsv", "vp9_v4l2m2m"],
        ffmpeg_next::codec::Id::AV1 => &["av1_cuvid", "av1_qsv"],
        ffmpeg_next::codec::Id::MPEG2VIDEO => &["mpeg2_cuvid", "mpeg2_qsv", "mpeg2_v4l2m2m"],
        ffmpeg_next::codec::Id::MPEG4 => &["mpeg4_cuvid", "mpeg4_v4l2m2m"],
        ffmpeg_next::codec::Id::AAC => &["aac_at"],
        ffmpeg_next::codec::Id::MP3 => &["mp3_at"],
        _ => &[],
    }
}

/// Try to find a hardware-accelerated decoder for the given codec ID.
/// Returns the first available hardware decoder, or None if none is found.
pub fn find_hw_decoder(codec_id: ffmpeg_next::codec::Id) -> Option<ffmpeg_next::Codec> {
    for name in hw_decoder_names(codec_id) {
        if let Some(codec) = ffmpeg_next::decoder::find_by_name(name) {
            log::info!("found hardware decoder: {}", name);
            return Some(codec);
        }
    }
    None
}

/// Hardware decoder first when preferred, software decoder otherwise.
pub fn select_decoder(
    codec_id: ffmpeg_next::codec::Id,
    prefer_hardware: bool,
) -> Option<ffmpeg_next::Codec> {
    if prefer_hardware {
        if let Some(codec) = find_hw_decoder(codec_id) {
            return Some(codec);
        }
        log::debug!("no hardware decoder for {:?}, using software", codec_id);
    }
    ffmpeg_next::decoder::find(codec_id)
}

pub fn is_hw_decoder(name: &str) -> bool {
    ["cuvid", "qsv", "v4l2m2m", "_at"]
        .iter()
        .any(|suffix| name.ends_with(suffix))
}
