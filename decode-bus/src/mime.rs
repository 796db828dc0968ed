use ffmpeg_next::codec::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let (category, _) = mime.split_once('/')?;
        match category.to_ascii_lowercase().as_str() {
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            _ => None,
        }
    }
}

const TABLE: &[(&str, Id)] = &[
    ("video/avc", Id::H264),
    ("video/hevc", Id::HEVC),
    ("video/mp4v-es", Id::MPEG4),
    ("video/3gpp", Id::H263),
    ("video/mpeg2", Id::MPEG2VIDEO),
    ("video/x-vnd.on2.vp8", Id::VP8),
    ("video/x-vnd.on2.vp9", Id::VP9),
    ("video/av01", Id::AV1),
    ("audio/mp4a-latm", Id::AAC),
    ("audio/mpeg", Id::MP3),
    ("audio/opus", Id::OPUS),
    ("audio/vorbis", Id::VORBIS),
    ("audio/flac", Id::FLAC),
    ("audio/3gpp", Id::AMR_NB),
    ("audio/amr-wb", Id::AMR_WB),
];

pub fn codec_id(mime: &str) -> Option<Id> {
    TABLE
        .iter()
        .find(|(m, _)| m.eq_ignore_ascii_case(mime))
        .map(|(_, id)| *id)
}

pub fn mime_for(id: Id) -> Option<&'static str> {
    TABLE.iter().find(|(_, i)| *i == id).map(|(m, _)| *m)
}
