use thiserror::Error;

use crate::mime::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl CropRect {
    /// Crop edges are inclusive, so a full 640x480 frame is `0, 0, 639, 479`.
    pub fn full(width: i32, height: i32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width - 1,
            bottom: height - 1,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left + 1
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top + 1
    }
}

/// Format as reported by the engine, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatedFormat {
    Video {
        width: i32,
        height: i32,
        color_format: Option<i32>,
        component: Option<String>,
        crop: Option<CropRect>,
        rotation: Option<i32>,
    },
    Audio {
        sample_rate: Option<u32>,
        channel_count: Option<u32>,
        component: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub stride: i32,
    pub slice_height: i32,
    pub color_format: i32,
    pub crop: CropRect,
    pub rotation: i32,
}

impl VideoFormat {
    pub fn width(&self) -> i32 {
        self.crop.width()
    }

    pub fn height(&self) -> i32 {
        self.crop.height()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channel_count: u32,
}

/// Validated format published to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl OutputFormat {
    pub fn kind(&self) -> MediaKind {
        match self {
            OutputFormat::Video(_) => MediaKind::Video,
            OutputFormat::Audio(_) => MediaKind::Audio,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("engine reported no component name")]
    MissingComponent,
    #[error("engine reported no color format")]
    MissingColorFormat,
    #[error("invalid stride {stride} or slice height {slice_height}")]
    InvalidGeometry { stride: i32, slice_height: i32 },
    #[error("crop rect {0:?} outside {1}x{2}")]
    InvalidCrop(CropRect, i32, i32),
    #[error("audio format is missing sample rate or channel count")]
    IncompleteAudio,
    #[error("expected {expected:?} format, engine reported {actual:?}")]
    KindMismatch { expected: MediaKind, actual: MediaKind },
}

/// Validates the engine's view of the stream and fills in defaults.
///
/// Returns the resolved format and the component name the engine reported.
pub fn resolve(
    kind: MediaKind,
    negotiated: &NegotiatedFormat,
) -> Result<(OutputFormat, String), FormatError> {
    match (kind, negotiated) {
        (
            MediaKind::Video,
            NegotiatedFormat::Video {
                width,
                height,
                color_format,
                component,
                crop,
                rotation,
            },
        ) => {
            let component = component.clone().ok_or(FormatError::MissingComponent)?;
            let color_format = color_format.ok_or(FormatError::MissingColorFormat)?;
            let (stride, slice_height) = (*width, *height);
            if stride <= 0 || slice_height <= 0 {
                return Err(FormatError::InvalidGeometry {
                    stride,
                    slice_height,
                });
            }

            let crop = crop.unwrap_or_else(|| CropRect::full(stride, slice_height));
            let valid = crop.left >= 0
                && crop.left < crop.right
                && crop.right < stride
                && crop.top >= 0
                && crop.top < crop.bottom
                && crop.bottom < slice_height;
            if !valid {
                return Err(FormatError::InvalidCrop(crop, stride, slice_height));
            }

            let rotation = match rotation.unwrap_or(0) {
                r @ (0 | 90 | 180 | 270) => r,
                other => {
                    log::warn!("ignoring unsupported rotation {}", other);
                    0
                }
            };

            Ok((
                OutputFormat::Video(VideoFormat {
                    stride,
                    slice_height,
                    color_format,
                    crop,
                    rotation,
                }),
                component,
            ))
        }
        (
            MediaKind::Audio,
            NegotiatedFormat::Audio {
                sample_rate,
                channel_count,
                component,
            },
        ) => {
            let component = component.clone().ok_or(FormatError::MissingComponent)?;
            match (sample_rate, channel_count) {
                (Some(sample_rate), Some(channel_count))
                    if *sample_rate > 0 && *channel_count > 0 =>
                {
                    Ok((
                        OutputFormat::Audio(AudioFormat {
                            sample_rate: *sample_rate,
                            channel_count: *channel_count,
                        }),
                        component,
                    ))
                }
                _ => Err(FormatError::IncompleteAudio),
            }
        }
        (expected, NegotiatedFormat::Video { .. }) => Err(FormatError::KindMismatch {
            expected,
            actual: MediaKind::Video,
        }),
        (expected, NegotiatedFormat::Audio { .. }) => Err(FormatError::KindMismatch {
            expected,
            actual: MediaKind::Audio,
        }),
    }
}
