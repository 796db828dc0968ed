use std::sync::Arc;
use std::time::Duration;

use decode_bus::decoder::FfmpegEngineFactory;
use decode_bus::frame::FrameFlags;
use decode_bus::mime::MediaKind;
use decode_bus::source::AvSource;
use decode_bus::surface::Surface;
use decode_bus::{OutputEvent, PipelineConfig, PipelineError, PipelineFacade};
use tokio_util::sync::CancellationToken;

use crate::log_surface::LogSurface;

#[derive(Debug, Default)]
pub struct Summary {
    pub fed: u64,
    pub rendered: u64,
    pub format_changes: u64,
}

fn open_source(path: &str) -> anyhow::Result<AvSource> {
    AvSource::open(path, MediaKind::Video).or_else(|err| {
        log::info!("no video stream ({:#}), trying audio", err);
        AvSource::open(path, MediaKind::Audio)
    })
}

/// Decodes `path` through a pipeline until end of stream or cancellation.
pub async fn run(
    path: String,
    config: PipelineConfig,
    cancel: CancellationToken,
) -> anyhow::Result<Summary> {
    let mut source = open_source(&path)?;
    let info = source.info().clone();

    let facade = Arc::new(PipelineFacade::new(config.clone(), Arc::new(FfmpegEngineFactory)));
    let surface: Option<Box<dyn Surface>> = match info.kind {
        MediaKind::Video => Some(Box::new(LogSurface::default())),
        MediaKind::Audio => None,
    };
    // audio picks up its configuration in band
    let config_at_open = match info.kind {
        MediaKind::Video => info.codec_config.as_deref(),
        MediaKind::Audio => None,
    };
    facade.configure(surface, info.width, info.height, config_at_open)?;
    facade.open(&info.mime)?;

    let watcher = {
        let facade = facade.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            tokio::task::spawn_blocking(move || facade.teardown()).await.ok();
        })
    };

    let producer = {
        let facade = facade.clone();
        let cancel = cancel.clone();
        let codec_config = info.codec_config.clone().filter(|_| info.kind == MediaKind::Audio);
        tokio::task::spawn_blocking(move || -> Result<u64, PipelineError> {
            if let Some(codec_config) = codec_config {
                facade.feed(&codec_config, 0, FrameFlags::CODEC_CONFIG)?;
            }
            let mut fed = 0;
            while let Some(unit) = source.read_unit() {
                loop {
                    if cancel.is_cancelled() {
                        return Ok(fed);
                    }
                    if facade.feed(&unit.payload, unit.timestamp, unit.flags)? {
                        break;
                    }
                }
                fed += 1;
            }
            log::info!("end of input after {} units", fed);
            facade.flush()?;
            Ok(fed)
        })
    };

    let consumer = {
        let facade = facade.clone();
        let cancel = cancel.clone();
        let slice = config.frame_interval();
        tokio::task::spawn_blocking(move || -> Result<(u64, u64), PipelineError> {
            let (mut rendered, mut format_changes) = (0, 0);
            loop {
                match facade.take_ready(slice)? {
                    OutputEvent::Frame(frame) => {
                        facade.release(frame.index, frame.timestamp);
                        rendered += 1;
                    }
                    OutputEvent::FormatChanged => {
                        format_changes += 1;
                        log::info!(
                            "format from {}: {:?}",
                            facade.component_name(),
                            facade.current_format()
                        );
                    }
                    OutputEvent::EndOfStream => break,
                    OutputEvent::WouldBlock if cancel.is_cancelled() => break,
                    OutputEvent::WouldBlock => std::thread::sleep(Duration::from_millis(1)),
                }
            }
            Ok((rendered, format_changes))
        })
    };

    let fed = match producer.await? {
        Ok(fed) => fed,
        Err(PipelineError::TornDown) => 0,
        Err(err) => {
            cancel.cancel();
            return Err(err.into());
        }
    };
    let (rendered, format_changes) = match consumer.await? {
        Ok(counts) => counts,
        Err(PipelineError::TornDown) => (0, 0),
        Err(err) => return Err(err.into()),
    };

    cancel.cancel();
    watcher.await?;
    Ok(Summary {
        fed,
        rendered,
        format_changes,
    })
}
