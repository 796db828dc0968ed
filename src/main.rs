use decode_bus::PipelineConfig;
use tokio_util::sync::CancellationToken;

mod log_surface;
mod player;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("decode_bus", log::LevelFilter::Debug)
        .filter_module("ffmpeg_next", log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn load_config(path: Option<String>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("reading config {}: {}", path, e))?;
            PipelineConfig::from_json(&text)
        }
        None => Ok(decode_bus::config::defaults().clone()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    decode_bus::init()?;

    let mut args = std::env::args().skip(1);
    let Some(media) = args.next() else {
        eprintln!("usage: decode-pipe <media-file> [config.json]");
        std::process::exit(2);
    };
    let config = load_config(args.next())?;

    let cancel = CancellationToken::new();
    let run = player::run(media, config, cancel.clone());
    tokio::pin!(run);

    let summary = tokio::select! {
        summary = &mut run => summary?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, tearing down");
            cancel.cancel();
            run.await?
        }
    };

    log::info!(
        "fed {} units, rendered {} frames, {} format changes",
        summary.fed,
        summary.rendered,
        summary.format_changes
    );
    Ok(())
}
