use decode_bus::surface::{DrawTarget, Geometry, PresentTarget, Surface};

/// Surface that only logs what would be shown.
#[derive(Default)]
pub struct LogSurface {
    presented: u64,
}

impl Surface for LogSurface {
    fn connect(&mut self) -> anyhow::Result<()> {
        log::info!("surface connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        log::info!("surface disconnected after {} frames", self.presented);
    }

    fn set_usage_and_geometry(&mut self, geometry: &Geometry) -> anyhow::Result<()> {
        log::info!(
            "surface geometry {}x{} color {} {:?}",
            geometry.width,
            geometry.height,
            geometry.color_format,
            geometry.transform
        );
        Ok(())
    }

    fn acquire_draw_target(&mut self, len: usize) -> anyhow::Result<DrawTarget> {
        Ok(DrawTarget { data: vec![0; len] })
    }

    fn present(&mut self, target: PresentTarget, timestamp_us: i64) -> anyhow::Result<()> {
        self.presented += 1;
        match target {
            PresentTarget::Drawn(target) => {
                log::trace!("present {} bytes at {}us", target.data.len(), timestamp_us)
            }
            PresentTarget::Buffer(id) => log::trace!("present buffer {} at {}us", id, timestamp_us),
        }
        Ok(())
    }
}
