use crate::format::VideoFormat;
use crate::frame::BufferId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    Rot90,
    Rot180,
    Rot270,
}

impl Transform {
    pub fn from_degrees(rotation: i32) -> Self {
        match rotation {
            90 => Transform::Rot90,
            180 => Transform::Rot180,
            270 => Transform::Rot270,
            _ => Transform::Identity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub color_format: i32,
    pub transform: Transform,
}

impl Geometry {
    /// Buffer geometry for a decoded format: the visible area rounded up to even sizes.
    pub fn for_format(format: &VideoFormat) -> Self {
        let round_even = |v: i32| ((v.max(0) as u32) + 1) & !1;
        Self {
            width: round_even(format.width()),
            height: round_even(format.height()),
            color_format: format.color_format,
            transform: Transform::from_degrees(format.rotation),
        }
    }
}

/// Writable buffer obtained from a surface for software rendering.
#[derive(Debug, Default)]
pub struct DrawTarget {
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum PresentTarget {
    Drawn(DrawTarget),
    Buffer(BufferId),
}

pub trait Surface: Send {
    fn connect(&mut self) -> anyhow::Result<()>;

    fn disconnect(&mut self);

    fn set_usage_and_geometry(&mut self, geometry: &Geometry) -> anyhow::Result<()>;

    fn acquire_draw_target(&mut self, len: usize) -> anyhow::Result<DrawTarget>;

    fn present(&mut self, target: PresentTarget, timestamp_us: i64) -> anyhow::Result<()>;
}

/// Connected surface. Disconnects when dropped.
pub struct SurfaceToken {
    surface: Option<Box<dyn Surface>>,
}

impl SurfaceToken {
    pub fn acquire(mut surface: Box<dyn Surface>) -> anyhow::Result<Self> {
        surface.connect()?;
        Ok(Self {
            surface: Some(surface),
        })
    }

    pub fn surface_mut(&mut self) -> Option<&mut (dyn Surface + 'static)> {
        self.surface.as_deref_mut()
    }

    /// Disconnects and gives the surface back.
    pub fn into_inner(mut self) -> Option<Box<dyn Surface>> {
        let mut surface = self.surface.take()?;
        surface.disconnect();
        Some(surface)
    }
}

impl Drop for SurfaceToken {
    fn drop(&mut self) {
        if let Some(surface) = self.surface.as_mut() {
            surface.disconnect();
        }
    }
}

pub struct Renderer {
    token: SurfaceToken,
    geometry: Option<Geometry>,
}

impl Renderer {
    pub fn new(token: SurfaceToken) -> Self {
        Self {
            token,
            geometry: None,
        }
    }

    /// Configures the surface for software rendering of `format`.
    pub fn init(&mut self, format: &VideoFormat) -> anyhow::Result<()> {
        let geometry = Geometry::for_format(format);
        if self.geometry.as_ref() == Some(&geometry) {
            return Ok(());
        }
        let surface = self
            .token
            .surface_mut()
            .ok_or_else(|| anyhow::anyhow!("surface already released"))?;
        surface.set_usage_and_geometry(&geometry)?;
        log::info!(
            "renderer configured {}x{} {:?}",
            geometry.width,
            geometry.height,
            geometry.transform
        );
        self.geometry = Some(geometry);
        Ok(())
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        self.geometry.as_ref()
    }

    pub fn render_bytes(&mut self, data: &[u8], timestamp_us: i64) -> anyhow::Result<()> {
        let surface = self
            .token
            .surface_mut()
            .ok_or_else(|| anyhow::anyhow!("surface already released"))?;
        let mut target = surface.acquire_draw_target(data.len())?;
        let len = target.data.len().min(data.len());
        target.data[..len].copy_from_slice(&data[..len]);
        surface.present(PresentTarget::Drawn(target), timestamp_us)
    }

    pub fn present_buffer(&mut self, id: BufferId, timestamp_us: i64) -> anyhow::Result<()> {
        let surface = self
            .token
            .surface_mut()
            .ok_or_else(|| anyhow::anyhow!("surface already released"))?;
        surface.present(PresentTarget::Buffer(id), timestamp_us)
    }

    pub fn into_surface(self) -> Option<Box<dyn Surface>> {
        self.token.into_inner()
    }
}
