//! Compositor
//!
//! Backends own tile pixel storage and draw tiles onto the destination
//! surface. The tile cache only ever talks to the [`Compositor`] trait; the
//! concrete backend is picked with [`CompositorKind`] or injected directly.

mod atlas;
mod software;

pub use atlas::AtlasCompositor;
pub use software::SoftwareCompositor;

use tiny_skia::{FillRule, Mask, PathBuilder, Pixmap, PixmapMut, PixmapRef, Transform};

use crate::error::CompositorError;
use crate::geometry::Rect;

/// Opaque handle to tile storage owned by a compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendTile(pub u32);

/// Blend mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    /// Draw nothing
    NoOp,
}

impl BlendMode {
    /// Matching tiny-skia mode, or `None` when nothing should be drawn
    pub fn to_skia(self) -> Option<tiny_skia::BlendMode> {
        match self {
            BlendMode::Normal => Some(tiny_skia::BlendMode::SourceOver),
            BlendMode::Multiply => Some(tiny_skia::BlendMode::Multiply),
            BlendMode::Screen => Some(tiny_skia::BlendMode::Screen),
            BlendMode::Overlay => Some(tiny_skia::BlendMode::Overlay),
            BlendMode::Darken => Some(tiny_skia::BlendMode::Darken),
            BlendMode::Lighten => Some(tiny_skia::BlendMode::Lighten),
            BlendMode::NoOp => None,
        }
    }
}

/// Available compositor backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompositorKind {
    /// No backend; nothing can be cached or drawn
    None,
    /// One pixmap per tile
    #[default]
    Software,
    /// Tiles packed into 256x256 atlas pages
    Atlas,
}

impl CompositorKind {
    pub fn is_supported(self) -> bool {
        matches!(self, CompositorKind::None | CompositorKind::Software | CompositorKind::Atlas)
    }

    /// Build the backend for this kind
    pub fn create(self) -> Box<dyn Compositor> {
        match self {
            CompositorKind::None => Box::new(NullCompositor),
            CompositorKind::Software => Box::new(SoftwareCompositor::new()),
            CompositorKind::Atlas => Box::new(AtlasCompositor::new()),
        }
    }
}

/// Destination of a composite
pub trait Surface {
    fn pixmap(&self) -> PixmapRef<'_>;
    fn pixmap_mut(&mut self) -> PixmapMut<'_>;
}

impl Surface for Pixmap {
    fn pixmap(&self) -> PixmapRef<'_> {
        self.as_ref()
    }

    fn pixmap_mut(&mut self) -> PixmapMut<'_> {
        self.as_mut()
    }
}

/// Compositing backend
///
/// Tile coordinates passed to the drawing hooks are surface pixels. Colors
/// are packed premultiplied RGBA with alpha in the top byte.
pub trait Compositor: std::fmt::Debug {
    fn kind(&self) -> CompositorKind;

    /// Called before tiles are allocated for a frame
    fn begin_tiling(&mut self, _tile_size: u32) -> Result<(), CompositorError> {
        Ok(())
    }

    /// Called after all tiles of a frame are allocated
    fn end_tiling(&mut self) -> Result<(), CompositorError> {
        Ok(())
    }

    /// Store a tile's pixels; `pixels` is `size * size` RGBA rows
    fn allocate_tile(&mut self, size: u32, pixels: &[u8]) -> Result<BackendTile, CompositorError>;

    fn deallocate_tile(&mut self, tile: BackendTile);

    fn begin_frame(&mut self, surface: &dyn Surface, dirty: Rect) -> Result<(), CompositorError>;

    fn end_frame(&mut self, surface: &mut dyn Surface) -> Result<(), CompositorError>;

    /// Start rendering `area` (surface coordinates) into an off-screen image
    fn begin_snapshot(&mut self, area: Rect) -> Result<(), CompositorError>;

    fn end_snapshot(&mut self) -> Result<Pixmap, CompositorError>;

    fn begin_layer(&mut self, clip: Rect, opacity: u8, blend: BlendMode) -> Result<(), CompositorError>;

    fn end_layer(&mut self) -> Result<(), CompositorError>;

    fn composite_tile(&mut self, x: i32, y: i32, tile: BackendTile) -> Result<(), CompositorError>;

    fn composite_rect(&mut self, rect: Rect, color: u32) -> Result<(), CompositorError>;

    /// Release cached resources that are no longer referenced
    fn flush(&mut self) {}
}

/// Backend used while deactivated
#[derive(Debug, Default)]
pub struct NullCompositor;

impl Compositor for NullCompositor {
    fn kind(&self) -> CompositorKind { CompositorKind::None }

    fn allocate_tile(&mut self, _size: u32, _pixels: &[u8]) -> Result<BackendTile, CompositorError> {
        Err(CompositorError::Unsupported)
    }

    fn deallocate_tile(&mut self, _tile: BackendTile) {}

    fn begin_frame(&mut self, _surface: &dyn Surface, _dirty: Rect) -> Result<(), CompositorError> {
        Err(CompositorError::Unsupported)
    }

    fn end_frame(&mut self, _surface: &mut dyn Surface) -> Result<(), CompositorError> {
        Err(CompositorError::Unsupported)
    }

    fn begin_snapshot(&mut self, _area: Rect) -> Result<(), CompositorError> {
        Err(CompositorError::Unsupported)
    }

    fn end_snapshot(&mut self) -> Result<Pixmap, CompositorError> {
        Err(CompositorError::Unsupported)
    }

    fn begin_layer(&mut self, _clip: Rect, _opacity: u8, _blend: BlendMode) -> Result<(), CompositorError> {
        Err(CompositorError::Unsupported)
    }

    fn end_layer(&mut self) -> Result<(), CompositorError> {
        Err(CompositorError::Unsupported)
    }

    fn composite_tile(&mut self, _x: i32, _y: i32, _tile: BackendTile) -> Result<(), CompositorError> {
        Err(CompositorError::Unsupported)
    }

    fn composite_rect(&mut self, _rect: Rect, _color: u32) -> Result<(), CompositorError> {
        Err(CompositorError::Unsupported)
    }
}

/// Build a mask covering the union of `rects` (pixel coordinates of the mask)
pub(crate) fn mask_from_rects(width: u32, height: u32, rects: &[Rect]) -> Option<Mask> {
    let mut mask = Mask::new(width, height)?;
    let mut builder = PathBuilder::new();
    for rect in rects.iter().filter(|r| !r.is_empty()) {
        if let Some(r) = rect.to_skia() {
            builder.push_rect(r);
        }
    }
    if let Some(path) = builder.finish() {
        mask.fill_path(&path, FillRule::Winding, false, Transform::identity());
    }
    Some(mask)
}

/// Convert a packed premultiplied color into a tiny-skia color
pub(crate) fn packed_to_color(packed: u32) -> Option<tiny_skia::Color> {
    let [r, g, b, a] = packed.to_le_bytes();
    let premultiplied = tiny_skia::PremultipliedColorU8::from_rgba(r, g, b, a)?;
    let c = premultiplied.demultiply();
    Some(tiny_skia::Color::from_rgba8(c.red(), c.green(), c.blue(), c.alpha()))
}

struct ActiveLayer {
    opacity: f32,
    blend: Option<tiny_skia::BlendMode>,
    mask: Option<Mask>,
}

/// Opacity, blend mode and mask for the next draw; `None` when it would
/// draw nothing
fn draw_state<'a>(
    layer: Option<&'a ActiveLayer>,
    frame_mask: Option<&'a Mask>,
) -> Option<(f32, tiny_skia::BlendMode, Option<&'a Mask>)> {
    match layer {
        Some(layer) => Some((layer.opacity, layer.blend?, layer.mask.as_ref())),
        None => Some((1.0, tiny_skia::BlendMode::SourceOver, frame_mask)),
    }
}

/// Pixels being composited for one frame or snapshot. Shared by the
/// software and atlas backends.
pub(crate) struct FrameTarget {
    pixmap: Pixmap,
    /// Added to surface coordinates to get pixmap coordinates
    offset: (i32, i32),
    /// Area being composited, surface coordinates
    clip: Rect,
    mask: Option<Mask>,
    layer: Option<ActiveLayer>,
}

impl std::fmt::Debug for FrameTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTarget")
            .field("width", &self.pixmap.width())
            .field("height", &self.pixmap.height())
            .field("offset", &self.offset)
            .field("clip", &self.clip)
            .field("in_layer", &self.layer.is_some())
            .finish()
    }
}

impl FrameTarget {
    /// Composite on top of a copy of the surface, limited to `dirty`
    pub fn for_surface(surface: &dyn Surface, dirty: Rect) -> Result<Self, CompositorError> {
        let pixmap = surface.pixmap().to_owned();
        let bounds = Rect::new(0, 0, pixmap.width() as i32, pixmap.height() as i32);
        Self::new(pixmap, (0, 0), dirty.intersect(&bounds))
    }

    /// Composite `area` into a fresh transparent image
    pub fn for_snapshot(area: Rect) -> Result<Self, CompositorError> {
        let invalid = CompositorError::InvalidSize { width: area.width, height: area.height };
        if area.is_empty() {
            return Err(invalid);
        }
        let pixmap = Pixmap::new(area.width as u32, area.height as u32).ok_or(invalid)?;
        Self::new(pixmap, (-area.x, -area.y), area)
    }

    fn new(pixmap: Pixmap, offset: (i32, i32), clip: Rect) -> Result<Self, CompositorError> {
        let mut target = Self { pixmap, offset, clip, mask: None, layer: None };
        target.mask = Some(target.mask_for(clip)?);
        Ok(target)
    }

    fn mask_for(&self, clip: Rect) -> Result<Mask, CompositorError> {
        let local = clip.offset(self.offset.0, self.offset.1);
        mask_from_rects(self.pixmap.width(), self.pixmap.height(), &[local])
            .ok_or(CompositorError::Allocation)
    }

    pub fn begin_layer(&mut self, clip: Rect, opacity: u8, blend: BlendMode) -> Result<(), CompositorError> {
        let mask = self.mask_for(clip.intersect(&self.clip))?;
        self.layer = Some(ActiveLayer {
            opacity: opacity as f32 / 255.0,
            blend: blend.to_skia(),
            mask: Some(mask),
        });
        Ok(())
    }

    pub fn end_layer(&mut self) -> Result<(), CompositorError> {
        self.layer.take().map(|_| ()).ok_or(CompositorError::LayerUnderflow)
    }

    /// Draw the `size` square at (sx, sy) of `src` at surface position (x, y)
    pub fn draw_region(&mut self, x: i32, y: i32, src: PixmapRef<'_>, sx: i32, sy: i32, size: u32) {
        let Self { pixmap, offset, mask, layer, .. } = self;
        let Some((opacity, blend_mode, mask)) = draw_state(layer.as_ref(), mask.as_ref()) else {
            return;
        };
        let (dx, dy) = (x + offset.0, y + offset.1);
        let Some(dest) = Rect::new(dx, dy, size as i32, size as i32).to_skia() else {
            return;
        };
        let shader = tiny_skia::Pattern::new(
            src,
            tiny_skia::SpreadMode::Pad,
            tiny_skia::FilterQuality::Nearest,
            opacity,
            Transform::from_translate((dx - sx) as f32, (dy - sy) as f32),
        );
        let paint = tiny_skia::Paint {
            shader,
            blend_mode,
            anti_alias: false,
            ..tiny_skia::Paint::default()
        };
        pixmap.fill_rect(dest, &paint, Transform::identity(), mask);
    }

    /// Fill a surface rect with a packed premultiplied color
    pub fn fill_rect(&mut self, rect: Rect, color: u32) {
        let Self { pixmap, offset, mask, layer, .. } = self;
        let Some((opacity, blend_mode, mask)) = draw_state(layer.as_ref(), mask.as_ref()) else {
            return;
        };
        let Some(mut color) = packed_to_color(color) else {
            return;
        };
        let Some(dest) = rect.offset(offset.0, offset.1).to_skia() else {
            return;
        };
        color.apply_opacity(opacity);
        let mut paint = tiny_skia::Paint::default();
        paint.set_color(color);
        paint.blend_mode = blend_mode;
        paint.anti_alias = false;
        pixmap.fill_rect(dest, &paint, Transform::identity(), mask);
    }

    /// Write the composited area back to the surface
    pub fn write_back(&self, surface: &mut dyn Surface) -> Result<(), CompositorError> {
        let mut dst = surface.pixmap_mut();
        if dst.width() != self.pixmap.width() || dst.height() != self.pixmap.height() {
            return Err(CompositorError::InvalidSize {
                width: dst.width() as i32,
                height: dst.height() as i32,
            });
        }
        let row = self.pixmap.width() as usize * 4;
        let src = self.pixmap.data();
        let data = dst.data_mut();
        for y in self.clip.top()..self.clip.bottom() {
            let start = y as usize * row + self.clip.x as usize * 4;
            let end = start + self.clip.width as usize * 4;
            data[start..end].copy_from_slice(&src[start..end]);
        }
        Ok(())
    }

    pub fn into_pixmap(self) -> Pixmap {
        self.pixmap
    }
}
