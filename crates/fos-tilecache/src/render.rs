//! Layer Rendering
//!
//! Layers describe what to draw; renderers draw it. A renderer is handed a
//! [`RenderContext`] wrapping an off-screen tiny-skia buffer together with the
//! translation from layer coordinates to buffer pixels and the clip mask of
//! the tiles actually being rendered.

use std::rc::Rc;

use tiny_skia::{Mask, Paint, PixmapMut, Transform};

use crate::compositor::BlendMode;
use crate::error::RenderError;
use crate::geometry::Rect;

/// Draws a layer's content
pub trait LayerRenderer {
    /// Draw the part of the layer covering `rect` into `ctx`
    fn render(&self, ctx: &mut RenderContext<'_>, rect: Rect) -> Result<(), RenderError>;
}

impl<F> LayerRenderer for F
where
    F: Fn(&mut RenderContext<'_>, Rect) -> Result<(), RenderError>,
{
    fn render(&self, ctx: &mut RenderContext<'_>, rect: Rect) -> Result<(), RenderError> {
        self(ctx, rect)
    }
}

/// Drawing target for one render batch
pub struct RenderContext<'a> {
    pixmap: PixmapMut<'a>,
    /// Layer coordinates of buffer pixel (0, 0)
    origin: (i32, i32),
    clip: Option<&'a Mask>,
}

impl<'a> RenderContext<'a> {
    pub fn new(pixmap: PixmapMut<'a>, origin: (i32, i32), clip: Option<&'a Mask>) -> Self {
        Self { pixmap, origin, clip }
    }

    /// Maps layer coordinates onto the buffer
    pub fn transform(&self) -> Transform {
        Transform::from_translate(-self.origin.0 as f32, -self.origin.1 as f32)
    }

    pub fn clip(&self) -> Option<&Mask> {
        self.clip
    }

    /// Layer-space area covered by the buffer
    pub fn bounds(&self) -> Rect {
        Rect::new(
            self.origin.0,
            self.origin.1,
            self.pixmap.width() as i32,
            self.pixmap.height() as i32,
        )
    }

    /// Fill a layer-space rect with a solid color
    pub fn fill_rect(&mut self, rect: Rect, color: tiny_skia::Color) {
        let mut paint = Paint::default();
        paint.set_color(color);
        paint.anti_alias = false;
        self.fill_rect_with(rect, &paint);
    }

    /// Fill a layer-space rect with an arbitrary paint
    pub fn fill_rect_with(&mut self, rect: Rect, paint: &Paint<'_>) {
        if rect.is_empty() {
            return;
        }
        let Some(rect) = rect.to_skia() else {
            return;
        };
        let transform = self.transform();
        self.pixmap.fill_rect(rect, paint, transform, self.clip);
    }

}

/// A layer as submitted for one frame
#[derive(Clone)]
pub struct Layer {
    /// Id handed out by the previous frame, 0 for a new layer; updated in place
    pub id: u32,
    /// Full extent of the layer in canvas coordinates
    pub region: Rect,
    /// Visible part of the layer in canvas coordinates
    pub clip: Rect,
    /// Every pixel the renderer draws is opaque
    pub is_opaque: bool,
    pub opacity: u8,
    pub blend: BlendMode,
    pub renderer: Rc<dyn LayerRenderer>,
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("region", &self.region)
            .field("clip", &self.clip)
            .field("is_opaque", &self.is_opaque)
            .field("opacity", &self.opacity)
            .field("blend", &self.blend)
            .finish_non_exhaustive()
    }
}

impl Layer {
    pub fn new(region: Rect, renderer: Rc<dyn LayerRenderer>) -> Self {
        Self {
            id: 0,
            region,
            clip: region,
            is_opaque: false,
            opacity: 255,
            blend: BlendMode::Normal,
            renderer,
        }
    }

    pub fn opaque(mut self, is_opaque: bool) -> Self {
        self.is_opaque = is_opaque;
        self
    }

    pub fn with_clip(mut self, clip: Rect) -> Self {
        self.clip = clip;
        self
    }

    pub fn with_opacity(mut self, opacity: u8) -> Self {
        self.opacity = opacity;
        self
    }

    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    /// Opaque and drawn at full opacity, so it hides whatever is below
    pub fn occludes(&self) -> bool {
        self.is_opaque && self.opacity == 255
    }
}

/// Renderer that fills its layer region with one color
#[derive(Debug, Clone, Copy)]
pub struct SolidRenderer {
    pub region: Rect,
    pub color: tiny_skia::Color,
}

impl SolidRenderer {
    pub fn new(region: Rect, color: tiny_skia::Color) -> Self {
        Self { region, color }
    }
}

impl LayerRenderer for SolidRenderer {
    fn render(&self, ctx: &mut RenderContext<'_>, rect: Rect) -> Result<(), RenderError> {
        ctx.fill_rect(self.region.intersect(&rect), self.color);
        Ok(())
    }
}
