//! Software compositor: one pixmap per cached tile.

use tiny_skia::{IntSize, Pixmap};

use super::{BackendTile, BlendMode, Compositor, CompositorKind, FrameTarget, Surface};
use crate::error::CompositorError;
use crate::geometry::Rect;

#[derive(Debug, Default)]
pub struct SoftwareCompositor {
    tiles: Vec<Option<Pixmap>>,
    free: Vec<u32>,
    target: Option<FrameTarget>,
}

impl SoftwareCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tiles currently stored
    pub fn tile_count(&self) -> usize {
        self.tiles.iter().filter(|t| t.is_some()).count()
    }

    fn target(&mut self) -> Result<&mut FrameTarget, CompositorError> {
        self.target.as_mut().ok_or(CompositorError::NoTarget)
    }
}

impl Compositor for SoftwareCompositor {
    fn kind(&self) -> CompositorKind { CompositorKind::Software }

    fn allocate_tile(&mut self, size: u32, pixels: &[u8]) -> Result<BackendTile, CompositorError> {
        let invalid = CompositorError::InvalidSize { width: size as i32, height: size as i32 };
        let int_size = IntSize::from_wh(size, size).ok_or(invalid.clone())?;
        let pixmap = Pixmap::from_vec(pixels.to_vec(), int_size).ok_or(invalid)?;

        let slot = match self.free.pop() {
            Some(slot) => {
                self.tiles[slot as usize] = Some(pixmap);
                slot
            }
            None => {
                self.tiles.push(Some(pixmap));
                (self.tiles.len() - 1) as u32
            }
        };
        Ok(BackendTile(slot + 1))
    }

    fn deallocate_tile(&mut self, tile: BackendTile) {
        let Some(slot) = tile.0.checked_sub(1) else {
            return;
        };
        if let Some(entry) = self.tiles.get_mut(slot as usize) {
            if entry.take().is_some() {
                self.free.push(slot);
            }
        }
    }

    fn begin_frame(&mut self, surface: &dyn Surface, dirty: Rect) -> Result<(), CompositorError> {
        self.target = Some(FrameTarget::for_surface(surface, dirty)?);
        Ok(())
    }

    fn end_frame(&mut self, surface: &mut dyn Surface) -> Result<(), CompositorError> {
        let target = self.target.take().ok_or(CompositorError::NoTarget)?;
        target.write_back(surface)
    }

    fn begin_snapshot(&mut self, area: Rect) -> Result<(), CompositorError> {
        self.target = Some(FrameTarget::for_snapshot(area)?);
        Ok(())
    }

    fn end_snapshot(&mut self) -> Result<Pixmap, CompositorError> {
        let target = self.target.take().ok_or(CompositorError::NoTarget)?;
        Ok(target.into_pixmap())
    }

    fn begin_layer(&mut self, clip: Rect, opacity: u8, blend: BlendMode) -> Result<(), CompositorError> {
        self.target()?.begin_layer(clip, opacity, blend)
    }

    fn end_layer(&mut self) -> Result<(), CompositorError> {
        self.target()?.end_layer()
    }

    fn composite_tile(&mut self, x: i32, y: i32, tile: BackendTile) -> Result<(), CompositorError> {
        let target = self.target.as_mut().ok_or(CompositorError::NoTarget)?;
        let pixmap = tile
            .0
            .checked_sub(1)
            .and_then(|slot| self.tiles.get(slot as usize))
            .and_then(Option::as_ref)
            .ok_or(CompositorError::UnknownTile(tile.0))?;
        target.draw_region(x, y, pixmap.as_ref(), 0, 0, pixmap.width());
        Ok(())
    }

    fn composite_rect(&mut self, rect: Rect, color: u32) -> Result<(), CompositorError> {
        self.target()?.fill_rect(rect, color);
        Ok(())
    }

    fn flush(&mut self) {
        // Only trailing free slots can be released without moving handles.
        while matches!(self.tiles.last(), Some(None)) {
            self.tiles.pop();
        }
        let len = self.tiles.len() as u32;
        self.free.retain(|&slot| slot < len);
        self.tiles.shrink_to_fit();
    }
}
