//! Atlas compositor
//!
//! Packs tiles into 256x256 pages so a frame draws from a handful of large
//! images. A handle encodes `page + 1` in the low 16 bits and `sub + 1` in
//! the high 16 bits.

use tiny_skia::Pixmap;

use super::{BackendTile, BlendMode, Compositor, CompositorKind, FrameTarget, Surface};
use crate::error::CompositorError;
use crate::geometry::Rect;

/// Edge length of an atlas page in pixels
pub const PAGE_SIZE: u32 = 256;

#[derive(Debug)]
struct Page {
    pixmap: Pixmap,
    /// Free sub-tile indices; popped from the back
    free: Vec<u16>,
    used: u16,
}

#[derive(Debug, Default)]
pub struct AtlasCompositor {
    tile_size: u32,
    pages: Vec<Option<Page>>,
    target: Option<FrameTarget>,
}

impl AtlasCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live pages
    pub fn page_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    /// Tiles per page row for the current tile size
    fn per_row(&self) -> u32 {
        (self.page_edge() / self.tile_size.max(1)).max(1)
    }

    fn page_edge(&self) -> u32 {
        PAGE_SIZE.max(self.tile_size)
    }

    fn arity(&self) -> u16 {
        let per_row = self.per_row();
        (per_row * per_row).min(u16::MAX as u32) as u16
    }

    fn sub_origin(&self, sub: u16) -> (i32, i32) {
        let per_row = self.per_row();
        let sub = sub as u32;
        ((sub % per_row * self.tile_size) as i32, (sub / per_row * self.tile_size) as i32)
    }

    fn decode(tile: BackendTile) -> Option<(usize, u16)> {
        let page = (tile.0 & 0xffff).checked_sub(1)?;
        let sub = (tile.0 >> 16).checked_sub(1)?;
        Some((page as usize, sub as u16))
    }

    fn encode(page: usize, sub: u16) -> BackendTile {
        BackendTile((page as u32 + 1) | ((sub as u32 + 1) << 16))
    }

    fn new_page(&self) -> Result<Page, CompositorError> {
        let edge = self.page_edge();
        let pixmap = Pixmap::new(edge, edge).ok_or(CompositorError::Allocation)?;
        // Sub 0 is handed out first.
        let free = (0..self.arity()).rev().collect();
        Ok(Page { pixmap, free, used: 0 })
    }

    /// Drop pages without any live sub-tile
    fn release_empty(&mut self) {
        for page in &mut self.pages {
            if page.as_ref().is_some_and(|p| p.used == 0) {
                *page = None;
            }
        }
        while matches!(self.pages.last(), Some(None)) {
            self.pages.pop();
        }
    }

    fn target(&mut self) -> Result<&mut FrameTarget, CompositorError> {
        self.target.as_mut().ok_or(CompositorError::NoTarget)
    }
}

impl Compositor for AtlasCompositor {
    fn kind(&self) -> CompositorKind { CompositorKind::Atlas }

    fn begin_tiling(&mut self, tile_size: u32) -> Result<(), CompositorError> {
        if tile_size != self.tile_size {
            self.release_empty();
            if self.page_count() > 0 {
                return Err(CompositorError::InvalidSize {
                    width: tile_size as i32,
                    height: tile_size as i32,
                });
            }
            tracing::debug!("Atlas tile size {} -> {}", self.tile_size, tile_size);
            self.tile_size = tile_size;
        }
        Ok(())
    }

    fn end_tiling(&mut self) -> Result<(), CompositorError> {
        self.release_empty();
        Ok(())
    }

    fn allocate_tile(&mut self, size: u32, pixels: &[u8]) -> Result<BackendTile, CompositorError> {
        if size != self.tile_size {
            self.begin_tiling(size)?;
        }
        let row = size as usize * 4;
        if size == 0 || pixels.len() < row * size as usize {
            return Err(CompositorError::InvalidSize { width: size as i32, height: size as i32 });
        }

        let found = self
            .pages
            .iter()
            .rposition(|p| p.as_ref().is_some_and(|p| !p.free.is_empty()));
        let index = match found {
            Some(index) => index,
            None => {
                let page = self.new_page()?;
                match self.pages.iter().position(Option::is_none) {
                    Some(index) => {
                        self.pages[index] = Some(page);
                        index
                    }
                    None => {
                        self.pages.push(Some(page));
                        self.pages.len() - 1
                    }
                }
            }
        };

        let page = self.pages[index].as_mut().ok_or(CompositorError::Allocation)?;
        let sub = page.free.pop().ok_or(CompositorError::Allocation)?;
        page.used += 1;

        let (ox, oy) = self.sub_origin(sub);
        let page = self.pages[index].as_mut().ok_or(CompositorError::Allocation)?;
        let stride = page.pixmap.width() as usize * 4;
        let data = page.pixmap.data_mut();
        for (y, src) in pixels.chunks_exact(row).take(size as usize).enumerate() {
            let start = (oy as usize + y) * stride + ox as usize * 4;
            data[start..start + row].copy_from_slice(src);
        }

        Ok(Self::encode(index, sub))
    }

    fn deallocate_tile(&mut self, tile: BackendTile) {
        let Some((index, sub)) = Self::decode(tile) else {
            return;
        };
        if let Some(Some(page)) = self.pages.get_mut(index) {
            page.free.push(sub);
            page.used = page.used.saturating_sub(1);
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
        let (index, sub) = Self::decode(tile).ok_or(CompositorError::UnknownTile(tile.0))?;
        let (sx, sy) = self.sub_origin(sub);
        let size = self.tile_size;
        let page = self
            .pages
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(CompositorError::UnknownTile(tile.0))?;
        let target = self.target.as_mut().ok_or(CompositorError::NoTarget)?;
        target.draw_region(x, y, page.pixmap.as_ref(), sx, sy, size);
        Ok(())
    }

    fn composite_rect(&mut self, rect: Rect, color: u32) -> Result<(), CompositorError> {
        self.target()?.fill_rect(rect, color);
        Ok(())
    }

    fn flush(&mut self) {
        self.release_empty();
    }
}
