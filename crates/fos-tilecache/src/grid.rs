//! Grid & Viewport Mapper
//!
//! Maps the pixel viewport onto a grid of scenery cells. Each cell keeps the
//! tiles cached at that location, one per cached layer span.

use crate::geometry::{Rect, TileRect, tile_ceil, tile_floor};
use crate::pool::TileId;

/// Scenery cell grid
#[derive(Debug, Default)]
pub struct Grid {
    tile_size: i32,
    viewport: Rect,
    across: i32,
    down: i32,
    cells: Vec<Vec<TileId>>,
}

impl Grid {
    pub fn new(tile_size: u32) -> Self {
        Self {
            tile_size: tile_size as i32,
            ..Self::default()
        }
    }

    pub fn tile_size(&self) -> i32 { self.tile_size }
    pub fn viewport(&self) -> Rect { self.viewport }
    pub fn tiles_across(&self) -> i32 { self.across }
    pub fn tiles_down(&self) -> i32 { self.down }

    pub fn bounds(&self) -> TileRect {
        TileRect::new(0, 0, self.across, self.down)
    }

    pub fn cell_index(&self, x: i32, y: i32) -> usize {
        (y * self.across + x) as usize
    }

    pub fn cell(&self, x: i32, y: i32) -> &[TileId] {
        &self.cells[self.cell_index(x, y)]
    }

    pub(crate) fn cell_mut(&mut self, x: i32, y: i32) -> &mut Vec<TileId> {
        let index = self.cell_index(x, y);
        &mut self.cells[index]
    }

    pub fn cells(&self) -> impl Iterator<Item = &[TileId]> {
        self.cells.iter().map(Vec::as_slice)
    }

    /// Cells touched by a canvas rect, clamped to the grid
    pub fn touched_tiles(&self, rect: &Rect) -> TileRect {
        let ts = self.tile_size;
        let local = rect.offset(-self.viewport.x, -self.viewport.y);
        TileRect::new(
            tile_floor(local.left(), ts).clamp(0, self.across),
            tile_floor(local.top(), ts).clamp(0, self.down),
            tile_ceil(local.right(), ts).clamp(0, self.across),
            tile_ceil(local.bottom(), ts).clamp(0, self.down),
        )
    }

    /// Cells lying completely inside a canvas rect, clamped to the grid
    pub fn occluded_tiles(&self, rect: &Rect) -> TileRect {
        let ts = self.tile_size;
        let local = rect.offset(-self.viewport.x, -self.viewport.y);
        TileRect::new(
            tile_ceil(local.left(), ts).clamp(0, self.across),
            tile_ceil(local.top(), ts).clamp(0, self.down),
            tile_floor(local.right(), ts).clamp(0, self.across),
            tile_floor(local.bottom(), ts).clamp(0, self.down),
        )
    }

    /// Remove `tile` from the cell at (x, y), if it is there
    pub(crate) fn detach(&mut self, x: i32, y: i32, tile: TileId) -> bool {
        if !self.bounds().contains(x, y) {
            return false;
        }
        let cell = self.cell_mut(x, y);
        match cell.iter().position(|&t| t == tile) {
            Some(pos) => {
                cell.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Switch to a new viewport, keeping cells that are still complete and
    /// in place. Returns the tiles of every cell that was dropped.
    pub fn set_viewport(&mut self, viewport: Rect) -> Vec<TileId> {
        let ts = self.tile_size;
        let across = tile_ceil(viewport.width.max(0), ts);
        let down = tile_ceil(viewport.height.max(0), ts);
        let mut cells = vec![Vec::new(); (across * down) as usize];

        if self.viewport.x == viewport.x && self.viewport.y == viewport.y {
            let keep_across = tile_floor(self.viewport.width.max(0), ts).min(across).min(self.across);
            let keep_down = tile_floor(self.viewport.height.max(0), ts).min(down).min(self.down);
            for y in 0..keep_down {
                for x in 0..keep_across {
                    cells[(y * across + x) as usize] = std::mem::take(self.cell_mut(x, y));
                }
            }
        }

        let dropped = self.cells.drain(..).flatten().collect();

        self.viewport = viewport;
        self.across = across;
        self.down = down;
        self.cells = cells;
        dropped
    }

    /// Change the tile size. The caller must have flushed every tile.
    pub(crate) fn set_tile_size(&mut self, tile_size: u32) {
        let viewport = self.viewport;
        self.tile_size = tile_size as i32;
        self.viewport = Rect::default();
        self.across = 0;
        self.down = 0;
        self.cells.clear();
        self.set_viewport(viewport);
    }

    /// Empty every cell without touching the tiles
    pub(crate) fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(n: u16) -> TileId {
        TileId::from_raw(n)
    }

    #[test]
    fn test_grid_dimensions_round_up() {
        let mut grid = Grid::new(32);
        grid.set_viewport(Rect::new(0, 0, 100, 64));
        assert_eq!(grid.tiles_across(), 4);
        assert_eq!(grid.tiles_down(), 2);
    }

    #[test]
    fn test_touched_and_occluded() {
        let mut grid = Grid::new(32);
        grid.set_viewport(Rect::new(0, 0, 128, 128));

        let r = Rect::new(10, 10, 60, 60);
        assert_eq!(grid.touched_tiles(&r), TileRect::new(0, 0, 3, 3));
        assert_eq!(grid.occluded_tiles(&r), TileRect::new(1, 1, 2, 2));

        let outside = Rect::new(-500, -500, 100, 100);
        assert!(grid.touched_tiles(&outside).is_empty());
    }

    #[test]
    fn test_touched_relative_to_viewport_origin() {
        let mut grid = Grid::new(32);
        grid.set_viewport(Rect::new(100, 100, 128, 128));
        let r = Rect::new(100, 100, 32, 32);
        assert_eq!(grid.touched_tiles(&r), TileRect::new(0, 0, 1, 1));
    }

    #[test]
    fn test_resize_keeps_complete_cells() {
        let mut grid = Grid::new(32);
        grid.set_viewport(Rect::new(0, 0, 80, 64));
        let a = tid(1);
        let b = tid(2);
        grid.cell_mut(0, 0).push(a);
        grid.cell_mut(2, 0).push(b);

        // Column 2 was a partial tile (80 px wide) so it cannot be kept.
        let dropped = grid.set_viewport(Rect::new(0, 0, 128, 64));
        assert_eq!(dropped, vec![b]);
        assert_eq!(grid.cell(0, 0), &[a]);
        assert!(grid.cell(2, 0).is_empty());
    }

    #[test]
    fn test_origin_change_drops_everything() {
        let mut grid = Grid::new(32);
        grid.set_viewport(Rect::new(0, 0, 64, 64));
        let a = tid(1);
        grid.cell_mut(1, 1).push(a);
        let dropped = grid.set_viewport(Rect::new(5, 0, 64, 64));
        assert_eq!(dropped, vec![a]);
    }
}
