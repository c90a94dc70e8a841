//! Sprite Registry
//!
//! Sprites are independently scrolled layers. Each one caches its tiles in a
//! bounded window of tile indices, `[0, span)` on both axes. The sprite's
//! origin maps content coordinates onto that window; when a request falls
//! outside the window, the window and origin slide together so that content
//! can be scrolled indefinitely while the window stays bounded.

use std::rc::Rc;

use crate::error::TileCacheError;
use crate::geometry::TileRect;
use crate::pool::TileId;
use crate::render::LayerRenderer;

/// Sprite handle; 0 means "not created yet"
pub type SpriteId = u32;

const MAX_SPRITES: usize = u16::MAX as usize;

/// Outcome of sliding a sprite's window
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct WindowShift {
    pub dx: i32,
    pub dy: i32,
    /// Tiles that kept their content but moved to a new window position
    pub moved: Vec<(TileId, i32, i32)>,
    /// Tiles that fell out of the window
    pub dropped: Vec<TileId>,
}

/// A sprite layer
pub struct Sprite {
    renderer: Rc<dyn LayerRenderer>,
    /// Offset from content (0, 0) to the pixel origin of window tile (0, 0)
    xorg: i32,
    yorg: i32,
    window: TileRect,
    tiles: Vec<TileId>,
}

impl std::fmt::Debug for Sprite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sprite")
            .field("xorg", &self.xorg)
            .field("yorg", &self.yorg)
            .field("window", &self.window)
            .field("cached", &self.cached_tiles().count())
            .finish_non_exhaustive()
    }
}

impl Sprite {
    fn new(renderer: Rc<dyn LayerRenderer>, xorg: i32, yorg: i32) -> Self {
        Self {
            renderer,
            xorg,
            yorg,
            window: TileRect::default(),
            tiles: Vec::new(),
        }
    }

    pub fn origin(&self) -> (i32, i32) {
        (self.xorg, self.yorg)
    }

    pub fn window(&self) -> TileRect {
        self.window
    }

    pub(crate) fn renderer(&self) -> Rc<dyn LayerRenderer> {
        Rc::clone(&self.renderer)
    }

    pub(crate) fn set_renderer(&mut self, renderer: Rc<dyn LayerRenderer>) {
        self.renderer = renderer;
    }

    pub(crate) fn scroll(&mut self, dx: i32, dy: i32) {
        self.xorg = self.xorg.saturating_sub(dx);
        self.yorg = self.yorg.saturating_sub(dy);
    }

    fn slot_index(&self, x: i32, y: i32) -> Option<usize> {
        if !self.window.contains(x, y) {
            return None;
        }
        let w = self.window.width();
        Some(((y - self.window.top) * w + (x - self.window.left)) as usize)
    }

    /// Tile cached at window position (x, y)
    pub fn slot(&self, x: i32, y: i32) -> TileId {
        self.slot_index(x, y).map_or(TileId::NIL, |i| self.tiles[i])
    }

    /// Store a tile at (x, y). Returns false when outside the window.
    pub(crate) fn set_slot(&mut self, x: i32, y: i32, tile: TileId) -> bool {
        match self.slot_index(x, y) {
            Some(i) => {
                self.tiles[i] = tile;
                true
            }
            None => false,
        }
    }

    /// Clear (x, y) if it holds `tile`
    pub(crate) fn detach(&mut self, x: i32, y: i32, tile: TileId) -> bool {
        match self.slot_index(x, y) {
            Some(i) if self.tiles[i] == tile => {
                self.tiles[i] = TileId::NIL;
                true
            }
            _ => false,
        }
    }

    /// Every cached tile with its window position
    pub fn cached_tiles(&self) -> impl Iterator<Item = (i32, i32, TileId)> + '_ {
        let window = self.window;
        self.tiles
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_nil())
            .map(move |(i, &t)| {
                let w = window.width().max(1);
                (window.left + i as i32 % w, window.top + i as i32 / w, t)
            })
    }

    /// Remove and return every cached tile in `area` (window coordinates)
    pub(crate) fn take_tiles_in(&mut self, area: TileRect) -> Vec<TileId> {
        let area = area.intersect(&self.window);
        let mut taken = Vec::new();
        for (x, y) in area.cells() {
            if let Some(i) = self.slot_index(x, y) {
                let tile = std::mem::take(&mut self.tiles[i]);
                if !tile.is_nil() {
                    taken.push(tile);
                }
            }
        }
        taken
    }

    /// Remove and return every cached tile
    pub(crate) fn take_all_tiles(&mut self) -> Vec<TileId> {
        let taken = self.tiles.iter().copied().filter(|t| !t.is_nil()).collect();
        self.tiles.iter_mut().for_each(|t| *t = TileId::NIL);
        taken
    }

    /// Make sure `request` fits inside the window, sliding the window and the
    /// origin if needed. On return `request` is expressed in the (possibly
    /// moved) window and clamped to it.
    pub(crate) fn expand(&mut self, request: &mut TileRect, span: i32, tile_size: i32) -> Option<WindowShift> {
        let mut wanted = *request;
        for (x, y, _) in self.cached_tiles() {
            wanted.include(x, y);
        }

        if wanted == self.window {
            return None;
        }

        let (dx, left, right) = slide(wanted.left, wanted.right, span);
        let (dy, top, bottom) = slide(wanted.top, wanted.bottom, span);
        let window = TileRect::new(left, top, right, bottom);

        let mut tiles = vec![TileId::NIL; (window.width() * window.height()) as usize];
        let mut shift = WindowShift { dx, dy, ..WindowShift::default() };
        for (x, y, tile) in self.cached_tiles() {
            let (nx, ny) = (x + dx, y + dy);
            if window.contains(nx, ny) {
                tiles[((ny - window.top) * window.width() + (nx - window.left)) as usize] = tile;
                if dx != 0 || dy != 0 {
                    shift.moved.push((tile, nx, ny));
                }
            } else {
                shift.dropped.push(tile);
            }
        }

        self.window = window;
        self.tiles = tiles;
        self.xorg += dx * tile_size;
        self.yorg += dy * tile_size;
        *request = request.offset(dx, dy).intersect(&window);

        if dx != 0 || dy != 0 {
            tracing::trace!("Sprite window slid by ({}, {}), {} tiles dropped", dx, dy, shift.dropped.len());
        }
        Some(shift)
    }
}

/// Bring `[lo, hi)` back inside `[0, span)`. Returns the translation and the
/// clamped range.
fn slide(lo: i32, hi: i32, span: i32) -> (i32, i32, i32) {
    if lo < 0 {
        let d = -lo;
        (d, 0, (hi + d).min(span))
    } else if hi > span {
        let d = span - hi;
        (d, (lo + d).max(0), span)
    } else {
        (0, lo, hi)
    }
}

/// All sprites, addressed by 1-based id
#[derive(Debug, Default)]
pub struct SpriteRegistry {
    slots: Vec<Option<Sprite>>,
}

impl SpriteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sprite, reusing the lowest free id
    pub fn insert(&mut self, renderer: Rc<dyn LayerRenderer>, xorg: i32, yorg: i32) -> Result<SpriteId, TileCacheError> {
        let sprite = Sprite::new(renderer, xorg, yorg);
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(sprite);
                index
            }
            None => {
                if self.slots.len() >= MAX_SPRITES {
                    return Err(TileCacheError::TooManySprites);
                }
                self.slots
                    .try_reserve(1)
                    .map_err(|_| TileCacheError::OutOfMemory("sprite table"))?;
                self.slots.push(Some(sprite));
                self.slots.len() - 1
            }
        };
        Ok(index as SpriteId + 1)
    }

    pub fn get(&self, id: SpriteId) -> Option<&Sprite> {
        let index = (id as usize).checked_sub(1)?;
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, id: SpriteId) -> Option<&mut Sprite> {
        let index = (id as usize).checked_sub(1)?;
        self.slots.get_mut(index)?.as_mut()
    }

    pub fn remove(&mut self, id: SpriteId) -> Option<Sprite> {
        let index = (id as usize).checked_sub(1)?;
        self.slots.get_mut(index)?.take()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SpriteId, &Sprite)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i as SpriteId + 1, s)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::render::RenderContext;
    use crate::error::RenderError;

    fn renderer() -> Rc<dyn LayerRenderer> {
        Rc::new(|_: &mut RenderContext<'_>, _: Rect| -> Result<(), RenderError> { Ok(()) })
    }

    #[test]
    fn test_ids_are_one_based_and_reused() {
        let mut sprites = SpriteRegistry::new();
        let a = sprites.insert(renderer(), 0, 0).unwrap();
        let b = sprites.insert(renderer(), 0, 0).unwrap();
        assert_eq!((a, b), (1, 2));

        sprites.remove(a);
        assert!(sprites.get(a).is_none());
        assert_eq!(sprites.insert(renderer(), 0, 0).unwrap(), 1);
        assert!(sprites.get(0).is_none());
    }

    #[test]
    fn test_scroll_saturates() {
        let mut sprites = SpriteRegistry::new();
        let id = sprites.insert(renderer(), 100, -100).unwrap();
        let sprite = sprites.get_mut(id).unwrap();
        sprite.scroll(3, -4);
        assert_eq!(sprite.origin(), (97, -96));

        sprite.scroll(i32::MIN, i32::MAX);
        sprite.scroll(i32::MIN, i32::MAX);
        assert_eq!(sprite.origin(), (i32::MAX, i32::MIN));
    }

    #[test]
    fn test_expand_grows_without_sliding() {
        let mut sprites = SpriteRegistry::new();
        let id = sprites.insert(renderer(), 128 * 32, 128 * 32).unwrap();
        let sprite = sprites.get_mut(id).unwrap();

        let mut request = TileRect::new(128, 128, 131, 131);
        let shift = sprite.expand(&mut request, 256, 32).unwrap();
        assert_eq!((shift.dx, shift.dy), (0, 0));
        assert_eq!(sprite.window(), TileRect::new(128, 128, 131, 131));
        assert_eq!(request, TileRect::new(128, 128, 131, 131));

        // Same request again leaves the window alone.
        assert!(sprite.expand(&mut request, 256, 32).is_none());
    }

    #[test]
    fn test_expand_slides_and_drops_far_tiles() {
        let mut sprites = SpriteRegistry::new();
        let id = sprites.insert(renderer(), 128 * 32, 0).unwrap();
        let sprite = sprites.get_mut(id).unwrap();

        let mut request = TileRect::new(128, 0, 130, 1);
        sprite.expand(&mut request, 256, 32);
        assert!(sprite.set_slot(128, 0, TileId::from_raw(7)));
        assert!(sprite.set_slot(129, 0, TileId::from_raw(8)));

        // Far to the left of the window: the union is wider than the span.
        let mut request = TileRect::new(-200, 0, -198, 1);
        let shift = sprite.expand(&mut request, 256, 32).unwrap();
        assert_eq!(shift.dx, 200);
        assert_eq!(shift.dropped.len(), 2);
        assert_eq!(request, TileRect::new(0, 0, 2, 1));
        assert_eq!(sprite.origin().0, 128 * 32 + 200 * 32);
        assert!(sprite.window().right <= 256);
    }

    #[test]
    fn test_expand_slide_keeps_nearby_tiles() {
        let mut sprites = SpriteRegistry::new();
        let id = sprites.insert(renderer(), 0, 0).unwrap();
        let sprite = sprites.get_mut(id).unwrap();

        let mut request = TileRect::new(0, 0, 2, 1);
        sprite.expand(&mut request, 256, 32);
        sprite.set_slot(0, 0, TileId::from_raw(3));

        let mut request = TileRect::new(-1, 0, 1, 1);
        let shift = sprite.expand(&mut request, 256, 32).unwrap();
        assert_eq!(shift.dx, 1);
        assert_eq!(shift.moved, vec![(TileId::from_raw(3), 1, 0)]);
        assert_eq!(sprite.slot(1, 0), TileId::from_raw(3));
        assert_eq!(request, TileRect::new(0, 0, 2, 1));
    }

    #[test]
    fn test_take_tiles_in_clears_slots() {
        let mut sprites = SpriteRegistry::new();
        let id = sprites.insert(renderer(), 0, 0).unwrap();
        let sprite = sprites.get_mut(id).unwrap();
        let mut request = TileRect::new(0, 0, 3, 3);
        sprite.expand(&mut request, 256, 32);
        sprite.set_slot(1, 1, TileId::from_raw(5));
        sprite.set_slot(2, 2, TileId::from_raw(6));

        let taken = sprite.take_tiles_in(TileRect::new(0, 0, 2, 2));
        assert_eq!(taken, vec![TileId::from_raw(5)]);
        assert!(sprite.slot(1, 1).is_nil());
        assert_eq!(sprite.slot(2, 2), TileId::from_raw(6));
    }
}
