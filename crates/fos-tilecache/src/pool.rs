//! Tile Pool
//!
//! Bounded arena of fixed-size tiles addressed by 16-bit handles. Every
//! live tile sits on exactly one of three intrusive lists: *used* (most
//! recently touched first), *dirty* (waiting for destruction at the start of
//! the next frame) or *empty* (free for reuse). Tiles at the tail of the used
//! list that have not been touched during the current frame form the
//! *inactive* segment, which is the only place eviction takes tiles from.

use crate::compositor::BackendTile;
use crate::error::TileCacheError;

/// Handle to a tile in the pool; 0 is never a valid tile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(u16);

impl TileId {
    pub const NIL: TileId = TileId(0);

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    fn index(self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u16) -> TileId {
        TileId(raw)
    }
}

/// What a tile caches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TileOwner {
    #[default]
    None,
    /// A tile of a sprite's window
    Sprite(u32),
    /// A composite of scenery layers `first..=last` (first is top-most)
    Scenery { first: u32, last: u32 },
}

/// Pixel payload of a tile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TileContent {
    /// Not rendered yet, or released
    #[default]
    Empty,
    /// Every pixel has this packed premultiplied color
    Constant(u32),
    /// Pixels live in the compositor
    Stored(BackendTile),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum TileState {
    #[default]
    Unlinked,
    Used,
    Dirty,
    Empty,
}

/// Cached tile
#[derive(Debug, Clone, Default)]
pub struct Tile {
    pub(crate) owner: TileOwner,
    /// Grid position for scenery, window position for sprites
    pub(crate) x: i32,
    pub(crate) y: i32,
    /// 255 opaque, 0 transparent, 127 anything in between
    pub(crate) alpha: u8,
    pub(crate) content: TileContent,
    state: TileState,
    prev: TileId,
    next: TileId,
}

impl Tile {
    pub fn owner(&self) -> TileOwner { self.owner }
    pub fn position(&self) -> (i32, i32) { (self.x, self.y) }
    pub fn alpha(&self) -> u8 { self.alpha }
    pub fn content(&self) -> TileContent { self.content }
}

/// Public snapshot of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileInfo {
    pub id: TileId,
    pub owner: TileOwner,
    pub x: i32,
    pub y: i32,
    pub alpha: u8,
    pub content: TileContent,
}

#[derive(Debug, Clone, Copy, Default)]
struct TileList {
    first: TileId,
    last: TileId,
    len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Used,
    Dirty,
    Empty,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub tile_count: usize,
    pub used: usize,
    pub dirty: usize,
    pub empty: usize,
    pub active: usize,
    pub bytes: usize,
}

/// Tile arena
#[derive(Debug)]
pub struct TilePool {
    tiles: Vec<Tile>,
    used: TileList,
    dirty: TileList,
    empty: TileList,
    inactive: TileId,
    active_count: usize,
    tile_limit: usize,
    cache_size: usize,
}

impl TilePool {
    pub fn new(tile_limit: usize) -> Self {
        Self {
            tiles: vec![Tile::default()],
            used: TileList::default(),
            dirty: TileList::default(),
            empty: TileList::default(),
            inactive: TileId::NIL,
            active_count: 0,
            tile_limit,
            cache_size: 0,
        }
    }

    /// Forget every tile. Backing storage must already have been released.
    pub fn reset(&mut self) {
        self.tiles.truncate(1);
        self.tiles[0] = Tile::default();
        self.used = TileList::default();
        self.dirty = TileList::default();
        self.empty = TileList::default();
        self.inactive = TileId::NIL;
        self.active_count = 0;
        self.cache_size = 0;
    }

    pub fn tile(&self, id: TileId) -> &Tile {
        &self.tiles[id.index()]
    }

    pub(crate) fn tile_mut(&mut self, id: TileId) -> &mut Tile {
        &mut self.tiles[id.index()]
    }

    pub fn info(&self, id: TileId) -> Option<TileInfo> {
        let tile = self.tiles.get(id.index()).filter(|_| !id.is_nil())?;
        if tile.state != TileState::Used && tile.state != TileState::Dirty {
            return None;
        }
        Some(TileInfo {
            id,
            owner: tile.owner,
            x: tile.x,
            y: tile.y,
            alpha: tile.alpha,
            content: tile.content,
        })
    }

    /// Number of tile slots handed out (excluding the reserved one)
    pub fn tile_count(&self) -> usize {
        self.tiles.len() - 1
    }

    pub fn tile_limit(&self) -> usize {
        self.tile_limit
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub(crate) fn add_bytes(&mut self, bytes: usize) {
        self.cache_size += bytes;
    }

    pub(crate) fn sub_bytes(&mut self, bytes: usize) {
        self.cache_size = self.cache_size.saturating_sub(bytes);
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            tile_count: self.tile_count(),
            used: self.used.len,
            dirty: self.dirty.len,
            empty: self.empty.len,
            active: self.active_count,
            bytes: self.cache_size,
        }
    }

    pub fn is_used(&self, id: TileId) -> bool {
        !id.is_nil() && self.tiles.get(id.index()).is_some_and(|t| t.state == TileState::Used)
    }

    /// Least recently touched tile that was not touched this frame
    pub fn oldest_inactive(&self) -> Option<TileId> {
        if self.inactive.is_nil() { None } else { Some(self.used.last) }
    }

    /// Take a tile from the empty list
    pub fn pop_empty(&mut self) -> Option<TileId> {
        let id = self.empty.first;
        if id.is_nil() {
            return None;
        }
        self.unlink(id);
        Some(id)
    }

    /// Append a fresh tile slot, or `None` when the tile limit is reached
    pub fn grow(&mut self) -> Result<Option<TileId>, TileCacheError> {
        if self.tile_count() >= self.tile_limit {
            return Ok(None);
        }
        self.tiles
            .try_reserve(1)
            .map_err(|_| TileCacheError::OutOfMemory("tile array"))?;
        let id = TileId(self.tiles.len() as u16);
        self.tiles.push(Tile::default());
        Ok(Some(id))
    }

    /// Reinitialize an unlinked tile and put it at the head of the used list
    pub fn activate(&mut self, id: TileId, owner: TileOwner, x: i32, y: i32, alpha: u8) {
        let tile = self.tile_mut(id);
        tile.owner = owner;
        tile.x = x;
        tile.y = y;
        tile.alpha = alpha;
        tile.content = TileContent::Empty;
        self.push_front(ListKind::Used, id);
    }

    /// Move a used tile to the head of the used list and mark it active
    pub fn touch(&mut self, id: TileId) {
        if self.tile(id).state != TileState::Used {
            return;
        }
        self.unlink(id);
        self.push_front(ListKind::Used, id);
        self.active_count += 1;
    }

    /// Move a used tile to the dirty list
    pub fn mark_dirty(&mut self, id: TileId) {
        if self.tile(id).state != TileState::Used {
            return;
        }
        self.unlink(id);
        self.push_front(ListKind::Dirty, id);
    }

    /// Release a destroyed tile to the empty list
    pub fn push_empty(&mut self, id: TileId) {
        let tile = self.tile_mut(id);
        tile.owner = TileOwner::None;
        tile.alpha = 0;
        tile.content = TileContent::Empty;
        self.push_front(ListKind::Empty, id);
    }

    /// Every tile currently on the dirty list
    pub fn dirty_tiles(&self) -> Vec<TileId> {
        self.collect(self.dirty)
    }

    /// Every tile currently on the used list, most recent first
    #[cfg(test)]
    pub fn used_tiles(&self) -> Vec<TileId> {
        self.collect(self.used)
    }

    /// Start a frame: every used tile becomes inactive
    pub fn begin_frame(&mut self) {
        self.inactive = self.used.first;
        self.active_count = 0;
    }

    /// Detach a tile from whichever list holds it
    pub fn unlink(&mut self, id: TileId) {
        let Some(kind) = self.kind_of(id) else {
            return;
        };

        if kind == ListKind::Used && self.inactive == id {
            self.inactive = self.tile(id).next;
        }

        let (prev, next) = {
            let tile = self.tile(id);
            (tile.prev, tile.next)
        };
        if prev.is_nil() {
            self.list_mut(kind).first = next;
        } else {
            self.tile_mut(prev).next = next;
        }
        if next.is_nil() {
            self.list_mut(kind).last = prev;
        } else {
            self.tile_mut(next).prev = prev;
        }
        self.list_mut(kind).len -= 1;

        let tile = self.tile_mut(id);
        tile.prev = TileId::NIL;
        tile.next = TileId::NIL;
        tile.state = TileState::Unlinked;
    }

    fn push_front(&mut self, kind: ListKind, id: TileId) {
        let first = self.list_mut(kind).first;
        {
            let tile = self.tile_mut(id);
            tile.prev = TileId::NIL;
            tile.next = first;
            tile.state = match kind {
                ListKind::Used => TileState::Used,
                ListKind::Dirty => TileState::Dirty,
                ListKind::Empty => TileState::Empty,
            };
        }
        if first.is_nil() {
            self.list_mut(kind).last = id;
        } else {
            self.tile_mut(first).prev = id;
        }
        let list = self.list_mut(kind);
        list.first = id;
        list.len += 1;
    }

    fn kind_of(&self, id: TileId) -> Option<ListKind> {
        match self.tile(id).state {
            TileState::Unlinked => None,
            TileState::Used => Some(ListKind::Used),
            TileState::Dirty => Some(ListKind::Dirty),
            TileState::Empty => Some(ListKind::Empty),
        }
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut TileList {
        match kind {
            ListKind::Used => &mut self.used,
            ListKind::Dirty => &mut self.dirty,
            ListKind::Empty => &mut self.empty,
        }
    }

    fn collect(&self, list: TileList) -> Vec<TileId> {
        let mut out = Vec::with_capacity(list.len);
        let mut id = list.first;
        while !id.is_nil() {
            out.push(id);
            id = self.tile(id).next;
        }
        out
    }

    /// Tiles on more than one list, or whose list links disagree with their state
    pub(crate) fn check_links(&self) -> Option<TileId> {
        let mut seen = vec![false; self.tiles.len()];
        for (list, state) in [
            (self.used, TileState::Used),
            (self.dirty, TileState::Dirty),
            (self.empty, TileState::Empty),
        ] {
            for id in self.collect(list) {
                if seen[id.index()] || self.tile(id).state != state {
                    return Some(id);
                }
                seen[id.index()] = true;
            }
        }
        None
    }

    /// Ids of all tiles in the given state set, in slot order
    pub(crate) fn live_tiles(&self) -> impl Iterator<Item = (TileId, &Tile)> {
        self.tiles
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, t)| matches!(t.state, TileState::Used | TileState::Dirty))
            .map(|(i, t)| (TileId(i as u16), t))
    }
}

/// Pack one premultiplied RGBA pixel with alpha in the top byte
pub fn pack_pixel(rgba: &[u8]) -> u32 {
    u32::from_le_bytes([rgba[0], rgba[1], rgba[2], rgba[3]])
}
