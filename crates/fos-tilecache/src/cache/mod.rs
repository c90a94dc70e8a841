//! Tile Cache
//!
//! Owns the tile pool, the scenery grid, the sprites and the compositor, and
//! keeps them consistent. Frame rendering lives in [`pipeline`].
//!
//! Errors inside an operation invalidate the whole cache: the first error is
//! kept in [`TileCache::last_error`] and every later operation is a no-op
//! until [`TileCache::flush`] or [`TileCache::activate`].

mod pipeline;

pub use pipeline::FrameStats;

use std::rc::Rc;

use tiny_skia::Pixmap;

use crate::compositor::{Compositor, CompositorKind, NullCompositor};
use crate::config::TileCacheConfig;
use crate::display_list::DisplayList;
use crate::error::{AuditError, TileCacheError};
use crate::geometry::{Rect, TileRect, tile_ceil, tile_floor};
use crate::grid::Grid;
use crate::pool::{PoolStats, TileContent, TileId, TileInfo, TileOwner, TilePool, pack_pixel};
use crate::render::LayerRenderer;
use crate::sprite::{Sprite, SpriteId, SpriteRegistry};

/// Per-cell frame state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Frontier {
    /// Nothing pending
    #[default]
    Empty,
    /// Covered by an opaque tile; lower layers are skipped
    Occluded,
    /// Layers `first..=last` still have to be emitted as one tile.
    /// `old_*` are the ids the same layers had last frame.
    Pending {
        first: u32,
        last: u32,
        old_first: u32,
        old_last: u32,
    },
}

/// Tile-based rendering cache
pub struct TileCache {
    config: TileCacheConfig,
    compositor: Box<dyn Compositor>,
    pool: TilePool,
    grid: Grid,
    sprites: SpriteRegistry,
    display: DisplayList,

    // Frame state
    in_frame: bool,
    frontiers: Vec<Frontier>,
    /// Last frame's layer id -> this frame's layer id
    scenery_map: Vec<u32>,
    /// Renderers of this frame's scenery layers; id `n` is at `n - 1`
    scenery: Vec<Rc<dyn LayerRenderer>>,
    /// Number of scenery layers rendered in the previous frame
    layer_count: usize,
    sprite_list: Vec<TileId>,
    scenery_list: Vec<TileId>,

    valid: bool,
    clean: bool,
    last_error: Option<TileCacheError>,
    stats: FrameStats,
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("config", &self.config)
            .field("compositor", &self.compositor)
            .field("pool", &self.pool.stats())
            .field("viewport", &self.grid.viewport())
            .field("sprites", &self.sprites.len())
            .field("in_frame", &self.in_frame)
            .field("valid", &self.valid)
            .field("clean", &self.clean)
            .finish_non_exhaustive()
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new(TileCacheConfig::default())
    }
}

impl TileCache {
    pub fn new(config: TileCacheConfig) -> Self {
        let config = config.normalized();
        tracing::debug!(
            "Tile cache: {}px tiles, {} byte budget, {:?} compositor",
            config.tile_size,
            config.cache_limit,
            config.compositor
        );
        Self {
            compositor: config.compositor.create(),
            pool: TilePool::new(config.tile_limit),
            grid: Grid::new(config.tile_size),
            sprites: SpriteRegistry::new(),
            display: DisplayList::new(),
            in_frame: false,
            frontiers: Vec::new(),
            scenery_map: Vec::new(),
            scenery: Vec::new(),
            layer_count: 0,
            sprite_list: Vec::new(),
            scenery_list: Vec::new(),
            valid: true,
            clean: true,
            last_error: None,
            stats: FrameStats::default(),
            config,
        }
    }

    // ---- State ----

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// True after a flush until the next completed frame
    pub fn is_clean(&self) -> bool {
        self.clean
    }

    /// Mark the cache unusable until the next flush
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.in_frame = false;
    }

    /// First error since the last flush
    pub fn last_error(&self) -> Option<&TileCacheError> {
        self.last_error.as_ref()
    }

    pub fn config(&self) -> &TileCacheConfig {
        &self.config
    }

    pub fn tile_size(&self) -> u32 {
        self.config.tile_size
    }

    pub fn cache_limit(&self) -> usize {
        self.config.cache_limit
    }

    pub fn viewport(&self) -> Rect {
        self.grid.viewport()
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn compositor_kind(&self) -> CompositorKind {
        self.compositor.kind()
    }

    /// Bytes of tile storage held by the compositor
    pub fn cache_size(&self) -> usize {
        self.pool.cache_size()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn tile_info(&self, id: TileId) -> Option<TileInfo> {
        self.pool.info(id)
    }

    /// Tiles cached in grid cell (x, y)
    pub fn cell_tiles(&self, x: i32, y: i32) -> Vec<TileInfo> {
        if !self.grid.bounds().contains(x, y) {
            return Vec::new();
        }
        self.grid.cell(x, y).iter().filter_map(|&t| self.pool.info(t)).collect()
    }

    pub fn sprite(&self, id: SpriteId) -> Option<&Sprite> {
        self.sprites.get(id)
    }

    pub fn sprite_count(&self) -> usize {
        self.sprites.len()
    }

    pub fn display_list(&self) -> &DisplayList {
        &self.display
    }

    // ---- Lifecycle ----

    /// Drop every cached tile and sprite and return to a valid, clean state
    pub fn flush(&mut self) {
        self.release_all();
        self.grid.clear();
        self.sprites.clear();
        self.compositor.flush();
        self.pool.reset();
        self.reset_frame();
        self.layer_count = 0;
        self.valid = true;
        self.clean = true;
        self.last_error = None;
        tracing::debug!("Tile cache flushed");
    }

    /// Drop tiles that were not used in the last frame
    pub fn compact(&mut self) {
        if !self.valid {
            return;
        }
        let mut released = 0;
        while let Some(id) = self.pool.oldest_inactive() {
            self.destroy_tile(id);
            released += 1;
        }
        self.compositor.flush();
        tracing::debug!("Compacted {} tiles, {} bytes cached", released, self.pool.cache_size());
    }

    /// Bring the configured compositor back after [`Self::deactivate`].
    /// Cached tiles survive unless the backend changes or a frame failed.
    pub fn activate(&mut self) {
        if self.compositor.kind() != self.config.compositor {
            self.release_all();
            self.compositor = self.config.compositor.create();
            self.flush();
        } else if self.last_error.is_some() {
            self.flush();
        } else {
            self.valid = true;
        }
        tracing::info!("Tile cache activated with {:?} compositor", self.config.compositor);
    }

    /// Release everything and detach from the compositor
    pub fn deactivate(&mut self) {
        self.flush();
        self.compositor = Box::new(NullCompositor);
        self.valid = false;
        tracing::info!("Tile cache deactivated");
    }

    // ---- Configuration ----

    pub fn supports_compositor(&self, kind: CompositorKind) -> bool {
        kind.is_supported()
    }

    /// Switch to a built-in backend. Always flushes.
    pub fn set_compositor(&mut self, kind: CompositorKind) -> bool {
        if !self.supports_compositor(kind) {
            return false;
        }
        self.flush();
        self.compositor = kind.create();
        self.config.compositor = kind;
        tracing::info!("Compositor set to {:?}", kind);
        true
    }

    /// Install a custom backend. Always flushes.
    pub fn set_compositor_backend(&mut self, compositor: Box<dyn Compositor>) {
        self.flush();
        self.config.compositor = compositor.kind();
        self.compositor = compositor;
        tracing::info!("Compositor set to custom {:?} backend", self.config.compositor);
    }

    pub fn set_cache_limit(&mut self, limit: usize) {
        self.config.cache_limit = limit;
        if self.pool.cache_size() > limit {
            self.flush();
        }
    }

    pub fn set_tile_size(&mut self, tile_size: u32) {
        let tile_size = tile_size.clamp(1, 1024);
        if tile_size == self.config.tile_size {
            return;
        }
        self.flush();
        self.config.tile_size = tile_size;
        self.grid.set_tile_size(tile_size);
    }

    /// Resize or move the viewport. Cells that stay complete and in place
    /// keep their tiles; all others are dirtied.
    pub fn set_viewport(&mut self, viewport: Rect) {
        if !self.valid {
            self.flush();
        }
        if viewport == self.grid.viewport() {
            return;
        }
        let dropped = self.grid.set_viewport(viewport);
        tracing::debug!(
            "Viewport {:?}: {}x{} cells, {} tiles dropped",
            viewport,
            self.grid.tiles_across(),
            self.grid.tiles_down(),
            dropped.len()
        );
        for id in dropped {
            self.pool.mark_dirty(id);
        }
    }

    // ---- Scenery invalidation ----

    /// A layer is about to be inserted above layer `before` (last frame's ids)
    pub fn insert_scenery(&mut self, before: u32, region: Rect) {
        if !self.valid || before <= 1 {
            return;
        }
        self.dirty_scenery(region, before - 1, before);
    }

    pub fn remove_scenery(&mut self, layer: u32, region: Rect) {
        if !self.valid {
            return;
        }
        self.dirty_scenery(region, layer, layer);
    }

    pub fn reshape_scenery(&mut self, layer: u32, old_region: Rect, new_region: Rect) {
        self.remove_scenery(layer, old_region);
        self.insert_scenery(layer + 1, new_region);
    }

    /// Content of `layer` changed inside `region`
    pub fn update_scenery(&mut self, layer: u32, region: Rect) {
        if !self.valid {
            return;
        }
        self.dirty_scenery(region, layer, layer);
    }

    /// Dirty scenery tiles in `region` whose span covers `first..=last`
    fn dirty_scenery(&mut self, region: Rect, first: u32, last: u32) {
        let mut dirty = Vec::new();
        for (x, y) in self.grid.touched_tiles(&region).cells() {
            dirty.extend(self.grid.cell(x, y).iter().copied().filter(|&t| {
                match self.pool.tile(t).owner {
                    TileOwner::Scenery { first: f, last: l } => f <= first && last <= l,
                    _ => false,
                }
            }));
        }
        for id in dirty {
            self.dirty_tile(id);
        }
    }

    // ---- Sprites ----

    /// Forget a sprite and dirty its tiles
    pub fn remove_sprite(&mut self, id: SpriteId) {
        if id == 0 || !self.valid || self.clean {
            return;
        }
        if let Some(mut sprite) = self.sprites.remove(id) {
            for tile in sprite.take_all_tiles() {
                self.pool.mark_dirty(tile);
            }
        }
    }

    /// Move a sprite's content by (dx, dy) without invalidating it
    pub fn scroll_sprite(&mut self, id: SpriteId, dx: i32, dy: i32) {
        if id == 0 || !self.valid || self.clean {
            return;
        }
        if let Some(sprite) = self.sprites.get_mut(id) {
            sprite.scroll(dx, dy);
        }
    }

    /// Content of a sprite changed inside `region` (sprite content coordinates)
    pub fn update_sprite(&mut self, id: SpriteId, region: Rect) {
        if id == 0 || !self.valid || self.clean || region.is_empty() {
            return;
        }
        let ts = self.config.tile_size as i32;
        let Some(sprite) = self.sprites.get_mut(id) else {
            return;
        };
        let (xorg, yorg) = sprite.origin();
        let local = region.offset(xorg, yorg);
        let area = TileRect::new(
            tile_floor(local.left(), ts),
            tile_floor(local.top(), ts),
            tile_ceil(local.right(), ts),
            tile_ceil(local.bottom(), ts),
        );
        for tile in sprite.take_tiles_in(area) {
            self.pool.mark_dirty(tile);
        }
    }

    /// Starting origin of a new sprite: the middle of its window
    fn initial_sprite_origin(&self) -> i32 {
        let ts = self.config.tile_size as i32;
        let span = self.config.sprite_window_span;
        if ts < 256 { span / 2 * ts } else { span / 4 * ts }
    }

    // ---- Tiles ----

    /// Get a tile for `owner`: a free one, a new one, or the least recently
    /// used tile that was not touched this frame
    fn create_tile(&mut self, owner: TileOwner, x: i32, y: i32, alpha: u8) -> Result<TileId, TileCacheError> {
        let id = match self.pool.pop_empty() {
            Some(id) => id,
            None => match self.pool.grow()? {
                Some(id) => id,
                None => {
                    let id = self.pool.oldest_inactive().ok_or(TileCacheError::TileLimit {
                        limit: self.pool.tile_limit(),
                    })?;
                    tracing::trace!("Reclaiming tile {}", id.get());
                    self.detach_tile(id);
                    self.release_storage(id);
                    self.pool.unlink(id);
                    id
                }
            },
        };
        self.pool.activate(id, owner, x, y, alpha);
        Ok(id)
    }

    /// Clear whichever cell or sprite slot references the tile
    fn detach_tile(&mut self, id: TileId) {
        let tile = self.pool.tile(id);
        let (x, y) = tile.position();
        match tile.owner() {
            TileOwner::Scenery { .. } => {
                self.grid.detach(x, y, id);
            }
            TileOwner::Sprite(sprite) => {
                if let Some(sprite) = self.sprites.get_mut(sprite) {
                    sprite.detach(x, y, id);
                }
            }
            TileOwner::None => {}
        }
    }

    /// Schedule a used tile for destruction at the start of the next frame
    fn dirty_tile(&mut self, id: TileId) {
        if !self.pool.is_used(id) {
            return;
        }
        self.detach_tile(id);
        self.pool.mark_dirty(id);
    }

    /// Destroy a used tile right away
    fn destroy_tile(&mut self, id: TileId) {
        self.detach_tile(id);
        self.release_storage(id);
        self.pool.unlink(id);
        self.pool.push_empty(id);
    }

    /// Give a tile's pixels back to the compositor
    fn release_storage(&mut self, id: TileId) {
        let tile = self.pool.tile_mut(id);
        let content = std::mem::take(&mut tile.content);
        if let TileContent::Stored(handle) = content {
            self.compositor.deallocate_tile(handle);
            self.pool.sub_bytes(self.config.tile_bytes());
        }
    }

    /// Release the storage of every live tile
    fn release_all(&mut self) {
        let live: Vec<TileId> = self.pool.live_tiles().map(|(id, _)| id).collect();
        for id in live {
            self.release_storage(id);
        }
    }

    /// Evict inactive tiles until one more tile fits the budget
    fn ensure_room(&mut self) -> Result<(), TileCacheError> {
        let tile_bytes = self.config.tile_bytes();
        while self.pool.cache_size() + tile_bytes > self.config.cache_limit {
            let id = self.pool.oldest_inactive().ok_or(TileCacheError::BudgetExhausted {
                limit: self.config.cache_limit,
            })?;
            tracing::trace!("Evicting tile {} for budget", id.get());
            self.destroy_tile(id);
        }
        Ok(())
    }

    /// Copy a tile out of a rendered buffer at (ox, oy) and store it
    fn fill_tile(&mut self, id: TileId, buffer: &Pixmap, ox: i32, oy: i32) -> Result<(), TileCacheError> {
        let ts = self.config.tile_size as usize;
        let row = ts * 4;
        let stride = buffer.width() as usize * 4;
        let data = buffer.data();

        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(row * ts)
            .map_err(|_| TileCacheError::OutOfMemory("tile pixels"))?;
        let (mut or, mut and) = (0u32, u32::MAX);
        for y in 0..ts {
            let start = (oy as usize + y) * stride + ox as usize * 4;
            let line = &data[start..start + row];
            for px in line.chunks_exact(4) {
                let packed = pack_pixel(px);
                or |= packed;
                and &= packed;
            }
            pixels.extend_from_slice(line);
        }

        if or == and {
            let tile = self.pool.tile_mut(id);
            tile.content = TileContent::Constant(or);
            tile.alpha = (or >> 24) as u8;
            return Ok(());
        }

        self.ensure_room()?;
        let handle = self.compositor.allocate_tile(ts as u32, &pixels)?;
        let tile = self.pool.tile_mut(id);
        tile.content = TileContent::Stored(handle);
        tile.alpha = if and >> 24 == 255 { 255 } else { 127 };
        self.pool.add_bytes(self.config.tile_bytes());
        Ok(())
    }

    // ---- Errors ----

    /// Run an operation, invalidating the cache if it fails
    fn guard<T: Default>(&mut self, op: impl FnOnce(&mut Self) -> Result<T, TileCacheError>) -> T {
        match op(self) {
            Ok(value) => value,
            Err(err) => {
                self.fail(err);
                T::default()
            }
        }
    }

    fn fail(&mut self, err: TileCacheError) {
        tracing::warn!("Tile cache invalidated: {}", err);
        self.valid = false;
        self.in_frame = false;
        if self.last_error.is_none() {
            self.last_error = Some(err);
        }
    }

    // ---- Consistency ----

    /// Check tile ownership and byte accounting
    pub fn audit(&self) -> Result<(), AuditError> {
        if let Some(id) = self.pool.check_links() {
            return Err(AuditError::MultipleLists(id.get()));
        }

        let mut refs = vec![0usize; self.pool.tile_count() + 1];
        let slots = self
            .grid
            .cells()
            .flat_map(|cell| cell.iter().copied())
            .chain(self.sprites.iter().flat_map(|(_, s)| s.cached_tiles().map(|(_, _, t)| t)));
        for id in slots {
            if !self.pool.is_used(id) {
                return Err(AuditError::StaleReference(id.get()));
            }
            refs[id.get() as usize] += 1;
        }
        // Scenery tiles join their cells at the end of the frame.
        for &id in &self.scenery_list {
            if self.pool.is_used(id) {
                refs[id.get() as usize] += 1;
            }
        }

        let mut counted = 0;
        for (id, tile) in self.pool.live_tiles() {
            if matches!(tile.content(), TileContent::Stored(_)) {
                counted += self.config.tile_bytes();
            }
            if !self.pool.is_used(id) {
                continue;
            }
            match refs[id.get() as usize] {
                0 => return Err(AuditError::Orphaned(id.get())),
                1 => {}
                n => return Err(AuditError::SharedTile(id.get(), n)),
            }
        }

        let tracked = self.pool.cache_size();
        if counted != tracked {
            return Err(AuditError::Accounting { counted, tracked });
        }
        if tracked > self.config.cache_limit {
            return Err(AuditError::OverBudget { size: tracked, limit: self.config.cache_limit });
        }
        Ok(())
    }
}

impl Drop for TileCache {
    fn drop(&mut self) {
        self.release_all();
        self.compositor.flush();
    }
}
