//! Tile Cache Configuration

use crate::compositor::CompositorKind;

/// Largest number of addressable tiles (handle 0 is reserved)
pub const MAX_TILE_LIMIT: usize = u16::MAX as usize;

/// Tile cache configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCacheConfig {
    /// Edge length of a tile in pixels
    pub tile_size: u32,
    /// Budget for tile backing storage in bytes
    pub cache_limit: usize,
    /// Maximum number of live tiles
    pub tile_limit: usize,
    /// Width and height of a sprite's tile window
    pub sprite_window_span: i32,
    /// Backend selected on creation and activation
    pub compositor: CompositorKind,
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self {
            tile_size: 32,
            cache_limit: 32 * 1024 * 1024,
            tile_limit: MAX_TILE_LIMIT,
            sprite_window_span: 256,
            compositor: CompositorKind::Software,
        }
    }
}

impl TileCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_cache_limit(mut self, cache_limit: usize) -> Self {
        self.cache_limit = cache_limit;
        self
    }

    pub fn with_tile_limit(mut self, tile_limit: usize) -> Self {
        self.tile_limit = tile_limit;
        self
    }

    pub fn with_sprite_window_span(mut self, span: i32) -> Self {
        self.sprite_window_span = span;
        self
    }

    pub fn with_compositor(mut self, kind: CompositorKind) -> Self {
        self.compositor = kind;
        self
    }

    /// Clamp values into the ranges the cache can address
    pub(crate) fn normalized(mut self) -> Self {
        self.tile_size = self.tile_size.clamp(1, 1024);
        self.tile_limit = self.tile_limit.clamp(1, MAX_TILE_LIMIT);
        self.sprite_window_span = self.sprite_window_span.clamp(4, 4096);
        self
    }

    /// Bytes of backing storage for one tile
    pub fn tile_bytes(&self) -> usize {
        let size = self.tile_size as usize;
        size * size * 4
    }
}
