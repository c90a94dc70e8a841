//! Errors
//!
//! Failure classes for the tile cache and its two callback seams.

/// Tile cache error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TileCacheError {
    #[error("tile limit of {limit} tiles reached")]
    TileLimit { limit: usize },

    #[error("cache budget of {limit} bytes exhausted")]
    BudgetExhausted { limit: usize },

    #[error("too many scenery layers in one frame")]
    TooManyLayers,

    #[error("too many sprites")]
    TooManySprites,

    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    #[error("layer renderer failed: {0}")]
    Render(#[from] RenderError),

    #[error("compositor failed: {0}")]
    Compositor(#[from] CompositorError),

    #[error("tile cache is invalid")]
    Invalid,
}

/// Error returned by a layer renderer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("render failed: {0}")]
    Failed(String),
}

/// Error returned by a compositor backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositorError {
    #[error("no compositor configured")]
    Unsupported,

    #[error("tile storage allocation failed")]
    Allocation,

    #[error("unknown tile handle {0:#x}")]
    UnknownTile(u32),

    #[error("no frame or snapshot in progress")]
    NoTarget,

    #[error("layer stack underflow")]
    LayerUnderflow,

    #[error("invalid target size {width}x{height}")]
    InvalidSize { width: i32, height: i32 },
}

/// Consistency violation reported by [`crate::TileCache::audit`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("tile {0} is linked on more than one list")]
    MultipleLists(u16),

    #[error("tile {0} is used but has no owner slot")]
    Orphaned(u16),

    #[error("tile {0} is referenced by {1} slots")]
    SharedTile(u16, usize),

    #[error("slot references tile {0} which is not in use")]
    StaleReference(u16),

    #[error("cache holds {size} bytes over a limit of {limit}")]
    OverBudget { size: usize, limit: usize },

    #[error("byte accounting mismatch: counted {counted}, tracked {tracked}")]
    Accounting { counted: usize, tracked: usize },
}
