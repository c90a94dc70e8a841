//! fOS Tile Cache
//!
//! Tile-based rendering cache and compositor. Scenery layers (full-canvas,
//! ordered) and sprites (independently scrolled) are rendered into fixed-size
//! tiles that are cached across frames and replayed through a compositor
//! backend.
//!
//! ```no_run
//! use std::rc::Rc;
//! use fos_tilecache::{Layer, Rect, SolidRenderer, TileCache, TileCacheConfig};
//!
//! let mut cache = TileCache::new(TileCacheConfig::default());
//! cache.set_viewport(Rect::new(0, 0, 800, 600));
//!
//! let region = Rect::new(0, 0, 800, 600);
//! let mut background = Layer::new(
//!     region,
//!     Rc::new(SolidRenderer::new(region, tiny_skia::Color::WHITE)),
//! )
//! .opaque(true);
//!
//! cache.begin_frame();
//! cache.render_scenery(&mut background);
//! cache.end_frame();
//!
//! let mut surface = tiny_skia::Pixmap::new(800, 600).unwrap();
//! cache.composite(&mut surface, Rect::new(0, 0, 800, 600)).unwrap();
//! ```

pub mod cache;
pub mod compositor;
pub mod config;
pub mod display_list;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod pool;
pub mod render;
pub mod sprite;

pub use cache::{FrameStats, TileCache};
pub use compositor::{
    AtlasCompositor, BackendTile, BlendMode, Compositor, CompositorKind, NullCompositor,
    SoftwareCompositor, Surface,
};
pub use config::TileCacheConfig;
pub use display_list::{DisplayItem, DisplayList};
pub use error::{AuditError, CompositorError, RenderError, TileCacheError};
pub use geometry::{Rect, TileRect};
pub use pool::{PoolStats, TileContent, TileId, TileInfo, TileOwner};
pub use render::{Layer, LayerRenderer, RenderContext, SolidRenderer};
pub use sprite::{Sprite, SpriteId};
