//! Display List & Playback
//!
//! The frame pipeline records instructions front-to-back, in the order it
//! decides what is visible. Playback walks them in reverse so the compositor
//! sees a plain back-to-front painter's order.

use crate::compositor::{BlendMode, Compositor};
use crate::error::CompositorError;
use crate::geometry::Rect;
use crate::pool::{TileContent, TileId, TilePool};

/// Display list instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayItem {
    /// Draw a tile at its grid position relative to the current origin
    Composite(TileId),
    /// Start a sprite layer; `origin` and `clip` are surface coordinates
    BeginLayer {
        origin: (i32, i32),
        clip: Rect,
        opacity: u8,
        blend: BlendMode,
    },
    /// Close the current layer
    EndLayer,
}

/// Instructions of one frame
#[derive(Debug, Default)]
pub struct DisplayList {
    items: Vec<DisplayItem>,
}

impl DisplayList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn push(&mut self, item: DisplayItem) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Instructions in recording (front-to-back) order
    pub fn items(&self) -> &[DisplayItem] {
        &self.items
    }

    /// Replay back-to-front into `compositor`
    pub fn play(
        &self,
        pool: &TilePool,
        tile_size: i32,
        compositor: &mut dyn Compositor,
    ) -> Result<(), CompositorError> {
        let mut origin = (0, 0);
        for item in self.items.iter().rev() {
            match *item {
                DisplayItem::Composite(id) => {
                    // Tiles destroyed since recording are skipped; dirty
                    // tiles keep their pixels until the next frame.
                    let Some(info) = pool.info(id) else {
                        continue;
                    };
                    let x = origin.0 + info.x * tile_size;
                    let y = origin.1 + info.y * tile_size;
                    match info.content {
                        TileContent::Empty => {}
                        TileContent::Constant(color) => {
                            if color >> 24 != 0 {
                                compositor.composite_rect(Rect::new(x, y, tile_size, tile_size), color)?;
                            }
                        }
                        TileContent::Stored(handle) => compositor.composite_tile(x, y, handle)?,
                    }
                }
                DisplayItem::BeginLayer { origin: layer_origin, clip, opacity, blend } => {
                    origin = layer_origin;
                    compositor.begin_layer(clip, opacity, blend)?;
                }
                DisplayItem::EndLayer => {
                    origin = (0, 0);
                    compositor.end_layer()?;
                }
            }
        }
        Ok(())
    }
}
