//! Frame Pipeline
//!
//! A frame is `begin_frame`, any number of `render_scenery` and
//! `render_sprite` calls in front-to-back order, then `end_frame`.
//!
//! While layers are submitted, every grid cell tracks a [`Frontier`]: the
//! range of scenery layers seen since the last emitted tile. An opaque layer
//! covering the cell, a sprite above the cell or the end of the frame closes
//! the range into one tile, which is either found in the cell from last frame
//! or queued for rendering. Cells under an opaque tile are occluded and lower
//! layers skip them. `end_frame` then renders the queued tiles in batches,
//! one renderer call per sprite and one per scenery layer.

use std::rc::Rc;

use tiny_skia::Pixmap;

use super::{Frontier, TileCache};
use crate::compositor::{Surface, mask_from_rects};
use crate::display_list::DisplayItem;
use crate::error::TileCacheError;
use crate::geometry::{Rect, TileRect, tile_ceil, tile_floor};
use crate::pool::{TileId, TileOwner};
use crate::render::{Layer, RenderContext};
use crate::sprite::SpriteId;

/// Statistics of the last completed frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Sprite tiles rendered this frame
    pub sprite_tiles: usize,
    /// Scenery tiles rendered this frame
    pub scenery_tiles: usize,
    /// Cached tiles reused this frame
    pub active_tiles: usize,
    /// Display list length
    pub instructions: usize,
    pub cache_bytes: usize,
    pub tile_count: usize,
    pub sprite_count: usize,
    pub scenery_layers: usize,
}

impl TileCache {
    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    pub fn last_frame_stats(&self) -> FrameStats {
        self.stats
    }

    pub(super) fn reset_frame(&mut self) {
        self.in_frame = false;
        self.frontiers.clear();
        self.scenery_map.clear();
        self.scenery.clear();
        self.sprite_list.clear();
        self.scenery_list.clear();
        self.display.clear();
    }

    fn frontier_index(&self, x: i32, y: i32) -> usize {
        self.grid.cell_index(x, y)
    }

    /// Start a frame: destroy dirty tiles and reset per-frame state
    pub fn begin_frame(&mut self) {
        if !self.valid {
            return;
        }
        self.reset_frame();

        for id in self.pool.dirty_tiles() {
            self.release_storage(id);
            self.pool.unlink(id);
            self.pool.push_empty(id);
        }

        self.scenery_map = vec![0; self.layer_count + 1];
        let cells = (self.grid.tiles_across() * self.grid.tiles_down()) as usize;
        self.frontiers = vec![Frontier::Empty; cells];
        self.pool.begin_frame();
        self.in_frame = true;
    }

    /// Submit the next scenery layer (front to back). `layer.id` must hold the
    /// id it got last frame, or 0; it is replaced by this frame's id.
    pub fn render_scenery(&mut self, layer: &mut Layer) {
        if !self.valid || !self.in_frame {
            return;
        }
        self.guard(|cache| cache.add_scenery(layer));
    }

    fn add_scenery(&mut self, layer: &mut Layer) -> Result<(), TileCacheError> {
        if self.clean {
            layer.id = 0;
        }
        let old = layer.id;
        let new = self.scenery.len() as u32 + 1;
        if new > u16::MAX as u32 {
            return Err(TileCacheError::TooManyLayers);
        }
        self.scenery
            .try_reserve(1)
            .map_err(|_| TileCacheError::OutOfMemory("scenery layers"))?;
        self.scenery.push(Rc::clone(&layer.renderer));
        if let Some(slot) = self.scenery_map.get_mut(old as usize).filter(|_| old != 0) {
            *slot = new;
        }
        layer.id = new;

        let touched = self.grid.touched_tiles(&layer.region);
        let covered = if layer.occludes() {
            self.grid.occluded_tiles(&layer.region)
        } else {
            TileRect::default()
        };

        for (x, y) in touched.cells() {
            let index = self.frontier_index(x, y);
            self.frontiers[index] = match self.frontiers[index] {
                Frontier::Occluded => continue,
                Frontier::Empty => Frontier::Pending { first: new, last: new, old_first: old, old_last: old },
                Frontier::Pending { first, old_first, .. } => {
                    Frontier::Pending { first, last: new, old_first, old_last: old }
                }
            };
            if covered.contains(x, y) {
                self.emit_scenery_tile(x, y, true)?;
            }
        }
        Ok(())
    }

    /// Close the pending layer range of cell (x, y) into a tile
    fn emit_scenery_tile(&mut self, x: i32, y: i32, opaque: bool) -> Result<(), TileCacheError> {
        let index = self.frontier_index(x, y);
        let Frontier::Pending { first, last, old_first, old_last } = self.frontiers[index] else {
            return Ok(());
        };

        let cached = if old_first != 0 && old_last != 0 {
            let owner = TileOwner::Scenery { first: old_first, last: old_last };
            self.grid.cell(x, y).iter().copied().find(|&t| self.pool.tile(t).owner == owner)
        } else {
            None
        };

        let id = match cached {
            Some(id) => {
                self.pool.touch(id);
                id
            }
            None => {
                let alpha = if opaque { 255 } else { 127 };
                let id = self.create_tile(TileOwner::Scenery { first, last }, x, y, alpha)?;
                self.scenery_list.push(id);
                id
            }
        };

        let alpha = self.pool.tile(id).alpha();
        if alpha != 0 {
            self.display.push(DisplayItem::Composite(id));
        }
        self.frontiers[index] = if alpha == 255 { Frontier::Occluded } else { Frontier::Empty };
        Ok(())
    }

    /// Submit a sprite layer (front to back). Creates the sprite when
    /// `layer.id` is 0; returns the sprite id, also stored in `layer.id`.
    pub fn render_sprite(&mut self, layer: &mut Layer) -> SpriteId {
        if !self.valid || !self.in_frame {
            return layer.id;
        }
        self.guard(|cache| cache.add_sprite(layer))
    }

    fn add_sprite(&mut self, layer: &mut Layer) -> Result<SpriteId, TileCacheError> {
        let ts = self.config.tile_size as i32;
        let span = self.config.sprite_window_span;
        let viewport = self.grid.viewport();

        if self.clean {
            layer.id = 0;
        }
        let id = match self.sprites.get_mut(layer.id) {
            Some(sprite) => {
                sprite.set_renderer(Rc::clone(&layer.renderer));
                layer.id
            }
            None => {
                let origin = self.initial_sprite_origin();
                self.sprites.insert(Rc::clone(&layer.renderer), origin, origin)?
            }
        };
        layer.id = id;

        let visible = viewport.intersect(&layer.region).intersect(&layer.clip);
        if visible.is_empty() {
            return Ok(id);
        }

        // Scenery above the sprite is emitted first.
        for (x, y) in self.grid.touched_tiles(&visible).cells() {
            self.emit_scenery_tile(x, y, false)?;
        }

        let Some(sprite) = self.sprites.get_mut(id) else {
            return Ok(id);
        };
        let (xorg, yorg) = sprite.origin();
        let local = visible.offset(xorg - layer.region.x, yorg - layer.region.y);
        let mut request = TileRect::new(
            tile_floor(local.left(), ts),
            tile_floor(local.top(), ts),
            tile_ceil(local.right(), ts),
            tile_ceil(local.bottom(), ts),
        );
        let shift = sprite.expand(&mut request, span, ts);
        let (xorg, yorg) = sprite.origin();

        if let Some(shift) = shift {
            for (tile, x, y) in shift.moved {
                let tile = self.pool.tile_mut(tile);
                tile.x = x;
                tile.y = y;
            }
            for tile in shift.dropped {
                self.pool.mark_dirty(tile);
            }
        }

        let left = layer.region.x - xorg;
        let top = layer.region.y - yorg;
        let alpha = if layer.is_opaque { 255 } else { 127 };
        let mut emitted = false;

        for (x, y) in request.cells() {
            let canvas = Rect::new(left + x * ts, top + y * ts, ts, ts);
            let covering = self.grid.touched_tiles(&canvas);
            let hidden = covering.cells().next().is_some()
                && covering
                    .cells()
                    .all(|(cx, cy)| self.frontiers[self.frontier_index(cx, cy)] == Frontier::Occluded);
            if hidden {
                continue;
            }

            let cached = self.sprites.get(id).map_or(TileId::NIL, |s| s.slot(x, y));
            let tile = if self.pool.is_used(cached) {
                self.pool.touch(cached);
                cached
            } else {
                let tile = self.create_tile(TileOwner::Sprite(id), x, y, alpha)?;
                if let Some(sprite) = self.sprites.get_mut(id) {
                    sprite.set_slot(x, y, tile);
                }
                self.sprite_list.push(tile);
                tile
            };

            if self.pool.tile(tile).alpha() != 0 {
                if !emitted {
                    self.display.push(DisplayItem::EndLayer);
                    emitted = true;
                }
                self.display.push(DisplayItem::Composite(tile));
            }
        }

        if emitted {
            self.display.push(DisplayItem::BeginLayer {
                origin: (left - viewport.x, top - viewport.y),
                clip: visible.offset(-viewport.x, -viewport.y),
                opacity: layer.opacity,
                blend: layer.blend,
            });
        }

        if layer.occludes() {
            for (x, y) in self.grid.occluded_tiles(&visible).cells() {
                let index = self.frontier_index(x, y);
                self.frontiers[index] = Frontier::Occluded;
            }
        }
        Ok(id)
    }

    /// Finish the frame: render every queued tile
    pub fn end_frame(&mut self) {
        if !self.valid || !self.in_frame {
            return;
        }
        self.in_frame = false;
        self.guard(|cache| cache.finish_frame());
    }

    fn finish_frame(&mut self) -> Result<(), TileCacheError> {
        // Scenery with no opaque backdrop is still pending.
        for (x, y) in self.grid.bounds().cells() {
            self.emit_scenery_tile(x, y, false)?;
        }
        self.frontiers.clear();

        self.compositor.begin_tiling(self.config.tile_size)?;
        let sprite_tiles = self.render_sprite_batches()?;
        let scenery_tiles = self.render_scenery_batch()?;
        self.compositor.end_tiling()?;

        self.layer_count = self.scenery.len();
        self.clean = false;

        let pool = self.pool.stats();
        self.stats = FrameStats {
            sprite_tiles,
            scenery_tiles,
            active_tiles: pool.active,
            instructions: self.display.len(),
            cache_bytes: pool.bytes,
            tile_count: pool.used,
            sprite_count: self.sprites.len(),
            scenery_layers: self.layer_count,
        };
        tracing::debug!(
            "Frame: {} sprite + {} scenery tiles rendered, {} reused, {} instructions, {} tiles / {} bytes cached",
            sprite_tiles,
            scenery_tiles,
            self.stats.active_tiles,
            self.stats.instructions,
            self.stats.tile_count,
            self.stats.cache_bytes
        );
        Ok(())
    }

    /// Allocate a buffer covering `rects` and the mask of their union
    fn batch_buffer(rects: &[Rect]) -> Result<(Rect, Pixmap, tiny_skia::Mask), TileCacheError> {
        let bounds = rects.iter().fold(Rect::default(), |acc, r| acc.union(r));
        let pixmap = Pixmap::new(bounds.width as u32, bounds.height as u32)
            .ok_or(TileCacheError::OutOfMemory("render buffer"))?;
        let local: Vec<Rect> = rects.iter().map(|r| r.offset(-bounds.x, -bounds.y)).collect();
        let mask = mask_from_rects(pixmap.width(), pixmap.height(), &local)
            .ok_or(TileCacheError::OutOfMemory("clip mask"))?;
        Ok((bounds, pixmap, mask))
    }

    /// One renderer call per sprite covering all of its new tiles
    fn render_sprite_batches(&mut self) -> Result<usize, TileCacheError> {
        let ts = self.config.tile_size as i32;
        let mut queued: Vec<(SpriteId, TileId)> = std::mem::take(&mut self.sprite_list)
            .into_iter()
            .filter(|&t| self.pool.is_used(t))
            .filter_map(|t| match self.pool.tile(t).owner() {
                TileOwner::Sprite(sprite) => Some((sprite, t)),
                _ => None,
            })
            .collect();
        queued.sort_by_key(|&(sprite, _)| sprite);

        let mut rendered = 0;
        for group in queued.chunk_by(|a, b| a.0 == b.0) {
            let sprite_id = group[0].0;
            let Some(sprite) = self.sprites.get(sprite_id) else {
                continue;
            };
            let (xorg, yorg) = sprite.origin();
            let renderer = sprite.renderer();

            let rects: Vec<Rect> = group
                .iter()
                .map(|&(_, t)| {
                    let (x, y) = self.pool.tile(t).position();
                    Rect::new(x * ts - xorg, y * ts - yorg, ts, ts)
                })
                .collect();
            let (bounds, mut pixmap, mask) = Self::batch_buffer(&rects)?;
            {
                let mut ctx = RenderContext::new(pixmap.as_mut(), (bounds.x, bounds.y), Some(&mask));
                renderer.render(&mut ctx, bounds)?;
            }

            for (&(_, tile), rect) in group.iter().zip(&rects) {
                self.fill_tile(tile, &pixmap, rect.x - bounds.x, rect.y - bounds.y)?;
                rendered += 1;
            }
        }
        Ok(rendered)
    }

    /// Render every queued scenery tile in one buffer, layer by layer from
    /// the bottom up, then hand the tiles to their cells
    fn render_scenery_batch(&mut self) -> Result<usize, TileCacheError> {
        let ts = self.config.tile_size as i32;
        let viewport = self.grid.viewport();
        let mut tiles: Vec<(TileId, u32, u32)> = std::mem::take(&mut self.scenery_list)
            .into_iter()
            .filter(|&t| self.pool.is_used(t))
            .filter_map(|t| match self.pool.tile(t).owner() {
                TileOwner::Scenery { first, last } => Some((t, first, last)),
                _ => None,
            })
            .collect();

        if !tiles.is_empty() {
            let rects: Vec<Rect> = tiles
                .iter()
                .map(|&(t, _, _)| {
                    let (x, y) = self.pool.tile(t).position();
                    Rect::new(viewport.x + x * ts, viewport.y + y * ts, ts, ts)
                })
                .collect();
            let (bounds, mut pixmap, mask) = Self::batch_buffer(&rects)?;

            // Activation order: increasing last layer. Emission order:
            // decreasing first layer.
            let mut by_last: Vec<usize> = (0..tiles.len()).collect();
            by_last.sort_by_key(|&i| tiles[i].2);
            let mut by_first: Vec<usize> = (0..tiles.len()).collect();
            by_first.sort_by_key(|&i| std::cmp::Reverse(tiles[i].1));

            // 0 untouched, 2 being drawn, 1 emitted
            let mut activity = vec![0u8; tiles.len()];
            let mut input = tiles.len();
            let mut output = 0;
            let mut layer = tiles[by_last[input - 1]].2;

            while input > 0 {
                let mut next_layer = 0;
                while input > 0 {
                    let i = by_last[input - 1];
                    if tiles[i].2 != layer {
                        next_layer = tiles[i].2;
                        break;
                    }
                    if activity[i] < 2 {
                        erase(&mut pixmap, rects[i].offset(-bounds.x, -bounds.y));
                    }
                    activity[i] = 2;
                    input -= 1;
                }

                while layer > next_layer {
                    if output < tiles.len() {
                        if let Some(renderer) = self.scenery.get(layer as usize - 1).cloned() {
                            let mut ctx = RenderContext::new(pixmap.as_mut(), (bounds.x, bounds.y), Some(&mask));
                            renderer.render(&mut ctx, bounds)?;
                        }
                    }
                    while output < tiles.len() && tiles[by_first[output]].1 == layer {
                        let i = by_first[output];
                        let rect = rects[i];
                        self.fill_tile(tiles[i].0, &pixmap, rect.x - bounds.x, rect.y - bounds.y)?;
                        activity[i] = 1;
                        output += 1;
                    }
                    layer -= 1;
                }
            }
        }

        // Last frame's spans now refer to this frame's ids.
        let map = &self.scenery_map;
        let remap = |id: u32| map.get(id as usize).copied().unwrap_or(0);
        let cached: Vec<TileId> = self.grid.cells().flat_map(|c| c.iter().copied()).collect();
        for id in cached {
            let tile = self.pool.tile_mut(id);
            if let TileOwner::Scenery { first, last } = tile.owner {
                tile.owner = TileOwner::Scenery { first: remap(first), last: remap(last) };
            }
        }

        tiles.sort_by_key(|&(t, _, _)| {
            let (x, y) = self.pool.tile(t).position();
            (y, x)
        });
        let rendered = tiles.len();
        for (id, _, _) in tiles {
            if !self.pool.is_used(id) {
                continue;
            }
            let (x, y) = self.pool.tile(id).position();
            self.grid.cell_mut(x, y).push(id);
        }
        Ok(rendered)
    }

    /// Draw the last frame into `surface`, limited to `dirty` (surface
    /// coordinates, origin at the viewport's top-left)
    pub fn composite(&mut self, surface: &mut dyn Surface, dirty: Rect) -> Result<(), TileCacheError> {
        if !self.valid {
            return Err(TileCacheError::Invalid);
        }
        let ts = self.config.tile_size as i32;
        self.compositor.begin_frame(surface, dirty)?;
        self.display.play(&self.pool, ts, self.compositor.as_mut())?;
        self.compositor.end_frame(surface)?;
        Ok(())
    }

    /// Render the last frame's `area` (surface coordinates) off-screen
    pub fn snapshot(&mut self, area: Rect) -> Result<Pixmap, TileCacheError> {
        if !self.valid {
            return Err(TileCacheError::Invalid);
        }
        let ts = self.config.tile_size as i32;
        self.compositor.begin_snapshot(area)?;
        self.display.play(&self.pool, ts, self.compositor.as_mut())?;
        Ok(self.compositor.end_snapshot()?)
    }
}

/// Clear a rect of the buffer to transparent
fn erase(pixmap: &mut Pixmap, rect: Rect) {
    let bounds = Rect::new(0, 0, pixmap.width() as i32, pixmap.height() as i32);
    let rect = rect.intersect(&bounds);
    if rect.is_empty() {
        return;
    }
    let stride = pixmap.width() as usize * 4;
    let data = pixmap.data_mut();
    for y in rect.top()..rect.bottom() {
        let start = y as usize * stride + rect.x as usize * 4;
        data[start..start + rect.width as usize * 4].fill(0);
    }
}
