//! Frame scenarios for fos-tilecache
//!
//! Drives the cache through whole frames and checks what gets rendered,
//! reused and composited.

use std::cell::Cell;
use std::rc::Rc;

use fos_tilecache::*;
use tiny_skia::{Color, Pixmap};

// ============================================================================
// HELPERS
// ============================================================================

/// Renderer that counts its calls and fills with one color
fn counting(region: Rect, color: Color) -> (Rc<dyn LayerRenderer>, Rc<Cell<usize>>) {
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    let renderer: Rc<dyn LayerRenderer> =
        Rc::new(move |ctx: &mut RenderContext<'_>, rect: Rect| -> Result<(), RenderError> {
            counter.set(counter.get() + 1);
            ctx.fill_rect(region.intersect(&rect), color);
            Ok(())
        });
    (renderer, calls)
}

fn solid(region: Rect, color: Color) -> Layer {
    Layer::new(region, Rc::new(SolidRenderer::new(region, color)))
}

fn red() -> Color {
    Color::from_rgba8(255, 0, 0, 255)
}

fn blue() -> Color {
    Color::from_rgba8(0, 0, 255, 255)
}

/// Vertical 8px bands alternating red and blue, shifted right by `offset`
fn band_color(x: i32, offset: i32) -> Color {
    if (x - offset).div_euclid(8) % 2 == 0 { red() } else { blue() }
}

fn banded(offset: Rc<Cell<i32>>) -> Rc<dyn LayerRenderer> {
    Rc::new(move |ctx: &mut RenderContext<'_>, rect: Rect| -> Result<(), RenderError> {
        let offset = offset.get();
        let first = (rect.left() - offset).div_euclid(8);
        let last = (rect.right() - offset).div_euclid(8);
        for band in first..=last {
            let color = if band % 2 == 0 { red() } else { blue() };
            ctx.fill_rect(Rect::new(band * 8 + offset, rect.y, 8, rect.height), color);
        }
        Ok(())
    })
}

/// Renderer producing tiles that are never constant
fn striped(region: Rect) -> Rc<dyn LayerRenderer> {
    Rc::new(move |ctx: &mut RenderContext<'_>, rect: Rect| -> Result<(), RenderError> {
        let area = region.intersect(&rect);
        ctx.fill_rect(area, Color::WHITE);
        let mut x = area.left() - area.left().rem_euclid(4);
        while x < area.right() {
            ctx.fill_rect(Rect::new(x, area.y, 1, area.height).intersect(&area), Color::BLACK);
            x += 4;
        }
        Ok(())
    })
}

fn cache(tile_size: u32, width: i32, height: i32) -> TileCache {
    let mut cache = TileCache::new(TileCacheConfig::new().with_tile_size(tile_size));
    cache.set_viewport(Rect::new(0, 0, width, height));
    cache
}

// ============================================================================
// SCENERY
// ============================================================================

#[test]
fn test_full_grid_then_nothing_new() {
    let mut cache = cache(32, 128, 128);
    let mut layer = solid(Rect::new(0, 0, 128, 128), Color::WHITE).opaque(true);

    cache.begin_frame();
    cache.render_scenery(&mut layer);
    cache.end_frame();
    assert_eq!(cache.last_frame_stats().scenery_tiles, 16);
    assert_eq!(cache.pool_stats().used, 16);
    for y in 0..4 {
        for x in 0..4 {
            let tiles = cache.cell_tiles(x, y);
            assert_eq!(tiles.len(), 1, "cell ({x}, {y})");
            assert_eq!(tiles[0].alpha, 255, "cell ({x}, {y})");
            assert_eq!(cache.tile_info(tiles[0].id), Some(tiles[0]));
        }
    }

    cache.begin_frame();
    cache.render_scenery(&mut layer);
    cache.end_frame();
    assert_eq!(cache.last_frame_stats().scenery_tiles, 0);
    assert_eq!(cache.pool_stats().used, 16);
    assert!(cache.audit().is_ok());
}

#[test]
fn test_opaque_layer_hides_lower_layer() {
    let mut cache = cache(32, 128, 128);
    let region = Rect::new(0, 0, 128, 128);
    let (lower, lower_calls) = counting(region, blue());
    let mut top = solid(region, red()).opaque(true);
    let mut below = Layer::new(region, lower);

    for _ in 0..3 {
        cache.begin_frame();
        cache.render_scenery(&mut top);
        cache.render_scenery(&mut below);
        cache.end_frame();
    }
    assert_eq!(lower_calls.get(), 0);

    let mut surface = Pixmap::new(128, 128).unwrap();
    cache.composite(&mut surface, Rect::new(0, 0, 128, 128)).unwrap();
    assert_eq!(surface.pixel(64, 64).unwrap().red(), 255);
}

#[test]
fn test_partial_occlusion_still_draws_lower_layer() {
    let mut cache = cache(32, 128, 128);
    let (lower, lower_calls) = counting(Rect::new(0, 0, 128, 128), blue());
    let mut top = solid(Rect::new(0, 0, 64, 128), red()).opaque(true);
    let mut below = Layer::new(Rect::new(0, 0, 128, 128), lower).opaque(true);

    cache.begin_frame();
    cache.render_scenery(&mut top);
    cache.render_scenery(&mut below);
    cache.end_frame();
    assert_eq!(lower_calls.get(), 1);

    let snapshot = cache.snapshot(Rect::new(0, 0, 128, 128)).unwrap();
    assert_eq!(snapshot.pixel(10, 10).unwrap().red(), 255);
    assert_eq!(snapshot.pixel(100, 10).unwrap().blue(), 255);
}

#[test]
fn test_update_scenery_round_trip() {
    let mut cache = cache(32, 128, 128);
    let left = Rect::new(0, 0, 64, 128);
    let right = Rect::new(64, 0, 64, 128);
    let (left_renderer, left_calls) = counting(left, red());
    let (right_renderer, right_calls) = counting(right, blue());
    let mut a = Layer::new(left, left_renderer).opaque(true);
    let mut b = Layer::new(right, right_renderer).opaque(true);

    cache.begin_frame();
    cache.render_scenery(&mut a);
    cache.render_scenery(&mut b);
    cache.end_frame();
    assert_eq!((left_calls.get(), right_calls.get()), (1, 1));

    cache.update_scenery(a.id, left);
    // Only the left half is dirty.
    assert_eq!(cache.pool_stats().dirty, 8);
    assert_eq!(cache.cell_tiles(3, 0).len(), 1);

    cache.begin_frame();
    cache.render_scenery(&mut a);
    cache.render_scenery(&mut b);
    cache.end_frame();
    assert_eq!((left_calls.get(), right_calls.get()), (2, 1));
    assert_eq!(cache.last_frame_stats().scenery_tiles, 8);
    assert!(cache.audit().is_ok());
}

#[test]
fn test_layer_removed_between_frames() {
    let mut cache = cache(32, 64, 64);
    let region = Rect::new(0, 0, 64, 64);
    let mut top = solid(region, Color::from_rgba8(0, 128, 0, 128));
    let mut bottom = solid(region, Color::WHITE).opaque(true);

    cache.begin_frame();
    cache.render_scenery(&mut top);
    cache.render_scenery(&mut bottom);
    cache.end_frame();

    cache.remove_scenery(top.id, region);
    cache.begin_frame();
    cache.render_scenery(&mut bottom);
    cache.end_frame();

    assert_eq!(bottom.id, 1);
    let snapshot = cache.snapshot(region).unwrap();
    let pixel = snapshot.pixel(5, 5).unwrap();
    assert_eq!((pixel.red(), pixel.green(), pixel.blue()), (255, 255, 255));
    assert!(cache.audit().is_ok());
}

#[test]
fn test_reshape_scenery_dirties_covering_spans() {
    let mut cache = cache(32, 128, 128);
    let mut top = solid(Rect::new(96, 0, 32, 128), red()).opaque(true);
    let mut panel = solid(Rect::new(0, 0, 64, 128), Color::from_rgba8(0, 0, 128, 128));
    let mut backdrop = solid(Rect::new(0, 0, 128, 128), Color::WHITE).opaque(true);

    let frame = |cache: &mut TileCache, top: &mut Layer, panel: &mut Layer, backdrop: &mut Layer| {
        cache.begin_frame();
        cache.render_scenery(top);
        cache.render_scenery(panel);
        cache.render_scenery(backdrop);
        cache.end_frame();
    };
    frame(&mut cache, &mut top, &mut panel, &mut backdrop);
    assert_eq!((top.id, panel.id, backdrop.id), (1, 2, 3));
    assert_eq!(cache.cell_tiles(0, 0)[0].owner, TileOwner::Scenery { first: 2, last: 3 });
    assert_eq!(cache.cell_tiles(2, 0)[0].owner, TileOwner::Scenery { first: 3, last: 3 });
    assert_eq!(cache.cell_tiles(3, 0)[0].owner, TileOwner::Scenery { first: 1, last: 1 });

    // Old region: top half of the panel. New region: bottom half.
    cache.reshape_scenery(panel.id, Rect::new(0, 0, 64, 64), Rect::new(0, 64, 64, 64));
    assert_eq!(cache.pool_stats().dirty, 8);
    for y in 0..4 {
        assert!(cache.cell_tiles(0, y).is_empty());
        assert!(cache.cell_tiles(1, y).is_empty());
        assert_eq!(cache.cell_tiles(2, y).len(), 1);
        assert_eq!(cache.cell_tiles(3, y).len(), 1);
    }

    frame(&mut cache, &mut top, &mut panel, &mut backdrop);
    assert_eq!(cache.last_frame_stats().scenery_tiles, 8);
    assert!(cache.audit().is_ok());
}

// ============================================================================
// SPRITES
// ============================================================================

#[test]
fn test_sprite_scroll_far_stays_in_window() {
    let mut cache = cache(32, 128, 128);
    let mut sprite = solid(Rect::new(0, 0, 64, 64), red());

    cache.begin_frame();
    let id = cache.render_sprite(&mut sprite);
    cache.end_frame();
    assert_ne!(id, 0);
    let window = cache.sprite(id).unwrap().window();
    assert_eq!((window.width(), window.height()), (2, 2));

    cache.scroll_sprite(id, 10000, 0);
    cache.begin_frame();
    cache.render_sprite(&mut sprite);
    cache.end_frame();

    assert!(cache.is_valid());
    let window = cache.sprite(id).unwrap().window();
    assert!(window.left >= 0 && window.right <= 256);
    assert!(cache.audit().is_ok());
}

#[test]
fn test_sliding_window_keeps_pattern() {
    let mut cache = cache(16, 64, 64);
    let offset = Rc::new(Cell::new(0));
    let region = Rect::new(0, 0, 64, 64);
    let mut sprite = Layer::new(region, banded(Rc::clone(&offset)));

    let check = |cache: &mut TileCache, sprite: &mut Layer| {
        cache.begin_frame();
        cache.render_sprite(sprite);
        cache.end_frame();
        assert!(cache.is_valid());

        let snapshot = cache.snapshot(region).unwrap();
        for x in 0..64 {
            let expected = band_color(x, offset.get()).to_color_u8();
            let pixel = snapshot.pixel(x as u32, 7).unwrap();
            assert_eq!(
                (pixel.red(), pixel.blue()),
                (expected.red(), expected.blue()),
                "x = {x}, offset = {}",
                offset.get()
            );
        }
        assert!(cache.audit().is_ok());
    };

    check(&mut cache, &mut sprite);
    for dx in [16, 5, 10000, -3, -20000, 8] {
        let id = sprite.id;
        cache.scroll_sprite(id, dx, 0);
        offset.set(offset.get() + dx);
        check(&mut cache, &mut sprite);
    }
}

#[test]
fn test_sprite_reused_and_updated() {
    let mut cache = cache(32, 128, 128);
    let (renderer, calls) = counting(Rect::new(0, 0, 128, 128), red());
    let mut sprite = Layer::new(Rect::new(0, 0, 128, 128), renderer);

    cache.begin_frame();
    let id = cache.render_sprite(&mut sprite);
    cache.end_frame();
    assert_eq!(cache.last_frame_stats().sprite_tiles, 16);

    cache.begin_frame();
    cache.render_sprite(&mut sprite);
    cache.end_frame();
    assert_eq!(calls.get(), 1);

    cache.update_sprite(id, Rect::new(0, 0, 10, 10));
    cache.begin_frame();
    cache.render_sprite(&mut sprite);
    cache.end_frame();
    assert_eq!(calls.get(), 2);
    assert_eq!(cache.last_frame_stats().sprite_tiles, 1);
}

#[test]
fn test_sprite_under_opaque_scenery_is_skipped() {
    let mut cache = cache(32, 128, 128);
    let (renderer, calls) = counting(Rect::new(0, 0, 128, 128), blue());
    let mut cover = solid(Rect::new(0, 0, 128, 128), red()).opaque(true);
    let mut sprite = Layer::new(Rect::new(0, 0, 128, 128), renderer);

    cache.begin_frame();
    cache.render_scenery(&mut cover);
    cache.render_sprite(&mut sprite);
    cache.end_frame();

    assert_eq!(calls.get(), 0);
    assert_eq!(cache.last_frame_stats().sprite_tiles, 0);
}

#[test]
fn test_translucent_sprite_over_scenery() {
    let mut cache = cache(32, 64, 64);
    let region = Rect::new(0, 0, 64, 64);
    let mut sprite = solid(Rect::new(0, 0, 32, 32), Color::WHITE).with_opacity(128);
    let mut backdrop = solid(region, Color::BLACK).opaque(true);

    cache.begin_frame();
    cache.render_sprite(&mut sprite);
    cache.render_scenery(&mut backdrop);
    cache.end_frame();

    let snapshot = cache.snapshot(region).unwrap();
    let grey = snapshot.pixel(10, 10).unwrap().red();
    assert!(grey > 100 && grey < 160, "grey {grey}");
    assert_eq!(snapshot.pixel(40, 40).unwrap().red(), 0);
    assert_eq!(snapshot.pixel(40, 40).unwrap().alpha(), 255);
}

#[test]
fn test_remove_sprite_frees_tiles() {
    let mut cache = cache(32, 64, 64);
    let mut sprite = solid(Rect::new(0, 0, 64, 64), red());

    cache.begin_frame();
    let id = cache.render_sprite(&mut sprite);
    cache.end_frame();
    assert_eq!(cache.pool_stats().used, 4);

    cache.remove_sprite(id);
    assert!(cache.sprite(id).is_none());
    assert_eq!(cache.pool_stats().dirty, 4);

    cache.begin_frame();
    cache.end_frame();
    assert_eq!(cache.pool_stats().used, 0);
    assert_eq!(cache.pool_stats().empty, 4);
    assert!(cache.audit().is_ok());
}

// ============================================================================
// LIFECYCLE & BUDGET
// ============================================================================

#[test]
fn test_flush_is_idempotent() {
    let mut cache = cache(32, 128, 128);
    let mut layer = Layer::new(Rect::new(0, 0, 128, 128), striped(Rect::new(0, 0, 128, 128)));

    cache.begin_frame();
    cache.render_scenery(&mut layer);
    cache.end_frame();
    assert!(cache.cache_size() > 0);

    cache.flush();
    let once = cache.pool_stats();
    cache.flush();
    assert_eq!(cache.pool_stats(), once);
    assert_eq!(cache.cache_size(), 0);
    assert!(cache.is_clean());
    assert!(cache.is_valid());

    // The stale id is reset by the clean cache.
    cache.begin_frame();
    cache.render_scenery(&mut layer);
    cache.end_frame();
    assert_eq!(layer.id, 1);
    assert_eq!(cache.last_frame_stats().scenery_tiles, 16);
}

#[test]
fn test_budget_is_respected_across_frames() {
    let tile_bytes = 16 * 16 * 4;
    let mut cache = TileCache::new(
        TileCacheConfig::new()
            .with_tile_size(16)
            .with_cache_limit(8 * tile_bytes),
    );
    cache.set_viewport(Rect::new(0, 0, 64, 64));

    for region in [
        Rect::new(0, 0, 32, 64),
        Rect::new(32, 0, 32, 64),
        Rect::new(0, 0, 64, 32),
    ] {
        let mut layer = Layer::new(region, striped(region));
        cache.begin_frame();
        cache.render_scenery(&mut layer);
        cache.end_frame();

        assert!(cache.is_valid(), "{:?}", cache.last_error());
        assert!(cache.cache_size() <= cache.cache_limit());
        assert!(cache.audit().is_ok());
    }
}

#[test]
fn test_compact_releases_inactive_tiles() {
    let mut cache = cache(32, 128, 128);
    let left = Rect::new(0, 0, 64, 128);
    let right = Rect::new(64, 0, 64, 128);
    let mut a = Layer::new(left, striped(left)).opaque(true);
    let mut b = Layer::new(right, striped(right)).opaque(true);

    cache.begin_frame();
    cache.render_scenery(&mut a);
    cache.render_scenery(&mut b);
    cache.end_frame();
    assert_eq!(cache.cache_size(), 16 * 32 * 32 * 4);

    // `b` is gone; its tiles stay cached but inactive.
    cache.begin_frame();
    cache.render_scenery(&mut a);
    cache.end_frame();
    assert_eq!(cache.pool_stats().used, 16);

    cache.compact();
    assert_eq!(cache.pool_stats().used, 8);
    assert_eq!(cache.cache_size(), 8 * 32 * 32 * 4);
    assert!(cache.cell_tiles(3, 0).is_empty());
    assert!(cache.audit().is_ok());

    cache.begin_frame();
    cache.render_scenery(&mut a);
    cache.end_frame();
    assert_eq!(cache.last_frame_stats().scenery_tiles, 0);
    let snapshot = cache.snapshot(Rect::new(0, 0, 128, 128)).unwrap();
    assert_eq!(snapshot.pixel(0, 5).unwrap().alpha(), 255);
    assert_eq!(snapshot.pixel(1, 5).unwrap().red(), 255);
    assert_eq!(snapshot.pixel(100, 5).unwrap().alpha(), 0);
}

#[test]
fn test_lower_cache_limit_flushes_then_holds() {
    let tile_bytes = 32 * 32 * 4;
    let mut cache = cache(32, 128, 128);
    let full = Rect::new(0, 0, 128, 128);
    let mut layer = Layer::new(full, striped(full));

    cache.begin_frame();
    cache.render_scenery(&mut layer);
    cache.end_frame();
    assert_eq!(cache.cache_size(), 16 * tile_bytes);

    // Still above usage: nothing happens.
    cache.set_cache_limit(32 * tile_bytes);
    assert!(!cache.is_clean());
    assert_eq!(cache.cache_size(), 16 * tile_bytes);

    cache.set_cache_limit(8 * tile_bytes);
    assert!(cache.is_clean());
    assert_eq!(cache.cache_size(), 0);
    assert_eq!(cache.cache_limit(), 8 * tile_bytes);

    for region in [Rect::new(0, 0, 64, 128), Rect::new(64, 0, 64, 128)] {
        let mut half = Layer::new(region, striped(region));
        cache.begin_frame();
        cache.render_scenery(&mut half);
        cache.end_frame();

        assert!(cache.is_valid(), "{:?}", cache.last_error());
        assert_eq!(cache.cache_size(), 8 * tile_bytes);
        assert!(cache.audit().is_ok());
    }
}

#[test]
fn test_budget_too_small_invalidates() {
    let mut cache = TileCache::new(
        TileCacheConfig::new()
            .with_tile_size(16)
            .with_cache_limit(2 * 16 * 16 * 4),
    );
    cache.set_viewport(Rect::new(0, 0, 64, 64));
    let region = Rect::new(0, 0, 64, 64);
    let mut layer = Layer::new(region, striped(region));

    cache.begin_frame();
    cache.render_scenery(&mut layer);
    cache.end_frame();

    assert!(!cache.is_valid());
    assert!(matches!(cache.last_error(), Some(TileCacheError::BudgetExhausted { .. })));

    // Invalid caches ignore work until flushed.
    cache.begin_frame();
    assert!(!cache.in_frame());
    cache.flush();
    assert!(cache.is_valid());
}

#[test]
fn test_viewport_grow_keeps_complete_cells() {
    let mut cache = cache(32, 64, 64);
    let region = Rect::new(0, 0, 256, 256);
    let mut layer = solid(region, Color::WHITE).opaque(true);

    cache.begin_frame();
    cache.render_scenery(&mut layer);
    cache.end_frame();

    cache.set_viewport(Rect::new(0, 0, 96, 64));
    cache.begin_frame();
    cache.render_scenery(&mut layer);
    cache.end_frame();
    assert_eq!(cache.last_frame_stats().scenery_tiles, 2);
}

// ============================================================================
// BACKENDS
// ============================================================================

#[test]
fn test_atlas_matches_software() {
    let region = Rect::new(0, 0, 96, 96);
    let offset = Rc::new(Cell::new(3));

    let render = |kind: CompositorKind| {
        let mut cache = TileCache::new(TileCacheConfig::new().with_tile_size(32).with_compositor(kind));
        cache.set_viewport(region);
        let mut backdrop = Layer::new(region, striped(region)).opaque(true);
        let mut sprite = Layer::new(Rect::new(10, 10, 50, 50), banded(Rc::clone(&offset))).with_opacity(200);

        cache.begin_frame();
        cache.render_sprite(&mut sprite);
        cache.render_scenery(&mut backdrop);
        cache.end_frame();

        let mut surface = Pixmap::new(96, 96).unwrap();
        cache.composite(&mut surface, region).unwrap();
        surface
    };

    let software = render(CompositorKind::Software);
    let atlas = render(CompositorKind::Atlas);
    assert_eq!(software.data(), atlas.data());
}

#[test]
fn test_atlas_matches_software_after_scroll() {
    let region = Rect::new(0, 0, 64, 64);

    let render = |kind: CompositorKind| {
        let mut cache = TileCache::new(TileCacheConfig::new().with_tile_size(16).with_compositor(kind));
        cache.set_viewport(region);
        let offset = Rc::new(Cell::new(0));
        let mut sprite = Layer::new(region, banded(Rc::clone(&offset)));
        let mut surface = Pixmap::new(64, 64).unwrap();

        for dx in [0, 16, 5] {
            if dx != 0 {
                cache.scroll_sprite(sprite.id, dx, 0);
                offset.set(offset.get() + dx);
            }
            cache.begin_frame();
            cache.render_sprite(&mut sprite);
            cache.end_frame();
        }
        cache.composite(&mut surface, region).unwrap();
        surface
    };

    let software = render(CompositorKind::Software);
    let atlas = render(CompositorKind::Atlas);
    // A tile hanging off the left edge must not bleed past its right edge.
    let expected = band_color(5, 21).to_color_u8();
    assert_eq!(software.pixel(5, 7).unwrap().red(), expected.red());
    assert_eq!(software.data(), atlas.data());
}

#[test]
fn test_noop_blend_hides_sprite() {
    let mut cache = cache(32, 64, 64);
    let region = Rect::new(0, 0, 64, 64);
    let mut sprite = solid(region, red()).with_blend(BlendMode::NoOp);

    cache.begin_frame();
    cache.render_sprite(&mut sprite);
    cache.end_frame();

    let snapshot = cache.snapshot(region).unwrap();
    assert_eq!(snapshot.pixel(5, 5).unwrap().alpha(), 0);
}

#[test]
fn test_deactivated_cache_cannot_composite() {
    let mut cache = cache(32, 64, 64);
    cache.deactivate();
    let mut surface = Pixmap::new(64, 64).unwrap();
    assert!(cache.composite(&mut surface, Rect::new(0, 0, 64, 64)).is_err());

    cache.activate();
    assert!(cache.composite(&mut surface, Rect::new(0, 0, 64, 64)).is_ok());
}
