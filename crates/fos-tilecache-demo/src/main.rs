//! fOS Tile Cache Demo
//!
//! Renders a synthetic scene for a number of frames while scrolling a sprite,
//! logs per-frame cache statistics and optionally saves the last frame.
//!
//! ```text
//! fos-tilecache-demo [--tile-size N] [--cache-limit BYTES] [--backend software|atlas]
//!                    [--frames N] [--output frame.png]
//! ```

use std::cell::Cell;
use std::rc::Rc;

use anyhow::{Context, bail};
use fos_tilecache::{
    BlendMode, CompositorKind, Layer, LayerRenderer, Rect, RenderContext, RenderError,
    SolidRenderer, TileCache, TileCacheConfig,
};
use tiny_skia::{Color, Pixmap};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const WIDTH: i32 = 640;
const HEIGHT: i32 = 480;

#[derive(Debug)]
struct Options {
    tile_size: u32,
    cache_limit: usize,
    backend: CompositorKind,
    frames: usize,
    output: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        let config = TileCacheConfig::default();
        Self {
            tile_size: config.tile_size,
            cache_limit: config.cache_limit,
            backend: config.compositor,
            frames: 8,
            output: None,
        }
    }
}

fn parse_args() -> anyhow::Result<Options> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = || args.next().with_context(|| format!("missing value for {arg}"));
        match arg.as_str() {
            "--tile-size" => options.tile_size = value()?.parse().context("invalid tile size")?,
            "--cache-limit" => options.cache_limit = value()?.parse().context("invalid cache limit")?,
            "--frames" => options.frames = value()?.parse().context("invalid frame count")?,
            "--output" => options.output = Some(value()?),
            "--backend" => {
                options.backend = match value()?.as_str() {
                    "software" => CompositorKind::Software,
                    "atlas" => CompositorKind::Atlas,
                    other => bail!("unknown backend: {other}"),
                }
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(options)
}

/// Checkerboard with `cell` pixel squares
fn checkerboard(region: Rect, cell: i32, a: Color, b: Color) -> Rc<dyn LayerRenderer> {
    Rc::new(move |ctx: &mut RenderContext<'_>, rect: Rect| -> Result<(), RenderError> {
        let area = region.intersect(&rect);
        if area.is_empty() {
            return Ok(());
        }
        ctx.fill_rect(area, a);
        let left = area.left().div_euclid(cell);
        let top = area.top().div_euclid(cell);
        for y in top..=area.bottom().div_euclid(cell) {
            for x in left..=area.right().div_euclid(cell) {
                if (x + y) % 2 != 0 {
                    ctx.fill_rect(Rect::new(x * cell, y * cell, cell, cell).intersect(&area), b);
                }
            }
        }
        Ok(())
    })
}

/// Horizontal rules, like lines of text in a document scrolled by `scroll`
fn ruled(width: i32, scroll: Rc<Cell<i32>>) -> Rc<dyn LayerRenderer> {
    Rc::new(move |ctx: &mut RenderContext<'_>, rect: Rect| -> Result<(), RenderError> {
        let scroll = scroll.get();
        ctx.fill_rect(rect, Color::WHITE);
        let ink = Color::from_rgba8(40, 40, 60, 255);
        let first = (rect.top() - scroll).div_euclid(20);
        let last = (rect.bottom() - scroll).div_euclid(20);
        for line in first..=last {
            let length = width - 40 - (line.rem_euclid(5) * 37);
            let y = line * 20 + 6 + scroll;
            ctx.fill_rect(Rect::new(20, y, length, 8).intersect(&rect), ink);
        }
        Ok(())
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let options = parse_args()?;
    tracing::info!("Starting tile cache demo: {:?}", options);

    let config = TileCacheConfig::new()
        .with_tile_size(options.tile_size)
        .with_cache_limit(options.cache_limit)
        .with_compositor(options.backend);
    let mut cache = TileCache::new(config);
    let viewport = Rect::new(0, 0, WIDTH, HEIGHT);
    cache.set_viewport(viewport);

    let mut background = Layer::new(
        viewport,
        checkerboard(
            viewport,
            48,
            Color::from_rgba8(220, 220, 230, 255),
            Color::from_rgba8(190, 190, 205, 255),
        ),
    )
    .opaque(true);

    let panel_region = Rect::new(360, 40, 240, 160);
    let mut panel = Layer::new(
        panel_region,
        Rc::new(SolidRenderer::new(panel_region, Color::from_rgba8(0, 90, 160, 160))),
    );

    let page = Rect::new(40, 120, 300, 320);
    let scroll = Rc::new(Cell::new(0));
    let mut document = Layer::new(page, ruled(page.width, Rc::clone(&scroll))).opaque(true);

    let badge_region = Rect::new(500, 360, 96, 96);
    let mut badge = Layer::new(
        badge_region,
        Rc::new(SolidRenderer::new(
            Rect::new(0, 0, 96, 96),
            Color::from_rgba8(220, 60, 40, 255),
        )),
    )
    .with_opacity(200)
    .with_blend(BlendMode::Multiply);

    let mut surface = Pixmap::new(WIDTH as u32, HEIGHT as u32).context("cannot allocate surface")?;

    for frame in 0..options.frames {
        if frame > 0 {
            cache.scroll_sprite(document.id, 0, -24);
            scroll.set(scroll.get() - 24);
            cache.update_scenery(panel.id, panel_region);
        }

        cache.begin_frame();
        cache.render_sprite(&mut badge);
        cache.render_scenery(&mut panel);
        cache.render_sprite(&mut document);
        cache.render_scenery(&mut background);
        cache.end_frame();

        if !cache.is_valid() {
            let reason = cache
                .last_error()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".to_string());
            bail!("tile cache failed in frame {frame}: {reason}");
        }

        cache.composite(&mut surface, viewport)?;
        let stats = cache.last_frame_stats();
        tracing::info!(
            "Frame {}: {} sprite / {} scenery tiles rendered, {} reused, {} KiB cached",
            frame,
            stats.sprite_tiles,
            stats.scenery_tiles,
            stats.active_tiles,
            stats.cache_bytes / 1024
        );
    }

    cache.audit().context("tile cache audit failed")?;

    if let Some(path) = &options.output {
        surface.save_png(path).with_context(|| format!("cannot write {path}"))?;
        tracing::info!("Saved last frame to {}", path);
    }

    Ok(())
}
