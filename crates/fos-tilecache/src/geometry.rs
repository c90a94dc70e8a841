//! Geometry
//!
//! Integer pixel rectangles and tile-space arithmetic.

/// Pixel rectangle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Build from edges, collapsing inverted edges to an empty rect
    pub fn from_ltrb(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(left, top, (right - left).max(0), (bottom - top).max(0))
    }

    pub fn left(&self) -> i32 { self.x }
    pub fn top(&self) -> i32 { self.y }
    pub fn right(&self) -> i32 { self.x + self.width }
    pub fn bottom(&self) -> i32 { self.y + self.height }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Intersection; empty rects intersect to an empty rect at the origin
    pub fn intersect(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 > x && y2 > y {
            Rect::from_ltrb(x, y, x2, y2)
        } else {
            Rect::default()
        }
    }

    /// Union with another rect (empty rects are ignored)
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }

        Rect::from_ltrb(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    pub fn offset(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    pub(crate) fn to_skia(self) -> Option<tiny_skia::Rect> {
        tiny_skia::Rect::from_xywh(self.x as f32, self.y as f32, self.width as f32, self.height as f32)
    }
}

/// Rectangle of tile indices, half-open on the right and bottom
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl TileRect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> i32 { (self.right - self.left).max(0) }
    pub fn height(&self) -> i32 { (self.bottom - self.top).max(0) }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    pub fn intersect(&self, other: &TileRect) -> TileRect {
        TileRect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        )
    }

    /// Grow to include the tile at (x, y)
    pub fn include(&mut self, x: i32, y: i32) {
        if self.is_empty() {
            *self = TileRect::new(x, y, x + 1, y + 1);
            return;
        }
        self.left = self.left.min(x);
        self.top = self.top.min(y);
        self.right = self.right.max(x + 1);
        self.bottom = self.bottom.max(y + 1);
    }

    pub fn offset(&self, dx: i32, dy: i32) -> TileRect {
        TileRect::new(self.left + dx, self.top + dy, self.right + dx, self.bottom + dy)
    }

    /// Iterate the cells row by row
    pub fn cells(&self) -> impl Iterator<Item = (i32, i32)> + use<> {
        let (left, right) = (self.left, self.right);
        (self.top..self.bottom).flat_map(move |y| (left..right).map(move |x| (x, y)))
    }
}

/// Index of the tile containing pixel `z`
pub fn tile_floor(z: i32, tile_size: i32) -> i32 {
    z.div_euclid(tile_size)
}

/// Index of the first tile starting at or after pixel `z`
pub fn tile_ceil(z: i32, tile_size: i32) -> i32 {
    -((-z).div_euclid(tile_size))
}
