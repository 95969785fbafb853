//! Tiled rasterization of kept-set coverage into per-pixel OOB statistics.

use rayon::prelude::*;
use tracing::{debug, info, instrument};

use crate::domain::{Bounds, SetId};
use crate::EnsembleError;

/// Value written to pixels outside the valid area or not covered by any set.
pub const NODATA: f32 = -9999.0;

/// North-up affine geotransform (no rotation terms).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    /// x of the upper-left corner of the upper-left pixel.
    pub origin_x: f64,
    /// Pixel width, positive.
    pub pixel_width: f64,
    /// y of the upper-left corner of the upper-left pixel.
    pub origin_y: f64,
    /// Pixel height, negative for north-up rasters.
    pub pixel_height: f64,
}

/// Size, placement, and projection of a raster grid.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterExtent {
    width: usize,
    height: usize,
    transform: GeoTransform,
    projection: Option<String>,
}

impl RasterExtent {
    /// Describe a raster grid.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::InvalidRasterGrid`] for an empty grid or a
    /// transform that is not north-up.
    pub fn new(
        width: usize,
        height: usize,
        transform: GeoTransform,
        projection: Option<String>,
    ) -> Result<Self, EnsembleError> {
        let GeoTransform {
            pixel_width,
            pixel_height,
            ..
        } = transform;
        if width == 0 || height == 0 || !(pixel_width > 0.0) || !(pixel_height < 0.0) {
            return Err(EnsembleError::InvalidRasterGrid {
                width,
                height,
                pixel_width,
                pixel_height,
            });
        }
        Ok(Self {
            width,
            height,
            transform,
            projection,
        })
    }

    /// Columns.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Rows.
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of pixels.
    #[must_use]
    pub fn n_pixels(&self) -> usize {
        self.width * self.height
    }

    /// The geotransform.
    #[must_use]
    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    /// Projection WKT, if known.
    #[must_use]
    pub fn projection(&self) -> Option<&str> {
        self.projection.as_deref()
    }

    /// Map-unit bounds of the full grid.
    #[must_use]
    pub fn bounds(&self) -> Bounds {
        self.pixel_box(0, self.height, 0, self.width)
    }

    /// Bounds of the smallest pixel-aligned box holding every valid pixel.
    #[must_use]
    pub fn valid_bounds(&self, mask: &[bool]) -> Option<Bounds> {
        let mut rows = (usize::MAX, 0);
        let mut cols = (usize::MAX, 0);
        for (idx, _) in mask.iter().enumerate().filter(|(_, valid)| **valid) {
            let (r, c) = (idx / self.width, idx % self.width);
            rows = (rows.0.min(r), rows.1.max(r + 1));
            cols = (cols.0.min(c), cols.1.max(c + 1));
        }
        (rows.0 < rows.1).then(|| self.pixel_box(rows.0, rows.1, cols.0, cols.1))
    }

    fn pixel_box(&self, r0: usize, r1: usize, c0: usize, c1: usize) -> Bounds {
        let t = &self.transform;
        Bounds::from_corners(
            t.origin_x + c0 as f64 * t.pixel_width,
            t.origin_y + r0 as f64 * t.pixel_height,
            t.origin_x + c1 as f64 * t.pixel_width,
            t.origin_y + r1 as f64 * t.pixel_height,
        )
    }

    /// Half-open pixel window whose centres lie inside `bounds`, clipped to the grid.
    #[must_use]
    pub fn pixel_window(&self, bounds: &Bounds) -> Window {
        let t = &self.transform;
        let y_step = -t.pixel_height;
        let col = |x: f64| ((x - t.origin_x) / t.pixel_width - 0.5).ceil();
        let row = |y: f64| ((t.origin_y - y) / y_step - 0.5).ceil();
        let clip = |v: f64, max: usize| v.clamp(0.0, max as f64) as usize;
        Window {
            row0: clip(row(bounds.max_y), self.height),
            row1: clip(row(bounds.min_y), self.height),
            col0: clip(col(bounds.min_x), self.width),
            col1: clip(col(bounds.max_x), self.width),
        }
    }
}

/// Half-open rectangle of pixels `[row0, row1) x [col0, col1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// First row.
    pub row0: usize,
    /// One past the last row.
    pub row1: usize,
    /// First column.
    pub col0: usize,
    /// One past the last column.
    pub col1: usize,
}

impl Window {
    /// Return `true` if the window holds no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row0 >= self.row1 || self.col0 >= self.col1
    }

    fn intersect(&self, other: &Window) -> Window {
        Window {
            row0: self.row0.max(other.row0),
            row1: self.row1.min(other.row1),
            col0: self.col0.max(other.col0),
            col1: self.col1.min(other.col1),
        }
    }
}

/// A kept set's footprint and the metric value it contributes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredFootprint {
    /// Set id.
    pub set_id: SetId,
    /// Footprint.
    pub bounds: Bounds,
    /// Metric value averaged into covered pixels.
    pub value: f64,
}

/// Per-pixel mean metric and overlap count.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMap {
    /// Grid the arrays are laid out on (row-major).
    pub extent: RasterExtent,
    /// Mean metric of covering sets; [`NODATA`] where invalid or uncovered.
    pub score: Vec<f32>,
    /// Number of covering sets; [`NODATA`] where invalid.
    pub count: Vec<f32>,
    /// Valid pixels covered by at least one set.
    pub n_covered: usize,
    /// Area-wide mean of `score` over valid, covered pixels.
    pub mean_score: Option<f64>,
    /// Area-wide mean of `count` over valid, covered pixels.
    pub mean_count: Option<f64>,
}

struct Tile {
    window: Window,
    score: Vec<f32>,
    count: Vec<f32>,
    score_sum: f64,
    count_sum: f64,
    n_covered: usize,
}

/// Configuration for tiled score mapping.
///
/// # Defaults
///
/// | Parameter | Default |
/// |---|---|
/// | `n_tiles` | `(40, 90)` rows x cols |
#[derive(Debug, Clone)]
pub struct ScoreMapConfig {
    n_tiles: (usize, usize),
}

impl Default for ScoreMapConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ScoreMapConfig {
    /// Create a configuration with the default tile grid.
    #[must_use]
    pub fn new() -> Self {
        Self { n_tiles: (40, 90) }
    }

    /// Split the raster into `rows x cols` tiles.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::InvalidTileCount`] if either count is zero.
    pub fn with_n_tiles(mut self, rows: usize, cols: usize) -> Result<Self, EnsembleError> {
        if rows == 0 || cols == 0 {
            return Err(EnsembleError::InvalidTileCount { rows, cols });
        }
        self.n_tiles = (rows, cols);
        Ok(self)
    }

    /// Return the tile grid.
    #[must_use]
    pub fn n_tiles(&self) -> (usize, usize) {
        self.n_tiles
    }

    /// Rasterize `footprints` over `extent`.
    ///
    /// A pixel is covered by a footprint when its centre is inside it. Tiles
    /// are processed in parallel; each accumulates only over the footprints
    /// that intersect it, so working memory is bounded by the tile size.
    /// Output depends only on the inputs and their order.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::MaskSizeMismatch`] if `mask.len()` is not
    /// `width * height`.
    #[instrument(skip_all, fields(width = extent.width(), height = extent.height(), n_sets = footprints.len()))]
    pub fn map(
        &self,
        extent: &RasterExtent,
        mask: &[bool],
        footprints: &[ScoredFootprint],
    ) -> Result<ScoreMap, EnsembleError> {
        if mask.len() != extent.n_pixels() {
            return Err(EnsembleError::MaskSizeMismatch {
                expected: extent.n_pixels(),
                got: mask.len(),
            });
        }

        let windows: Vec<(Window, f64)> = footprints
            .iter()
            .map(|f| (extent.pixel_window(&f.bounds), f.value))
            .filter(|(w, _)| !w.is_empty())
            .collect();

        let (height, width) = (extent.height, extent.width);
        let tile_h = height.div_ceil(self.n_tiles.0).max(1);
        let tile_w = width.div_ceil(self.n_tiles.1).max(1);
        let tile_windows: Vec<Window> = (0..height)
            .step_by(tile_h)
            .flat_map(|row0| {
                (0..width).step_by(tile_w).map(move |col0| Window {
                    row0,
                    row1: (row0 + tile_h).min(height),
                    col0,
                    col1: (col0 + tile_w).min(width),
                })
            })
            .collect();
        debug!(n_tiles = tile_windows.len(), tile_h, tile_w, "tiling raster");

        let tiles: Vec<Tile> = tile_windows
            .into_par_iter()
            .map(|window| process_tile(window, extent.width, mask, &windows))
            .collect();

        let n = extent.n_pixels();
        let mut score = vec![NODATA; n];
        let mut count = vec![NODATA; n];
        let (mut score_sum, mut count_sum, mut n_covered) = (0.0, 0.0, 0usize);
        for tile in tiles {
            let w = tile.window.col1 - tile.window.col0;
            for (i, r) in (tile.window.row0..tile.window.row1).enumerate() {
                let dst = r * extent.width + tile.window.col0;
                score[dst..dst + w].copy_from_slice(&tile.score[i * w..(i + 1) * w]);
                count[dst..dst + w].copy_from_slice(&tile.count[i * w..(i + 1) * w]);
            }
            score_sum += tile.score_sum;
            count_sum += tile.count_sum;
            n_covered += tile.n_covered;
        }

        let mean = |sum: f64| (n_covered > 0).then(|| sum / n_covered as f64);
        let map = ScoreMap {
            extent: extent.clone(),
            score,
            count,
            n_covered,
            mean_score: mean(score_sum),
            mean_count: mean(count_sum),
        };
        info!(
            n_covered,
            mean_score = map.mean_score.unwrap_or(f64::NAN),
            mean_count = map.mean_count.unwrap_or(f64::NAN),
            "score map complete"
        );
        Ok(map)
    }
}

fn process_tile(window: Window, raster_width: usize, mask: &[bool], footprints: &[(Window, f64)]) -> Tile {
    let h = window.row1 - window.row0;
    let w = window.col1 - window.col0;
    let mut sums = vec![0.0f64; h * w];
    let mut hits = vec![0u32; h * w];

    for (fp, value) in footprints {
        let overlap = fp.intersect(&window);
        if overlap.is_empty() {
            continue;
        }
        for r in overlap.row0..overlap.row1 {
            let base = (r - window.row0) * w;
            for c in overlap.col0..overlap.col1 {
                let i = base + c - window.col0;
                sums[i] += value;
                hits[i] += 1;
            }
        }
    }

    let mut score = vec![NODATA; h * w];
    let mut count = vec![NODATA; h * w];
    let (mut score_sum, mut count_sum, mut n_covered) = (0.0, 0.0, 0usize);
    for r in 0..h {
        for c in 0..w {
            let i = r * w + c;
            if !mask[(window.row0 + r) * raster_width + window.col0 + c] {
                continue;
            }
            count[i] = hits[i] as f32;
            if hits[i] > 0 {
                let mean = sums[i] / f64::from(hits[i]);
                score[i] = mean as f32;
                score_sum += mean;
                count_sum += f64::from(hits[i]);
                n_covered += 1;
            }
        }
    }

    Tile {
        window,
        score,
        count,
        score_sum,
        count_sum,
        n_covered,
    }
}
