//! Generalized Spatial Random Design: overlapping footprints over a study extent.

use rand::Rng;
use tracing::{debug, info, instrument};

use crate::domain::{Bounds, SetId, SupportSet};
use crate::rng::{Purpose, stream_rng};
use crate::EnsembleError;

/// Global lattice that cell and footprint corners are aligned to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapGrid {
    /// Lattice origin x.
    pub origin_x: f64,
    /// Lattice origin y.
    pub origin_y: f64,
    /// Lattice spacing in map units.
    pub resolution: f64,
}

impl SnapGrid {
    fn floor_x(&self, x: f64) -> f64 {
        self.origin_x + ((x - self.origin_x) / self.resolution).floor() * self.resolution
    }

    fn ceil_y(&self, y: f64) -> f64 {
        self.origin_y + ((y - self.origin_y) / self.resolution).ceil() * self.resolution
    }

    fn spans_whole_steps(&self, length: f64) -> bool {
        let steps = length / self.resolution;
        (steps - steps.round()).abs() < 1e-9 * steps.max(1.0)
    }
}

/// Configuration for support-set footprint generation.
///
/// The extent is tiled by `cell_size` cells from its upper-left corner.
/// Each cell receives `sets_per_cell` footprints of `support_size`, each
/// shifted by a random offset so that it still contains the whole cell.
/// Since every cell is inside at least one footprint, the union of all
/// footprints covers the extent.
///
/// # Defaults
///
/// | Parameter | Default |
/// |---|---|
/// | `snap` | `None` |
/// | `max_features` | `None` (all predictors) |
/// | `seed` | `42` |
#[derive(Debug, Clone)]
pub struct GridConfig {
    cell_size: (f64, f64),
    support_size: (f64, f64),
    sets_per_cell: usize,
    min_obs: usize,
    snap: Option<SnapGrid>,
    max_features: Option<usize>,
    seed: u64,
}

impl GridConfig {
    /// Create a grid configuration.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::InvalidSize`] | a size is non-positive or non-finite |
    /// | [`EnsembleError::SupportSmallerThanCell`] | a footprint axis is shorter than the cell axis |
    /// | [`EnsembleError::InvalidSetsPerCell`] | `sets_per_cell == 0` |
    /// | [`EnsembleError::InvalidMinObs`] | `min_obs == 0` |
    pub fn new(
        cell_size: (f64, f64),
        support_size: (f64, f64),
        sets_per_cell: usize,
        min_obs: usize,
    ) -> Result<Self, EnsembleError> {
        for (name, (x, y)) in [("cell_size", cell_size), ("support_size", support_size)] {
            if !(x.is_finite() && y.is_finite() && x > 0.0 && y > 0.0) {
                return Err(EnsembleError::InvalidSize { name, x, y });
            }
        }
        for (axis, support, cell) in [
            ("x", support_size.0, cell_size.0),
            ("y", support_size.1, cell_size.1),
        ] {
            if support < cell {
                return Err(EnsembleError::SupportSmallerThanCell { axis, support, cell });
            }
        }
        if sets_per_cell == 0 {
            return Err(EnsembleError::InvalidSetsPerCell);
        }
        if min_obs == 0 {
            return Err(EnsembleError::InvalidMinObs);
        }

        Ok(Self {
            cell_size,
            support_size,
            sets_per_cell,
            min_obs,
            snap: None,
            max_features: None,
            seed: 42,
        })
    }

    /// Align cell and footprint corners to a global lattice.
    ///
    /// The upper-left cell corner is snapped outward; every other corner
    /// stays on the lattice because both sizes and all offsets are whole
    /// multiples of the resolution.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::InvalidResolution`] | non-positive or non-finite spacing |
    /// | [`EnsembleError::SizeOffLattice`] | `cell_size` or `support_size` is not a multiple of the spacing |
    pub fn with_snap(mut self, snap: Option<SnapGrid>) -> Result<Self, EnsembleError> {
        if let Some(s) = snap {
            let resolution = s.resolution;
            if !(resolution.is_finite() && resolution > 0.0) {
                return Err(EnsembleError::InvalidResolution { resolution });
            }
            for (name, (x, y)) in [("cell_size", self.cell_size), ("support_size", self.support_size)] {
                if !(s.spans_whole_steps(x) && s.spans_whole_steps(y)) {
                    return Err(EnsembleError::SizeOffLattice { name, x, y, resolution });
                }
            }
        }
        self.snap = snap;
        Ok(self)
    }

    /// Set the per-split feature subsample size stamped on every set.
    #[must_use]
    pub fn with_max_features(mut self, max_features: Option<usize>) -> Self {
        self.max_features = max_features;
        self
    }

    /// Set the run seed that per-cell offsets derive from.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Return the cell size.
    #[must_use]
    pub fn cell_size(&self) -> (f64, f64) {
        self.cell_size
    }

    /// Return the footprint size.
    #[must_use]
    pub fn support_size(&self) -> (f64, f64) {
        self.support_size
    }

    /// Return the number of footprints per cell.
    #[must_use]
    pub fn sets_per_cell(&self) -> usize {
        self.sets_per_cell
    }

    /// Return the minimum sample count stamped on every set.
    #[must_use]
    pub fn min_obs(&self) -> usize {
        self.min_obs
    }

    /// Tile `extent` into cells, row-major from the upper-left corner.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::EmptyExtent`] if `extent` has no area.
    pub fn cells(&self, extent: &Bounds) -> Result<Vec<Bounds>, EnsembleError> {
        if !extent.is_valid() {
            return Err(EnsembleError::EmptyExtent {
                min_x: extent.min_x,
                min_y: extent.min_y,
                max_x: extent.max_x,
                max_y: extent.max_y,
            });
        }

        let (ul_x, ul_y) = match &self.snap {
            Some(snap) => (snap.floor_x(extent.min_x), snap.ceil_y(extent.max_y)),
            None => (extent.min_x, extent.max_y),
        };
        let (cell_x, cell_y) = self.cell_size;
        let n_cols = (((extent.max_x - ul_x) / cell_x).ceil() as usize).max(1);
        let n_rows = (((ul_y - extent.min_y) / cell_y).ceil() as usize).max(1);

        let mut cells = Vec::with_capacity(n_rows * n_cols);
        for row in 0..n_rows {
            for col in 0..n_cols {
                let min_x = ul_x + col as f64 * cell_x;
                let max_y = ul_y - row as f64 * cell_y;
                cells.push(Bounds::from_corners(min_x, max_y, min_x + cell_x, max_y - cell_y));
            }
        }
        Ok(cells)
    }

    /// Generate every support-set footprint for `extent`.
    ///
    /// Set ids are `cell_index * sets_per_cell + k`. Offsets for a cell come
    /// from a stream keyed by the run seed and the cell index only.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::EmptyExtent`] if `extent` has no area.
    #[instrument(skip(self), fields(sets_per_cell = self.sets_per_cell))]
    pub fn generate(&self, extent: &Bounds) -> Result<Vec<SupportSet>, EnsembleError> {
        let cells = self.cells(extent)?;
        let (support_x, support_y) = self.support_size;
        let slack_x = support_x - self.cell_size.0;
        let slack_y = support_y - self.cell_size.1;

        let mut sets = Vec::with_capacity(cells.len() * self.sets_per_cell);
        for (cell_index, cell) in cells.iter().enumerate() {
            let mut rng = stream_rng(self.seed, Purpose::Grid, cell_index as u64);
            for k in 0..self.sets_per_cell {
                let offset_x = self.draw_offset(&mut rng, slack_x);
                let offset_y = self.draw_offset(&mut rng, slack_y);
                let ul_x = cell.min_x - offset_x;
                let ul_y = cell.max_y + offset_y;
                let id = SetId::new((cell_index * self.sets_per_cell + k) as u64);
                sets.push(SupportSet {
                    id,
                    bounds: Bounds::from_corners(ul_x, ul_y, ul_x + support_x, ul_y - support_y),
                    min_obs: self.min_obs,
                    max_features: self.max_features,
                });
            }
            debug!(cell_index, ul_x = cell.min_x, ul_y = cell.max_y, "cell populated");
        }

        info!(n_cells = cells.len(), n_sets = sets.len(), "support sets generated");
        Ok(sets)
    }

    fn draw_offset(&self, rng: &mut impl Rng, slack: f64) -> f64 {
        match &self.snap {
            Some(snap) => {
                let steps = (slack / snap.resolution + 1e-9).floor() as u64;
                rng.gen_range(0..=steps) as f64 * snap.resolution
            }
            None => rng.r#gen::<f64>() * slack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent() -> Bounds {
        Bounds::from_corners(0.0, 100.0, 250.0, 0.0)
    }

    #[test]
    fn support_smaller_than_cell_rejected() {
        let err = GridConfig::new((10.0, 10.0), (5.0, 20.0), 1, 1).unwrap_err();
        assert!(matches!(err, EnsembleError::SupportSmallerThanCell { axis: "x", .. }));
    }

    #[test]
    fn zero_sets_per_cell_rejected() {
        assert!(matches!(
            GridConfig::new((10.0, 10.0), (10.0, 10.0), 0, 1),
            Err(EnsembleError::InvalidSetsPerCell)
        ));
    }

    #[test]
    fn cells_tile_extent_row_major() {
        let config = GridConfig::new((100.0, 50.0), (150.0, 80.0), 1, 1).unwrap();
        let cells = config.cells(&extent()).unwrap();
        // 3 columns (250 / 100 rounded up) by 2 rows.
        assert_eq!(cells.len(), 6);
        assert_eq!(cells[0], Bounds::from_corners(0.0, 100.0, 100.0, 50.0));
        assert_eq!(cells[2], Bounds::from_corners(200.0, 100.0, 300.0, 50.0));
        assert_eq!(cells[3], Bounds::from_corners(0.0, 50.0, 100.0, 0.0));
    }

    #[test]
    fn every_footprint_contains_its_cell() {
        let config = GridConfig::new((40.0, 40.0), (90.0, 70.0), 3, 1)
            .unwrap()
            .with_seed(7);
        let cells = config.cells(&extent()).unwrap();
        let sets = config.generate(&extent()).unwrap();
        assert_eq!(sets.len(), cells.len() * 3);
        for set in &sets {
            let cell = &cells[set.id.get() as usize / 3];
            assert!(set.bounds.encloses(cell), "set {} misses its cell", set.id);
            assert!((set.bounds.width() - 90.0).abs() < 1e-9);
            assert!((set.bounds.height() - 70.0).abs() < 1e-9);
        }
    }

    #[test]
    fn ids_unique_and_dense() {
        let config = GridConfig::new((50.0, 50.0), (60.0, 60.0), 4, 1).unwrap();
        let sets = config.generate(&extent()).unwrap();
        for (i, set) in sets.iter().enumerate() {
            assert_eq!(set.id.get(), i as u64);
        }
    }

    #[test]
    fn same_seed_same_footprints() {
        let config = GridConfig::new((30.0, 30.0), (75.0, 75.0), 2, 5)
            .unwrap()
            .with_seed(99);
        assert_eq!(config.generate(&extent()).unwrap(), config.generate(&extent()).unwrap());

        let other = config.clone().with_seed(100);
        assert_ne!(config.generate(&extent()).unwrap(), other.generate(&extent()).unwrap());
    }

    fn on_lattice(v: f64, origin: f64) -> bool {
        let steps = (v - origin) / 30.0;
        (steps - steps.round()).abs() < 1e-9
    }

    #[test]
    fn snapped_corners_on_lattice() {
        let snap = SnapGrid {
            origin_x: 5.0,
            origin_y: 5.0,
            resolution: 30.0,
        };
        let config = GridConfig::new((90.0, 60.0), (150.0, 120.0), 3, 1)
            .unwrap()
            .with_snap(Some(snap))
            .unwrap();
        let extent = Bounds::from_corners(17.0, 203.0, 400.0, 11.0);
        let sets = config.generate(&extent).unwrap();
        assert!(!sets.is_empty());
        for set in &sets {
            let b = &set.bounds;
            for x in [b.min_x, b.max_x] {
                assert!(on_lattice(x, 5.0), "set {} x corner {x} off lattice", set.id);
            }
            for y in [b.min_y, b.max_y] {
                assert!(on_lattice(y, 5.0), "set {} y corner {y} off lattice", set.id);
            }
        }
        let cells = config.cells(&extent).unwrap();
        assert_eq!(cells[0].min_x, 5.0);
        assert_eq!(cells[0].max_y, 215.0);
    }

    #[test]
    fn snapping_rejects_sizes_between_lattice_steps() {
        let snap = SnapGrid {
            origin_x: 0.0,
            origin_y: 0.0,
            resolution: 30.0,
        };
        let cell = GridConfig::new((100.0, 100.0), (150.0, 150.0), 1, 1)
            .unwrap()
            .with_snap(Some(snap))
            .unwrap_err();
        assert!(matches!(cell, EnsembleError::SizeOffLattice { name: "cell_size", .. }));

        let support = GridConfig::new((90.0, 90.0), (150.0, 100.0), 1, 1)
            .unwrap()
            .with_snap(Some(snap))
            .unwrap_err();
        assert!(matches!(support, EnsembleError::SizeOffLattice { name: "support_size", .. }));
    }

    #[test]
    fn empty_extent_rejected() {
        let config = GridConfig::new((10.0, 10.0), (10.0, 10.0), 1, 1).unwrap();
        let flat = Bounds::from_corners(0.0, 5.0, 10.0, 5.0);
        assert!(matches!(config.generate(&flat), Err(EnsembleError::EmptyExtent { .. })));
    }
}
