//! Grid communication schedules used around interpolation and spreading.
//!
//! The fluid solver owns the Eulerian fields; the coupling layer only asks
//! for them to be made consistent before it reads them (ghost fill,
//! fine-to-coarse synchronization) or after it writes them (prolongation,
//! physical-boundary accumulation).  The traits are the seam; the concrete
//! schedules here are the piecewise-constant versions the runner uses.

use std::array;

use ib_kernel::grid::floor_div;
use ib_kernel::{CellIndex, FieldStore, GridGeometry, LevelData, PatchHierarchy, NDIM};

/// Fills data on one level from other data (ghost fill or prolongation).
pub trait RefineSchedule: Send + Sync {
    /// Perform the fill at `fill_time`.
    fn fill_data(&self, fields: &mut FieldStore, hierarchy: &PatchHierarchy, fill_time: f64);
}

/// Synchronizes a coarse level from the next finer one.
pub trait CoarsenSchedule: Send + Sync {
    /// Perform the synchronization.
    fn coarsen_data(&self, fields: &mut FieldStore, hierarchy: &PatchHierarchy);
}

/// Folds values spread into ghost cells outside a physical boundary back
/// into the interior.
pub trait PhysicalBoundaryOp: Send + Sync {
    /// Accumulate ghost contributions of `data` on a level refined by `ratio`.
    fn accumulate_from_physical_boundary(&self, data: &mut LevelData, geometry: &GridGeometry, ratio: i64);
}

/// Per-level list of optional refine schedules.
pub type RefineSchedules = Vec<Option<Box<dyn RefineSchedule>>>;

/// Per-level list of optional coarsen schedules.
pub type CoarsenSchedules = Vec<Option<Box<dyn CoarsenSchedule>>>;

// ---------------------------------------------------------------------------
// Ghost fill
// ---------------------------------------------------------------------------

/// Fills every ghost cell of one level.
///
/// Periodic images and same-level neighbors are copied; cells across a
/// non-periodic boundary take the nearest interior value; cells at a
/// coarse-fine interface take the value of the underlying coarse cell.
#[derive(Debug, Clone, Copy)]
pub struct GhostFillSchedule {
    /// Field to fill.
    pub field_idx: usize,
    /// Level to fill.
    pub level_number: usize,
}

impl GhostFillSchedule {
    /// One ghost-fill schedule per level of `hierarchy`.
    pub fn for_hierarchy(field_idx: usize, hierarchy: &PatchHierarchy) -> RefineSchedules {
        (0..hierarchy.num_levels())
            .map(|level_number| Some(Box::new(Self { field_idx, level_number }) as Box<dyn RefineSchedule>))
            .collect()
    }
}

impl RefineSchedule for GhostFillSchedule {
    fn fill_data(&self, fields: &mut FieldStore, hierarchy: &PatchHierarchy, _fill_time: f64) {
        let ln = self.level_number;
        let Some(level) = hierarchy.level(ln) else {
            return;
        };
        let geometry = &hierarchy.geometry;
        let ratio = level.ratio_to_level_zero;
        let ratio_to_coarser = hierarchy.ratio_to_coarser(ln);
        let domain = geometry.level_domain_box(ratio);

        let has_coarse = ln > 0 && fields.level_data(self.field_idx, ln - 1).is_some();
        let (coarse, fine) = if has_coarse {
            match fields.coarse_fine_mut(self.field_idx, ln) {
                Some((coarse, fine)) => (Some(&*coarse), fine),
                None => return,
            }
        } else {
            match fields.level_data_mut(self.field_idx, ln) {
                Some(fine) => (None, fine),
                None => return,
            }
        };

        let depth = fine.depth();
        let ghost_cells: Vec<CellIndex> = fine.ghost_box().cells().filter(|c| !level.contains_cell(c)).collect();
        for cell in ghost_cells {
            let mut src = geometry.wrap_periodic(&cell, ratio);
            for d in 0..NDIM {
                src[d] = src[d].clamp(domain.lower[d], domain.upper[d]);
            }
            if src != cell && level.contains_cell(&src) {
                for k in 0..depth {
                    if let Some(v) = fine.get(&src, k) {
                        fine.set(&cell, k, v);
                    }
                }
            } else if let Some(coarse) = coarse {
                let coarse_cell: CellIndex = array::from_fn(|d| floor_div(src[d], ratio_to_coarser));
                for k in 0..depth {
                    if let Some(v) = coarse.get(&coarse_cell, k) {
                        fine.set(&cell, k, v);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prolongation
// ---------------------------------------------------------------------------

/// Overwrites the patch interiors of a fine level with the underlying
/// coarse values.
#[derive(Debug, Clone, Copy)]
pub struct ConstantProlongation {
    /// Field to fill.
    pub field_idx: usize,
    /// Fine level to fill from the next coarser one.
    pub level_number: usize,
}

impl RefineSchedule for ConstantProlongation {
    fn fill_data(&self, fields: &mut FieldStore, hierarchy: &PatchHierarchy, _fill_time: f64) {
        let ln = self.level_number;
        let Some(level) = hierarchy.level(ln) else {
            return;
        };
        let ratio = hierarchy.ratio_to_coarser(ln);
        let Some((coarse, fine)) = fields.coarse_fine_mut(self.field_idx, ln) else {
            return;
        };
        let depth = fine.depth();
        for patch in &level.patches {
            for cell in patch.cell_box.cells() {
                let coarse_cell: CellIndex = array::from_fn(|d| floor_div(cell[d], ratio));
                for k in 0..depth {
                    if let Some(v) = coarse.get(&coarse_cell, k) {
                        fine.set(&cell, k, v);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Coarsening
// ---------------------------------------------------------------------------

/// Replaces coarse cells covered by a fine level with the mean of their
/// fine children.
#[derive(Debug, Clone, Copy)]
pub struct CoarsenAverage {
    /// Field to synchronize.
    pub field_idx: usize,
    /// Fine level whose data is averaged onto the next coarser level.
    pub level_number: usize,
}

impl CoarsenAverage {
    /// One schedule per level that has a coarser level.
    pub fn for_hierarchy(field_idx: usize, hierarchy: &PatchHierarchy) -> CoarsenSchedules {
        (0..hierarchy.num_levels())
            .map(|level_number| {
                (level_number > 0).then(|| Box::new(Self { field_idx, level_number }) as Box<dyn CoarsenSchedule>)
            })
            .collect()
    }
}

impl CoarsenSchedule for CoarsenAverage {
    fn coarsen_data(&self, fields: &mut FieldStore, hierarchy: &PatchHierarchy) {
        let ln = self.level_number;
        let Some(level) = hierarchy.level(ln) else {
            return;
        };
        let ratio = hierarchy.ratio_to_coarser(ln);
        let Some((coarse, fine)) = fields.coarse_fine_mut(self.field_idx, ln) else {
            return;
        };
        let depth = coarse.depth();
        let mut sums = vec![0.0; depth];
        for patch in &level.patches {
            for coarse_cell in patch.cell_box.coarsen(ratio).cells() {
                let children = ib_kernel::CellBox::new(coarse_cell, coarse_cell).refine(ratio);
                sums.iter_mut().for_each(|s| *s = 0.0);
                let mut count = 0usize;
                for child in children.cells() {
                    if !patch.cell_box.contains(&child) {
                        continue;
                    }
                    count += 1;
                    for (k, s) in sums.iter_mut().enumerate() {
                        *s += fine.get(&child, k).unwrap_or(0.0);
                    }
                }
                if count == children.num_cells() {
                    for (k, s) in sums.iter().enumerate() {
                        coarse.set(&coarse_cell, k, s / count as f64);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Physical boundaries
// ---------------------------------------------------------------------------

/// Reflects ghost contributions across non-periodic walls.
///
/// The value in the ghost cell at distance `k` outside a wall is added to
/// the interior cell at distance `k` inside it.  For vector data with
/// `NDIM` components the wall-normal component is multiplied by
/// `normal_sign`.
#[derive(Debug, Clone, Copy)]
pub struct ReflectGhostContributions {
    /// Factor applied to the wall-normal component.
    pub normal_sign: f64,
}

impl Default for ReflectGhostContributions {
    fn default() -> Self {
        Self { normal_sign: 1.0 }
    }
}

impl PhysicalBoundaryOp for ReflectGhostContributions {
    fn accumulate_from_physical_boundary(&self, data: &mut LevelData, geometry: &GridGeometry, ratio: i64) {
        let domain = geometry.level_domain_box(ratio);
        let depth = data.depth();
        for d in 0..NDIM {
            if geometry.periodic[d] {
                continue;
            }
            let (lo, hi) = (domain.lower[d], domain.upper[d]);
            let outside: Vec<CellIndex> = data.ghost_box().cells().filter(|c| c[d] < lo || c[d] > hi).collect();
            for cell in outside {
                let mut mirror = cell;
                mirror[d] = if cell[d] < lo { 2 * lo - 1 - cell[d] } else { 2 * hi + 1 - cell[d] };
                for k in 0..depth {
                    let Some(v) = data.get(&cell, k) else {
                        continue;
                    };
                    let sign = if depth == NDIM && k == d { self.normal_sign } else { 1.0 };
                    data.add(&mirror, k, sign * v);
                    data.set(&cell, k, 0.0);
                }
            }
        }
    }
}
