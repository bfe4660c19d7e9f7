//! Cosine-bell fluid sources and sinks
//!
//! Each source spreads its strength `Q` onto the grid with the separable
//! weight `prod_d 0.5 (1 + cos(pi x_d / r_d)) / r_d`.  The radius along
//! each axis is rounded to a whole number of cells, at least two, so the
//! discrete weights integrate to one and the spread field carries exactly
//! the prescribed volume.

use std::f64::consts::PI;

use ib_kernel::grid::floor_div;
use ib_kernel::{CellBox, CellIndex, FieldStore, PatchHierarchy, Point, NDIM};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IbError, IbResult};

/// Absolute and relative tolerance of the source conservation check.
pub const SOURCE_BALANCE_TOL: f64 = 1.0e-12;

/// Relative tolerance of the boundary normalization check.
pub const NORMALIZATION_TOL: f64 = 1.0e-10;

/// `0.5 (1 + cos(pi x / r)) / r` on `|x| <= r`, zero outside.
pub fn cos_kernel(x: f64, r: f64) -> f64 {
    if x.abs() > r {
        0.0
    } else {
        0.5 * (1.0 + (PI * x / r).cos()) / r
    }
}

/// Radius rounded to the nearest whole number of cells, at least two.
pub fn rounded_radius(r: f64, dx: f64) -> f64 {
    (r / dx + 0.5).floor().max(2.0) * dx
}

// Undefined source data is NaN, which JSON cannot carry; it is written as null.
mod nan_as_null {
    use ib_kernel::{Point, NDIM};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    fn to_option(v: f64) -> Option<f64> {
        (!v.is_nan()).then_some(v)
    }

    pub fn serialize<S: Serializer>(values: &[f64], s: S) -> Result<S::Ok, S::Error> {
        values.iter().copied().map(to_option).collect::<Vec<_>>().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(d)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }

    pub mod points {
        use super::*;

        pub fn serialize<S: Serializer>(points: &[Point], s: S) -> Result<S::Ok, S::Error> {
            points
                .iter()
                .map(|p| p.iter().copied().map(to_option).collect::<Vec<_>>())
                .collect::<Vec<_>>()
                .serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Point>, D::Error> {
            let points = Vec::<Vec<Option<f64>>>::deserialize(d)?;
            Ok(points
                .into_iter()
                .map(|p| std::array::from_fn(|k| p.get(k).copied().flatten().unwrap_or(f64::NAN)))
                .collect::<Vec<[f64; NDIM]>>())
        }
    }
}

/// Sources of one level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelSources {
    /// Centers.
    #[serde(with = "nan_as_null::points")]
    pub positions: Vec<Point>,
    /// Radii before rounding.
    #[serde(with = "nan_as_null")]
    pub radii: Vec<f64>,
    /// Mean pressures at the sources.
    #[serde(with = "nan_as_null")]
    pub pressures: Vec<f64>,
    /// Strengths.
    #[serde(with = "nan_as_null")]
    pub strengths: Vec<f64>,
}

impl LevelSources {
    /// `n` sources with undefined data.
    pub fn with_count(n: usize) -> Self {
        let mut sources = Self::default();
        sources.resize(n);
        sources
    }

    /// Keep the first `n` sources, appending undefined ones as needed.
    pub fn resize(&mut self, n: usize) {
        self.positions.resize(n, [f64::NAN; NDIM]);
        self.radii.resize(n, f64::NAN);
        self.pressures.resize(n, f64::NAN);
        self.strengths.resize(n, f64::NAN);
    }

    /// Number of sources.
    pub fn len(&self) -> usize {
        self.strengths.len()
    }

    /// Whether the level has no sources.
    pub fn is_empty(&self) -> bool {
        self.strengths.is_empty()
    }
}

/// Per-level rounded radii and stencil box of source `n` on a level
/// refined by `ratio`.
fn source_stencil(hierarchy: &PatchHierarchy, ratio: i64, x: &Point, r: f64) -> (Point, CellBox) {
    let geometry = &hierarchy.geometry;
    let dx = geometry.level_dx(ratio);
    let radius: Point = std::array::from_fn(|d| rounded_radius(r, dx[d]));
    let center = geometry.cell_index(x, ratio);
    let mut stencil_box = CellBox::new(center, center);
    for d in 0..NDIM {
        stencil_box = stencil_box.grow_axis(d, (radius[d] / dx[d]) as i64 + 1);
    }
    (radius, stencil_box)
}

/// Cosine-bell weight of `cell` for a source at `x`.
fn bell_weight(hierarchy: &PatchHierarchy, ratio: i64, cell: &CellIndex, x: &Point, radius: &Point) -> f64 {
    let center = hierarchy.geometry.cell_center(cell, ratio);
    (0..NDIM).map(|d| cos_kernel(center[d] - x[d], radius[d])).product()
}

/// Whether level cell `cell` lies in the outer boundary layer of the
/// coarsest domain: one coarse cell thick, normal to every axis but the
/// last.
fn in_boundary_layer(hierarchy: &PatchHierarchy, ratio: i64, cell: &CellIndex) -> bool {
    let domain = hierarchy.geometry.domain_box();
    let coarse: CellIndex = std::array::from_fn(|d| floor_div(cell[d], ratio));
    if !domain.contains(&coarse) {
        return false;
    }
    let mut interior = domain;
    for d in 0..NDIM - 1 {
        interior = interior.grow_axis(d, -1);
    }
    !interior.contains(&coarse)
}

/// Spread the sources of the finest level into component 0 of `q_idx`.
///
/// Stencil cells are wrapped along periodic axes; cells outside every
/// patch of the level receive nothing.  Sources on a coarser level would
/// be counted again under the finer patches and are rejected.
pub fn spread_sources(sources: &[LevelSources], fields: &mut FieldStore, q_idx: usize, hierarchy: &PatchHierarchy) -> IbResult<()> {
    let geometry = &hierarchy.geometry;
    let finest = hierarchy.finest_level_number();
    for (ln, level_sources) in sources.iter().enumerate() {
        if level_sources.is_empty() {
            continue;
        }
        if ln != finest {
            return Err(IbError::SourcesOffFinestLevel {
                level: ln,
                finest,
                count: level_sources.len(),
            });
        }
        let level = hierarchy.level(ln).ok_or(IbError::MissingLevel(ln))?;
        let ratio = level.ratio_to_level_zero;
        let q_data = fields
            .level_data_mut(q_idx, ln)
            .ok_or(IbError::MissingField { field: q_idx, level: ln })?;
        for n in 0..level_sources.len() {
            let x = level_sources.positions[n];
            let q = level_sources.strengths[n];
            let (radius, stencil_box) = source_stencil(hierarchy, ratio, &x, level_sources.radii[n]);
            for cell in stencil_box.cells() {
                let target = geometry.wrap_periodic(&cell, ratio);
                if !level.contains_cell(&target) {
                    continue;
                }
                let wgt = bell_weight(hierarchy, ratio, &cell, &x, &radius);
                if wgt != 0.0 {
                    q_data.add(&target, 0, q * wgt);
                }
            }
        }
    }
    Ok(())
}

/// Compare the grid integral of `q_idx` with the sum of the point strengths.
///
/// Returns the grid integral.
pub fn check_source_balance(
    object_name: &str,
    sources: &[LevelSources],
    fields: &FieldStore,
    q_idx: usize,
    hierarchy: &PatchHierarchy,
) -> IbResult<f64> {
    let q_sum: f64 = sources.iter().flat_map(|s| s.strengths.iter()).sum();
    let q_max = sources
        .iter()
        .flat_map(|s| s.strengths.iter())
        .fold(0.0_f64, |acc, q| acc.max(q.abs()));
    let q_total = fields.integral(q_idx, 0, hierarchy);
    let diff = (q_total - q_sum).abs();
    if diff > SOURCE_BALANCE_TOL && diff / q_max.max(1.0) > SOURCE_BALANCE_TOL {
        return Err(IbError::SourceImbalance {
            object: object_name.to_string(),
            grid_total: q_total,
            point_total: q_sum,
        });
    }
    debug!("{}: net source strength {:e}", object_name, q_total);
    Ok(q_total)
}

/// Cancel a net source `q_total` by a uniform sink over the outer boundary
/// layer, then verify that the field integrates to zero.
pub fn normalize_source_strength(
    object_name: &str,
    fields: &mut FieldStore,
    q_idx: usize,
    hierarchy: &PatchHierarchy,
    q_total: f64,
) -> IbResult<()> {
    let geometry = &hierarchy.geometry;
    let num_bdry_cells = geometry
        .domain_box()
        .cells()
        .filter(|c| in_boundary_layer(hierarchy, 1, c))
        .count();
    let vol = num_bdry_cells as f64 * geometry.cell_volume(1);
    if vol > 0.0 {
        let q_norm = -q_total / vol;
        for ln in 0..hierarchy.num_levels() {
            let Some(level) = hierarchy.level(ln) else {
                continue;
            };
            let ratio = level.ratio_to_level_zero;
            let q_data = fields
                .level_data_mut(q_idx, ln)
                .ok_or(IbError::MissingField { field: q_idx, level: ln })?;
            for patch in &level.patches {
                for cell in patch.cell_box.cells() {
                    if in_boundary_layer(hierarchy, ratio, &cell) {
                        q_data.add(&cell, 0, q_norm);
                    }
                }
            }
        }
    }

    let integral = fields.integral(q_idx, 0, hierarchy);
    if integral.abs() > NORMALIZATION_TOL * fields.max_norm(q_idx, hierarchy).max(1.0) {
        return Err(IbError::NormalizationResidual {
            object: object_name.to_string(),
            integral,
        });
    }
    Ok(())
}

/// Mean of component 0 of `p_idx` over the outer boundary layer, counting
/// only cells not covered by a finer level.
pub fn boundary_mean(fields: &FieldStore, p_idx: usize, hierarchy: &PatchHierarchy) -> f64 {
    let mut p_sum = 0.0;
    let mut vol = 0.0;
    for ln in 0..hierarchy.num_levels() {
        let (Some(level), Some(p_data)) = (hierarchy.level(ln), fields.level_data(p_idx, ln)) else {
            continue;
        };
        let ratio = level.ratio_to_level_zero;
        let cell_volume = hierarchy.geometry.cell_volume(ratio);
        for patch in &level.patches {
            for cell in patch.cell_box.cells() {
                if in_boundary_layer(hierarchy, ratio, &cell) && !hierarchy.covered_by_finer(ln, &cell) {
                    p_sum += p_data.get(&cell, 0).unwrap_or(0.0) * cell_volume;
                    vol += cell_volume;
                }
            }
        }
    }
    if vol > 0.0 {
        p_sum / vol
    } else {
        0.0
    }
}

/// Bell-weighted mean of component 0 of `p_idx` at every source, minus
/// `p_norm`.  Results are written into each level's `pressures`.
pub fn interpolate_source_pressures(
    sources: &mut [LevelSources],
    fields: &FieldStore,
    p_idx: usize,
    hierarchy: &PatchHierarchy,
    p_norm: f64,
) -> IbResult<()> {
    let geometry = &hierarchy.geometry;
    for (ln, level_sources) in sources.iter_mut().enumerate() {
        level_sources.pressures.iter_mut().for_each(|p| *p = 0.0);
        if level_sources.is_empty() {
            continue;
        }
        let level = hierarchy.level(ln).ok_or(IbError::MissingLevel(ln))?;
        let ratio = level.ratio_to_level_zero;
        let dx = geometry.level_dx(ratio);
        let cell_volume: f64 = dx.iter().product();
        let p_data = fields
            .level_data(p_idx, ln)
            .ok_or(IbError::MissingField { field: p_idx, level: ln })?;
        for n in 0..level_sources.len() {
            let x = level_sources.positions[n];
            let (radius, stencil_box) = source_stencil(hierarchy, ratio, &x, level_sources.radii[n]);
            let mut p = 0.0;
            for cell in stencil_box.cells() {
                let target = geometry.wrap_periodic(&cell, ratio);
                if !level.contains_cell(&target) {
                    continue;
                }
                let wgt = bell_weight(hierarchy, ratio, &cell, &x, &radius) * cell_volume;
                p += p_data.get(&target, 0).unwrap_or(0.0) * wgt;
            }
            level_sources.pressures[n] = p - p_norm;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ib_kernel::GridGeometry;

    fn setup(periodic: bool) -> (PatchHierarchy, FieldStore, usize) {
        let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [16; NDIM], [periodic; NDIM]);
        let hierarchy = PatchHierarchy::uniform(geometry, [2; NDIM], 2);
        let mut fields = FieldStore::new();
        let q_idx = fields.register("q", 1, 0);
        fields.allocate(q_idx, &hierarchy);
        (hierarchy, fields, q_idx)
    }

    fn single(x: Point, r: f64, q: f64) -> Vec<LevelSources> {
        vec![LevelSources {
            positions: vec![x],
            radii: vec![r],
            pressures: vec![0.0],
            strengths: vec![q],
        }]
    }

    #[test]
    fn test_cos_kernel() {
        assert_eq!(cos_kernel(0.3, 0.2), 0.0);
        assert!((cos_kernel(0.0, 0.5) - 2.0).abs() < 1e-15);
        assert!(cos_kernel(0.5, 0.5).abs() < 1e-15);
    }

    #[test]
    fn test_undefined_values_survive_json() {
        let sources = LevelSources::with_count(2);
        let json = serde_json::to_string(&sources).unwrap();
        let back: LevelSources = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert!(back.pressures.iter().all(|p| p.is_nan()));
        assert!(back.positions[1].iter().all(|x| x.is_nan()));
    }

    #[test]
    fn test_rounded_radius() {
        assert_eq!(rounded_radius(0.1, 0.1), 0.2);
        assert!((rounded_radius(0.26, 0.1) - 0.3).abs() < 1e-15);
    }

    #[test]
    fn test_source_at_center_conserves_volume() {
        let (hierarchy, mut fields, q_idx) = setup(false);
        let sources = single([0.5; NDIM], 3.0 / 16.0, 1.0);
        spread_sources(&sources, &mut fields, q_idx, &hierarchy).unwrap();
        let total = check_source_balance("test", &sources, &fields, q_idx, &hierarchy).unwrap();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_source_wraps_periodic_boundary() {
        let (hierarchy, mut fields, q_idx) = setup(true);
        let sources = single([0.02; NDIM], 3.0 / 16.0, -2.0);
        spread_sources(&sources, &mut fields, q_idx, &hierarchy).unwrap();
        let total = check_source_balance("test", &sources, &fields, q_idx, &hierarchy).unwrap();
        assert!((total + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_sources_below_finest_level_are_rejected() {
        let (mut hierarchy, _, _) = setup(false);
        hierarchy.set_level(ib_kernel::PatchLevel::chopped(
            1,
            2,
            ib_kernel::CellBox::new([8; NDIM], [23; NDIM]),
            [1; NDIM],
            2,
        ));
        let mut fields = FieldStore::new();
        let q_idx = fields.register("q", 1, 0);
        fields.allocate(q_idx, &hierarchy);

        let mut sources = single([0.5; NDIM], 3.0 / 16.0, 1.0);
        sources.push(LevelSources::default());
        let err = spread_sources(&sources, &mut fields, q_idx, &hierarchy);
        assert!(matches!(err, Err(IbError::SourcesOffFinestLevel { level: 0, finest: 1, count: 1 })));
        assert_eq!(fields.integral(q_idx, 0, &hierarchy), 0.0);

        // the same source on the finest level spreads normally
        sources.swap(0, 1);
        spread_sources(&sources, &mut fields, q_idx, &hierarchy).unwrap();
        assert!(fields.integral(q_idx, 0, &hierarchy) > 0.5);
    }

    #[test]
    fn test_clipped_source_is_an_imbalance() {
        let (hierarchy, mut fields, q_idx) = setup(false);
        let sources = single([0.02; NDIM], 3.0 / 16.0, 1.0);
        spread_sources(&sources, &mut fields, q_idx, &hierarchy).unwrap();
        let err = check_source_balance("test", &sources, &fields, q_idx, &hierarchy);
        assert!(matches!(err, Err(IbError::SourceImbalance { .. })));
    }

    #[test]
    fn test_normalization_cancels_net_source() {
        let (hierarchy, mut fields, q_idx) = setup(false);
        let sources = single([0.5; NDIM], 3.0 / 16.0, 1.0);
        spread_sources(&sources, &mut fields, q_idx, &hierarchy).unwrap();
        let q_total = check_source_balance("test", &sources, &fields, q_idx, &hierarchy).unwrap();
        normalize_source_strength("test", &mut fields, q_idx, &hierarchy, q_total).unwrap();
        assert!(fields.integral(q_idx, 0, &hierarchy).abs() < 1e-12);
        // the boundary layer is normal to every axis but the last
        let mut corner = [8; NDIM];
        corner[0] = 0;
        assert!(fields.level_data(q_idx, 0).unwrap().get(&corner, 0).unwrap() < 0.0);
        let mut top = [8; NDIM];
        top[NDIM - 1] = 15;
        assert_eq!(fields.level_data(q_idx, 0).unwrap().get(&top, 0), Some(0.0));
    }

    #[test]
    fn test_pressure_at_source() {
        let (hierarchy, mut fields, p_idx) = setup(false);
        fields.set_to_scalar(p_idx, 3.0);
        let mut sources = single([0.5; NDIM], 3.0 / 16.0, 1.0);
        interpolate_source_pressures(&mut sources, &fields, p_idx, &hierarchy, 0.0).unwrap();
        assert!((sources[0].pressures[0] - 3.0).abs() < 1e-12);

        let p_norm = boundary_mean(&fields, p_idx, &hierarchy);
        assert!((p_norm - 3.0).abs() < 1e-12);
        interpolate_source_pressures(&mut sources, &fields, p_idx, &hierarchy, p_norm).unwrap();
        assert!(sources[0].pressures[0].abs() < 1e-12);
    }
}
