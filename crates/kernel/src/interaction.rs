//! Kernel-weighted transfer between Lagrangian points and cell-centered data.
//!
//! Interpolation evaluates `U(X) = sum_i u_i * delta_h(x_i - X) * h^d`, which
//! reduces to the tensor-product stencil weights.  Spreading is the adjoint:
//! `f_i += F * delta_h(x_i - X)`, i.e. the weights divided by the cell volume.
//! Stencil cells outside the allocated ghost box contribute nothing.

use crate::delta::DeltaKernel;
use crate::grid::{GridGeometry, LevelData};
use crate::Point;

/// Interpolate all components of `data` to the point `x`.
///
/// # Arguments
/// * `kernel` - Delta-function kernel.
/// * `geometry` - Domain description.
/// * `ratio` - Refinement ratio of the level `data` lives on.
/// * `data` - Cell-centered level data.
/// * `x` - Point position.
/// * `out` - Receives `data.depth()` interpolated components (overwritten).
pub fn interpolate_point(kernel: &DeltaKernel, geometry: &GridGeometry, ratio: i64, data: &LevelData, x: &Point, out: &mut [f64]) {
    let depth = data.depth();
    debug_assert_eq!(out.len(), depth);
    out.iter_mut().for_each(|v| *v = 0.0);

    let dx = geometry.level_dx(ratio);
    let stencil = kernel.stencil(x, &geometry.x_lower, &dx);
    let values = data.values();
    stencil.for_each(|cell, w| {
        if let Some(o) = data.offset(&cell) {
            for (k, v) in out.iter_mut().enumerate() {
                *v += w * values[o + k];
            }
        }
    });
}

/// Spread a point value into `data`, adding to whatever is already there.
///
/// # Arguments
/// * `kernel` - Delta-function kernel.
/// * `geometry` - Domain description.
/// * `ratio` - Refinement ratio of the level `data` lives on.
/// * `data` - Cell-centered level data receiving the contribution.
/// * `x` - Point position.
/// * `value` - `data.depth()` components carried by the point.
pub fn spread_point(kernel: &DeltaKernel, geometry: &GridGeometry, ratio: i64, data: &mut LevelData, x: &Point, value: &[f64]) {
    debug_assert_eq!(value.len(), data.depth());
    let dx = geometry.level_dx(ratio);
    let inv_volume = 1.0 / geometry.cell_volume(ratio);
    let stencil = kernel.stencil(x, &geometry.x_lower, &dx);
    stencil.for_each(|cell, w| {
        if let Some(o) = data.offset(&cell) {
            let values = data.values_mut();
            for (k, v) in value.iter().enumerate() {
                values[o + k] += w * inv_volume * v;
            }
        }
    });
}

/// Value obtained by spreading a unit quantity from `x` and interpolating it
/// back to `x`: `prod_d (sum_i w_{d,i}^2) / h^d`.
pub fn self_overlap(kernel: &DeltaKernel, geometry: &GridGeometry, ratio: i64, x: &Point) -> f64 {
    let dx = geometry.level_dx(ratio);
    let stencil = kernel.stencil(x, &geometry.x_lower, &dx);
    let squares: f64 = stencil.axes.iter().map(|a| a.sum_of_squares()).product();
    squares / geometry.cell_volume(ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::KernelLibrary;
    use crate::grid::CellBox;
    use crate::NDIM;

    fn setup() -> (GridGeometry, LevelData) {
        let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [16; NDIM], [false; NDIM]);
        let data = LevelData::new(geometry.domain_box(), 3, NDIM);
        (geometry, data)
    }

    #[test]
    fn test_interpolate_constant_field() {
        let (geometry, mut data) = setup();
        data.fill(1.0);
        let kernel = KernelLibrary::new().lookup("IB_4").unwrap();
        let mut out = [0.0; NDIM];
        interpolate_point(&kernel, &geometry, 1, &data, &[0.4137; NDIM], &mut out);
        for v in out {
            assert!((v - 1.0).abs() < 1e-12, "interpolated {} from unit field", v);
        }
    }

    #[test]
    fn test_spread_conserves_total() {
        let (geometry, mut data) = setup();
        let kernel = KernelLibrary::new().lookup("BSPLINE_3").unwrap();
        let force = [2.0; NDIM];
        spread_point(&kernel, &geometry, 1, &mut data, &[0.52; NDIM], &force);
        let volume = geometry.cell_volume(1);
        let total: f64 = geometry
            .domain_box()
            .cells()
            .map(|c| data.get(&c, 0).unwrap() * volume)
            .sum();
        assert!((total - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_spread_then_interpolate_matches_self_overlap() {
        let (geometry, mut data) = setup();
        let kernel = KernelLibrary::new().lookup("IB_4").unwrap();
        let x = [0.3311; NDIM];
        let mut unit = [0.0; NDIM];
        unit[0] = 1.0;
        spread_point(&kernel, &geometry, 1, &mut data, &x, &unit);
        let mut out = [0.0; NDIM];
        interpolate_point(&kernel, &geometry, 1, &data, &x, &mut out);
        let expected = self_overlap(&kernel, &geometry, 1, &x);
        assert!((out[0] - expected).abs() < 1e-9 * expected);
        assert!(out[1].abs() < 1e-15);
    }

    #[test]
    fn test_cells_outside_ghost_box_are_ignored() {
        let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [8; NDIM], [false; NDIM]);
        let mut data = LevelData::new(CellBox::new([0; NDIM], [7; NDIM]), 0, 1);
        let kernel = KernelLibrary::new().lookup("IB_4").unwrap();
        spread_point(&kernel, &geometry, 1, &mut data, &[0.01; NDIM], &[1.0]);
        let total: f64 = data.values().iter().sum::<f64>() * geometry.cell_volume(1);
        assert!(total < 1.0);
        assert!(total > 0.0);
    }
}
