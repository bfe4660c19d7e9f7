//! Interpolation and spreading are adjoint.
//!
//! Spreading a unit force from a point and interpolating the resulting field
//! back at the same point returns the kernel's self-overlap
//! `prod_d sum_i w_{d,i}^2 / h^d`.  For two different points the transfer is
//! symmetric: spreading from A and reading at B equals spreading from B and
//! reading at A.

use ib_kernel::{interpolate_point, self_overlap, spread_point, GridGeometry, KernelLibrary, LevelData, NDIM};

fn geometry() -> GridGeometry {
    GridGeometry::new([0.0; NDIM], [2.0; NDIM], [24; NDIM], [false; NDIM])
}

fn unit_x() -> [f64; NDIM] {
    let mut v = [0.0; NDIM];
    v[0] = 1.0;
    v
}

#[test]
fn spread_then_interpolate_returns_self_overlap() {
    let geometry = geometry();
    let library = KernelLibrary::new();
    for name in ["PIECEWISE_LINEAR", "IB_3", "IB_4", "BSPLINE_3", "BSPLINE_4"] {
        let kernel = library.lookup(name).unwrap();
        let x = [0.913; NDIM];
        let mut data = LevelData::new(geometry.domain_box(), 3, NDIM);
        spread_point(&kernel, &geometry, 1, &mut data, &x, &unit_x());

        let mut u = [0.0; NDIM];
        interpolate_point(&kernel, &geometry, 1, &data, &x, &mut u);
        let expected = self_overlap(&kernel, &geometry, 1, &x);
        assert!(
            (u[0] - expected).abs() <= 1e-12 * expected,
            "{}: interpolated {} expected {}",
            name,
            u[0],
            expected
        );
        for v in &u[1..] {
            assert!(v.abs() < 1e-15);
        }
    }
}

#[test]
fn transfer_between_two_points_is_symmetric() {
    let geometry = geometry();
    let kernel = KernelLibrary::new().lookup("IB_4").unwrap();
    let a = [0.91; NDIM];
    let b = [1.02; NDIM];

    let mut from_a = LevelData::new(geometry.domain_box(), 3, NDIM);
    spread_point(&kernel, &geometry, 1, &mut from_a, &a, &unit_x());
    let mut at_b = [0.0; NDIM];
    interpolate_point(&kernel, &geometry, 1, &from_a, &b, &mut at_b);

    let mut from_b = LevelData::new(geometry.domain_box(), 3, NDIM);
    spread_point(&kernel, &geometry, 1, &mut from_b, &b, &unit_x());
    let mut at_a = [0.0; NDIM];
    interpolate_point(&kernel, &geometry, 1, &from_b, &a, &mut at_a);

    assert!(at_b[0] > 0.0);
    assert!((at_a[0] - at_b[0]).abs() < 1e-12 * at_a[0]);
}
