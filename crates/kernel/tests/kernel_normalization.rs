//! Partition of unity for every built-in kernel, checked on a grid.
//!
//! Interpolating a constant field must return the constant for any point
//! position whose stencil stays inside the allocated data, and the
//! tensor-product weights over the full stencil must sum to one.

use ib_kernel::delta::BUILTIN_KERNELS;
use ib_kernel::{interpolate_point, GridGeometry, KernelLibrary, LevelData, NDIM};

fn sample_points(n: usize) -> Vec<[f64; NDIM]> {
    // Deterministic quasi-random offsets (golden-ratio sequence).
    let phi = 0.618_033_988_749_895_f64;
    (0..n)
        .map(|i| std::array::from_fn(|d| 0.3 + 0.4 * ((i * (d + 1)) as f64 * phi).fract()))
        .collect()
}

#[test]
fn weights_sum_to_one_for_random_offsets() {
    let library = KernelLibrary::new();
    let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [32; NDIM], [false; NDIM]);
    let dx = geometry.dx();

    for name in BUILTIN_KERNELS {
        let kernel = library.lookup(name).unwrap();
        for x in sample_points(50) {
            let stencil = kernel.stencil(&x, &geometry.x_lower, &dx);
            let mut total = 0.0;
            stencil.for_each(|_, w| {
                assert!(w >= 0.0, "{} produced negative weight {}", name, w);
                total += w;
            });
            assert!(
                (total - 1.0).abs() < 1e-12,
                "{}: weights at {:?} sum to {}",
                name,
                x,
                total
            );
        }
    }
}

#[test]
fn constant_field_is_reproduced() {
    let library = KernelLibrary::new();
    let geometry = GridGeometry::new([-1.0; NDIM], [1.0; NDIM], [20; NDIM], [false; NDIM]);
    let mut data = LevelData::new(geometry.domain_box(), 3, 2);
    data.fill(-2.5);

    for name in BUILTIN_KERNELS {
        let kernel = library.lookup(name).unwrap();
        for x in sample_points(20) {
            let mut out = [0.0; 2];
            interpolate_point(&kernel, &geometry, 1, &data, &x, &mut out);
            assert!((out[0] + 2.5).abs() < 1e-12, "{}: got {}", name, out[0]);
            assert!((out[1] + 2.5).abs() < 1e-12, "{}: got {}", name, out[1]);
        }
    }
}

#[test]
fn custom_kernel_participates_in_stencils() {
    let mut library = KernelLibrary::new();
    library
        .register("HAT_WIDE", 4, |r| {
            let r = r.abs() / 2.0;
            if r < 1.0 {
                (1.0 - r) / 2.0
            } else {
                0.0
            }
        })
        .unwrap();
    let kernel = library.lookup("HAT_WIDE").unwrap();
    assert_eq!(kernel.min_ghost_width(), 3);

    let stencil = kernel.stencil_1d(4.25);
    assert_eq!(stencil.start, 3);
    assert!((stencil.sum() - 1.0).abs() < 1e-12);
}
