//! Interpolation and spreading throughput for a cloud of points.
//!
//! Run with: cargo bench -p ib-kernel --bench interaction

use std::time::Instant;

use ib_kernel::{interpolate_point, spread_point, GridGeometry, KernelLibrary, LevelData, NDIM};

fn main() {
    println!("=== Interpolation / Spreading Throughput ===\n");

    let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [64; NDIM], [true; NDIM]);
    let library = KernelLibrary::new();
    let points: Vec<[f64; NDIM]> = (0..20_000)
        .map(|i| std::array::from_fn(|d| ((i * (2 * d + 3)) as f64 * 0.618_033_988_749_895).fract()))
        .collect();

    for name in ["PIECEWISE_LINEAR", "IB_3", "IB_4", "BSPLINE_4"] {
        let kernel = library.lookup(name).unwrap();
        let mut field = LevelData::new(geometry.domain_box(), kernel.min_ghost_width(), NDIM);

        let start = Instant::now();
        for x in &points {
            spread_point(&kernel, &geometry, 1, &mut field, x, &[1.0; NDIM]);
        }
        let spread_time = start.elapsed();

        let start = Instant::now();
        let mut checksum = 0.0;
        let mut out = [0.0; NDIM];
        for x in &points {
            interpolate_point(&kernel, &geometry, 1, &field, x, &mut out);
            checksum += out[0];
        }
        let interp_time = start.elapsed();

        println!(
            "{:<18} spread {:>8.2} ms  interp {:>8.2} ms  ({} points, checksum {:.3e})",
            name,
            spread_time.as_secs_f64() * 1e3,
            interp_time.as_secs_f64() * 1e3,
            points.len(),
            checksum
        );
    }
}
