//! Compact-support delta-function kernels and stencil weights.
//!
//! Every kernel here is a one-dimensional function `phi(r)` of the distance
//! `r` measured in grid cells.  For any real offset the weights `phi(s - i)`
//! over the kernel's stencil are non-negative and sum to one (the discrete
//! partition of unity).  Multi-dimensional weights are tensor products of the
//! one-dimensional weights.
//!
//! Built-in kernels are looked up by name; additional kernels can be
//! registered with a [`KernelLibrary`] before the coupling layer is created.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{KernelError, Point, NDIM};

/// Largest stencil width any kernel may declare.
pub const MAX_STENCIL_WIDTH: usize = 8;

/// Name of the kernel used when none is configured.
pub const DEFAULT_KERNEL: &str = "IB_4";

/// Names of the built-in kernels.
pub const BUILTIN_KERNELS: [&str; 5] = ["PIECEWISE_LINEAR", "IB_3", "IB_4", "BSPLINE_3", "BSPLINE_4"];

// ---------------------------------------------------------------------------
// Built-in kernel functions
// ---------------------------------------------------------------------------

/// Piecewise-linear (hat) kernel, stencil width 2.
///
/// ```text
/// phi(r) = 1 - |r|   for |r| < 1
/// ```
pub fn piecewise_linear(r: f64) -> f64 {
    let r = r.abs();
    if r < 1.0 {
        1.0 - r
    } else {
        0.0
    }
}

/// Three-point immersed-boundary kernel (Roma, Peskin and Berger), stencil width 3.
///
/// ```text
/// phi(r) = (1 + sqrt(1 - 3r^2)) / 3                      for |r| <= 1/2
/// phi(r) = (5 - 3|r| - sqrt(1 - 3(1 - |r|)^2)) / 6       for 1/2 < |r| <= 3/2
/// ```
pub fn ib_3(r: f64) -> f64 {
    let r = r.abs();
    if r <= 0.5 {
        (1.0 + (1.0 - 3.0 * r * r).max(0.0).sqrt()) / 3.0
    } else if r <= 1.5 {
        let t = 1.0 - r;
        ((5.0 - 3.0 * r - (1.0 - 3.0 * t * t).max(0.0).sqrt()) / 6.0).max(0.0)
    } else {
        0.0
    }
}

/// Standard four-point immersed-boundary kernel (Peskin), stencil width 4.
///
/// ```text
/// phi(r) = (3 - 2|r| + sqrt(1 + 4|r| - 4r^2)) / 8        for |r| < 1
/// phi(r) = (5 - 2|r| - sqrt(-7 + 12|r| - 4r^2)) / 8      for 1 <= |r| < 2
/// ```
pub fn ib_4(r: f64) -> f64 {
    let r = r.abs();
    if r < 1.0 {
        (3.0 - 2.0 * r + (1.0 + 4.0 * r - 4.0 * r * r).max(0.0).sqrt()) / 8.0
    } else if r < 2.0 {
        ((5.0 - 2.0 * r - (-7.0 + 12.0 * r - 4.0 * r * r).max(0.0).sqrt()) / 8.0).max(0.0)
    } else {
        0.0
    }
}

/// Quadratic B-spline kernel, stencil width 3.
pub fn bspline_3(r: f64) -> f64 {
    let r = r.abs();
    if r < 0.5 {
        0.75 - r * r
    } else if r < 1.5 {
        let t = 1.5 - r;
        0.5 * t * t
    } else {
        0.0
    }
}

/// Cubic B-spline kernel, stencil width 4.
pub fn bspline_4(r: f64) -> f64 {
    let r = r.abs();
    if r < 1.0 {
        2.0 / 3.0 - r * r + 0.5 * r * r * r
    } else if r < 2.0 {
        let t = 2.0 - r;
        t * t * t / 6.0
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Stencils
// ---------------------------------------------------------------------------

/// Weights of one kernel evaluation along a single axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stencil1d {
    /// Index of the first cell covered by the stencil.
    pub start: i64,
    /// Number of cells covered.
    pub width: usize,
    /// Weight of cell `start + k` at position `k`; entries past `width` are zero.
    pub weights: [f64; MAX_STENCIL_WIDTH],
}

impl Stencil1d {
    /// Sum of the active weights.
    pub fn sum(&self) -> f64 {
        self.weights[..self.width].iter().sum()
    }

    /// Sum of the squared active weights.
    pub fn sum_of_squares(&self) -> f64 {
        self.weights[..self.width].iter().map(|w| w * w).sum()
    }
}

/// Tensor-product stencil over `NDIM` axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stencil {
    /// Per-axis one-dimensional stencils.
    pub axes: [Stencil1d; NDIM],
}

impl Stencil {
    /// Visit every cell of the stencil with its tensor-product weight.
    ///
    /// Axis 0 varies fastest.
    pub fn for_each<F: FnMut([i64; NDIM], f64)>(&self, mut f: F) {
        let mut offset = [0usize; NDIM];
        loop {
            let mut cell = [0i64; NDIM];
            let mut weight = 1.0;
            for d in 0..NDIM {
                cell[d] = self.axes[d].start + offset[d] as i64;
                weight *= self.axes[d].weights[offset[d]];
            }
            f(cell, weight);

            let mut d = 0;
            loop {
                offset[d] += 1;
                if offset[d] < self.axes[d].width {
                    break;
                }
                offset[d] = 0;
                d += 1;
                if d == NDIM {
                    return;
                }
            }
        }
    }

    /// Sum of all tensor-product weights.
    pub fn total_weight(&self) -> f64 {
        self.axes.iter().map(Stencil1d::sum).product()
    }
}

// ---------------------------------------------------------------------------
// DeltaKernel
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum KernelFn {
    Builtin(fn(f64) -> f64),
    Custom(Arc<dyn Fn(f64) -> f64 + Send + Sync>),
}

/// A named delta-function kernel together with its stencil width.
#[derive(Clone)]
pub struct DeltaKernel {
    name: String,
    stencil_width: usize,
    phi: KernelFn,
}

impl fmt::Debug for DeltaKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaKernel")
            .field("name", &self.name)
            .field("stencil_width", &self.stencil_width)
            .finish()
    }
}

impl PartialEq for DeltaKernel {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.stencil_width == other.stencil_width
    }
}

impl DeltaKernel {
    fn builtin(name: &str) -> Option<Self> {
        let (stencil_width, phi): (usize, fn(f64) -> f64) = match name {
            "PIECEWISE_LINEAR" => (2, piecewise_linear),
            "IB_3" => (3, ib_3),
            "IB_4" => (4, ib_4),
            "BSPLINE_3" => (3, bspline_3),
            "BSPLINE_4" => (4, bspline_4),
            _ => return None,
        };
        Some(Self {
            name: name.to_string(),
            stencil_width,
            phi: KernelFn::Builtin(phi),
        })
    }

    /// Kernel name as configured.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of cells the kernel touches along each axis.
    pub fn stencil_width(&self) -> usize {
        self.stencil_width
    }

    /// Minimum ghost-cell width needed to interpolate or spread with this kernel
    /// from any point inside a patch.
    pub fn min_ghost_width(&self) -> usize {
        self.stencil_width / 2 + 1
    }

    /// Evaluate the one-dimensional kernel at a distance `r` in cell units.
    #[inline]
    pub fn eval(&self, r: f64) -> f64 {
        match &self.phi {
            KernelFn::Builtin(f) => f(r),
            KernelFn::Custom(f) => f(r),
        }
    }

    /// One-dimensional stencil for a point at cell-center coordinate `s`.
    ///
    /// `s` is the position measured in cells from the center of cell 0, i.e.
    /// `s = (x - x_lower) / dx - 0.5`.
    pub fn stencil_1d(&self, s: f64) -> Stencil1d {
        let w = self.stencil_width;
        let start = if w % 2 == 0 {
            s.floor() as i64 - (w as i64 / 2 - 1)
        } else {
            (s + 0.5).floor() as i64 - (w as i64 - 1) / 2
        };
        let mut weights = [0.0; MAX_STENCIL_WIDTH];
        for (k, weight) in weights.iter_mut().take(w).enumerate() {
            *weight = self.eval(s - (start + k as i64) as f64);
        }
        Stencil1d {
            start,
            width: w,
            weights,
        }
    }

    /// Tensor-product stencil for a point `x` on a grid with lower corner
    /// `x_lower` and spacing `dx`.
    ///
    /// # Arguments
    /// * `x` - Physical position of the Lagrangian point.
    /// * `x_lower` - Physical lower corner of cell index 0.
    /// * `dx` - Grid spacing on the level.
    pub fn stencil(&self, x: &Point, x_lower: &Point, dx: &Point) -> Stencil {
        let axes = std::array::from_fn(|d| self.stencil_1d((x[d] - x_lower[d]) / dx[d] - 0.5));
        Stencil { axes }
    }
}

// ---------------------------------------------------------------------------
// KernelLibrary
// ---------------------------------------------------------------------------

/// Name-based kernel lookup with support for user-registered kernels.
#[derive(Clone, Default)]
pub struct KernelLibrary {
    custom: HashMap<String, DeltaKernel>,
}

impl fmt::Debug for KernelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("KernelLibrary").field("custom", &names).finish()
    }
}

impl KernelLibrary {
    /// Library containing only the built-in kernels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom kernel under `name`.
    ///
    /// The callback is evaluated at distances in cell units and must vanish
    /// outside `|r| < stencil_width / 2`.  Built-in names cannot be replaced.
    pub fn register<F>(&mut self, name: &str, stencil_width: usize, phi: F) -> Result<(), KernelError>
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        if BUILTIN_KERNELS.contains(&name) {
            return Err(KernelError::ReservedKernelName(name.to_string()));
        }
        if stencil_width == 0 || stencil_width > MAX_STENCIL_WIDTH {
            return Err(KernelError::InvalidStencilWidth {
                name: name.to_string(),
                width: stencil_width,
            });
        }
        let kernel = DeltaKernel {
            name: name.to_string(),
            stencil_width,
            phi: KernelFn::Custom(Arc::new(phi)),
        };
        tracing::debug!("registered custom delta kernel {} (width {})", name, stencil_width);
        self.custom.insert(name.to_string(), kernel);
        Ok(())
    }

    /// Look up a kernel by name.
    pub fn lookup(&self, name: &str) -> Result<DeltaKernel, KernelError> {
        DeltaKernel::builtin(name)
            .or_else(|| self.custom.get(name).cloned())
            .ok_or_else(|| KernelError::UnknownKernel(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_builtins() -> Vec<DeltaKernel> {
        let library = KernelLibrary::new();
        BUILTIN_KERNELS
            .iter()
            .map(|name| library.lookup(name).unwrap())
            .collect()
    }

    #[test]
    fn test_partition_of_unity() {
        for kernel in all_builtins() {
            for k in 0..200 {
                let s = -3.0 + 0.0371 * k as f64;
                let stencil = kernel.stencil_1d(s);
                assert!(
                    (stencil.sum() - 1.0).abs() < 1e-12,
                    "{} weights sum to {} at s = {}",
                    kernel.name(),
                    stencil.sum(),
                    s
                );
            }
        }
    }

    #[test]
    fn test_weights_non_negative() {
        for kernel in all_builtins() {
            for k in 0..100 {
                let s = 0.0173 * k as f64;
                let stencil = kernel.stencil_1d(s);
                assert!(stencil.weights.iter().all(|w| *w >= 0.0), "{} has negative weight", kernel.name());
            }
        }
    }

    #[test]
    fn test_kernels_symmetric() {
        for kernel in all_builtins() {
            for r in [0.1, 0.5, 0.9, 1.3, 1.7] {
                assert_eq!(kernel.eval(r), kernel.eval(-r));
            }
        }
    }

    #[test]
    fn test_stencil_start_even_and_odd() {
        let library = KernelLibrary::new();
        let ib4 = library.lookup("IB_4").unwrap();
        // s in [2, 3): cells 1..=4
        assert_eq!(ib4.stencil_1d(2.4).start, 1);
        let ib3 = library.lookup("IB_3").unwrap();
        // s rounds to 2: cells 1..=3
        assert_eq!(ib3.stencil_1d(2.4).start, 1);
        assert_eq!(ib3.stencil_1d(2.6).start, 2);
    }

    #[test]
    fn test_ib4_known_values() {
        assert!((ib_4(0.0) - 0.5).abs() < 1e-15);
        assert!((ib_4(1.0) - 0.125).abs() < 1e-15);
        assert_eq!(ib_4(2.0), 0.0);
    }

    #[test]
    fn test_min_ghost_width() {
        let library = KernelLibrary::new();
        assert_eq!(library.lookup("IB_4").unwrap().min_ghost_width(), 3);
        assert_eq!(library.lookup("PIECEWISE_LINEAR").unwrap().min_ghost_width(), 2);
        assert_eq!(library.lookup("IB_3").unwrap().min_ghost_width(), 2);
    }

    #[test]
    fn test_unknown_kernel() {
        let library = KernelLibrary::new();
        assert!(matches!(library.lookup("IB_5"), Err(KernelError::UnknownKernel(_))));
    }

    #[test]
    fn test_register_custom_kernel() {
        let mut library = KernelLibrary::new();
        library.register("TOP_HAT", 1, |r| if r.abs() < 0.5 { 1.0 } else { 0.0 }).unwrap();
        let kernel = library.lookup("TOP_HAT").unwrap();
        assert_eq!(kernel.stencil_width(), 1);
        let stencil = kernel.stencil_1d(3.2);
        assert_eq!(stencil.start, 3);
        assert_eq!(stencil.sum(), 1.0);

        assert!(library.register("IB_4", 4, ib_4).is_err());
        assert!(library.register("WIDE", 9, ib_4).is_err());
    }

    #[test]
    fn test_tensor_product_total_weight() {
        let kernel = KernelLibrary::new().lookup("BSPLINE_4").unwrap();
        let x = [0.337; NDIM];
        let stencil = kernel.stencil(&x, &[0.0; NDIM], &[0.1; NDIM]);
        let mut total = 0.0;
        let mut count = 0;
        stencil.for_each(|_, w| {
            total += w;
            count += 1;
        });
        assert_eq!(count, 4usize.pow(NDIM as u32));
        assert!((total - 1.0).abs() < 1e-12);
        assert!((stencil.total_weight() - 1.0).abs() < 1e-12);
    }
}
