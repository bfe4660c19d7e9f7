//! Immersed-Boundary Coupling Kernel
//!
//! This crate provides the numerical leaf layer for coupling Lagrangian point
//! data to block-structured Cartesian grids. It is independent of any
//! particular fluid solver.
//!
//! # Modules
//! - [`delta`] -- Delta-function kernels, stencil weights, and the kernel library.
//! - [`grid`] -- Cell boxes, grid geometry, patch levels, and cell-centered field storage.
//! - [`interaction`] -- Kernel-weighted interpolation and spreading for single points.
//! - [`lnode`] -- Lagrangian node records and their attached specs.
//! - [`lmesh`] -- Local/ghost partitioning of a level's nodes across ranks.
//! - [`ldata`] -- Distributed per-node vectors with ghost regions and dirty tracking.

#![warn(missing_docs)]

pub mod delta;
pub mod grid;
pub mod interaction;
pub mod ldata;
pub mod lmesh;
pub mod lnode;

pub use delta::{DeltaKernel, KernelLibrary, Stencil, Stencil1d, DEFAULT_KERNEL};
pub use grid::{CellBox, CellIndex, FieldStore, GridGeometry, LevelData, Patch, PatchHierarchy, PatchLevel};
pub use interaction::{interpolate_point, self_overlap, spread_point};
pub use ldata::{LData, LDataPart, LocalArrayMut};
pub use lmesh::{LMesh, RankNodes};
pub use lnode::{AnchorPointSpec, InstrumentationSpec, LNode, NodeSpecs, RodForceSpec, SourceSpec};

/// Spatial dimension of the grid and of every Lagrangian point.
#[cfg(not(feature = "dim2"))]
pub const NDIM: usize = 3;

/// Spatial dimension of the grid and of every Lagrangian point.
#[cfg(feature = "dim2")]
pub const NDIM: usize = 2;

/// A physical-space position or vector.
pub type Point = [f64; NDIM];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by the kernel layer.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// No built-in or registered kernel has this name.
    #[error("unknown delta-function kernel `{0}`")]
    UnknownKernel(String),

    /// A custom kernel tried to take a built-in name.
    #[error("kernel name `{0}` is reserved for a built-in kernel")]
    ReservedKernelName(String),

    /// A custom kernel declared an unusable stencil width.
    #[error("invalid stencil width {width} for kernel `{name}`")]
    InvalidStencilWidth {
        /// Kernel name.
        name: String,
        /// Declared width.
        width: usize,
    },

    /// Two vectors used together do not share a layout.
    #[error("layout mismatch between `{left}` and `{right}`")]
    LayoutMismatch {
        /// First vector.
        left: String,
        /// Second vector.
        right: String,
    },

    /// A node was assigned to a rank outside the communicator.
    #[error("rank {rank} out of range for {num_ranks} ranks")]
    InvalidRank {
        /// Offending rank.
        rank: usize,
        /// Number of ranks.
        num_ranks: usize,
    },

    /// A Lagrangian index was owned by more than one rank.
    #[error("Lagrangian index {0} is owned by more than one rank")]
    DuplicateNode(usize),

    /// A ghost request named a Lagrangian index nobody owns.
    #[error("Lagrangian index {0} is not owned by any rank")]
    UnknownNode(usize),
}
