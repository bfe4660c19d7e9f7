//! Error type for the coupling layer.
//!
//! Configuration, conservation, and lifecycle failures are fatal to a run:
//! they propagate to the driver, which reports them and stops.  Lookups that
//! can legitimately miss return `Option` instead.

use ib_kernel::KernelError;

use crate::ib_method::IntegratorState;

/// Errors raised by the data manager and the IB method.
#[derive(Debug, thiserror::Error)]
pub enum IbError {
    /// Kernel-layer failure (unknown kernel, layout mismatch, ...).
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The configured time-stepping scheme is not supported.
    #[error("unsupported time stepping type `{0}`; valid types are FORWARD_EULER, MIDPOINT_RULE, TRAPEZOIDAL_RULE")]
    UnsupportedTimeStepping(String),

    /// A restart record was written by an incompatible version.
    #[error("{object}: restart file version {found} differs from supported version {expected}")]
    RestartVersionMismatch {
        /// Object reading the record.
        object: String,
        /// Version this build understands.
        expected: u32,
        /// Version found in the record.
        found: u32,
    },

    /// Spread source strengths do not integrate to the prescribed total.
    #[error(
        "{object}::spread_fluid_source(): Lagrangian and Eulerian source/sink strengths are inconsistent: \
         grid integral = {grid_total:e}, sum of point strengths = {point_total:e}"
    )]
    SourceImbalance {
        /// Object performing the spread.
        object: String,
        /// Integral of the spread field.
        grid_total: f64,
        /// Sum of the point strengths.
        point_total: f64,
    },

    /// Sources were placed on a level other than the finest.
    #[error("sources are only supported on the finest level {finest}, found {count} on level {level}")]
    SourcesOffFinestLevel {
        /// Level holding the sources.
        level: usize,
        /// Finest level number.
        finest: usize,
        /// Number of sources on `level`.
        count: usize,
    },

    /// Boundary normalization failed to cancel the net source.
    #[error("{object}::spread_fluid_source(): external source/sink does not correctly offset net inflow/outflow into domain; integral = {integral:e}")]
    NormalizationResidual {
        /// Object performing the spread.
        object: String,
        /// Remaining integral after normalization.
        integral: f64,
    },

    /// An operation was called out of order.
    #[error("{object}: `{operation}` is not permitted in state {state:?}")]
    InvalidState {
        /// Object whose lifecycle was violated.
        object: String,
        /// Operation attempted.
        operation: &'static str,
        /// State at the time of the call.
        state: IntegratorState,
    },

    /// A data time matched none of the current, half, or new times.
    #[error("{object}: data time {time} is not the current ({current}), half ({half}), or new ({new}) time")]
    UnknownDataTime {
        /// Object performing the lookup.
        object: String,
        /// Requested time.
        time: f64,
        /// Current time.
        current: f64,
        /// Half time.
        half: f64,
        /// New time.
        new: f64,
    },

    /// The level holds no Lagrangian data.
    #[error("level {0} contains no Lagrangian data")]
    LevelWithoutLagrangianData(usize),

    /// A required per-level quantity is missing.
    #[error("quantity `{name}` is not available on level {level}")]
    MissingQuantity {
        /// Quantity name.
        name: String,
        /// Level number.
        level: usize,
    },

    /// A grid field index is unknown or unallocated.
    #[error("grid field {field} is not allocated on level {level}")]
    MissingField {
        /// Field index.
        field: usize,
        /// Level number.
        level: usize,
    },

    /// A grid field lacks the ghost cells a kernel stencil needs.
    #[error("grid field {field} has ghost width {found}, but the kernels require {required}")]
    InsufficientGhostWidth {
        /// Field index.
        field: usize,
        /// Required width.
        required: usize,
        /// Allocated width.
        found: usize,
    },

    /// The patch hierarchy has no such level.
    #[error("level {0} is not part of the patch hierarchy")]
    MissingLevel(usize),

    /// The patch hierarchy has not been provided yet.
    #[error("{0}: patch hierarchy has not been initialized")]
    HierarchyNotInitialized(String),

    /// Point data was used while a redistribution was staged.
    #[error("Lagrangian data redistribution is in progress")]
    RedistributionInProgress,

    /// `end_data_redistribution` without a matching begin.
    #[error("no Lagrangian data redistribution is in progress")]
    NoRedistributionInProgress,

    /// A node lies outside every patch of its level.
    #[error("Lagrangian node {lag_idx} on level {level} lies outside every patch")]
    NodeOutsideLevel {
        /// Level number.
        level: usize,
        /// Lagrangian index.
        lag_idx: usize,
    },

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type IbResult<T> = Result<T, IbError>;
