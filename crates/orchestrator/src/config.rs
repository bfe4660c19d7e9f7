//! Configuration parsing and validation for immersed-boundary runs

use std::fmt;
use std::fs;
use std::str::FromStr;

use ib_kernel::{GridGeometry, KernelLibrary, PatchHierarchy, Point, DEFAULT_KERNEL, NDIM};
use serde::{Deserialize, Serialize};

use crate::error::{IbError, IbResult};
use crate::init::StructureSpec;
use crate::runner::RunControl;

/// Explicit time-stepping scheme for the Lagrangian positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeSteppingType {
    /// X_new = X_current + dt U(current)
    #[serde(rename = "FORWARD_EULER")]
    ForwardEuler,
    /// X_new = X_current + dt U(half)
    #[serde(rename = "MIDPOINT_RULE")]
    MidpointRule,
    /// X_new = X_current + dt/2 (U(current) + U(new))
    #[serde(rename = "TRAPEZOIDAL_RULE")]
    TrapezoidalRule,
}

impl FromStr for TimeSteppingType {
    type Err = IbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FORWARD_EULER" => Ok(Self::ForwardEuler),
            "MIDPOINT_RULE" => Ok(Self::MidpointRule),
            "TRAPEZOIDAL_RULE" => Ok(Self::TrapezoidalRule),
            other => Err(IbError::UnsupportedTimeStepping(other.to_string())),
        }
    }
}

impl fmt::Display for TimeSteppingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ForwardEuler => "FORWARD_EULER",
            Self::MidpointRule => "MIDPOINT_RULE",
            Self::TrapezoidalRule => "TRAPEZOIDAL_RULE",
        };
        f.write_str(name)
    }
}

/// Settings of one IB method instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IBMethodConfig {
    /// Kernel used to interpolate grid velocity to the points
    #[serde(default = "default_kernel")]
    pub interp_kernel_fcn: String,
    /// Kernel used to spread point forces to the grid
    #[serde(default = "default_kernel")]
    pub spread_kernel_fcn: String,
    /// Lower bound on the ghost width; raised to what the kernels need
    #[serde(default)]
    pub min_ghost_cell_width: Option<usize>,
    /// Cancel the net point source by a uniform sink on the outer boundary
    #[serde(default)]
    pub normalize_source_strength: bool,
    /// Log flow-meter totals and source diagnostics
    #[serde(default)]
    pub do_log: bool,
    /// Interpolate and spread at frozen positions X_LE instead of X
    #[serde(default)]
    pub use_fixed_coupling_ops: bool,
    /// Position update scheme: FORWARD_EULER, MIDPOINT_RULE, TRAPEZOIDAL_RULE
    #[serde(default = "default_time_stepping_type")]
    pub time_stepping_type: String,
}

fn default_kernel() -> String {
    DEFAULT_KERNEL.to_string()
}

fn default_time_stepping_type() -> String {
    TimeSteppingType::ForwardEuler.to_string()
}

impl Default for IBMethodConfig {
    fn default() -> Self {
        Self {
            interp_kernel_fcn: default_kernel(),
            spread_kernel_fcn: default_kernel(),
            min_ghost_cell_width: None,
            normalize_source_strength: false,
            do_log: false,
            use_fixed_coupling_ops: false,
            time_stepping_type: default_time_stepping_type(),
        }
    }
}

impl IBMethodConfig {
    /// Parsed time-stepping scheme
    pub fn time_stepping(&self) -> IbResult<TimeSteppingType> {
        self.time_stepping_type.parse()
    }

    /// Validate against the built-in kernels plus those in `library`
    pub fn validate(&self, library: &KernelLibrary) -> IbResult<()> {
        library.lookup(&self.interp_kernel_fcn)?;
        library.lookup(&self.spread_kernel_fcn)?;
        self.time_stepping()?;
        Ok(())
    }
}

/// Cartesian grid and decomposition for a single-level run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Physical lower corner
    pub x_lower: Point,
    /// Physical upper corner
    pub x_upper: Point,
    /// Cells per axis
    pub num_cells: [i64; NDIM],
    /// Periodicity per axis
    #[serde(default)]
    pub periodic: [bool; NDIM],
    /// Patches per axis
    #[serde(default = "default_chop")]
    pub chop: [i64; NDIM],
    /// Number of simulated ranks
    #[serde(default = "default_num_ranks")]
    pub num_ranks: usize,
}

fn default_chop() -> [i64; NDIM] {
    [1; NDIM]
}

fn default_num_ranks() -> usize {
    1
}

impl GridConfig {
    /// Validate extents and decomposition
    pub fn validate(&self) -> Result<(), String> {
        for d in 0..NDIM {
            if self.x_lower[d] >= self.x_upper[d] {
                return Err(format!("Grid x_lower[{}] must be less than x_upper[{}]", d, d));
            }
            if self.num_cells[d] <= 0 {
                return Err(format!("Grid num_cells[{}] must be positive", d));
            }
            if self.chop[d] <= 0 || self.chop[d] > self.num_cells[d] {
                return Err(format!("Grid chop[{}] must be in 1..=num_cells[{}]", d, d));
            }
        }
        if self.num_ranks == 0 {
            return Err("num_ranks must be at least 1".to_string());
        }
        Ok(())
    }

    /// Single-level hierarchy described by this config
    pub fn build_hierarchy(&self) -> PatchHierarchy {
        let geometry = GridGeometry::new(self.x_lower, self.x_upper, self.num_cells, self.periodic);
        PatchHierarchy::uniform(geometry, self.chop, self.num_ranks)
    }
}

/// Main simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Human-readable simulation name
    pub name: String,
    /// IB method settings
    #[serde(default)]
    pub ib_method: IBMethodConfig,
    /// Grid settings
    pub grid: GridConfig,
    /// Structures placed on the grid at the initial time
    #[serde(default)]
    pub structures: Vec<StructureSpec>,
    /// Flow meter names, indexed by meter number
    #[serde(default)]
    pub instrument_names: Vec<String>,
    /// Time step size
    #[serde(default = "default_dt")]
    pub dt: f64,
    /// Stop after this many steps
    pub max_timesteps: Option<u64>,
    /// Stop at this simulation time
    #[serde(default)]
    pub max_time: Option<f64>,
    /// Steps between redistributions of the Lagrangian data
    #[serde(default)]
    pub regrid_interval: Option<u64>,
    /// Steps between recorded restart states
    #[serde(default)]
    pub restart_interval: Option<u64>,
}

fn default_dt() -> f64 {
    1.0e-3
}

impl SimulationConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &str) -> IbResult<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| IbError::Config(format!("Failed to read config file {}: {}", path, e)))?;
        let config: SimulationConfig = serde_json::from_str(&contents)
            .map_err(|e| IbError::Config(format!("Failed to parse config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Stopping rules and intervals for the simulation runner
    pub fn run_control(&self) -> RunControl {
        RunControl {
            dt: self.dt,
            max_timesteps: self.max_timesteps,
            max_time: self.max_time,
            regrid_interval: self.regrid_interval,
            restart_interval: self.restart_interval,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> IbResult<()> {
        self.ib_method.validate(&KernelLibrary::new())?;
        self.grid.validate().map_err(IbError::Config)?;
        if self.dt <= 0.0 {
            return Err(IbError::Config("dt must be positive".to_string()));
        }
        if let Some(max_timesteps) = self.max_timesteps {
            if max_timesteps == 0 {
                return Err(IbError::Config("max_timesteps must be at least 1".to_string()));
            }
        }
        if self.max_timesteps.is_none() && self.max_time.is_none() {
            return Err(IbError::Config("one of max_timesteps or max_time is required".to_string()));
        }
        for (name, interval) in [("regrid_interval", self.regrid_interval), ("restart_interval", self.restart_interval)] {
            if interval == Some(0) {
                return Err(IbError::Config(format!("{} must be at least 1", name)));
            }
        }
        for structure in &self.structures {
            structure.validate().map_err(IbError::Config)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> GridConfig {
        GridConfig {
            x_lower: [0.0; NDIM],
            x_upper: [1.0; NDIM],
            num_cells: [8; NDIM],
            periodic: [true; NDIM],
            chop: [2; NDIM],
            num_ranks: 2,
        }
    }

    #[test]
    fn test_defaults_from_empty_json() {
        let config: IBMethodConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, IBMethodConfig::default());
        assert_eq!(config.interp_kernel_fcn, "IB_4");
        assert_eq!(config.time_stepping().unwrap(), TimeSteppingType::ForwardEuler);
        assert!(config.validate(&KernelLibrary::new()).is_ok());
    }

    #[test]
    fn test_unknown_kernel_rejected() {
        let config = IBMethodConfig {
            spread_kernel_fcn: "GAUSSIAN".to_string(),
            ..IBMethodConfig::default()
        };
        assert!(matches!(
            config.validate(&KernelLibrary::new()),
            Err(IbError::Kernel(ib_kernel::KernelError::UnknownKernel(_)))
        ));
    }

    #[test]
    fn test_unsupported_time_stepping() {
        let config = IBMethodConfig {
            time_stepping_type: "BACKWARD_EULER".to_string(),
            ..IBMethodConfig::default()
        };
        assert!(matches!(
            config.validate(&KernelLibrary::new()),
            Err(IbError::UnsupportedTimeStepping(_))
        ));
    }

    #[test]
    fn test_grid_validation() {
        let mut g = grid();
        assert!(g.validate().is_ok());
        g.chop[0] = 9;
        assert!(g.validate().is_err());
        g.chop[0] = 2;
        g.x_upper[0] = 0.0;
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_build_hierarchy() {
        let hierarchy = grid().build_hierarchy();
        assert_eq!(hierarchy.num_levels(), 1);
        assert_eq!(hierarchy.num_ranks(), 2);
        assert_eq!(hierarchy.level(0).unwrap().patches.len(), 2usize.pow(NDIM as u32));
    }

    #[test]
    fn test_simulation_config_validation() {
        let mut config = SimulationConfig {
            name: "test".to_string(),
            ib_method: IBMethodConfig::default(),
            grid: grid(),
            structures: Vec::new(),
            instrument_names: Vec::new(),
            dt: default_dt(),
            max_timesteps: Some(10),
            max_time: None,
            regrid_interval: Some(5),
            restart_interval: None,
        };
        assert!(config.validate().is_ok());
        let control = config.run_control();
        assert_eq!(control.max_timesteps, Some(10));
        assert_eq!(control.regrid_interval, Some(5));
        config.dt = 0.0;
        assert!(config.validate().is_err());
        config.dt = 0.1;
        config.max_timesteps = Some(0);
        assert!(config.validate().is_err());
        // a run must have some way to stop
        config.max_timesteps = None;
        assert!(config.validate().is_err());
        config.max_time = Some(1.0);
        assert!(config.validate().is_ok());
        config.regrid_interval = Some(0);
        assert!(config.validate().is_err());
    }
}
