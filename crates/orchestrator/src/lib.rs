//! Orchestration Layer
//!
//! This crate couples Lagrangian structures to a fluid on a block-structured
//! Cartesian grid:
//! - Lagrangian data management across levels and ranks ([`ldata_manager`])
//! - Immersed-boundary time integration ([`ib_method`])
//! - Force, source and post-processing strategies ([`strategies`])
//! - Fluid sources, flow meters and restart records
//! - Coupled stepping and the run loop ([`runner`])
//! - Workload-driven load balancing ([`distributed`])

#![warn(missing_docs)]

pub mod config;
pub mod distributed;
pub mod error;
pub mod eulerian_force;
pub mod ib_method;
pub mod init;
pub mod instrument;
pub mod ldata_manager;
pub mod restart;
pub mod runner;
pub mod schedules;
pub mod sources;
pub mod strategies;

pub use config::{GridConfig, IBMethodConfig, SimulationConfig, TimeSteppingType};
pub use error::{IbError, IbResult};
pub use ib_method::{IBMethod, IntegratorState};
pub use ldata_manager::LDataManager;
pub use runner::{CoupledStepper, FluidSolver, RunControl, RunSummary, SimulationRunner};

use ib_kernel::{FieldStore, PatchHierarchy};

use crate::init::StandardInitializer;

/// Build an IB method and its grid from a loaded configuration.
///
/// The structures of the configuration are registered as the initial
/// structure layout; the hierarchy is not yet initialized.
pub fn create_ib_method(config: &SimulationConfig) -> IbResult<(IBMethod, PatchHierarchy)> {
    config.validate()?;
    let mut ib = IBMethod::new(&config.name, config.ib_method.clone())?;
    ib.register_init_strategy(Box::new(StandardInitializer::new(
        config.structures.clone(),
        config.instrument_names.clone(),
    )));
    let hierarchy = config.grid.build_hierarchy();
    tracing::info!(
        "{}: {} structure(s) on a {:?} grid over {} rank(s)",
        config.name,
        config.structures.len(),
        config.grid.num_cells,
        hierarchy.num_ranks()
    );
    Ok((ib, hierarchy))
}

/// Create a complete coupled simulation from a configuration file
///
/// `make_solver` registers the fluid solver's fields (with at least the
/// given ghost width) and returns the solver.  The returned runner is
/// initialized; [`SimulationRunner::run`] steps it to the configured limit.
///
/// # Example
/// ```no_run
/// use ib_kernel::NDIM;
/// use ib_orchestrator::create_simulation;
/// use ib_orchestrator::runner::PrescribedFlow;
///
/// let mut runner = create_simulation("config/tethered_ring.json", |fields, ghosts| {
///     Box::new(PrescribedFlow::new(fields, ghosts, [0.0; NDIM]))
/// })?;
/// runner.run()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn create_simulation<F>(config_path: &str, make_solver: F) -> IbResult<SimulationRunner>
where
    F: FnOnce(&mut FieldStore, usize) -> Box<dyn FluidSolver>,
{
    tracing::info!("Creating simulation from config: {}", config_path);
    let config = SimulationConfig::load(config_path)?;
    let (ib, hierarchy) = create_ib_method(&config)?;

    let mut fields = FieldStore::new();
    let solver = make_solver(&mut fields, ib.minimum_ghost_cell_width());
    let mut stepper = CoupledStepper::new(ib, hierarchy, fields, solver);
    stepper.initialize(0.0)?;

    tracing::info!("Simulation ready to start");
    SimulationRunner::new(stepper, config.run_control())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ib_kernel::NDIM;

    fn config_json() -> String {
        let point = |v: f64| serde_json::to_string(&[v; NDIM]).unwrap();
        format!(
            r#"{{
                "name": "tethered",
                "ib_method": {{ "time_stepping_type": "MIDPOINT_RULE" }},
                "grid": {{
                    "x_lower": {lo},
                    "x_upper": {hi},
                    "num_cells": {n},
                    "periodic": {periodic}
                }},
                "structures": [{{
                    "name": "marker",
                    "level_number": 0,
                    "vertices": [{x}]
                }}],
                "dt": 0.01,
                "max_timesteps": 3
            }}"#,
            lo = point(0.0),
            hi = point(1.0),
            n = serde_json::to_string(&[8; NDIM]).unwrap(),
            periodic = serde_json::to_string(&[true; NDIM]).unwrap(),
            x = point(0.5),
        )
    }

    #[test]
    fn test_create_ib_method() {
        let config: SimulationConfig = serde_json::from_str(&config_json()).unwrap();
        let (ib, hierarchy) = create_ib_method(&config).unwrap();
        assert_eq!(ib.time_stepping_type(), TimeSteppingType::MidpointRule);
        assert_eq!(ib.state(), IntegratorState::Idle);
        assert_eq!(hierarchy.num_levels(), 1);
    }

    #[test]
    fn test_create_simulation_runs_to_completion() {
        let path = std::env::temp_dir().join(format!("ib_sim_{}.json", std::process::id()));
        std::fs::write(&path, config_json()).unwrap();
        let mut runner = create_simulation(path.to_str().unwrap(), |fields, ghosts| {
            Box::new(runner::PrescribedFlow::new(fields, ghosts, [1.0; NDIM]))
        })
        .unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(runner.run().unwrap().steps, 3);
        let stepper = runner.into_stepper();
        assert_eq!(stepper.step_count(), 3);
        let x = stepper
            .ib_method()
            .l_data_manager()
            .gather_ldata(ldata_manager::POSN_DATA_NAME, 0)
            .unwrap();
        assert!(x.iter().all(|v| (v - 0.53).abs() < 1e-12));
    }
}
