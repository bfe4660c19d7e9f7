//! Coupled fluid-structure stepping
//!
//! [`CoupledStepper`] sequences the sub-steps of one explicit IB time step
//! against a [`FluidSolver`].  [`SimulationRunner`] repeats steps until a
//! step or time limit, regridding and recording restart state on the way.

use std::time::Instant;

use tracing::{debug, error, info};

use ib_kernel::{FieldStore, GridGeometry, LevelData, PatchHierarchy, Point, NDIM};

use crate::config::TimeSteppingType;
use crate::distributed::{rebalance_level, LoadBalanceReport};
use crate::error::{IbError, IbResult};
use crate::eulerian_force::{BodyForce, EulerianForceFunction};
use crate::ib_method::IBMethod;
use crate::restart::RestartRecord;
use crate::schedules::{
    CoarsenAverage, CoarsenSchedules, ConstantProlongation, GhostFillSchedule, RefineSchedule, RefineSchedules,
    ReflectGhostContributions,
};

/// The Navier-Stokes side of the coupling.
///
/// The solver owns the meaning of its fields; the stepper only needs to know
/// which of them hold the velocity, the force density the IB method spreads
/// into, and optionally the pressure and the fluid source density.
pub trait FluidSolver: Send {
    /// Cell-centered velocity field (depth `NDIM`).
    fn velocity_index(&self) -> usize;

    /// Cell-centered body force field (depth `NDIM`) read during `advance`.
    fn force_index(&self) -> usize;

    /// Cell-centered pressure field, if the solver has one.
    fn pressure_index(&self) -> Option<usize> {
        None
    }

    /// Cell-centered source density field, if the solver accepts sources.
    fn source_index(&self) -> Option<usize> {
        None
    }

    /// Advance the fluid from `current_time` to `new_time` with the body
    /// force currently stored in the force field.
    fn advance(
        &mut self,
        fields: &mut FieldStore,
        hierarchy: &PatchHierarchy,
        current_time: f64,
        new_time: f64,
    ) -> IbResult<()>;
}

/// A fluid whose velocity is prescribed and unaffected by forces.
///
/// The velocity is `u0 + shear * (x[1] - y0) e_0`: uniform flow plus an
/// optional simple shear in the first direction.
#[derive(Debug, Clone)]
pub struct PrescribedFlow {
    u_idx: usize,
    f_idx: usize,
    p_idx: Option<usize>,
    u0: Point,
    shear: f64,
    y0: f64,
}

impl PrescribedFlow {
    /// Register the velocity, force and pressure fields with ghost width
    /// `ghosts` and return the flow.
    pub fn new(fields: &mut FieldStore, ghosts: usize, u0: Point) -> Self {
        let u_idx = fields.register("u", NDIM, ghosts);
        let f_idx = fields.register("f", NDIM, ghosts);
        let p_idx = fields.register("p", 1, ghosts);
        Self {
            u_idx,
            f_idx,
            p_idx: Some(p_idx),
            u0,
            shear: 0.0,
            y0: 0.0,
        }
    }

    /// Add a simple shear `shear * (x[1] - y0)` to the first component.
    pub fn with_shear(mut self, shear: f64, y0: f64) -> Self {
        self.shear = shear;
        self.y0 = y0;
        self
    }

    fn fill_level(&self, data: &mut LevelData, geometry: &GridGeometry, ratio: i64) {
        let cells: Vec<_> = data.ghost_box().cells().collect();
        for cell in cells {
            let x = geometry.cell_center(&cell, ratio);
            for d in 0..NDIM {
                let mut u = self.u0[d];
                if d == 0 && NDIM > 1 {
                    u += self.shear * (x[1] - self.y0);
                }
                data.set(&cell, d, u);
            }
        }
    }
}

impl FluidSolver for PrescribedFlow {
    fn velocity_index(&self) -> usize {
        self.u_idx
    }

    fn force_index(&self) -> usize {
        self.f_idx
    }

    fn pressure_index(&self) -> Option<usize> {
        self.p_idx
    }

    fn advance(
        &mut self,
        fields: &mut FieldStore,
        hierarchy: &PatchHierarchy,
        _current_time: f64,
        _new_time: f64,
    ) -> IbResult<()> {
        for ln in 0..hierarchy.num_levels() {
            let ratio = hierarchy.level(ln).map_or(1, |l| l.ratio_to_level_zero);
            let data = fields
                .level_data_mut(self.u_idx, ln)
                .ok_or(IbError::MissingField { field: self.u_idx, level: ln })?;
            self.fill_level(data, &hierarchy.geometry, ratio);
        }
        Ok(())
    }
}

/// One IB method, its grid, and the fluid solver, stepped together.
pub struct CoupledStepper {
    ib: IBMethod,
    hierarchy: PatchHierarchy,
    fields: FieldStore,
    solver: Box<dyn FluidSolver>,
    u_ghost_fill: RefineSchedules,
    u_synch: CoarsenSchedules,
    p_ghost_fill: RefineSchedules,
    f_prolongation: RefineSchedules,
    f_bdry_op: ReflectGhostContributions,
    f_ib_idx: usize,
    eulerian_force: EulerianForceFunction,
    time: f64,
    step: u64,
}

impl CoupledStepper {
    /// Combine the pieces; the solver's fields must already be registered.
    ///
    /// A scratch field `f_ib` receives the spread IB force, which is then
    /// added to any registered body force in the solver's force field.
    pub fn new(ib: IBMethod, hierarchy: PatchHierarchy, mut fields: FieldStore, solver: Box<dyn FluidSolver>) -> Self {
        let f_idx = solver.force_index();
        let f_ghosts = fields.ghost_width(f_idx).unwrap_or(0).max(ib.minimum_ghost_cell_width());
        let f_ib_idx = fields.register("f_ib", NDIM, f_ghosts);
        let mut stepper = Self {
            ib,
            hierarchy,
            fields,
            solver,
            u_ghost_fill: Vec::new(),
            u_synch: Vec::new(),
            p_ghost_fill: Vec::new(),
            f_prolongation: Vec::new(),
            f_bdry_op: ReflectGhostContributions::default(),
            f_ib_idx,
            eulerian_force: EulerianForceFunction::new(f_ib_idx),
            time: 0.0,
            step: 0,
        };
        stepper.rebuild_schedules();
        stepper
    }

    /// Add a prescribed body force to the force the fluid sees.
    pub fn register_body_force(&mut self, body_force: Box<dyn BodyForce>) {
        self.eulerian_force.register_body_force(body_force);
    }

    fn rebuild_schedules(&mut self) {
        let u_idx = self.solver.velocity_index();
        let f_idx = self.f_ib_idx;
        self.u_ghost_fill = GhostFillSchedule::for_hierarchy(u_idx, &self.hierarchy);
        self.u_synch = CoarsenAverage::for_hierarchy(u_idx, &self.hierarchy);
        self.p_ghost_fill = match self.solver.pressure_index() {
            Some(p_idx) => GhostFillSchedule::for_hierarchy(p_idx, &self.hierarchy),
            None => Vec::new(),
        };
        self.f_prolongation = (0..self.hierarchy.num_levels())
            .map(|level_number| {
                (level_number > 0).then(|| {
                    Box::new(ConstantProlongation {
                        field_idx: f_idx,
                        level_number,
                    }) as Box<dyn RefineSchedule>
                })
            })
            .collect();
    }

    /// Allocate the fields, let the solver set the initial flow, and build
    /// the Lagrangian data at `start_time`.
    pub fn initialize(&mut self, start_time: f64) -> IbResult<()> {
        self.fields.allocate_all(&self.hierarchy);
        self.eulerian_force.set_data_on_patch_hierarchy(
            &mut self.fields,
            self.solver.force_index(),
            &self.hierarchy,
            start_time,
            true,
        )?;
        self.solver
            .advance(&mut self.fields, &self.hierarchy, start_time, start_time)?;
        let u_idx = self.solver.velocity_index();
        self.ib.initialize_patch_hierarchy(
            &self.hierarchy,
            &mut self.fields,
            u_idx,
            &self.u_synch,
            &self.u_ghost_fill,
            0,
            start_time,
            true,
        )?;
        self.ib.free_init_strategy();
        self.time = start_time;
        self.step = 0;
        Ok(())
    }

    /// Take one step of size `dt` with the configured scheme.
    pub fn step(&mut self, dt: f64) -> IbResult<()> {
        let current_time = self.time;
        let new_time = current_time + dt;
        let half_time = current_time + 0.5 * dt;
        let u_idx = self.solver.velocity_index();
        let f_idx = self.solver.force_index();
        let scheme = self.ib.time_stepping_type();

        self.ib.preprocess_integrate_data(current_time, new_time, 1)?;
        self.ib.interpolate_velocity(
            &mut self.fields,
            u_idx,
            &self.u_synch,
            &self.u_ghost_fill,
            current_time,
        )?;

        // the predictor also serves the half-time force of the second-order schemes
        let force_time = match scheme {
            TimeSteppingType::ForwardEuler => current_time,
            TimeSteppingType::MidpointRule | TimeSteppingType::TrapezoidalRule => {
                self.ib.euler_step(current_time, new_time)?;
                half_time
            }
        };
        self.ib.compute_lagrangian_force(force_time)?;
        self.fields.set_to_scalar(self.f_ib_idx, 0.0);
        self.ib.spread_force(
            &mut self.fields,
            self.f_ib_idx,
            Some(&self.f_bdry_op),
            &self.f_prolongation,
            force_time,
        )?;
        self.eulerian_force
            .set_data_on_patch_hierarchy(&mut self.fields, f_idx, &self.hierarchy, force_time, false)?;

        let source_idx = self.solver.source_index().filter(|_| self.ib.has_fluid_sources());
        if let Some(q_idx) = source_idx {
            self.ib.compute_lagrangian_fluid_source(force_time)?;
            self.fields.set_to_scalar(q_idx, 0.0);
            self.ib.spread_fluid_source(&mut self.fields, q_idx, force_time)?;
        }

        if scheme == TimeSteppingType::ForwardEuler {
            self.ib.euler_step(current_time, new_time)?;
        }
        self.solver
            .advance(&mut self.fields, &self.hierarchy, current_time, new_time)?;
        self.ib.interpolate_velocity(
            &mut self.fields,
            u_idx,
            &self.u_synch,
            &self.u_ghost_fill,
            new_time,
        )?;
        match scheme {
            TimeSteppingType::ForwardEuler => {}
            TimeSteppingType::MidpointRule => self.ib.midpoint_step(current_time, new_time)?,
            TimeSteppingType::TrapezoidalRule => self.ib.trapezoidal_step(current_time, new_time)?,
        }
        if let (Some(_), Some(p_idx)) = (source_idx, self.solver.pressure_index()) {
            self.ib.interpolate_pressure(&self.fields, p_idx, new_time)?;
        }
        self.ib.postprocess_integrate_data(current_time, new_time, 1)?;

        self.step += 1;
        self.time = new_time;
        if let Some(p_idx) = self.solver.pressure_index() {
            self.ib.update_ib_instrumentation_data(
                &mut self.fields,
                u_idx,
                p_idx,
                &self.u_ghost_fill,
                &self.p_ghost_fill,
                self.step,
                new_time,
            )?;
        }
        self.ib.post_process_data(&self.fields, new_time)
    }

    /// Redistribute the patches of every level by workload and move the
    /// Lagrangian data to the new owners.
    pub fn rebalance(&mut self) -> IbResult<Vec<LoadBalanceReport>> {
        let workloads = self.ib.update_workload_estimates()?;
        self.ib.begin_data_redistribution()?;
        let mut reports = Vec::with_capacity(workloads.len());
        for (ln, level_workloads) in workloads.iter().enumerate() {
            reports.push(rebalance_level(&mut self.hierarchy, ln, level_workloads)?);
        }
        self.ib.end_data_redistribution(&self.hierarchy)?;
        self.rebuild_schedules();
        Ok(reports)
    }

    /// The IB method.
    pub fn ib_method(&self) -> &IBMethod {
        &self.ib
    }

    /// Mutable access to the IB method.
    pub fn ib_method_mut(&mut self) -> &mut IBMethod {
        &mut self.ib
    }

    /// The grid.
    pub fn hierarchy(&self) -> &PatchHierarchy {
        &self.hierarchy
    }

    /// The grid fields.
    pub fn fields(&self) -> &FieldStore {
        &self.fields
    }

    /// Simulation time reached.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Steps taken since initialization.
    pub fn step_count(&self) -> u64 {
        self.step
    }
}

/// Stopping rules and between-step work for [`SimulationRunner::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunControl {
    /// Step size.
    pub dt: f64,
    /// Stop once this many steps have been taken since initialization.
    pub max_timesteps: Option<u64>,
    /// Stop once the simulation time is within half a step of this time.
    pub max_time: Option<f64>,
    /// Rebalance the grid and redistribute the Lagrangian data every this
    /// many steps.
    pub regrid_interval: Option<u64>,
    /// Record the IB method's restart state every this many steps.
    pub restart_interval: Option<u64>,
}

impl RunControl {
    /// Plain stepping with `dt` until `max_timesteps`.
    pub fn steps(dt: f64, max_timesteps: u64) -> Self {
        Self {
            dt,
            max_timesteps: Some(max_timesteps),
            max_time: None,
            regrid_interval: None,
            restart_interval: None,
        }
    }

    fn finished(&self, step: u64, time: f64) -> bool {
        let reached_steps = self.max_timesteps.is_some_and(|max| step >= max);
        let reached_time = self.max_time.is_some_and(|max| time >= max - 0.5 * self.dt);
        reached_steps || reached_time
    }
}

fn due(interval: Option<u64>, step: u64) -> bool {
    interval.is_some_and(|n| n > 0 && step % n == 0)
}

/// Where a call to [`SimulationRunner::run`] stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Steps taken by this call.
    pub steps: u64,
    /// Simulation time reached.
    pub time: f64,
    /// Redistributions of the Lagrangian data performed by this call.
    pub regrids: usize,
}

/// Drives a [`CoupledStepper`] until a stopping rule fires.
///
/// Between steps the runner regrids and records restart state on the
/// configured intervals.  A failed step ends the run with its error; the
/// last recorded restart state stays available for restarting from it.
pub struct SimulationRunner {
    stepper: CoupledStepper,
    control: RunControl,
    checkpoint: Option<(u64, RestartRecord)>,
}

impl SimulationRunner {
    /// Run an initialized `stepper` under `control`.
    pub fn new(stepper: CoupledStepper, control: RunControl) -> IbResult<Self> {
        if control.max_timesteps.is_none() && control.max_time.is_none() {
            return Err(IbError::Config(
                "a run needs max_timesteps or max_time to stop".to_string(),
            ));
        }
        if !(control.dt > 0.0) {
            return Err(IbError::Config(format!("dt must be positive, got {}", control.dt)));
        }
        Ok(Self {
            stepper,
            control,
            checkpoint: None,
        })
    }

    /// Step until a stopping rule fires or a step fails.
    ///
    /// Calling `run` again after raising a limit continues from where the
    /// previous call stopped.
    pub fn run(&mut self) -> IbResult<RunSummary> {
        let start_wall_time = Instant::now();
        let first_step = self.stepper.step_count();
        let mut regrids = 0;
        while !self.control.finished(self.stepper.step_count(), self.stepper.time()) {
            if let Err(e) = self.stepper.step(self.control.dt) {
                error!("Step {} failed: {}", self.stepper.step_count() + 1, e);
                return Err(e);
            }
            let step = self.stepper.step_count();
            if due(self.control.regrid_interval, step) {
                let reports = self.stepper.rebalance()?;
                regrids += 1;
                debug!("Step {}: redistributed Lagrangian data over {} level(s)", step, reports.len());
            }
            if due(self.control.restart_interval, step) {
                self.checkpoint = Some((step, self.stepper.ib_method().put_to_restart()));
                debug!("Step {}: recorded restart state at t = {:.6}", step, self.stepper.time());
            }
            if step % 100 == 0 {
                debug!(
                    "Step {}: sim_time={:.6}, dt={:.3e}, wall_time={:.2}s",
                    step,
                    self.stepper.time(),
                    self.control.dt,
                    start_wall_time.elapsed().as_secs_f64()
                );
            }
        }
        let summary = RunSummary {
            steps: self.stepper.step_count() - first_step,
            time: self.stepper.time(),
            regrids,
        };
        info!(
            "Simulation stopped at step {} (t = {:.6}) after {} step(s), {} regrid(s)",
            self.stepper.step_count(),
            summary.time,
            summary.steps,
            summary.regrids
        );
        Ok(summary)
    }

    /// Stopping rules in effect.
    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Change the stopping rules, e.g. to continue past a limit.
    pub fn control_mut(&mut self) -> &mut RunControl {
        &mut self.control
    }

    /// Step number and restart state of the last checkpoint.
    pub fn checkpoint(&self) -> Option<(u64, &RestartRecord)> {
        self.checkpoint.as_ref().map(|(step, record)| (*step, record))
    }

    /// The stepper.
    pub fn stepper(&self) -> &CoupledStepper {
        &self.stepper
    }

    /// Give back the stepper.
    pub fn into_stepper(self) -> CoupledStepper {
        self.stepper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IBMethodConfig;
    use crate::init::{StandardInitializer, StructureSpec};
    use crate::ldata_manager::POSN_DATA_NAME;

    fn stepper(scheme: TimeSteppingType, u0: Point) -> CoupledStepper {
        let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [8; NDIM], [true; NDIM]);
        let hierarchy = PatchHierarchy::uniform(geometry, [2; NDIM], 2);
        let config = IBMethodConfig {
            time_stepping_type: scheme.to_string(),
            ..IBMethodConfig::default()
        };
        let mut ib = IBMethod::new("IBMethod", config).unwrap();
        ib.register_init_strategy(Box::new(StandardInitializer::new(
            vec![StructureSpec {
                name: "marker".to_string(),
                level_number: 0,
                vertices: vec![[0.3; NDIM], [0.6; NDIM]],
                anchors: Vec::new(),
                rods: Vec::new(),
                instruments: Vec::new(),
                sources: Vec::new(),
            }],
            Vec::new(),
        )));
        let mut fields = FieldStore::new();
        let flow = PrescribedFlow::new(&mut fields, ib.minimum_ghost_cell_width(), u0);
        let mut stepper = CoupledStepper::new(ib, hierarchy, fields, Box::new(flow));
        stepper.initialize(0.0).unwrap();
        stepper
    }

    fn positions(stepper: &CoupledStepper) -> Vec<f64> {
        stepper
            .ib_method()
            .l_data_manager()
            .gather_ldata(POSN_DATA_NAME, 0)
            .unwrap()
    }

    #[test]
    fn test_markers_advected_by_uniform_flow() {
        for scheme in [
            TimeSteppingType::ForwardEuler,
            TimeSteppingType::MidpointRule,
            TimeSteppingType::TrapezoidalRule,
        ] {
            let mut s = stepper(scheme, [0.5; NDIM]);
            for _ in 0..4 {
                s.step(0.05).unwrap();
            }
            let x = positions(&s);
            for (i, v) in x.iter().enumerate() {
                let x0 = if i < NDIM { 0.3 } else { 0.6 };
                assert!((v - (x0 + 0.1)).abs() < 1e-12, "{} moved node to {}", scheme, v);
            }
            assert_eq!(s.step_count(), 4);
            assert!((s.time() - 0.2).abs() < 1e-15);
        }
    }

    #[test]
    fn test_rebalance_keeps_nodes() {
        let mut s = stepper(TimeSteppingType::ForwardEuler, [0.0; NDIM]);
        let reports = s.rebalance().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(s.ib_method().l_data_manager().num_nodes(0), 2);
        s.step(0.1).unwrap();
        let x = positions(&s);
        assert!((x[0] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_body_force_reaches_fluid_force_field() {
        let mut s = stepper(TimeSteppingType::ForwardEuler, [0.0; NDIM]);
        let f_idx = (0..s.fields().len()).find(|&i| s.fields().name(i) == Some("f")).unwrap();
        assert_eq!(s.fields().max_norm(f_idx, s.hierarchy()), 0.0);

        let mut g = vec![0.0; NDIM];
        g[0] = -2.0;
        s.register_body_force(Box::new(crate::eulerian_force::ConstantBodyForce::new(g)));
        s.step(0.1).unwrap();
        // no Lagrangian force is registered, so only the body force remains
        assert!((s.fields().integral(f_idx, 0, s.hierarchy()) + 2.0).abs() < 1e-12);
        assert!(s.fields().integral(f_idx, 1, s.hierarchy()).abs() < 1e-12);
    }

    #[test]
    fn test_run_stops_at_step_limit() {
        let s = stepper(TimeSteppingType::ForwardEuler, [0.5; NDIM]);
        let mut runner = SimulationRunner::new(s, RunControl::steps(0.01, 10)).unwrap();
        let summary = runner.run().unwrap();
        assert_eq!(summary.steps, 10);
        assert_eq!(summary.regrids, 0);
        assert!((summary.time - 0.1).abs() < 1e-12);
        assert!(runner.checkpoint().is_none());

        // a finished run takes no more steps until the limit is raised
        assert_eq!(runner.run().unwrap().steps, 0);
        runner.control_mut().max_timesteps = Some(12);
        assert_eq!(runner.run().unwrap().steps, 2);
        assert_eq!(runner.into_stepper().step_count(), 12);
    }

    #[test]
    fn test_run_stops_at_time_limit() {
        let s = stepper(TimeSteppingType::MidpointRule, [0.5; NDIM]);
        let control = RunControl {
            max_timesteps: None,
            max_time: Some(0.3),
            ..RunControl::steps(0.1, 0)
        };
        let mut runner = SimulationRunner::new(s, control).unwrap();
        let summary = runner.run().unwrap();
        // accumulated round-off must not add a fourth step
        assert_eq!(summary.steps, 3);
        let x = positions(runner.stepper());
        assert!((x[0] - 0.45).abs() < 1e-12);
    }

    #[test]
    fn test_run_regrids_and_records_restart_state() {
        let s = stepper(TimeSteppingType::ForwardEuler, [0.5; NDIM]);
        let control = RunControl {
            regrid_interval: Some(2),
            restart_interval: Some(3),
            ..RunControl::steps(0.01, 7)
        };
        let mut runner = SimulationRunner::new(s, control).unwrap();
        let summary = runner.run().unwrap();
        assert_eq!(summary.regrids, 3);
        let (step, record) = runner.checkpoint().unwrap();
        assert_eq!(step, 6);
        assert!(IBMethod::from_restart("IBMethod", IBMethodConfig::default(), record).is_ok());

        // redistribution keeps every node moving with the flow
        assert_eq!(runner.stepper().ib_method().l_data_manager().num_nodes(0), 2);
        let x = positions(runner.stepper());
        assert!((x[0] - 0.335).abs() < 1e-12);
    }

    #[test]
    fn test_run_without_limit_is_rejected() {
        let s = stepper(TimeSteppingType::ForwardEuler, [0.0; NDIM]);
        let control = RunControl {
            max_timesteps: None,
            ..RunControl::steps(0.1, 0)
        };
        assert!(matches!(SimulationRunner::new(s, control), Err(IbError::Config(_))));
    }

    #[test]
    fn test_run_returns_step_failure() {
        let mut s = stepper(TimeSteppingType::ForwardEuler, [0.0; NDIM]);
        // leave a step open so the next preprocess is rejected
        s.ib_method_mut().preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        let mut runner = SimulationRunner::new(s, RunControl::steps(0.1, 5)).unwrap();
        let err = runner.run().unwrap_err();
        assert!(err.to_string().contains("preprocess_integrate_data"));
        assert_eq!(runner.stepper().step_count(), 0);
    }
}
