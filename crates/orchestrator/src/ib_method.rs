//! Immersed-boundary time integration
//!
//! [`IBMethod`] drives the Lagrangian side of one coupled time step.  The
//! fluid solver brackets each step with
//! [`preprocess_integrate_data`](IBMethod::preprocess_integrate_data) and
//! [`postprocess_integrate_data`](IBMethod::postprocess_integrate_data) and in
//! between asks for velocity interpolation, position updates, force
//! computation and spreading, and fluid sources, each at one of the three
//! canonical times of the step (current, half, new).
//!
//! Between steps the positions, velocities and forces live in the data
//! manager as the managed vectors `X`, `U` and `F`.  During a step the
//! method holds them together with the scratch vectors for the new, half and
//! linearized quantities; midpoint values are only recomputed when they are
//! asked for after one of their end points changed.

use std::collections::BTreeSet;
use std::mem;

use ib_kernel::ldata::point_at;
use ib_kernel::{CellBox, FieldStore, KernelLibrary, LData, PatchHierarchy, NDIM};
use tracing::{debug, info};

use crate::config::{IBMethodConfig, TimeSteppingType};
use crate::error::{IbError, IbResult};
use crate::init::LInitStrategy;
use crate::instrument::{InstrumentReader, PlanarFlowMeter};
use crate::ldata_manager::{LDataManager, LevelLData, POSN_DATA_NAME, VEL_DATA_NAME};
use crate::restart::{RestartRecord, IB_METHOD_VERSION};
use crate::schedules::{CoarsenSchedule, PhysicalBoundaryOp, RefineSchedule};
use crate::sources::{
    boundary_mean, check_source_balance, interpolate_source_pressures, normalize_source_strength, rounded_radius,
    spread_sources, LevelSources,
};
use crate::strategies::{LagrangianForceStrategy, LagrangianSourceStrategy, PostProcessStrategy, Strategy};

/// Name of the managed force vector.
pub const FORCE_DATA_NAME: &str = "F";

/// Where the method is in the step cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegratorState {
    /// No step has been started.
    Idle,
    /// A step interval is set up; no sub-step has run yet.
    Preprocessed,
    /// Sub-steps of the current interval are running.
    Stepping,
    /// The last step was completed.
    Postprocessed,
}

/// Whether two times agree to a relative tolerance of 1e-12.
pub fn equal_eps(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1.0e-12 * a.abs().max(b.abs()).max(1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    XCurrent,
    XNew,
    XHalf,
    XLeNew,
    XLeHalf,
    XJac,
    UCurrent,
    UNew,
    UHalf,
    UJac,
    FCurrent,
    FNew,
    FHalf,
    FJac,
}

const NUM_SLOTS: usize = 14;

impl Slot {
    fn name(self) -> &'static str {
        match self {
            Slot::XCurrent => POSN_DATA_NAME,
            Slot::XNew => "X_new",
            Slot::XHalf => "X_half",
            Slot::XLeNew => "X_LE_new",
            Slot::XLeHalf => "X_LE_half",
            Slot::XJac => "X_jac",
            Slot::UCurrent => VEL_DATA_NAME,
            Slot::UNew => "U_new",
            Slot::UHalf => "U_half",
            Slot::UJac => "U_jac",
            Slot::FCurrent => FORCE_DATA_NAME,
            Slot::FNew => "F_new",
            Slot::FHalf => "F_half",
            Slot::FJac => "F_jac",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimePoint {
    Current,
    Half,
    New,
}

fn empty_buffers(num_levels: usize) -> Vec<LevelLData> {
    (0..NUM_SLOTS).map(|_| (0..num_levels).map(|_| None).collect()).collect()
}

/// Two distinct slots, both mutable.
fn slot_pair(buffers: &mut [LevelLData], a: Slot, b: Slot) -> (&mut LevelLData, &mut LevelLData) {
    let (a, b) = (a as usize, b as usize);
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = buffers.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = buffers.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

fn level_of(buffers: &[LevelLData], slot: Slot, ln: usize) -> IbResult<&LData> {
    buffers[slot as usize]
        .get(ln)
        .and_then(Option::as_ref)
        .ok_or_else(|| IbError::MissingQuantity {
            name: slot.name().to_string(),
            level: ln,
        })
}

/// Resize `level_sources` to the count the strategy reports and refresh
/// their centers and radii.  Retained sources keep their pressures.
fn update_level_sources(
    source_fcn: &dyn LagrangianSourceStrategy,
    level_sources: &mut LevelSources,
    x: Option<&LData>,
    hierarchy: &PatchHierarchy,
    ln: usize,
    data_time: f64,
    manager: &LDataManager,
) -> IbResult<()> {
    let n_src = source_fcn.num_sources(hierarchy, ln, data_time, manager);
    if n_src != level_sources.len() {
        debug!("level {}: {} -> {} source(s)", ln, level_sources.len(), n_src);
        level_sources.resize(n_src);
    }
    if n_src > 0 {
        let LevelSources { positions, radii, .. } = level_sources;
        source_fcn.source_locations(positions, radii, x, hierarchy, ln, data_time, manager)?;
    }
    Ok(())
}

/// Zero every anchored node of `data`.
fn reset_anchor_point_values(anchors: &[Vec<BTreeSet<usize>>], data: &mut [Option<LData>]) {
    for (ln, level) in data.iter_mut().enumerate() {
        let (Some(level), Some(level_anchors)) = (level.as_mut(), anchors.get(ln)) else {
            continue;
        };
        if level_anchors.iter().all(BTreeSet::is_empty) {
            continue;
        }
        let depth = level.depth();
        for (part, idxs) in level.local_parts_mut().iter_mut().zip(level_anchors) {
            let values = part.values_mut();
            for &i in idxs {
                values[i * depth..(i + 1) * depth].iter_mut().for_each(|v| *v = 0.0);
            }
        }
    }
}

/// Lagrangian side of the immersed-boundary method.
pub struct IBMethod {
    object_name: String,
    config: IBMethodConfig,
    time_stepping: TimeSteppingType,
    l_data_manager: LDataManager,
    ghosts: usize,
    state: IntegratorState,
    start_time: f64,
    integrator_step: u64,
    // time of the data held by the manager between steps
    integrator_time: f64,

    current_time: f64,
    new_time: f64,
    half_time: f64,
    buffers: Vec<LevelLData>,
    x_half_needs_reinit: bool,
    x_le_half_needs_reinit: bool,
    u_half_needs_reinit: bool,

    // [level][rank] local indices
    anchor_point_local_idxs: Vec<Vec<BTreeSet<usize>>>,

    ib_force_fcn: Option<Box<dyn LagrangianForceStrategy>>,
    ib_force_fcn_needs_init: bool,
    ib_source_fcn: Option<Box<dyn LagrangianSourceStrategy>>,
    ib_source_fcn_needs_init: bool,
    post_processor: Option<Box<dyn PostProcessStrategy>>,
    instrument_panel: Box<dyn InstrumentReader>,
    total_flow_volume: Vec<f64>,
    sources: Vec<LevelSources>,
}

impl IBMethod {
    /// Create a method using the built-in kernels.
    pub fn new(object_name: &str, config: IBMethodConfig) -> IbResult<Self> {
        Self::with_kernel_library(object_name, config, &KernelLibrary::new())
    }

    /// Create a method whose kernels are looked up in `library`.
    pub fn with_kernel_library(object_name: &str, config: IBMethodConfig, library: &KernelLibrary) -> IbResult<Self> {
        config.validate(library)?;
        let time_stepping = config.time_stepping()?;
        let interp_kernel = library.lookup(&config.interp_kernel_fcn)?;
        let spread_kernel = library.lookup(&config.spread_kernel_fcn)?;
        let l_data_manager = LDataManager::new(
            &format!("{}::LDataManager", object_name),
            interp_kernel,
            spread_kernel,
            config.min_ghost_cell_width.unwrap_or(0),
        );
        let ghosts = l_data_manager.ghost_cell_width();
        info!(
            "{}: {} time stepping with {}/{} kernels and ghost width {}",
            object_name, time_stepping, config.interp_kernel_fcn, config.spread_kernel_fcn, ghosts
        );
        Ok(Self {
            object_name: object_name.to_string(),
            config,
            time_stepping,
            l_data_manager,
            ghosts,
            state: IntegratorState::Idle,
            start_time: 0.0,
            integrator_step: 0,
            integrator_time: 0.0,
            current_time: f64::NAN,
            new_time: f64::NAN,
            half_time: f64::NAN,
            buffers: empty_buffers(0),
            x_half_needs_reinit: true,
            x_le_half_needs_reinit: true,
            u_half_needs_reinit: true,
            anchor_point_local_idxs: Vec::new(),
            ib_force_fcn: None,
            ib_force_fcn_needs_init: true,
            ib_source_fcn: None,
            ib_source_fcn_needs_init: true,
            post_processor: None,
            instrument_panel: Box::new(PlanarFlowMeter::default()),
            total_flow_volume: Vec::new(),
            sources: Vec::new(),
        })
    }

    /// Rebuild a method from a restart record.
    ///
    /// Kernel choices, ghost width and the normalization flag come from the
    /// record; the remaining settings come from `config`.
    pub fn from_restart(object_name: &str, config: IBMethodConfig, record: &RestartRecord) -> IbResult<Self> {
        record.check_version(object_name)?;
        let config = IBMethodConfig {
            interp_kernel_fcn: record.interp_kernel_fcn.clone(),
            spread_kernel_fcn: record.spread_kernel_fcn.clone(),
            min_ghost_cell_width: record.ghosts.iter().copied().max(),
            normalize_source_strength: record.normalize_source_strength,
            ..config
        };
        let mut ib = Self::new(object_name, config)?;
        ib.total_flow_volume = record.total_flow_volume.clone();
        ib.sources = record.level_sources()?;
        ib.instrument_panel = Box::new(PlanarFlowMeter::new(record.instrument_names.clone()));
        Ok(ib)
    }

    /// State to write to a restart file.
    pub fn put_to_restart(&self) -> RestartRecord {
        RestartRecord {
            version: IB_METHOD_VERSION,
            interp_kernel_fcn: self.config.interp_kernel_fcn.clone(),
            spread_kernel_fcn: self.config.spread_kernel_fcn.clone(),
            ghosts: vec![self.ghosts; NDIM],
            instrument_names: self.instrument_panel.instrument_names().to_vec(),
            total_flow_volume: self.total_flow_volume.clone(),
            n_src: self.sources.iter().map(LevelSources::len).collect(),
            sources: self.sources.clone(),
            normalize_source_strength: self.config.normalize_source_strength,
        }
    }

    // -----------------------------------------------------------------------
    // Registration and queries
    // -----------------------------------------------------------------------

    /// Use `strategy` to compute Lagrangian forces.
    pub fn register_lagrangian_force_function(&mut self, strategy: Box<dyn LagrangianForceStrategy>) {
        self.ib_force_fcn = Some(strategy);
        self.ib_force_fcn_needs_init = true;
    }

    /// Use `strategy` to describe fluid sources and sinks.
    pub fn register_lagrangian_source_function(&mut self, strategy: Box<dyn LagrangianSourceStrategy>) {
        self.ib_source_fcn = Some(strategy);
        self.ib_source_fcn_needs_init = true;
    }

    /// Run `strategy` from [`post_process_data`](Self::post_process_data).
    pub fn register_post_processor(&mut self, strategy: Box<dyn PostProcessStrategy>) {
        self.post_processor = Some(strategy);
    }

    /// Register a strategy of any kind.
    pub fn register_strategy(&mut self, strategy: Strategy) {
        match strategy {
            Strategy::Force(s) => self.register_lagrangian_force_function(s),
            Strategy::Source(s) => self.register_lagrangian_source_function(s),
            Strategy::PostProcess(s) => self.register_post_processor(s),
        }
    }

    /// Provide the structures placed at the initial time.
    pub fn register_init_strategy(&mut self, strategy: Box<dyn LInitStrategy>) {
        self.l_data_manager.register_init_strategy(strategy);
    }

    /// Drop the structure initializer once the hierarchy is built.
    pub fn free_init_strategy(&mut self) {
        self.l_data_manager.free_init_strategy();
    }

    /// Replace the flow meter panel.
    pub fn register_instrument_panel(&mut self, panel: Box<dyn InstrumentReader>) {
        self.instrument_panel = panel;
    }

    /// Object name used in log and error messages.
    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Settings in effect.
    pub fn config(&self) -> &IBMethodConfig {
        &self.config
    }

    /// Position update scheme.
    pub fn time_stepping_type(&self) -> TimeSteppingType {
        self.time_stepping
    }

    /// Ghost width every coupled grid field must provide.
    pub fn minimum_ghost_cell_width(&self) -> usize {
        self.ghosts
    }

    /// The Lagrangian data manager.
    pub fn l_data_manager(&self) -> &LDataManager {
        &self.l_data_manager
    }

    /// Mutable access to the Lagrangian data manager.
    pub fn l_data_manager_mut(&mut self) -> &mut LDataManager {
        &mut self.l_data_manager
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IntegratorState {
        self.state
    }

    /// Start, midpoint and end of the step in progress (NaN between steps).
    pub fn step_times(&self) -> (f64, f64, f64) {
        (self.current_time, self.half_time, self.new_time)
    }

    /// Number of completed steps.
    pub fn integrator_step(&self) -> u64 {
        self.integrator_step
    }

    /// Whether a source strategy is registered.
    pub fn has_fluid_sources(&self) -> bool {
        self.ib_source_fcn.is_some()
    }

    /// Source and sink data per level.
    pub fn sources(&self) -> &[LevelSources] {
        &self.sources
    }

    /// Volume that has passed each flow meter.
    pub fn total_flow_volume(&self) -> &[f64] {
        &self.total_flow_volume
    }

    /// The flow meter panel.
    pub fn instrument_panel(&self) -> &dyn InstrumentReader {
        self.instrument_panel.as_ref()
    }

    /// Local indices of the anchored nodes of `rank` on level `ln`.
    pub fn anchor_point_local_indices(&self, ln: usize, rank: usize) -> Option<&BTreeSet<usize>> {
        self.anchor_point_local_idxs.get(ln)?.get(rank)
    }

    // -----------------------------------------------------------------------
    // Lifecycle checks
    // -----------------------------------------------------------------------

    fn begin_sub_step(&mut self, operation: &'static str) -> IbResult<()> {
        match self.state {
            IntegratorState::Preprocessed | IntegratorState::Stepping => {
                self.state = IntegratorState::Stepping;
                Ok(())
            }
            state => Err(self.invalid_state(operation, state)),
        }
    }

    fn require_between_steps(&self, operation: &'static str) -> IbResult<()> {
        match self.state {
            IntegratorState::Idle | IntegratorState::Postprocessed => Ok(()),
            state => Err(self.invalid_state(operation, state)),
        }
    }

    fn invalid_state(&self, operation: &'static str, state: IntegratorState) -> IbError {
        IbError::InvalidState {
            object: self.object_name.clone(),
            operation,
            state,
        }
    }

    // -----------------------------------------------------------------------
    // Step buffers
    // -----------------------------------------------------------------------

    fn time_point(&self, data_time: f64) -> IbResult<TimePoint> {
        if equal_eps(data_time, self.current_time) {
            Ok(TimePoint::Current)
        } else if equal_eps(data_time, self.half_time) {
            Ok(TimePoint::Half)
        } else if equal_eps(data_time, self.new_time) {
            Ok(TimePoint::New)
        } else {
            Err(IbError::UnknownDataTime {
                object: self.object_name.clone(),
                time: data_time,
                current: self.current_time,
                half: self.half_time,
                new: self.new_time,
            })
        }
    }

    fn finest_data_level(&self) -> IbResult<usize> {
        let ln = self.buffers[Slot::XCurrent as usize].len().saturating_sub(1);
        if self.buffers[Slot::XCurrent as usize].get(ln).is_some_and(Option::is_some) {
            Ok(ln)
        } else {
            Err(IbError::LevelWithoutLagrangianData(ln))
        }
    }

    /// Allocate `slot` on every level that holds data; true if anything was
    /// allocated.
    fn ensure_allocated(&mut self, slot: Slot) -> IbResult<bool> {
        let mut allocated = false;
        for ln in 0..self.buffers[Slot::XCurrent as usize].len() {
            if self.buffers[Slot::XCurrent as usize][ln].is_none() || self.buffers[slot as usize][ln].is_some() {
                continue;
            }
            let data = self.l_data_manager.create_ldata(slot.name(), ln, NDIM)?;
            self.buffers[slot as usize][ln] = Some(data);
            allocated = true;
        }
        Ok(allocated)
    }

    /// half = (current + new) / 2 on every level.
    fn reinit_midpoint_data(&mut self, current: Slot, new: Slot, half: Slot) -> IbResult<()> {
        let mut half_data = mem::take(&mut self.buffers[half as usize]);
        let mut result: IbResult<()> = Ok(());
        for (ln, h) in half_data.iter_mut().enumerate() {
            let Some(h) = h.as_mut() else {
                continue;
            };
            let c = level_of(&self.buffers, current, ln);
            let n = level_of(&self.buffers, new, ln);
            result = match (c, n) {
                (Ok(c), Ok(n)) => h.axpbypcz(0.5, c, 0.5, n, 0.0).map_err(IbError::from),
                (Err(e), _) | (_, Err(e)) => Err(e),
            };
            if result.is_err() {
                break;
            }
        }
        self.buffers[half as usize] = half_data;
        result
    }

    fn prepare_position(&mut self, data_time: f64) -> IbResult<Slot> {
        match self.time_point(data_time)? {
            TimePoint::Current => Ok(Slot::XCurrent),
            TimePoint::New => Ok(Slot::XNew),
            TimePoint::Half => {
                if self.ensure_allocated(Slot::XHalf)? {
                    self.x_half_needs_reinit = true;
                }
                if self.x_half_needs_reinit {
                    self.reinit_midpoint_data(Slot::XCurrent, Slot::XNew, Slot::XHalf)?;
                    self.x_half_needs_reinit = false;
                }
                Ok(Slot::XHalf)
            }
        }
    }

    fn prepare_le_position(&mut self, data_time: f64) -> IbResult<Slot> {
        if !self.config.use_fixed_coupling_ops {
            return self.prepare_position(data_time);
        }
        match self.time_point(data_time)? {
            TimePoint::Current => Ok(Slot::XCurrent),
            TimePoint::New => Ok(Slot::XLeNew),
            TimePoint::Half => {
                if self.ensure_allocated(Slot::XLeHalf)? {
                    self.x_le_half_needs_reinit = true;
                }
                if self.x_le_half_needs_reinit {
                    self.reinit_midpoint_data(Slot::XCurrent, Slot::XLeNew, Slot::XLeHalf)?;
                    self.x_le_half_needs_reinit = false;
                }
                Ok(Slot::XLeHalf)
            }
        }
    }

    fn prepare_velocity(&mut self, data_time: f64) -> IbResult<Slot> {
        match self.time_point(data_time)? {
            TimePoint::Current => Ok(Slot::UCurrent),
            TimePoint::New => Ok(Slot::UNew),
            TimePoint::Half => {
                if self.ensure_allocated(Slot::UHalf)? {
                    self.u_half_needs_reinit = true;
                }
                if self.u_half_needs_reinit {
                    self.reinit_midpoint_data(Slot::UCurrent, Slot::UNew, Slot::UHalf)?;
                    self.u_half_needs_reinit = false;
                }
                Ok(Slot::UHalf)
            }
        }
    }

    fn prepare_force(&mut self, data_time: f64) -> IbResult<Slot> {
        let slot = match self.time_point(data_time)? {
            TimePoint::Current => Slot::FCurrent,
            TimePoint::Half => Slot::FHalf,
            TimePoint::New => Slot::FNew,
        };
        self.ensure_allocated(slot)?;
        Ok(slot)
    }

    /// Positions at `data_time` on every level, computing the midpoint if
    /// it is stale.
    pub fn position_data(&mut self, data_time: f64) -> IbResult<&[Option<LData>]> {
        let slot = self.prepare_position(data_time)?;
        Ok(&self.buffers[slot as usize])
    }

    /// Velocities at `data_time` on every level.
    pub fn velocity_data(&mut self, data_time: f64) -> IbResult<&[Option<LData>]> {
        let slot = self.prepare_velocity(data_time)?;
        Ok(&self.buffers[slot as usize])
    }

    /// Forces at `data_time` on every level.
    pub fn force_data(&mut self, data_time: f64) -> IbResult<&[Option<LData>]> {
        let slot = self.prepare_force(data_time)?;
        Ok(&self.buffers[slot as usize])
    }

    // -----------------------------------------------------------------------
    // Step bracketing
    // -----------------------------------------------------------------------

    /// Set up the interval `[current_time, new_time]`.
    ///
    /// Strategies are (re)initialized if the node layout changed since they
    /// last were, the current `X`, `U` and `F` are taken from the data
    /// manager, and `X_new`, `U_new` start as copies of the current values.
    pub fn preprocess_integrate_data(&mut self, current_time: f64, new_time: f64, _num_cycles: usize) -> IbResult<()> {
        self.require_between_steps("preprocess_integrate_data")?;
        {
            let manager = &self.l_data_manager;
            for ln in (0..manager.num_levels()).filter(|&ln| manager.level_contains_lagrangian_data(ln)) {
                for name in [POSN_DATA_NAME, VEL_DATA_NAME, FORCE_DATA_NAME] {
                    if manager.ldata(name, ln).is_none() {
                        return Err(IbError::MissingQuantity {
                            name: name.to_string(),
                            level: ln,
                        });
                    }
                }
            }
        }
        self.current_time = current_time;
        self.new_time = new_time;
        self.half_time = current_time + 0.5 * (new_time - current_time);
        let initial_time = equal_eps(current_time, self.start_time);

        let num_levels = {
            let hierarchy = self.l_data_manager.hierarchy()?;
            let manager = &self.l_data_manager;
            let data_levels: Vec<usize> = (0..hierarchy.num_levels())
                .filter(|&ln| manager.level_contains_lagrangian_data(ln))
                .collect();
            if let Some(force_fcn) = self.ib_force_fcn.as_deref_mut() {
                if self.ib_force_fcn_needs_init {
                    for &ln in &data_levels {
                        force_fcn.initialize_level_data(hierarchy, ln, current_time, initial_time, manager)?;
                    }
                    self.ib_force_fcn_needs_init = false;
                }
                force_fcn.set_time_interval(current_time, new_time);
            }
            if let Some(source_fcn) = self.ib_source_fcn.as_deref_mut() {
                if self.ib_source_fcn_needs_init {
                    for &ln in &data_levels {
                        source_fcn.initialize_level_data(hierarchy, ln, current_time, initial_time, manager)?;
                    }
                    self.ib_source_fcn_needs_init = false;
                }
                source_fcn.set_time_interval(current_time, new_time);
            }
            hierarchy.num_levels()
        };

        self.buffers = empty_buffers(num_levels);
        for ln in 0..num_levels {
            if !self.l_data_manager.level_contains_lagrangian_data(ln) {
                continue;
            }
            let x = self.l_data_manager.take_ldata(POSN_DATA_NAME, ln)?;
            let u = self.l_data_manager.take_ldata(VEL_DATA_NAME, ln)?;
            let f = self.l_data_manager.take_ldata(FORCE_DATA_NAME, ln)?;

            let mut x_new = self.l_data_manager.create_ldata(Slot::XNew.name(), ln, NDIM)?;
            x_new.copy_from(&x)?;
            let mut u_new = self.l_data_manager.create_ldata(Slot::UNew.name(), ln, NDIM)?;
            u_new.copy_from(&u)?;
            if self.config.use_fixed_coupling_ops {
                let mut x_le_new = self.l_data_manager.create_ldata(Slot::XLeNew.name(), ln, NDIM)?;
                x_le_new.copy_from(&x)?;
                self.buffers[Slot::XLeNew as usize][ln] = Some(x_le_new);
            }
            self.buffers[Slot::XCurrent as usize][ln] = Some(x);
            self.buffers[Slot::XNew as usize][ln] = Some(x_new);
            self.buffers[Slot::UCurrent as usize][ln] = Some(u);
            self.buffers[Slot::UNew as usize][ln] = Some(u_new);
            self.buffers[Slot::FCurrent as usize][ln] = Some(f);
        }

        self.x_half_needs_reinit = true;
        self.x_le_half_needs_reinit = true;
        self.u_half_needs_reinit = true;
        self.state = IntegratorState::Preprocessed;
        debug!(
            "{}: step {} preprocessed on [{}, {}]",
            self.object_name, self.integrator_step, current_time, new_time
        );
        Ok(())
    }

    /// Finish the interval: accumulate flow volumes, rotate the new values
    /// into the current buffers, and hand `X`, `U` and `F` back to the data
    /// manager.
    pub fn postprocess_integrate_data(&mut self, current_time: f64, new_time: f64, _num_cycles: usize) -> IbResult<()> {
        match self.state {
            IntegratorState::Preprocessed | IntegratorState::Stepping => {}
            state => return Err(self.invalid_state("postprocess_integrate_data", state)),
        }
        let dt = new_time - current_time;

        if self.instrument_panel.is_instrumented() {
            let flow = self.instrument_panel.flow_values();
            if self.total_flow_volume.len() < flow.len() {
                self.total_flow_volume.resize(flow.len(), 0.0);
            }
            let names = self.instrument_panel.instrument_names();
            for (m, q) in flow.iter().enumerate() {
                self.total_flow_volume[m] += q * dt;
                if self.config.do_log {
                    let name = names.get(m).map_or("?", String::as_str);
                    info!("flow volume through {}: {}", name, self.total_flow_volume[m]);
                }
            }
        }

        let num_levels = self.buffers[Slot::XCurrent as usize].len();
        for ln in 0..num_levels {
            if self.buffers[Slot::XCurrent as usize][ln].is_none() {
                continue;
            }
            for (current, new) in [(Slot::XCurrent, Slot::XNew), (Slot::UCurrent, Slot::UNew)] {
                let (c, n) = slot_pair(&mut self.buffers, current, new);
                if let (Some(c), Some(n)) = (c[ln].as_mut(), n[ln].as_mut()) {
                    c.swap_values(n)?;
                }
            }
            let f_source = if self.buffers[Slot::FNew as usize][ln].is_some() {
                Some(Slot::FNew)
            } else if self.buffers[Slot::FHalf as usize][ln].is_some() {
                Some(Slot::FHalf)
            } else {
                None
            };
            if let Some(f_source) = f_source {
                let (c, n) = slot_pair(&mut self.buffers, Slot::FCurrent, f_source);
                if let (Some(c), Some(n)) = (c[ln].as_mut(), n[ln].as_mut()) {
                    c.swap_values(n)?;
                }
            }
        }

        let mut buffers = mem::take(&mut self.buffers);
        for slot in [Slot::XCurrent, Slot::UCurrent, Slot::FCurrent] {
            for (ln, data) in mem::take(&mut buffers[slot as usize]).into_iter().enumerate() {
                if let Some(data) = data {
                    self.l_data_manager.restore_ldata(ln, data)?;
                }
            }
        }
        drop(buffers);

        self.integrator_time = new_time;
        self.current_time = f64::NAN;
        self.new_time = f64::NAN;
        self.half_time = f64::NAN;
        self.integrator_step += 1;
        self.state = IntegratorState::Postprocessed;
        debug!("{}: step {} postprocessed", self.object_name, self.integrator_step);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Coupling sub-steps
    // -----------------------------------------------------------------------

    /// Interpolate grid velocity `u_idx` to the nodes at `data_time`.
    ///
    /// Anchored nodes get zero velocity.
    pub fn interpolate_velocity(
        &mut self,
        fields: &mut FieldStore,
        u_idx: usize,
        u_synch_scheds: &[Option<Box<dyn CoarsenSchedule>>],
        u_ghost_fill_scheds: &[Option<Box<dyn RefineSchedule>>],
        data_time: f64,
    ) -> IbResult<()> {
        self.begin_sub_step("interpolate_velocity")?;
        let u_slot = self.prepare_velocity(data_time)?;
        let x_slot = self.prepare_le_position(data_time)?;
        let (u, x) = slot_pair(&mut self.buffers, u_slot, x_slot);
        self.l_data_manager
            .interp(fields, u_idx, u, x, u_synch_scheds, u_ghost_fill_scheds, data_time)?;
        reset_anchor_point_values(&self.anchor_point_local_idxs, u);
        self.u_half_needs_reinit = !equal_eps(data_time, self.half_time);
        Ok(())
    }

    /// `X_new = X_current + dt U(current)`.
    pub fn euler_step(&mut self, current_time: f64, new_time: f64) -> IbResult<()> {
        self.begin_sub_step("euler_step")?;
        let dt = new_time - current_time;
        let u_slot = self.prepare_velocity(current_time)?;
        self.update_new_positions(&[(dt, u_slot)])
    }

    /// `X_new = X_current + dt U(half)`.
    pub fn midpoint_step(&mut self, current_time: f64, new_time: f64) -> IbResult<()> {
        self.begin_sub_step("midpoint_step")?;
        let dt = new_time - current_time;
        let u_slot = self.prepare_velocity(current_time + 0.5 * dt)?;
        self.update_new_positions(&[(dt, u_slot)])
    }

    /// `X_new = X_current + dt/2 (U(current) + U(new))`.
    pub fn trapezoidal_step(&mut self, current_time: f64, new_time: f64) -> IbResult<()> {
        self.begin_sub_step("trapezoidal_step")?;
        let dt = new_time - current_time;
        let u_current = self.prepare_velocity(current_time)?;
        let u_new = self.prepare_velocity(new_time)?;
        self.update_new_positions(&[(0.5 * dt, u_current), (0.5 * dt, u_new)])
    }

    /// Update the positions with the configured scheme.
    pub fn advance_positions(&mut self, current_time: f64, new_time: f64) -> IbResult<()> {
        match self.time_stepping {
            TimeSteppingType::ForwardEuler => self.euler_step(current_time, new_time),
            TimeSteppingType::MidpointRule => self.midpoint_step(current_time, new_time),
            TimeSteppingType::TrapezoidalRule => self.trapezoidal_step(current_time, new_time),
        }
    }

    /// `X_new = X_current + sum_k a_k U_k`.
    fn update_new_positions(&mut self, terms: &[(f64, Slot)]) -> IbResult<()> {
        let mut x_new = mem::take(&mut self.buffers[Slot::XNew as usize]);
        let mut result: IbResult<()> = Ok(());
        for (ln, level) in x_new.iter_mut().enumerate() {
            let Some(level) = level.as_mut() else {
                continue;
            };
            result = (|| -> IbResult<()> {
                level.copy_from(level_of(&self.buffers, Slot::XCurrent, ln)?)?;
                for &(alpha, slot) in terms {
                    level.axpy(alpha, level_of(&self.buffers, slot, ln)?)?;
                }
                Ok(())
            })();
            if result.is_err() {
                break;
            }
        }
        self.buffers[Slot::XNew as usize] = x_new;
        self.x_half_needs_reinit = true;
        result
    }

    /// Zero `F(data_time)` and let the force strategy fill it.
    pub fn compute_lagrangian_force(&mut self, data_time: f64) -> IbResult<()> {
        self.begin_sub_step("compute_lagrangian_force")?;
        let f_slot = self.prepare_force(data_time)?;
        let x_slot = self.prepare_position(data_time)?;
        let u_slot = self.prepare_velocity(data_time)?;

        let mut f_data = mem::take(&mut self.buffers[f_slot as usize]);
        let mut result: IbResult<()> = Ok(());
        for (ln, f) in f_data.iter_mut().enumerate() {
            let Some(f) = f.as_mut() else {
                continue;
            };
            f.set_all(0.0);
            let Some(force_fcn) = self.ib_force_fcn.as_deref_mut() else {
                continue;
            };
            result = (|| -> IbResult<()> {
                let hierarchy = self.l_data_manager.hierarchy()?;
                let x = level_of(&self.buffers, x_slot, ln)?;
                let u = level_of(&self.buffers, u_slot, ln)?;
                force_fcn.compute_lagrangian_force(f, x, u, hierarchy, ln, data_time, &self.l_data_manager)
            })();
            if result.is_err() {
                break;
            }
        }
        self.buffers[f_slot as usize] = f_data;
        result
    }

    /// Spread `F(data_time)` into grid field `f_idx` (added to its contents).
    ///
    /// Anchored nodes spread nothing.
    pub fn spread_force(
        &mut self,
        fields: &mut FieldStore,
        f_idx: usize,
        f_phys_bdry_op: Option<&dyn PhysicalBoundaryOp>,
        f_prolongation_scheds: &[Option<Box<dyn RefineSchedule>>],
        data_time: f64,
    ) -> IbResult<()> {
        self.begin_sub_step("spread_force")?;
        let f_slot = self.prepare_force(data_time)?;
        let x_slot = self.prepare_le_position(data_time)?;
        let (f, x) = slot_pair(&mut self.buffers, f_slot, x_slot);
        reset_anchor_point_values(&self.anchor_point_local_idxs, f);
        self.l_data_manager
            .spread(fields, f_idx, f, x, f_phys_bdry_op, f_prolongation_scheds, data_time)
    }

    /// Ask the source strategy for the strength of every source.
    pub fn compute_lagrangian_fluid_source(&mut self, data_time: f64) -> IbResult<()> {
        self.begin_sub_step("compute_lagrangian_fluid_source")?;
        let Some(source_fcn) = self.ib_source_fcn.as_deref_mut() else {
            return Ok(());
        };
        let hierarchy = self.l_data_manager.hierarchy()?;
        for (ln, level_sources) in self.sources.iter_mut().enumerate() {
            if level_sources.is_empty() {
                continue;
            }
            level_sources.strengths.iter_mut().for_each(|q| *q = 0.0);
            source_fcn.compute_source_strengths(
                &mut level_sources.strengths,
                hierarchy,
                ln,
                data_time,
                &self.l_data_manager,
            )?;
        }
        Ok(())
    }

    /// Spread the sources into field `q_idx` and check that the grid carries
    /// exactly the prescribed volume.  With normalization enabled the net
    /// source is then cancelled on the outer boundary.
    pub fn spread_fluid_source(&mut self, fields: &mut FieldStore, q_idx: usize, data_time: f64) -> IbResult<()> {
        self.begin_sub_step("spread_fluid_source")?;
        if self.ib_source_fcn.is_none() {
            return Ok(());
        }
        let x_slot = self.prepare_le_position(data_time)?;
        let hierarchy = self.l_data_manager.hierarchy()?;
        if let Some(source_fcn) = self.ib_source_fcn.as_deref() {
            for (ln, level_sources) in self.sources.iter_mut().enumerate() {
                if level_sources.is_empty() {
                    continue;
                }
                let x = self.buffers[x_slot as usize].get(ln).and_then(Option::as_ref);
                let LevelSources { positions, radii, .. } = level_sources;
                source_fcn.source_locations(positions, radii, x, hierarchy, ln, data_time, &self.l_data_manager)?;
            }
        }

        spread_sources(&self.sources, fields, q_idx, hierarchy)?;
        let q_total = check_source_balance(&self.object_name, &self.sources, fields, q_idx, hierarchy)?;
        if self.config.normalize_source_strength {
            normalize_source_strength(&self.object_name, fields, q_idx, hierarchy, q_total)?;
        }
        if self.config.do_log {
            info!("{}: net source/sink strength {:e} at t = {}", self.object_name, q_total, data_time);
        }
        Ok(())
    }

    /// Average pressure field `p_idx` over every source and pass the values
    /// to the source strategy.  With normalization enabled the mean
    /// boundary pressure is subtracted.
    pub fn interpolate_pressure(&mut self, fields: &FieldStore, p_idx: usize, data_time: f64) -> IbResult<()> {
        self.begin_sub_step("interpolate_pressure")?;
        let Some(source_fcn) = self.ib_source_fcn.as_deref_mut() else {
            return Ok(());
        };
        let hierarchy = self.l_data_manager.hierarchy()?;
        let p_norm = if self.config.normalize_source_strength {
            boundary_mean(fields, p_idx, hierarchy)
        } else {
            0.0
        };
        interpolate_source_pressures(&mut self.sources, fields, p_idx, hierarchy, p_norm)?;
        for (ln, level_sources) in self.sources.iter().enumerate() {
            if level_sources.is_empty() {
                continue;
            }
            source_fcn.set_source_pressures(&level_sources.pressures, hierarchy, ln, data_time, &self.l_data_manager)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Linearized operators (finest level)
    // -----------------------------------------------------------------------

    /// Solver position and force vectors laid out like the finest level.
    pub fn create_solver_vecs(&self) -> IbResult<(LData, LData)> {
        let ln = self.finest_data_level()?;
        Ok((
            self.l_data_manager.create_ldata("X_solver", ln, NDIM)?,
            self.l_data_manager.create_ldata("F_solver", ln, NDIM)?,
        ))
    }

    /// Load `X_new` into `x` and zero `f`.
    pub fn setup_solver_vecs(&self, x: &mut LData, f: &mut LData) -> IbResult<()> {
        let ln = self.finest_data_level()?;
        x.copy_from(level_of(&self.buffers, Slot::XNew, ln)?)?;
        f.set_all(0.0);
        Ok(())
    }

    /// Replace `X_new` on the finest level.
    pub fn set_updated_position(&mut self, x_new: &LData) -> IbResult<()> {
        self.begin_sub_step("set_updated_position")?;
        let ln = self.finest_data_level()?;
        let target = self.buffers[Slot::XNew as usize][ln]
            .as_mut()
            .ok_or(IbError::LevelWithoutLagrangianData(ln))?;
        target.copy_from(x_new)?;
        self.x_half_needs_reinit = true;
        Ok(())
    }

    /// Set the base point of the linearization.
    pub fn set_linearized_position(&mut self, x: &LData) -> IbResult<()> {
        self.begin_sub_step("set_linearized_position")?;
        self.ensure_allocated(Slot::XJac)?;
        let ln = self.finest_data_level()?;
        let target = self.buffers[Slot::XJac as usize][ln]
            .as_mut()
            .ok_or(IbError::LevelWithoutLagrangianData(ln))?;
        target.copy_from(x)?;
        Ok(())
    }

    /// `R = X_new - dt U(half) - X_current`.
    pub fn compute_residual(&mut self, r: &mut LData) -> IbResult<()> {
        self.begin_sub_step("compute_residual")?;
        let dt = self.new_time - self.current_time;
        let u_slot = self.prepare_velocity(self.half_time)?;
        let ln = self.finest_data_level()?;
        r.waxpy(-dt, level_of(&self.buffers, u_slot, ln)?, level_of(&self.buffers, Slot::XNew, ln)?)?;
        r.axpy(-1.0, level_of(&self.buffers, Slot::XCurrent, ln)?)?;
        Ok(())
    }

    /// `R = X - dt U_jac`.
    pub fn compute_linearized_residual(&mut self, x: &LData, r: &mut LData) -> IbResult<()> {
        self.begin_sub_step("compute_linearized_residual")?;
        self.ensure_allocated(Slot::UJac)?;
        let dt = self.new_time - self.current_time;
        let ln = self.finest_data_level()?;
        r.waxpy(-dt, level_of(&self.buffers, Slot::UJac, ln)?, x)?;
        Ok(())
    }

    /// Freeze the coupling positions at the current `X_new`.
    pub fn update_fixed_le_operators(&mut self) -> IbResult<()> {
        self.begin_sub_step("update_fixed_le_operators")?;
        if !self.config.use_fixed_coupling_ops {
            return Ok(());
        }
        let (x_le, x_new) = slot_pair(&mut self.buffers, Slot::XLeNew, Slot::XNew);
        for (le, new) in x_le.iter_mut().zip(x_new.iter()) {
            if let (Some(le), Some(new)) = (le.as_mut(), new.as_ref()) {
                le.copy_from(new)?;
            }
        }
        self.x_le_half_needs_reinit = true;
        Ok(())
    }

    /// Interpolate grid velocity `u_idx` into `U_jac`.
    pub fn interpolate_linearized_velocity(
        &mut self,
        fields: &mut FieldStore,
        u_idx: usize,
        u_synch_scheds: &[Option<Box<dyn CoarsenSchedule>>],
        u_ghost_fill_scheds: &[Option<Box<dyn RefineSchedule>>],
        data_time: f64,
    ) -> IbResult<()> {
        self.begin_sub_step("interpolate_linearized_velocity")?;
        self.ensure_allocated(Slot::UJac)?;
        let x_slot = self.prepare_le_position(data_time)?;
        let (u, x) = slot_pair(&mut self.buffers, Slot::UJac, x_slot);
        self.l_data_manager
            .interp(fields, u_idx, u, x, u_synch_scheds, u_ghost_fill_scheds, data_time)?;
        reset_anchor_point_values(&self.anchor_point_local_idxs, u);
        Ok(())
    }

    /// `F_jac = 1/2 dF/dX (X_jac) v`, by a one-sided finite difference of
    /// the force strategy evaluated with `U_new`.
    pub fn compute_linearized_lagrangian_force(&mut self, v: &LData, data_time: f64) -> IbResult<()> {
        self.begin_sub_step("compute_linearized_lagrangian_force")?;
        self.ensure_allocated(Slot::FJac)?;
        let ln = self.finest_data_level()?;
        let v_norm = v.norm2();
        let Some(force_fcn) = self.ib_force_fcn.as_deref_mut() else {
            if let Some(f_jac) = self.buffers[Slot::FJac as usize][ln].as_mut() {
                f_jac.set_all(0.0);
            }
            return Ok(());
        };
        if v_norm == 0.0 {
            if let Some(f_jac) = self.buffers[Slot::FJac as usize][ln].as_mut() {
                f_jac.set_all(0.0);
            }
            return Ok(());
        }

        let manager = &self.l_data_manager;
        let hierarchy = manager.hierarchy()?;
        let mesh = manager.mesh(ln).ok_or(IbError::LevelWithoutLagrangianData(ln))?;
        let x_base = level_of(&self.buffers, Slot::XJac, ln)?;
        let u = level_of(&self.buffers, Slot::UNew, ln)?;
        let h = f64::EPSILON.sqrt() * (1.0 + x_base.norm2()) / v_norm;

        let mut x0 = x_base.clone();
        x0.ghost_fill(mesh);
        let mut x1 = x_base.clone();
        x1.axpy(h, v)?;
        x1.ghost_fill(mesh);

        let mut f0 = manager.create_ldata("F_base", ln, NDIM)?;
        let mut f1 = manager.create_ldata("F_perturbed", ln, NDIM)?;
        force_fcn.compute_lagrangian_force(&mut f0, &x0, u, hierarchy, ln, data_time, manager)?;
        force_fcn.compute_lagrangian_force(&mut f1, &x1, u, hierarchy, ln, data_time, manager)?;
        f1.axpy(-1.0, &f0)?;
        f1.scale(0.5 / h);

        let f_jac = self.buffers[Slot::FJac as usize][ln]
            .as_mut()
            .ok_or(IbError::LevelWithoutLagrangianData(ln))?;
        f_jac.copy_from(&f1)?;
        Ok(())
    }

    /// Spread `F_jac` into field `f_idx`.
    pub fn spread_linearized_force(
        &mut self,
        fields: &mut FieldStore,
        f_idx: usize,
        f_phys_bdry_op: Option<&dyn PhysicalBoundaryOp>,
        f_prolongation_scheds: &[Option<Box<dyn RefineSchedule>>],
        data_time: f64,
    ) -> IbResult<()> {
        self.begin_sub_step("spread_linearized_force")?;
        self.ensure_allocated(Slot::FJac)?;
        let x_slot = self.prepare_le_position(data_time)?;
        let (f, x) = slot_pair(&mut self.buffers, Slot::FJac, x_slot);
        reset_anchor_point_values(&self.anchor_point_local_idxs, f);
        self.l_data_manager
            .spread(fields, f_idx, f, x, f_phys_bdry_op, f_prolongation_scheds, data_time)
    }

    // -----------------------------------------------------------------------
    // Instrumentation and post-processing
    // -----------------------------------------------------------------------

    /// Locate the flow meters and read velocity `u_idx` and pressure `p_idx`
    /// through them at `data_time`.  Ghost cells of both fields are filled
    /// with the given schedules first.
    #[allow(clippy::too_many_arguments)]
    pub fn update_ib_instrumentation_data(
        &mut self,
        fields: &mut FieldStore,
        u_idx: usize,
        p_idx: usize,
        u_ghost_fill_scheds: &[Option<Box<dyn RefineSchedule>>],
        p_ghost_fill_scheds: &[Option<Box<dyn RefineSchedule>>],
        timestep_num: u64,
        data_time: f64,
    ) -> IbResult<()> {
        if !self.instrument_panel.is_instrumented() {
            return Ok(());
        }
        let mid_step = matches!(self.state, IntegratorState::Preprocessed | IntegratorState::Stepping);
        let x_slot = if mid_step {
            Some(self.prepare_position(data_time)?)
        } else {
            None
        };
        let manager = &self.l_data_manager;
        let hierarchy = manager.hierarchy()?;
        for sched in u_ghost_fill_scheds.iter().chain(p_ghost_fill_scheds).flatten() {
            sched.fill_data(fields, hierarchy, data_time);
        }
        match x_slot {
            Some(slot) => self.instrument_panel.initialize_hierarchy_dependent_data(
                manager,
                &self.buffers[slot as usize],
                timestep_num,
                data_time,
            )?,
            None => {
                let x_data: LevelLData = (0..hierarchy.num_levels())
                    .map(|ln| manager.ldata(POSN_DATA_NAME, ln).cloned())
                    .collect();
                self.instrument_panel
                    .initialize_hierarchy_dependent_data(manager, &x_data, timestep_num, data_time)?;
            }
        }
        self.instrument_panel
            .read_instrument_data(fields, u_idx, p_idx, hierarchy, manager, timestep_num, data_time)
    }

    /// Run the registered post-processor on the current state.
    pub fn post_process_data(&mut self, fields: &FieldStore, data_time: f64) -> IbResult<()> {
        self.require_between_steps("post_process_data")?;
        let Some(post_processor) = self.post_processor.as_deref_mut() else {
            return Ok(());
        };
        let hierarchy = self.l_data_manager.hierarchy()?;
        post_processor.postprocess_data(fields, &self.l_data_manager, hierarchy, data_time)
    }

    // -----------------------------------------------------------------------
    // Hierarchy lifecycle
    // -----------------------------------------------------------------------

    /// Build the Lagrangian data of every level of `hierarchy` and, at the
    /// initial time, interpolate the initial velocity and set up the
    /// sources and flow meters.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize_patch_hierarchy(
        &mut self,
        hierarchy: &PatchHierarchy,
        fields: &mut FieldStore,
        u_idx: usize,
        u_synch_scheds: &[Option<Box<dyn CoarsenSchedule>>],
        u_ghost_fill_scheds: &[Option<Box<dyn RefineSchedule>>],
        integrator_step: u64,
        init_data_time: f64,
        initial_time: bool,
    ) -> IbResult<()> {
        self.require_between_steps("initialize_patch_hierarchy")?;
        let finest_ln = hierarchy.finest_level_number();
        self.reset_hierarchy_configuration(hierarchy, 0, finest_ln)?;
        for ln in 0..=finest_ln {
            self.initialize_level_data(hierarchy, ln, init_data_time, ln < finest_ln, initial_time)?;
        }
        self.integrator_step = integrator_step;
        self.integrator_time = init_data_time;
        if initial_time {
            self.start_time = init_data_time;
        }
        self.update_anchor_points()?;

        let num_levels = finest_ln + 1;
        let mut x_data: LevelLData = (0..num_levels).map(|_| None).collect();
        let mut u_data: LevelLData = (0..num_levels).map(|_| None).collect();
        for ln in 0..num_levels {
            if self.l_data_manager.level_contains_lagrangian_data(ln) {
                x_data[ln] = Some(self.l_data_manager.take_ldata(POSN_DATA_NAME, ln)?);
                u_data[ln] = Some(self.l_data_manager.take_ldata(VEL_DATA_NAME, ln)?);
            }
        }
        let result = self.initialize_time_dependent_data(
            fields,
            u_idx,
            &mut x_data,
            &mut u_data,
            u_synch_scheds,
            u_ghost_fill_scheds,
            integrator_step,
            init_data_time,
            initial_time,
        );
        let taken = x_data.into_iter().enumerate().chain(u_data.into_iter().enumerate());
        for (ln, data) in taken {
            if let Some(data) = data {
                self.l_data_manager.restore_ldata(ln, data)?;
            }
        }
        result?;

        self.ib_force_fcn_needs_init = true;
        self.ib_source_fcn_needs_init = true;
        info!(
            "{}: patch hierarchy initialized with {} level(s) at t = {}",
            self.object_name, num_levels, init_data_time
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn initialize_time_dependent_data(
        &mut self,
        fields: &mut FieldStore,
        u_idx: usize,
        x_data: &mut LevelLData,
        u_data: &mut LevelLData,
        u_synch_scheds: &[Option<Box<dyn CoarsenSchedule>>],
        u_ghost_fill_scheds: &[Option<Box<dyn RefineSchedule>>],
        integrator_step: u64,
        init_data_time: f64,
        initial_time: bool,
    ) -> IbResult<()> {
        let manager = &self.l_data_manager;
        let hierarchy = manager.hierarchy()?;
        if initial_time {
            manager.interp(fields, u_idx, u_data, x_data, u_synch_scheds, u_ghost_fill_scheds, init_data_time)?;
            reset_anchor_point_values(&self.anchor_point_local_idxs, u_data);

            if let Some(source_fcn) = self.ib_source_fcn.as_deref_mut() {
                for ln in 0..hierarchy.num_levels() {
                    source_fcn.initialize_level_data(hierarchy, ln, init_data_time, initial_time, manager)?;
                    let mut level_sources = LevelSources::default();
                    let x = x_data.get(ln).and_then(Option::as_ref);
                    update_level_sources(&*source_fcn, &mut level_sources, x, hierarchy, ln, init_data_time, manager)?;
                    self.sources[ln] = level_sources;
                }
            }
        }

        if !self.instrument_panel.is_instrumented() {
            let names = manager.init_strategy().map(|s| s.instrument_names()).unwrap_or_default();
            if !names.is_empty() {
                self.instrument_panel = Box::new(PlanarFlowMeter::new(names));
            }
        }
        if self.instrument_panel.is_instrumented() {
            self.instrument_panel
                .initialize_hierarchy_dependent_data(manager, x_data, integrator_step, init_data_time)?;
            if self.total_flow_volume.is_empty() {
                self.total_flow_volume = vec![0.0; self.instrument_panel.instrument_names().len()];
            }
        }
        Ok(())
    }

    /// Create the Lagrangian data of level `ln`, including the managed
    /// force vector at the initial time.
    pub fn initialize_level_data(
        &mut self,
        hierarchy: &PatchHierarchy,
        ln: usize,
        init_data_time: f64,
        can_be_refined: bool,
        initial_time: bool,
    ) -> IbResult<()> {
        self.require_between_steps("initialize_level_data")?;
        self.l_data_manager.set_patch_hierarchy(hierarchy);
        self.l_data_manager
            .initialize_level_data(ln, init_data_time, can_be_refined, initial_time)?;
        if initial_time && self.l_data_manager.level_contains_lagrangian_data(ln) {
            self.l_data_manager.create_managed_ldata(FORCE_DATA_NAME, ln, NDIM)?;
        }
        Ok(())
    }

    /// Adopt a changed hierarchy.
    pub fn reset_hierarchy_configuration(
        &mut self,
        hierarchy: &PatchHierarchy,
        coarsest_ln: usize,
        finest_ln: usize,
    ) -> IbResult<()> {
        self.require_between_steps("reset_hierarchy_configuration")?;
        self.l_data_manager
            .reset_hierarchy_configuration(hierarchy, coarsest_ln, finest_ln);
        let num_levels = hierarchy.finest_level_number() + 1;
        self.anchor_point_local_idxs = vec![Vec::new(); num_levels];
        self.sources.resize_with(num_levels, LevelSources::default);
        Ok(())
    }

    /// Per-patch workload of every level.
    pub fn update_workload_estimates(&self) -> IbResult<Vec<Vec<f64>>> {
        let hierarchy = self.l_data_manager.hierarchy()?;
        (0..hierarchy.num_levels())
            .map(|ln| self.l_data_manager.update_workload_estimates(ln))
            .collect()
    }

    /// Stage the Lagrangian data ahead of a regrid or rebalance.
    pub fn begin_data_redistribution(&mut self) -> IbResult<()> {
        self.require_between_steps("begin_data_redistribution")?;
        self.l_data_manager.begin_data_redistribution()
    }

    /// Move the Lagrangian data onto `hierarchy`, recompute the anchors, and
    /// look up the number and locations of the sources again.
    pub fn end_data_redistribution(&mut self, hierarchy: &PatchHierarchy) -> IbResult<()> {
        self.require_between_steps("end_data_redistribution")?;
        self.l_data_manager.end_data_redistribution(hierarchy)?;
        self.update_anchor_points()?;
        if let Some(source_fcn) = self.ib_source_fcn.as_deref() {
            let manager = &self.l_data_manager;
            let hierarchy = manager.hierarchy()?;
            self.sources.resize_with(hierarchy.num_levels(), LevelSources::default);
            for (ln, level_sources) in self.sources.iter_mut().enumerate() {
                let x = manager.ldata(POSN_DATA_NAME, ln);
                update_level_sources(source_fcn, level_sources, x, hierarchy, ln, self.integrator_time, manager)?;
            }
        }
        self.ib_force_fcn_needs_init = true;
        self.ib_source_fcn_needs_init = true;
        Ok(())
    }

    /// Recompute the anchored local nodes: those with an anchor spec and
    /// those lying on a non-periodic physical boundary.
    fn update_anchor_points(&mut self) -> IbResult<()> {
        let eps = 2.0 * f64::EPSILON.sqrt();
        let manager = &self.l_data_manager;
        let hierarchy = manager.hierarchy()?;
        let geometry = &hierarchy.geometry;
        let mut anchors = Vec::with_capacity(hierarchy.num_levels());
        for ln in 0..hierarchy.num_levels() {
            let mut level_anchors = Vec::new();
            if let (Some(mesh), Some(x)) = (manager.mesh(ln), manager.ldata(POSN_DATA_NAME, ln)) {
                for (rank_nodes, part) in mesh.ranks().iter().zip(x.parts()) {
                    let mut idxs = BTreeSet::new();
                    for (i, node) in rank_nodes.local_nodes().iter().enumerate() {
                        let xi = point_at(part.values(), i);
                        let on_boundary = (0..NDIM).any(|d| {
                            !geometry.periodic[d]
                                && (xi[d] <= geometry.x_lower[d] + eps || xi[d] >= geometry.x_upper[d] - eps)
                        });
                        if node.specs.is_anchor() || on_boundary {
                            idxs.insert(i);
                        }
                    }
                    level_anchors.push(idxs);
                }
            }
            anchors.push(level_anchors);
        }
        self.anchor_point_local_idxs = anchors;
        Ok(())
    }

    /// Tag cells of level `ln` for refinement: cells holding nodes of finer
    /// levels and, after the initial time, the stencils of the sources on
    /// level `ln + 1`.
    pub fn apply_gradient_detector(
        &self,
        fields: &mut FieldStore,
        tag_idx: usize,
        ln: usize,
        initial_time: bool,
    ) -> IbResult<()> {
        self.l_data_manager.apply_gradient_detector(fields, tag_idx, ln)?;

        let hierarchy = self.l_data_manager.hierarchy()?;
        if self.ib_source_fcn.is_none() || initial_time || !hierarchy.finer_level_exists(ln) {
            return Ok(());
        }
        let Some(finer_sources) = self.sources.get(ln + 1) else {
            return Ok(());
        };
        let geometry = &hierarchy.geometry;
        let level = hierarchy.level(ln).ok_or(IbError::MissingLevel(ln))?;
        let finer = hierarchy.level(ln + 1).ok_or(IbError::MissingLevel(ln + 1))?;
        let finer_ratio = finer.ratio_to_level_zero;
        let dx_finer = geometry.level_dx(finer_ratio);
        let tags = fields
            .level_data_mut(tag_idx, ln)
            .ok_or(IbError::MissingField { field: tag_idx, level: ln })?;
        for (x, &r) in finer_sources.positions.iter().zip(&finer_sources.radii) {
            let center = geometry.cell_index(x, finer_ratio);
            let mut stencil_box = CellBox::new(center, center);
            for d in 0..NDIM {
                let radius = rounded_radius(r, dx_finer[d]);
                stencil_box = stencil_box.grow_axis(d, (radius / dx_finer[d]) as i64 + 1);
            }
            let coarsened = stencil_box.coarsen(hierarchy.ratio_to_coarser(ln + 1));
            for cell in coarsened.cells() {
                if level.contains_cell(&cell) {
                    tags.set(&cell, 0, 1.0);
                }
            }
        }
        Ok(())
    }

    /// Grow the per-level tag buffers so that every level holding
    /// Lagrangian data is covered by its kernel stencils.
    ///
    /// `max_levels` is the maximum number of levels of the hierarchy and
    /// `ratio_to_coarser[ln]` the refinement ratio between levels `ln` and
    /// `ln - 1`.
    pub fn setup_tag_buffer(&self, tag_buffer: &mut Vec<usize>, max_levels: usize, ratio_to_coarser: &[i64]) {
        let finest_hier_ln = max_levels.saturating_sub(1);
        tag_buffer.resize(finest_hier_ln, 0);
        if let Some(init) = self.l_data_manager.init_strategy() {
            for tag_ln in 0..finest_hier_ln {
                let data_ln = tag_ln + 1;
                let can_be_refined = data_ln < finest_hier_ln;
                if init.level_has_lagrangian_data(data_ln, can_be_refined) {
                    tag_buffer[tag_ln] = tag_buffer[tag_ln].max(self.ghosts);
                }
            }
        }
        for ln in (0..finest_hier_ln.saturating_sub(1)).rev() {
            let ratio = ratio_to_coarser.get(ln + 1).copied().unwrap_or(1).max(1) as usize;
            tag_buffer[ln] = tag_buffer[ln].max(tag_buffer[ln + 1] / ratio + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::{StandardInitializer, StructureSpec};
    use crate::strategies::{PointSource, PrescribedSources, TetherForce};
    use ib_kernel::{GridGeometry, Point};

    struct Setup {
        ib: IBMethod,
        hierarchy: PatchHierarchy,
        fields: FieldStore,
        u_idx: usize,
    }

    fn structure(vertices: Vec<Point>, anchors: Vec<usize>) -> StructureSpec {
        StructureSpec {
            name: "body".to_string(),
            level_number: 0,
            vertices,
            anchors,
            rods: Vec::new(),
            instruments: Vec::new(),
            sources: Vec::new(),
        }
    }

    fn setup_with(spec: StructureSpec, periodic: bool, config: IBMethodConfig, extent: f64) -> Setup {
        let geometry = GridGeometry::new([0.0; NDIM], [extent; NDIM], [8; NDIM], [periodic; NDIM]);
        let hierarchy = PatchHierarchy::uniform(geometry, [1; NDIM], 1);
        let mut ib = IBMethod::new("IBMethod", config).unwrap();
        ib.register_init_strategy(Box::new(StandardInitializer::new(vec![spec], Vec::new())));
        let mut fields = FieldStore::new();
        let u_idx = fields.register("u", NDIM, ib.minimum_ghost_cell_width());
        fields.allocate_all(&hierarchy);
        fields.set_to_scalar(u_idx, 1.0);
        ib.initialize_patch_hierarchy(&hierarchy, &mut fields, u_idx, &[], &[], 0, 0.0, true)
            .unwrap();
        Setup {
            ib,
            hierarchy,
            fields,
            u_idx,
        }
    }

    fn setup(vertices: Vec<Point>) -> Setup {
        setup_with(structure(vertices, Vec::new()), true, IBMethodConfig::default(), 1.0)
    }

    fn values(data: &[Option<LData>]) -> Vec<f64> {
        data[0].as_ref().unwrap().local_form_array(0).to_vec()
    }

    #[test]
    fn test_sub_step_requires_preprocess() {
        let mut s = setup(vec![[0.5; NDIM]]);
        let err = s.ib.euler_step(0.0, 0.1);
        assert!(matches!(err, Err(IbError::InvalidState { operation: "euler_step", .. })));
        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        assert!(matches!(
            s.ib.preprocess_integrate_data(0.0, 0.1, 1),
            Err(IbError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_missing_force_leaves_manager_untouched() {
        let mut s = setup(vec![[0.5; NDIM]]);
        let f = s.ib.l_data_manager_mut().take_ldata(FORCE_DATA_NAME, 0).unwrap();
        let err = s.ib.preprocess_integrate_data(0.0, 0.1, 1);
        assert!(matches!(err, Err(IbError::MissingQuantity { ref name, level: 0 }) if name == FORCE_DATA_NAME));
        assert_eq!(s.ib.state(), IntegratorState::Idle);
        assert!(s.ib.l_data_manager().ldata(POSN_DATA_NAME, 0).is_some());
        assert!(s.ib.l_data_manager().ldata(VEL_DATA_NAME, 0).is_some());

        s.ib.l_data_manager_mut().restore_ldata(0, f).unwrap();
        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        assert_eq!(s.ib.state(), IntegratorState::Preprocessed);
    }

    #[test]
    fn test_unknown_data_time() {
        let mut s = setup(vec![[0.5; NDIM]]);
        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        assert!(matches!(s.ib.position_data(0.07), Err(IbError::UnknownDataTime { .. })));
    }

    #[test]
    fn test_unit_velocity_euler_step() {
        let mut s = setup(vec![[0.5; NDIM]]);
        let u = s.ib.l_data_manager().ldata(VEL_DATA_NAME, 0).unwrap().local_form_array(0).to_vec();
        assert!(u.iter().all(|v| (v - 1.0).abs() < 1e-12));

        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        s.ib.euler_step(0.0, 0.1).unwrap();
        s.ib.postprocess_integrate_data(0.0, 0.1, 1).unwrap();

        let x = s.ib.l_data_manager().ldata(POSN_DATA_NAME, 0).unwrap().local_form_array(0).to_vec();
        assert!(x.iter().all(|v| (v - 0.6).abs() < 1e-12));
        assert_eq!(s.ib.state(), IntegratorState::Postprocessed);
        assert!(s.ib.step_times().0.is_nan());
        assert_eq!(s.ib.integrator_step(), 1);
    }

    #[test]
    fn test_midpoint_recomputed_only_when_stale() {
        let config = IBMethodConfig {
            time_stepping_type: "MIDPOINT_RULE".to_string(),
            ..IBMethodConfig::default()
        };
        let mut s = setup_with(structure(vec![[0.5; NDIM]], Vec::new()), true, config, 8.0);
        let current: Vec<f64> = [1.0, 2.0, 3.0][..NDIM].to_vec();
        let new: Vec<f64> = [3.0, 4.0, 5.0][..NDIM].to_vec();
        let half: Vec<f64> = [2.0, 3.0, 4.0][..NDIM].to_vec();
        s.ib.l_data_manager_mut()
            .ldata_mut(POSN_DATA_NAME, 0)
            .unwrap()
            .local_array_mut(0)
            .unwrap()
            .copy_from_slice(&current);

        s.ib.preprocess_integrate_data(0.0, 1.0, 1).unwrap();
        let mut x_new = s.ib.l_data_manager().create_ldata("X_trial", 0, NDIM).unwrap();
        x_new.local_array_mut(0).unwrap().copy_from_slice(&new);
        s.ib.set_updated_position(&x_new).unwrap();
        assert!(s.ib.x_half_needs_reinit);

        assert_eq!(values(s.ib.position_data(0.5).unwrap()), half);
        assert!(!s.ib.x_half_needs_reinit);

        // a change behind the method's back is not picked up while fresh
        s.ib.buffers[Slot::XNew as usize][0].as_mut().unwrap().set_all(100.0);
        assert_eq!(values(s.ib.position_data(0.5).unwrap()), half);

        // an update through the method marks the midpoint stale
        let newer: Vec<f64> = [5.0, 6.0, 7.0][..NDIM].to_vec();
        x_new.local_array_mut(0).unwrap().copy_from_slice(&newer);
        s.ib.set_updated_position(&x_new).unwrap();
        let expected: Vec<f64> = [3.0, 4.0, 5.0][..NDIM].to_vec();
        assert_eq!(values(s.ib.position_data(0.5).unwrap()), expected);
    }

    #[test]
    fn test_half_velocity_recomputed_once_per_change() {
        let mut s = setup_with(structure(vec![[0.5; NDIM]], Vec::new()), true, IBMethodConfig::default(), 8.0);
        let current: Vec<f64> = [1.0, 2.0, 3.0][..NDIM].to_vec();
        let new: Vec<f64> = [3.0, 4.0, 5.0][..NDIM].to_vec();
        let half: Vec<f64> = [2.0, 3.0, 4.0][..NDIM].to_vec();
        s.ib.l_data_manager_mut()
            .ldata_mut(VEL_DATA_NAME, 0)
            .unwrap()
            .local_array_mut(0)
            .unwrap()
            .copy_from_slice(&current);
        s.ib.preprocess_integrate_data(0.0, 1.0, 1).unwrap();
        s.ib.buffers[Slot::UNew as usize][0]
            .as_mut()
            .unwrap()
            .local_array_mut(0)
            .unwrap()
            .copy_from_slice(&new);

        // endpoint queries never touch the midpoint
        assert_eq!(values(s.ib.velocity_data(0.0).unwrap()), current);
        assert_eq!(values(s.ib.velocity_data(1.0).unwrap()), new);
        assert!(s.ib.u_half_needs_reinit);
        assert!(s.ib.buffers[Slot::UHalf as usize][0].is_none());

        assert_eq!(values(s.ib.velocity_data(0.5).unwrap()), half);
        assert!(!s.ib.u_half_needs_reinit);
        s.ib.buffers[Slot::UNew as usize][0].as_mut().unwrap().set_all(100.0);
        assert_eq!(values(s.ib.velocity_data(0.5).unwrap()), half);

        // interpolating at the new time makes the midpoint stale again
        s.ib.interpolate_velocity(&mut s.fields, s.u_idx, &[], &[], 1.0).unwrap();
        assert!(s.ib.u_half_needs_reinit);
        let expected: Vec<f64> = current.iter().map(|c| 0.5 * (c + 1.0)).collect();
        let recomputed = values(s.ib.velocity_data(0.5).unwrap());
        for (r, e) in recomputed.iter().zip(&expected) {
            assert!((r - e).abs() < 1e-12);
        }

        // interpolating at the half time leaves it fresh
        s.ib.interpolate_velocity(&mut s.fields, s.u_idx, &[], &[], 0.5).unwrap();
        assert!(!s.ib.u_half_needs_reinit);
        s.ib.buffers[Slot::UCurrent as usize][0].as_mut().unwrap().set_all(-7.0);
        assert!(values(s.ib.velocity_data(0.5).unwrap()).iter().all(|v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_midpoint_step_uses_half_velocity() {
        let config = IBMethodConfig {
            time_stepping_type: "MIDPOINT_RULE".to_string(),
            ..IBMethodConfig::default()
        };
        let mut s = setup_with(structure(vec![[0.5; NDIM]], Vec::new()), true, config, 1.0);
        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        s.fields.set_to_scalar(s.u_idx, 3.0);
        s.ib.interpolate_velocity(&mut s.fields, s.u_idx, &[], &[], 0.1).unwrap();
        s.ib.advance_positions(0.0, 0.1).unwrap();
        // U(half) = (1 + 3) / 2
        let x = values(s.ib.position_data(0.1).unwrap());
        assert!(x.iter().all(|v| (v - 0.7).abs() < 1e-12));
    }

    #[test]
    fn test_trapezoidal_step() {
        let mut s = setup(vec![[0.5; NDIM]]);
        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        s.fields.set_to_scalar(s.u_idx, -1.0);
        s.ib.interpolate_velocity(&mut s.fields, s.u_idx, &[], &[], 0.1).unwrap();
        s.ib.trapezoidal_step(0.0, 0.1).unwrap();
        let x = values(s.ib.position_data(0.1).unwrap());
        assert!(x.iter().all(|v| (v - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_buffers_rotate_without_copy() {
        let mut s = setup(vec![[0.5; NDIM]]);
        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        s.ib.euler_step(0.0, 0.1).unwrap();
        let new_storage = s.ib.position_data(0.1).unwrap()[0].as_ref().unwrap().storage_id(0);
        let old_storage = s.ib.position_data(0.0).unwrap()[0].as_ref().unwrap().storage_id(0);
        s.ib.postprocess_integrate_data(0.0, 0.1, 1).unwrap();
        let x = s.ib.l_data_manager().ldata(POSN_DATA_NAME, 0).unwrap();
        assert_eq!(x.storage_id(0), new_storage);
        assert_ne!(x.storage_id(0), old_storage);
    }

    #[test]
    fn test_force_rotates_from_half_when_no_new() {
        let mut s = setup(vec![[0.5; NDIM]]);
        s.ib.register_lagrangian_force_function(Box::new(TetherForce::new(1.0, 2.0)));
        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        s.ib.compute_lagrangian_force(0.05).unwrap();
        let f_half = values(s.ib.force_data(0.05).unwrap());
        // U(half) = 1 everywhere, X at its tether point
        assert!(f_half.iter().all(|v| (v + 2.0).abs() < 1e-12));
        s.ib.postprocess_integrate_data(0.0, 0.1, 1).unwrap();
        let f = s.ib.l_data_manager().ldata(FORCE_DATA_NAME, 0).unwrap().local_form_array(0).to_vec();
        assert_eq!(f, f_half);
    }

    #[test]
    fn test_anchored_nodes_are_held() {
        let spec = structure(vec![[0.25; NDIM], [0.5; NDIM]], vec![0]);
        let mut s = setup_with(spec, true, IBMethodConfig::default(), 1.0);
        let anchors = s.ib.anchor_point_local_indices(0, 0).unwrap().clone();
        assert_eq!(anchors.into_iter().collect::<Vec<_>>(), vec![0]);

        let u = s.ib.l_data_manager().ldata(VEL_DATA_NAME, 0).unwrap().local_form_array(0).to_vec();
        assert!(u[..NDIM].iter().all(|&v| v == 0.0));
        assert!(u[NDIM..].iter().all(|v| (v - 1.0).abs() < 1e-12));

        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        s.ib.euler_step(0.0, 0.1).unwrap();
        let x = values(s.ib.position_data(0.1).unwrap());
        assert!(x[..NDIM].iter().all(|&v| v == 0.25));

        // a force on the anchor is not spread
        s.ib.buffers[Slot::FCurrent as usize][0].as_mut().unwrap().set_all(1.0);
        let f_idx = s.fields.register("f", NDIM, s.ib.minimum_ghost_cell_width());
        s.fields.allocate(f_idx, &s.hierarchy);
        s.ib.spread_force(&mut s.fields, f_idx, None, &[], 0.0).unwrap();
        let f = values(s.ib.force_data(0.0).unwrap());
        assert!(f[..NDIM].iter().all(|&v| v == 0.0));
        assert!((s.fields.integral(f_idx, 0, &s.hierarchy) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_nodes_on_walls_are_anchored() {
        let mut on_wall = [0.5; NDIM];
        on_wall[0] = 0.0;
        let spec = structure(vec![on_wall, [0.5; NDIM]], Vec::new());
        let s = setup_with(spec, false, IBMethodConfig::default(), 1.0);
        let anchors: Vec<usize> = s.ib.anchor_point_local_indices(0, 0).unwrap().iter().copied().collect();
        assert_eq!(anchors, vec![0]);
    }

    #[test]
    fn test_source_conserves_volume() {
        let mut s = setup(vec![[0.5; NDIM]]);
        let mut sources = PrescribedSources::new();
        sources.add_source(
            0,
            PointSource {
                location: [0.5; NDIM],
                radius: 3.0 / 8.0,
                strength: 1.0,
                node: None,
            },
        );
        s.ib.register_lagrangian_source_function(Box::new(sources));
        s.ib.initialize_patch_hierarchy(&s.hierarchy, &mut s.fields, s.u_idx, &[], &[], 0, 0.0, true)
            .unwrap();
        assert_eq!(s.ib.sources()[0].len(), 1);

        let q_idx = s.fields.register("q", 1, 0);
        s.fields.allocate(q_idx, &s.hierarchy);
        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        s.ib.compute_lagrangian_fluid_source(0.05).unwrap();
        s.ib.spread_fluid_source(&mut s.fields, q_idx, 0.05).unwrap();
        assert!((s.fields.integral(q_idx, 0, &s.hierarchy) - 1.0).abs() < 1e-12);

        let p_idx = s.fields.register("p", 1, 0);
        s.fields.allocate(p_idx, &s.hierarchy);
        s.fields.set_to_scalar(p_idx, 5.0);
        s.ib.interpolate_pressure(&s.fields, p_idx, 0.05).unwrap();
        assert!((s.ib.sources()[0].pressures[0] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_residuals() {
        let mut s = setup(vec![[0.5; NDIM]]);
        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        let (mut x, mut f) = s.ib.create_solver_vecs().unwrap();
        s.ib.setup_solver_vecs(&mut x, &mut f).unwrap();
        assert!(x.local_form_array(0).iter().all(|&v| v == 0.5));
        assert_eq!(f.norm2(), 0.0);

        // X_new = X_current + dt U(half) makes the residual vanish
        x.set_all(0.6);
        s.ib.set_updated_position(&x).unwrap();
        let mut r = s.ib.l_data_manager().create_ldata("R", 0, NDIM).unwrap();
        s.ib.compute_residual(&mut r).unwrap();
        assert!(r.norm2() < 1e-12);

        s.ib.interpolate_linearized_velocity(&mut s.fields, s.u_idx, &[], &[], 0.1)
            .unwrap();
        s.ib.compute_linearized_residual(&x, &mut r).unwrap();
        assert!(r.local_form_array(0).iter().all(|v| (v - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_linearized_force_of_tether() {
        let mut s = setup(vec![[0.5; NDIM]]);
        s.ib.register_lagrangian_force_function(Box::new(TetherForce::new(4.0, 0.0)));
        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        let (x, _) = s.ib.create_solver_vecs().unwrap();
        let mut base = x.clone();
        base.set_all(0.5);
        s.ib.set_linearized_position(&base).unwrap();
        let mut v = x;
        v.set_all(1.0);
        s.ib.compute_linearized_lagrangian_force(&v, 0.1).unwrap();
        let f_jac = s.ib.buffers[Slot::FJac as usize][0].as_ref().unwrap().local_form_array(0).to_vec();
        // F = -k (X - X0), so 1/2 dF/dX v = -2
        assert!(f_jac.iter().all(|v| (v + 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_fixed_coupling_positions() {
        let config = IBMethodConfig {
            use_fixed_coupling_ops: true,
            ..IBMethodConfig::default()
        };
        let mut s = setup_with(structure(vec![[0.5; NDIM]], Vec::new()), true, config, 1.0);
        s.ib.preprocess_integrate_data(0.0, 0.1, 1).unwrap();
        s.ib.euler_step(0.0, 0.1).unwrap();
        let slot = s.ib.prepare_le_position(0.1).unwrap();
        assert_eq!(slot, Slot::XLeNew);
        assert!(values(&s.ib.buffers[slot as usize]).iter().all(|&v| v == 0.5));
        s.ib.update_fixed_le_operators().unwrap();
        assert!(values(&s.ib.buffers[slot as usize]).iter().all(|v| (v - 0.6).abs() < 1e-12));
    }

    #[test]
    fn test_restart_round_trip() {
        let s = setup(vec![[0.5; NDIM]]);
        let record = s.ib.put_to_restart();
        assert_eq!(record.version, IB_METHOD_VERSION);
        assert_eq!(record.ghosts, vec![3; NDIM]);
        let restored = IBMethod::from_restart("IBMethod", IBMethodConfig::default(), &record).unwrap();
        assert_eq!(restored.put_to_restart(), record);

        let mut stale = record;
        stale.version = IB_METHOD_VERSION + 1;
        assert!(matches!(
            IBMethod::from_restart("IBMethod", IBMethodConfig::default(), &stale),
            Err(IbError::RestartVersionMismatch { .. })
        ));
    }

    #[test]
    fn test_setup_tag_buffer() {
        let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [8; NDIM], [true; NDIM]);
        let hierarchy = PatchHierarchy::uniform(geometry, [1; NDIM], 1);
        let mut ib = IBMethod::new("IBMethod", IBMethodConfig::default()).unwrap();
        ib.l_data_manager_mut().set_patch_hierarchy(&hierarchy);
        let mut spec = structure(vec![[0.5; NDIM]], Vec::new());
        spec.level_number = 2;
        ib.register_init_strategy(Box::new(StandardInitializer::new(vec![spec], Vec::new())));
        let mut tag_buffer = Vec::new();
        ib.setup_tag_buffer(&mut tag_buffer, 3, &[1, 2, 2]);
        assert_eq!(tag_buffer, vec![2, 3]);
    }

    #[test]
    fn test_equal_eps() {
        assert!(equal_eps(0.1 + 0.2, 0.3));
        assert!(equal_eps(0.0, 1e-13));
        assert!(!equal_eps(1.0, 1.0 + 1e-9));
        assert!(!equal_eps(f64::NAN, f64::NAN));
    }
}
