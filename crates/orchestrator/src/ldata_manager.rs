//! Lagrangian data manager
//!
//! Owns, per level of the patch hierarchy, the node layout ([`LMesh`]), the
//! named point vectors that live with it, and the structure registry.  It
//! provides the two coupling operations, interpolation of a grid field to
//! the points and spreading of point values to a grid field, and it moves
//! all managed data to new owners when the hierarchy is regridded.
//!
//! Ownership rule: a node belongs to the rank whose patch contains the cell
//! holding the node (after periodic wrapping).  Every other rank whose patch,
//! grown by the ghost width, contains that cell or one of its periodic images
//! holds a ghost copy.

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use ib_kernel::ldata::point_at;
use ib_kernel::{
    interpolate_point, spread_point, CellBox, DeltaKernel, FieldStore, GridGeometry, LData, LMesh, LNode, LevelData,
    PatchHierarchy, NDIM,
};
use tracing::{debug, info, warn};

use crate::error::{IbError, IbResult};
use crate::init::LInitStrategy;
use crate::schedules::{CoarsenSchedule, PhysicalBoundaryOp, RefineSchedule};

/// Name of the managed position vector.
pub const POSN_DATA_NAME: &str = "X";

/// Name of the managed velocity vector.
pub const VEL_DATA_NAME: &str = "U";

/// One optional vector per level.
pub type LevelLData = Vec<Option<LData>>;

// ---------------------------------------------------------------------------
// Structure registry
// ---------------------------------------------------------------------------

/// Structures of one level and the contiguous Lagrangian index ranges they
/// occupy.
#[derive(Debug, Clone, Default)]
struct StructureRegistry {
    names: BTreeMap<usize, String>,
    ids_by_name: BTreeMap<String, usize>,
    ranges: BTreeMap<usize, (usize, usize)>,
    // keyed by the last Lagrangian index of each structure
    ids_by_last_index: BTreeMap<usize, usize>,
    inactive: BTreeSet<usize>,
}

impl StructureRegistry {
    fn add(&mut self, id: usize, name: String, range: (usize, usize)) {
        self.ids_by_name.insert(name.clone(), id);
        self.names.insert(id, name);
        self.ranges.insert(id, range);
        if range.1 > range.0 {
            self.ids_by_last_index.insert(range.1 - 1, id);
        }
    }

    fn id_of(&self, lag_idx: usize) -> Option<usize> {
        let (_, &id) = self.ids_by_last_index.range(lag_idx..).next()?;
        let (lo, hi) = self.ranges[&id];
        (lo <= lag_idx && lag_idx < hi).then_some(id)
    }
}

// ---------------------------------------------------------------------------
// Per-level state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LevelState {
    mesh: LMesh,
    data: BTreeMap<String, LData>,
    structures: StructureRegistry,
}

/// Level contents held in Lagrangian order between the two halves of a
/// redistribution.
#[derive(Debug)]
struct StagedLevel {
    nodes: Vec<LNode>,
    quantities: Vec<(String, usize, Vec<f64>)>,
    structures: StructureRegistry,
}

/// Per-level Lagrangian data plus the coupling operators that act on it.
pub struct LDataManager {
    object_name: String,
    interp_kernel: DeltaKernel,
    spread_kernel: DeltaKernel,
    ghost_width: usize,
    hierarchy: Option<PatchHierarchy>,
    levels: Vec<Option<LevelState>>,
    init_strategy: Option<Box<dyn LInitStrategy>>,
    staged: Option<Vec<Option<StagedLevel>>>,
    node_workload_weight: f64,
}

impl LDataManager {
    /// Create a manager using the given kernels.
    ///
    /// The ghost width is raised to whatever the kernels need.
    pub fn new(object_name: &str, interp_kernel: DeltaKernel, spread_kernel: DeltaKernel, min_ghost_width: usize) -> Self {
        if interp_kernel != spread_kernel {
            warn!(
                "{}: interpolation kernel {} differs from spreading kernel {}; the coupling operators will not be adjoint",
                object_name,
                interp_kernel.name(),
                spread_kernel.name()
            );
        }
        let ghost_width = min_ghost_width
            .max(interp_kernel.min_ghost_width())
            .max(spread_kernel.min_ghost_width());
        Self {
            object_name: object_name.to_string(),
            interp_kernel,
            spread_kernel,
            ghost_width,
            hierarchy: None,
            levels: Vec::new(),
            init_strategy: None,
            staged: None,
            node_workload_weight: 1.0,
        }
    }

    /// Name used in diagnostics.
    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Ghost width grid fields must carry for interpolation and spreading.
    pub fn ghost_cell_width(&self) -> usize {
        self.ghost_width
    }

    /// Interpolation kernel.
    pub fn interp_kernel(&self) -> &DeltaKernel {
        &self.interp_kernel
    }

    /// Spreading kernel.
    pub fn spread_kernel(&self) -> &DeltaKernel {
        &self.spread_kernel
    }

    /// Workload added to a patch for each node it contains.
    pub fn set_node_workload_weight(&mut self, weight: f64) {
        self.node_workload_weight = weight;
    }

    /// Install the strategy that supplies initial structures.
    pub fn register_init_strategy(&mut self, strategy: Box<dyn LInitStrategy>) {
        self.init_strategy = Some(strategy);
    }

    /// Drop the initialization strategy once initial data exists.
    pub fn free_init_strategy(&mut self) {
        self.init_strategy = None;
    }

    /// Installed initialization strategy.
    pub fn init_strategy(&self) -> Option<&dyn LInitStrategy> {
        self.init_strategy.as_deref()
    }

    /// Provide the patch hierarchy.
    pub fn set_patch_hierarchy(&mut self, hierarchy: &PatchHierarchy) {
        self.hierarchy = Some(hierarchy.clone());
    }

    /// Current patch hierarchy.
    pub fn hierarchy(&self) -> IbResult<&PatchHierarchy> {
        self.hierarchy
            .as_ref()
            .ok_or_else(|| IbError::HierarchyNotInitialized(self.object_name.clone()))
    }

    /// Number of levels tracked (with or without data).
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Finest tracked level number.
    pub fn finest_level_number(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// Whether level `ln` holds Lagrangian data.
    pub fn level_contains_lagrangian_data(&self, ln: usize) -> bool {
        self.level_state(ln).is_some()
    }

    /// Node layout of level `ln`.
    pub fn mesh(&self, ln: usize) -> Option<&LMesh> {
        self.level_state(ln).map(|s| &s.mesh)
    }

    /// Number of nodes on level `ln`.
    pub fn num_nodes(&self, ln: usize) -> usize {
        self.mesh(ln).map_or(0, LMesh::num_nodes)
    }

    /// Number of nodes of level `ln` owned by `rank`.
    pub fn num_local_nodes(&self, ln: usize, rank: usize) -> usize {
        self.mesh(ln).map_or(0, |m| m.num_local_nodes(rank))
    }

    fn level_state(&self, ln: usize) -> Option<&LevelState> {
        self.levels.get(ln).and_then(Option::as_ref)
    }

    fn level_state_mut(&mut self, ln: usize) -> Option<&mut LevelState> {
        self.levels.get_mut(ln).and_then(Option::as_mut)
    }

    fn check_not_redistributing(&self) -> IbResult<()> {
        if self.staged.is_some() {
            return Err(IbError::RedistributionInProgress);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Data access
    // -----------------------------------------------------------------------

    /// Zero vector on level `ln` that the manager does not track.
    pub fn create_ldata(&self, name: &str, ln: usize, depth: usize) -> IbResult<LData> {
        self.check_not_redistributing()?;
        let state = self.level_state(ln).ok_or(IbError::LevelWithoutLagrangianData(ln))?;
        Ok(LData::new(name, depth, &state.mesh))
    }

    /// Zero vector on level `ln` that the manager tracks and redistributes.
    ///
    /// An existing managed vector with the same name is replaced.
    pub fn create_managed_ldata(&mut self, name: &str, ln: usize, depth: usize) -> IbResult<&mut LData> {
        self.check_not_redistributing()?;
        let state = self.level_state_mut(ln).ok_or(IbError::LevelWithoutLagrangianData(ln))?;
        let data = LData::new(name, depth, &state.mesh);
        state.data.insert(name.to_string(), data);
        state
            .data
            .get_mut(name)
            .ok_or_else(|| IbError::MissingQuantity { name: name.to_string(), level: ln })
    }

    /// Managed vector `name` on level `ln`.
    pub fn ldata(&self, name: &str, ln: usize) -> Option<&LData> {
        self.level_state(ln).and_then(|s| s.data.get(name))
    }

    /// Mutable managed vector `name` on level `ln`.
    pub fn ldata_mut(&mut self, name: &str, ln: usize) -> Option<&mut LData> {
        self.level_state_mut(ln).and_then(|s| s.data.get_mut(name))
    }

    /// Names of the managed vectors on level `ln`.
    pub fn managed_ldata_names(&self, ln: usize) -> Vec<String> {
        self.level_state(ln).map_or_else(Vec::new, |s| s.data.keys().cloned().collect())
    }

    /// Remove a managed vector so the caller can hold it by value.
    ///
    /// The caller must hand it back with [`restore_ldata`](Self::restore_ldata)
    /// before the next redistribution, or it will not follow its nodes.
    pub fn take_ldata(&mut self, name: &str, ln: usize) -> IbResult<LData> {
        self.level_state_mut(ln)
            .and_then(|s| s.data.remove(name))
            .ok_or_else(|| IbError::MissingQuantity { name: name.to_string(), level: ln })
    }

    /// Return a vector taken with [`take_ldata`](Self::take_ldata).
    pub fn restore_ldata(&mut self, ln: usize, data: LData) -> IbResult<()> {
        let state = self.level_state_mut(ln).ok_or(IbError::LevelWithoutLagrangianData(ln))?;
        state.data.insert(data.name().to_string(), data);
        Ok(())
    }

    /// Values of a managed vector in Lagrangian-index order.
    pub fn gather_ldata(&self, name: &str, ln: usize) -> Option<Vec<f64>> {
        let state = self.level_state(ln)?;
        state.data.get(name).map(|d| d.gather(&state.mesh))
    }

    // -----------------------------------------------------------------------
    // Interpolation and spreading
    // -----------------------------------------------------------------------

    /// Field `idx` must be allocated on every level holding Lagrangian data,
    /// with enough ghost cells for `kernel`.
    fn check_field(&self, fields: &FieldStore, idx: usize, kernel: &DeltaKernel) -> IbResult<()> {
        for (ln, state) in self.levels.iter().enumerate() {
            if state.is_none() {
                continue;
            }
            let data = fields
                .level_data(idx, ln)
                .ok_or(IbError::MissingField { field: idx, level: ln })?;
            let found = data.ghost_width();
            let required = kernel.min_ghost_width();
            if found < required {
                return Err(IbError::InsufficientGhostWidth { field: idx, required, found });
            }
        }
        Ok(())
    }

    /// Interpolate grid field `u_idx` to the points of every level.
    ///
    /// The field is first synchronized coarse-from-fine (finest first) and
    /// ghost filled (coarsest first) with the given schedules.  Position
    /// vectors with stale ghosts are ghost filled; the velocity vectors are
    /// left needing a ghost fill.
    ///
    /// # Arguments
    /// * `fields` - Grid field storage.
    /// * `u_idx` - Field to interpolate.
    /// * `u_data` - Per-level output vectors.
    /// * `x_data` - Per-level positions.
    /// * `u_synch_scheds` - Per-level coarsen schedules.
    /// * `u_ghost_fill_scheds` - Per-level ghost-fill schedules.
    /// * `fill_data_time` - Time at which ghosts are filled.
    #[allow(clippy::too_many_arguments)]
    pub fn interp(
        &self,
        fields: &mut FieldStore,
        u_idx: usize,
        u_data: &mut [Option<LData>],
        x_data: &mut [Option<LData>],
        u_synch_scheds: &[Option<Box<dyn CoarsenSchedule>>],
        u_ghost_fill_scheds: &[Option<Box<dyn RefineSchedule>>],
        fill_data_time: f64,
    ) -> IbResult<()> {
        self.check_not_redistributing()?;
        self.check_field(fields, u_idx, &self.interp_kernel)?;
        let hierarchy = self.hierarchy()?;
        let finest = hierarchy.finest_level_number();

        for ln in (0..=finest).rev() {
            if let Some(Some(sched)) = u_synch_scheds.get(ln) {
                sched.coarsen_data(fields, hierarchy);
            }
        }
        for ln in 0..=finest {
            if let Some(Some(sched)) = u_ghost_fill_scheds.get(ln) {
                sched.fill_data(fields, hierarchy, fill_data_time);
            }
        }

        for ln in 0..=finest {
            let Some(state) = self.level_state(ln) else {
                continue;
            };
            let level = hierarchy.level(ln).ok_or(IbError::MissingLevel(ln))?;
            let x = level_vector(x_data, POSN_DATA_NAME, ln)?;
            if x.needs_ghost_fill() {
                x.ghost_fill(&state.mesh);
            }
            let u = level_vector(u_data, VEL_DATA_NAME, ln)?;
            let data = fields
                .level_data(u_idx, ln)
                .ok_or(IbError::MissingField { field: u_idx, level: ln })?;
            check_depth(u, data, fields.name(u_idx))?;
            interpolate_level(
                &self.interp_kernel,
                &hierarchy.geometry,
                level.ratio_to_level_zero,
                data,
                u,
                x,
            );
        }
        Ok(())
    }

    /// Spread point values onto grid field `f_idx`, adding to its contents.
    ///
    /// For each level, coarsest first: the prolongation schedule (if any)
    /// initializes the level from the coarser one, local point values are
    /// spread, contributions landing in periodic ghost cells are folded back
    /// onto their images, and the physical-boundary operator (if any) folds
    /// wall ghosts into the interior.
    ///
    /// # Arguments
    /// * `fields` - Grid field storage.
    /// * `f_idx` - Field receiving the values.
    /// * `f_data` - Per-level point values.
    /// * `x_data` - Per-level positions.
    /// * `f_phys_bdry_op` - Optional physical-boundary accumulation.
    /// * `f_prolongation_scheds` - Per-level prolongation schedules.
    /// * `fill_data_time` - Time passed to the prolongation.
    #[allow(clippy::too_many_arguments)]
    pub fn spread(
        &self,
        fields: &mut FieldStore,
        f_idx: usize,
        f_data: &mut [Option<LData>],
        x_data: &mut [Option<LData>],
        f_phys_bdry_op: Option<&dyn PhysicalBoundaryOp>,
        f_prolongation_scheds: &[Option<Box<dyn RefineSchedule>>],
        fill_data_time: f64,
    ) -> IbResult<()> {
        self.check_not_redistributing()?;
        self.check_field(fields, f_idx, &self.spread_kernel)?;
        let hierarchy = self.hierarchy()?;
        let geometry = &hierarchy.geometry;
        let field_name = fields.name(f_idx).map(str::to_string);

        for ln in 0..=hierarchy.finest_level_number() {
            if ln > 0 {
                if let Some(Some(sched)) = f_prolongation_scheds.get(ln) {
                    sched.fill_data(fields, hierarchy, fill_data_time);
                }
            }
            let Some(state) = self.level_state(ln) else {
                continue;
            };
            let level = hierarchy.level(ln).ok_or(IbError::MissingLevel(ln))?;
            let ratio = level.ratio_to_level_zero;
            let f = level_vector(f_data, "F", ln)?;
            if f.needs_ghost_fill() {
                f.ghost_fill(&state.mesh);
            }
            let x = level_vector(x_data, POSN_DATA_NAME, ln)?;
            if x.needs_ghost_fill() {
                x.ghost_fill(&state.mesh);
            }
            let data = fields
                .level_data_mut(f_idx, ln)
                .ok_or(IbError::MissingField { field: f_idx, level: ln })?;
            check_depth(f, data, field_name.as_deref())?;

            let depth = f.depth();
            for (f_part, x_part) in f.parts().iter().zip(x.parts()) {
                let values = f_part.values();
                for i in 0..f_part.num_local() {
                    let xi = point_at(x_part.values(), i);
                    spread_point(&self.spread_kernel, geometry, ratio, data, &xi, &values[i * depth..(i + 1) * depth]);
                }
            }
            data.fold_periodic_ghosts(geometry, ratio);
            if let Some(op) = f_phys_bdry_op {
                op.accumulate_from_physical_boundary(data, geometry, ratio);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Level lifecycle
    // -----------------------------------------------------------------------

    /// Create the Lagrangian data of level `ln`.
    ///
    /// At the initial time the registered strategy supplies the structures:
    /// they receive contiguous Lagrangian indices in the order given, their
    /// specs are shifted to those indices, and managed `X` (initial
    /// positions) and `U` (zero) vectors are created.  At later times new
    /// levels receive their data through redistribution, so only the level
    /// slot is created.
    pub fn initialize_level_data(
        &mut self,
        ln: usize,
        init_data_time: f64,
        can_be_refined: bool,
        initial_time: bool,
    ) -> IbResult<()> {
        self.check_not_redistributing()?;
        if self.levels.len() <= ln {
            self.levels.resize_with(ln + 1, || None);
        }
        if !initial_time {
            return Ok(());
        }
        let built = {
            let hierarchy = self.hierarchy()?;
            match self.init_strategy.as_deref() {
                Some(strategy) if strategy.level_has_lagrangian_data(ln, can_be_refined) => {
                    Some(build_initial_level(strategy, hierarchy, ln, self.ghost_width)?)
                }
                _ => None,
            }
        };
        if let Some(state) = &built {
            info!(
                "{}: level {} initialized at t = {} with {} structure(s) and {} node(s)",
                self.object_name,
                ln,
                init_data_time,
                state.structures.names.len(),
                state.mesh.num_nodes()
            );
        }
        self.levels[ln] = built;
        Ok(())
    }

    /// Adopt a changed hierarchy; levels finer than `finest_ln` are dropped.
    pub fn reset_hierarchy_configuration(&mut self, hierarchy: &PatchHierarchy, coarsest_ln: usize, finest_ln: usize) {
        debug!(
            "{}: resetting hierarchy configuration for levels {}..={}",
            self.object_name, coarsest_ln, finest_ln
        );
        self.hierarchy = Some(hierarchy.clone());
        self.levels.resize_with(finest_ln + 1, || None);
    }

    /// Per-patch workload of level `ln`: one unit per cell plus the node
    /// weight for every node whose cell lies in the patch.
    pub fn update_workload_estimates(&self, ln: usize) -> IbResult<Vec<f64>> {
        let hierarchy = self.hierarchy()?;
        let level = hierarchy.level(ln).ok_or(IbError::MissingLevel(ln))?;
        let mut workload: Vec<f64> = level.patches.iter().map(|p| p.cell_box.num_cells() as f64).collect();
        if let Some(x) = self.ldata(POSN_DATA_NAME, ln) {
            let geometry = &hierarchy.geometry;
            let ratio = level.ratio_to_level_zero;
            for part in x.parts() {
                for i in 0..part.num_local() {
                    let cell = geometry.wrap_periodic(&geometry.cell_index(&point_at(part.values(), i), ratio), ratio);
                    if let Some(p) = level.patch_containing(&cell) {
                        workload[p] += self.node_workload_weight;
                    }
                }
            }
        }
        Ok(workload)
    }

    /// Tag cells of level `ln` that contain nodes living on finer levels.
    ///
    /// Tags are written as 1.0 into component 0 of field `tag_idx`.
    pub fn apply_gradient_detector(&self, fields: &mut FieldStore, tag_idx: usize, ln: usize) -> IbResult<()> {
        let hierarchy = self.hierarchy()?;
        let level = hierarchy.level(ln).ok_or(IbError::MissingLevel(ln))?;
        let geometry = &hierarchy.geometry;
        let ratio = level.ratio_to_level_zero;
        let tags = fields
            .level_data_mut(tag_idx, ln)
            .ok_or(IbError::MissingField { field: tag_idx, level: ln })?;
        let mut num_tagged = 0usize;
        for finer in ln + 1..self.levels.len() {
            let Some(x) = self.ldata(POSN_DATA_NAME, finer) else {
                continue;
            };
            for part in x.parts() {
                for i in 0..part.num_local() {
                    let cell = geometry.wrap_periodic(&geometry.cell_index(&point_at(part.values(), i), ratio), ratio);
                    if level.contains_cell(&cell) {
                        tags.set(&cell, 0, 1.0);
                        num_tagged += 1;
                    }
                }
            }
        }
        debug!("{}: tagged {} cell(s) on level {}", self.object_name, num_tagged, ln);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Redistribution
    // -----------------------------------------------------------------------

    /// Stage every managed vector in Lagrangian order ahead of a regrid.
    ///
    /// Until [`end_data_redistribution`](Self::end_data_redistribution) the
    /// point data must not be used.
    pub fn begin_data_redistribution(&mut self) -> IbResult<()> {
        self.check_not_redistributing()?;
        let staged = self
            .levels
            .iter()
            .map(|level| {
                level.as_ref().map(|state| StagedLevel {
                    nodes: state.mesh.owned_nodes().cloned().collect(),
                    quantities: state
                        .data
                        .values()
                        .map(|d| (d.name().to_string(), d.depth(), d.gather(&state.mesh)))
                        .collect(),
                    structures: state.structures.clone(),
                })
            })
            .collect();
        self.staged = Some(staged);
        debug!("{}: Lagrangian data staged for redistribution", self.object_name);
        Ok(())
    }

    /// Reassign every node to the rank owning its cell on `hierarchy`.
    ///
    /// Positions are wrapped into the domain along periodic axes first.
    /// Every managed vector follows its nodes and has its ghosts filled.
    pub fn end_data_redistribution(&mut self, hierarchy: &PatchHierarchy) -> IbResult<()> {
        let staged = self.staged.take().ok_or(IbError::NoRedistributionInProgress)?;
        self.hierarchy = Some(hierarchy.clone());
        let mut levels = Vec::with_capacity(staged.len());
        for (ln, level) in staged.into_iter().enumerate() {
            let Some(mut level) = level else {
                levels.push(None);
                continue;
            };
            let positions = level
                .quantities
                .iter_mut()
                .find(|(name, _, _)| name == POSN_DATA_NAME)
                .map(|(_, _, values)| {
                    wrap_positions(&hierarchy.geometry, values);
                    values.clone()
                })
                .ok_or_else(|| IbError::MissingQuantity { name: POSN_DATA_NAME.to_string(), level: ln })?;
            let mesh = partition_level(hierarchy, ln, self.ghost_width, level.nodes, &positions)?;
            let data = level
                .quantities
                .into_iter()
                .map(|(name, depth, global)| {
                    let vector = LData::scatter(&name, depth, &mesh, &global);
                    (name, vector)
                })
                .collect();
            levels.push(Some(LevelState {
                mesh,
                data,
                structures: level.structures,
            }));
        }
        self.levels = levels;
        info!("{}: Lagrangian data redistributed over {} level(s)", self.object_name, self.levels.len());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Structures and index maps
    // -----------------------------------------------------------------------

    /// Structure containing Lagrangian index `lag_idx` on level `ln`.
    pub fn structure_id(&self, lag_idx: usize, ln: usize) -> Option<usize> {
        self.level_state(ln)?.structures.id_of(lag_idx)
    }

    /// Structure with the given name on level `ln`.
    pub fn structure_id_by_name(&self, name: &str, ln: usize) -> Option<usize> {
        self.level_state(ln)?.structures.ids_by_name.get(name).copied()
    }

    /// Name of structure `id` on level `ln`.
    pub fn structure_name(&self, id: usize, ln: usize) -> Option<&str> {
        self.level_state(ln)?.structures.names.get(&id).map(String::as_str)
    }

    /// Half-open Lagrangian index range of structure `id`.
    pub fn structure_index_range(&self, id: usize, ln: usize) -> Option<(usize, usize)> {
        self.level_state(ln)?.structures.ranges.get(&id).copied()
    }

    /// Structure ids on level `ln`, ascending.
    pub fn structure_ids(&self, ln: usize) -> Vec<usize> {
        self.level_state(ln)
            .map_or_else(Vec::new, |s| s.structures.names.keys().copied().collect())
    }

    /// Structure names on level `ln`, ordered by id.
    pub fn structure_names(&self, ln: usize) -> Vec<String> {
        self.level_state(ln)
            .map_or_else(Vec::new, |s| s.structures.names.values().cloned().collect())
    }

    /// Number of structures on level `ln`.
    pub fn num_structures(&self, ln: usize) -> usize {
        self.level_state(ln).map_or(0, |s| s.structures.names.len())
    }

    /// Mark structures as active.
    pub fn activate_structures(&mut self, ids: &[usize], ln: usize) {
        if let Some(state) = self.level_state_mut(ln) {
            for id in ids {
                state.structures.inactive.remove(id);
            }
        }
    }

    /// Mark structures as inactive.
    pub fn inactivate_structures(&mut self, ids: &[usize], ln: usize) {
        if let Some(state) = self.level_state_mut(ln) {
            for &id in ids {
                if state.structures.names.contains_key(&id) {
                    state.structures.inactive.insert(id);
                }
            }
        }
    }

    /// Whether structure `id` exists and is active.
    pub fn structure_is_activated(&self, id: usize, ln: usize) -> bool {
        self.level_state(ln)
            .is_some_and(|s| s.structures.names.contains_key(&id) && !s.structures.inactive.contains(&id))
    }

    /// Global (rank-major) index of Lagrangian index `lag_idx`.
    pub fn map_lagrangian_to_petsc(&self, lag_idx: usize, ln: usize) -> Option<usize> {
        self.mesh(ln)?.lagrangian_to_global(lag_idx)
    }

    /// Lagrangian index of global index `petsc_idx`.
    pub fn map_petsc_to_lagrangian(&self, petsc_idx: usize, ln: usize) -> Option<usize> {
        self.mesh(ln)?.global_to_lagrangian(petsc_idx)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn level_vector<'a>(data: &'a mut [Option<LData>], name: &str, ln: usize) -> IbResult<&'a mut LData> {
    data.get_mut(ln)
        .and_then(Option::as_mut)
        .ok_or_else(|| IbError::MissingQuantity { name: name.to_string(), level: ln })
}

fn check_depth(points: &LData, grid: &LevelData, field_name: Option<&str>) -> IbResult<()> {
    if points.depth() != grid.depth() {
        return Err(ib_kernel::KernelError::LayoutMismatch {
            left: points.name().to_string(),
            right: field_name.unwrap_or("grid field").to_string(),
        }
        .into());
    }
    Ok(())
}

/// Interpolate onto the local nodes of each rank, one scoped thread per rank.
fn interpolate_level(
    kernel: &DeltaKernel,
    geometry: &GridGeometry,
    ratio: i64,
    data: &LevelData,
    u: &mut LData,
    x: &LData,
) {
    let depth = u.depth();
    let x_parts = x.parts();
    thread::scope(|scope| {
        for (u_part, x_part) in u.local_parts_mut().iter_mut().zip(x_parts) {
            scope.spawn(move || {
                let positions = x_part.values();
                let num_local = u_part.num_local();
                let values = u_part.values_mut();
                for i in 0..num_local {
                    let xi = point_at(positions, i);
                    interpolate_point(kernel, geometry, ratio, data, &xi, &mut values[i * depth..(i + 1) * depth]);
                }
            });
        }
    });
}

/// Shift positions by whole periods into `[x_lower, x_upper)` along
/// periodic axes.
fn wrap_positions(geometry: &GridGeometry, positions: &mut [f64]) {
    for x in positions.chunks_exact_mut(NDIM) {
        for d in 0..NDIM {
            if geometry.periodic[d] {
                let length = geometry.x_upper[d] - geometry.x_lower[d];
                x[d] = geometry.x_lower[d] + (x[d] - geometry.x_lower[d]).rem_euclid(length);
            }
        }
    }
}

/// Assign `nodes` to ranks by the patch containing each node's cell and
/// collect the ghost requests of every other nearby rank.
fn partition_level(
    hierarchy: &PatchHierarchy,
    ln: usize,
    ghost_width: usize,
    nodes: Vec<LNode>,
    positions: &[f64],
) -> IbResult<LMesh> {
    let level = hierarchy.level(ln).ok_or(IbError::MissingLevel(ln))?;
    let geometry = &hierarchy.geometry;
    let ratio = level.ratio_to_level_zero;
    let num_ranks = hierarchy.num_ranks();
    let grown: Vec<(usize, CellBox)> = level
        .patches
        .iter()
        .map(|p| (p.owner, p.cell_box.grow(ghost_width as i64)))
        .collect();

    let mut owned = Vec::with_capacity(nodes.len());
    let mut ghost_requests = vec![Vec::new(); num_ranks];
    for node in nodes {
        let lag_idx = node.lagrangian_index;
        let home = geometry.wrap_periodic(&geometry.cell_index(&point_at(positions, lag_idx), ratio), ratio);
        let patch = level
            .patch_containing(&home)
            .ok_or(IbError::NodeOutsideLevel { level: ln, lag_idx })?;
        let owner = level.patches[patch].owner;
        let mut images = geometry.periodic_images(&home, ratio);
        images.push(home);
        for (rank, region) in &grown {
            if *rank != owner && images.iter().any(|c| region.contains(c)) {
                if let Some(requests) = ghost_requests.get_mut(*rank) {
                    requests.push(lag_idx);
                }
            }
        }
        owned.push((owner, node));
    }
    Ok(LMesh::new(ln, num_ranks, owned, ghost_requests)?)
}

fn build_initial_level(
    strategy: &dyn LInitStrategy,
    hierarchy: &PatchHierarchy,
    ln: usize,
    ghost_width: usize,
) -> IbResult<LevelState> {
    let mut structures = StructureRegistry::default();
    let mut nodes = Vec::new();
    let mut positions = Vec::new();
    let mut offset = 0;
    for (id, structure) in strategy.structures_on_level(ln).into_iter().enumerate() {
        let num_vertices = structure.positions.len();
        if structure.specs.len() != num_vertices {
            return Err(IbError::Config(format!(
                "structure {} has {} vertices but {} spec entries",
                structure.name,
                num_vertices,
                structure.specs.len()
            )));
        }
        if structures.ids_by_name.contains_key(&structure.name) {
            return Err(IbError::Config(format!("duplicate structure name {}", structure.name)));
        }
        structures.add(id, structure.name, (offset, offset + num_vertices));
        for (vertex, (x, mut specs)) in structure.positions.into_iter().zip(structure.specs).enumerate() {
            specs.shift_indices(offset);
            nodes.push(LNode::new(offset + vertex, specs));
            positions.extend_from_slice(&x);
        }
        offset += num_vertices;
    }

    let mesh = partition_level(hierarchy, ln, ghost_width, nodes, &positions)?;
    let mut data = BTreeMap::new();
    data.insert(
        POSN_DATA_NAME.to_string(),
        LData::scatter(POSN_DATA_NAME, NDIM, &mesh, &positions),
    );
    data.insert(VEL_DATA_NAME.to_string(), LData::new(VEL_DATA_NAME, NDIM, &mesh));
    Ok(LevelState { mesh, data, structures })
}
