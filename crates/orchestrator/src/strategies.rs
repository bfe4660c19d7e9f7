//! Pluggable structure-side collaborators of the IB method
//!
//! The IB method owns at most one strategy of each kind.  Force strategies
//! turn positions and velocities into Lagrangian forces, source strategies
//! describe point sources/sinks of fluid, and post-processors observe the
//! state after each step.

use std::collections::BTreeMap;

use ib_kernel::ldata::point_at;
use ib_kernel::{LData, PatchHierarchy, Point, FieldStore, NDIM};
use tracing::{debug, info};

use crate::error::{IbError, IbResult};
use crate::ldata_manager::{LDataManager, POSN_DATA_NAME, VEL_DATA_NAME};

/// Computes Lagrangian forces on one level.
pub trait LagrangianForceStrategy: Send {
    /// Announce the step about to be taken.
    fn set_time_interval(&mut self, _current_time: f64, _new_time: f64) {}

    /// (Re)build per-level state after the hierarchy or node layout changed.
    fn initialize_level_data(
        &mut self,
        _hierarchy: &PatchHierarchy,
        _level_number: usize,
        _init_data_time: f64,
        _initial_time: bool,
        _manager: &LDataManager,
    ) -> IbResult<()> {
        Ok(())
    }

    /// Add the force at `data_time` into `f` (which arrives zeroed).
    #[allow(clippy::too_many_arguments)]
    fn compute_lagrangian_force(
        &mut self,
        f: &mut LData,
        x: &LData,
        u: &LData,
        hierarchy: &PatchHierarchy,
        level_number: usize,
        data_time: f64,
        manager: &LDataManager,
    ) -> IbResult<()>;
}

/// Describes point sources and sinks of fluid on each level.
pub trait LagrangianSourceStrategy: Send {
    /// Announce the step about to be taken.
    fn set_time_interval(&mut self, _current_time: f64, _new_time: f64) {}

    /// (Re)build per-level state after the hierarchy or node layout changed.
    fn initialize_level_data(
        &mut self,
        _hierarchy: &PatchHierarchy,
        _level_number: usize,
        _init_data_time: f64,
        _initial_time: bool,
        _manager: &LDataManager,
    ) -> IbResult<()> {
        Ok(())
    }

    /// Number of sources on a level.
    fn num_sources(&self, hierarchy: &PatchHierarchy, level_number: usize, data_time: f64, manager: &LDataManager) -> usize;

    /// Write source centers and radii.  `x` holds the level's positions at
    /// `data_time` when available.
    #[allow(clippy::too_many_arguments)]
    fn source_locations(
        &self,
        x_src: &mut [Point],
        r_src: &mut [f64],
        x: Option<&LData>,
        hierarchy: &PatchHierarchy,
        level_number: usize,
        data_time: f64,
        manager: &LDataManager,
    ) -> IbResult<()>;

    /// Receive the mean pressure at each source.
    fn set_source_pressures(
        &mut self,
        p_src: &[f64],
        hierarchy: &PatchHierarchy,
        level_number: usize,
        data_time: f64,
        manager: &LDataManager,
    ) -> IbResult<()>;

    /// Write the strength of each source (volume per unit time).
    fn compute_source_strengths(
        &mut self,
        q_src: &mut [f64],
        hierarchy: &PatchHierarchy,
        level_number: usize,
        data_time: f64,
        manager: &LDataManager,
    ) -> IbResult<()>;
}

/// Observes the coupled state after a step.
pub trait PostProcessStrategy: Send {
    /// Called with the grid fields and the manager holding current data.
    fn postprocess_data(
        &mut self,
        fields: &FieldStore,
        manager: &LDataManager,
        hierarchy: &PatchHierarchy,
        data_time: f64,
    ) -> IbResult<()>;
}

/// Any strategy the IB method can own.
pub enum Strategy {
    /// Lagrangian force.
    Force(Box<dyn LagrangianForceStrategy>),
    /// Fluid sources and sinks.
    Source(Box<dyn LagrangianSourceStrategy>),
    /// Post-processing.
    PostProcess(Box<dyn PostProcessStrategy>),
}

/// Lagrangian index of each local node of `rank`, in local order.
fn local_lagrangian_indices(manager: &LDataManager, ln: usize, rank: usize) -> Vec<usize> {
    manager
        .mesh(ln)
        .and_then(|m| m.rank(rank))
        .map_or_else(Vec::new, |r| r.local_nodes().iter().map(|n| n.lagrangian_index).collect())
}

// ---------------------------------------------------------------------------
// Tether force
// ---------------------------------------------------------------------------

/// Penalty spring pulling each node toward its position at the initial
/// time, with linear damping: `F = -k (X - X0) - c U`.
#[derive(Debug, Clone)]
pub struct TetherForce {
    stiffness: f64,
    damping: f64,
    targets: BTreeMap<usize, Vec<f64>>,
}

impl TetherForce {
    /// Tether with spring constant `stiffness` and damping `damping`.
    pub fn new(stiffness: f64, damping: f64) -> Self {
        Self {
            stiffness,
            damping,
            targets: BTreeMap::new(),
        }
    }

    /// Target position of node `lag_idx` on level `ln`.
    pub fn target(&self, lag_idx: usize, ln: usize) -> Option<Point> {
        let targets = self.targets.get(&ln)?;
        (lag_idx * NDIM + NDIM <= targets.len()).then(|| point_at(targets, lag_idx))
    }
}

impl LagrangianForceStrategy for TetherForce {
    fn initialize_level_data(
        &mut self,
        _hierarchy: &PatchHierarchy,
        level_number: usize,
        _init_data_time: f64,
        initial_time: bool,
        manager: &LDataManager,
    ) -> IbResult<()> {
        if !initial_time && self.targets.contains_key(&level_number) {
            return Ok(());
        }
        let positions = manager
            .gather_ldata(POSN_DATA_NAME, level_number)
            .ok_or_else(|| IbError::MissingQuantity { name: POSN_DATA_NAME.to_string(), level: level_number })?;
        debug!("TetherForce: captured {} target(s) on level {}", positions.len() / NDIM, level_number);
        self.targets.insert(level_number, positions);
        Ok(())
    }

    fn compute_lagrangian_force(
        &mut self,
        f: &mut LData,
        x: &LData,
        u: &LData,
        _hierarchy: &PatchHierarchy,
        level_number: usize,
        _data_time: f64,
        manager: &LDataManager,
    ) -> IbResult<()> {
        let targets = self
            .targets
            .get(&level_number)
            .ok_or_else(|| IbError::MissingQuantity { name: "tether targets".to_string(), level: level_number })?;
        for (rank, f_part) in f.local_parts_mut().iter_mut().enumerate() {
            let lag_indices = local_lagrangian_indices(manager, level_number, rank);
            let x_values = x.local_form_array(rank);
            let u_values = u.local_form_array(rank);
            let values = f_part.values_mut();
            for (i, &lag) in lag_indices.iter().enumerate() {
                for d in 0..NDIM {
                    let target = targets.get(lag * NDIM + d).copied().unwrap_or(x_values[i * NDIM + d]);
                    values[i * NDIM + d] +=
                        -self.stiffness * (x_values[i * NDIM + d] - target) - self.damping * u_values[i * NDIM + d];
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Prescribed sources
// ---------------------------------------------------------------------------

/// One source with a fixed strength.
#[derive(Debug, Clone, PartialEq)]
pub struct PointSource {
    /// Center used when the source is not attached to a node.
    pub location: Point,
    /// Radius of the cosine bell.
    pub radius: f64,
    /// Strength (volume per unit time); negative for a sink.
    pub strength: f64,
    /// Lagrangian index of the node that carries the source, if any.
    pub node: Option<usize>,
}

/// Sources with prescribed strengths, optionally riding on nodes.
#[derive(Debug, Clone, Default)]
pub struct PrescribedSources {
    sources: BTreeMap<usize, Vec<PointSource>>,
    pressures: BTreeMap<usize, Vec<f64>>,
}

impl PrescribedSources {
    /// No sources on any level.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source on level `ln`.
    pub fn add_source(&mut self, ln: usize, source: PointSource) {
        self.sources.entry(ln).or_default().push(source);
    }

    /// Last pressures received for level `ln`.
    pub fn pressures(&self, ln: usize) -> &[f64] {
        self.pressures.get(&ln).map_or(&[][..], Vec::as_slice)
    }
}

impl LagrangianSourceStrategy for PrescribedSources {
    fn num_sources(&self, _hierarchy: &PatchHierarchy, level_number: usize, _data_time: f64, _manager: &LDataManager) -> usize {
        self.sources.get(&level_number).map_or(0, Vec::len)
    }

    fn source_locations(
        &self,
        x_src: &mut [Point],
        r_src: &mut [f64],
        x: Option<&LData>,
        _hierarchy: &PatchHierarchy,
        level_number: usize,
        _data_time: f64,
        manager: &LDataManager,
    ) -> IbResult<()> {
        let Some(sources) = self.sources.get(&level_number) else {
            return Ok(());
        };
        for (n, source) in sources.iter().enumerate().take(x_src.len().min(r_src.len())) {
            x_src[n] = source.location;
            r_src[n] = source.radius;
            let (Some(node), Some(x)) = (source.node, x) else {
                continue;
            };
            let (rank, li) = manager
                .mesh(level_number)
                .and_then(|m| m.locate(node))
                .ok_or(IbError::NodeOutsideLevel { level: level_number, lag_idx: node })?;
            x_src[n] = point_at(x.local_form_array(rank), li);
        }
        Ok(())
    }

    fn set_source_pressures(
        &mut self,
        p_src: &[f64],
        _hierarchy: &PatchHierarchy,
        level_number: usize,
        _data_time: f64,
        _manager: &LDataManager,
    ) -> IbResult<()> {
        self.pressures.insert(level_number, p_src.to_vec());
        Ok(())
    }

    fn compute_source_strengths(
        &mut self,
        q_src: &mut [f64],
        _hierarchy: &PatchHierarchy,
        level_number: usize,
        _data_time: f64,
        _manager: &LDataManager,
    ) -> IbResult<()> {
        if let Some(sources) = self.sources.get(&level_number) {
            for (q, source) in q_src.iter_mut().zip(sources) {
                *q = source.strength;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Kinetic energy monitor
// ---------------------------------------------------------------------------

/// Records `sum |U|^2 / 2` over all nodes after each step.
#[derive(Debug, Clone, Default)]
pub struct KineticEnergyMonitor {
    history: Vec<(f64, f64)>,
}

impl KineticEnergyMonitor {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(time, energy)` samples in call order.
    pub fn history(&self) -> &[(f64, f64)] {
        &self.history
    }
}

impl PostProcessStrategy for KineticEnergyMonitor {
    fn postprocess_data(
        &mut self,
        _fields: &FieldStore,
        manager: &LDataManager,
        _hierarchy: &PatchHierarchy,
        data_time: f64,
    ) -> IbResult<()> {
        let energy: f64 = (0..manager.num_levels())
            .filter_map(|ln| manager.ldata(VEL_DATA_NAME, ln))
            .map(|u| 0.5 * u.norm2().powi(2))
            .sum();
        info!("t = {:.6e}: Lagrangian kinetic energy = {:.6e}", data_time, energy);
        self.history.push((data_time, energy));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::{StandardInitializer, StructureSpec};
    use ib_kernel::{GridGeometry, KernelLibrary};

    fn setup() -> (LDataManager, PatchHierarchy) {
        let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [8; NDIM], [true; NDIM]);
        let hierarchy = PatchHierarchy::uniform(geometry, [1; NDIM], 1);
        let ib4 = KernelLibrary::new().lookup("IB_4").unwrap();
        let mut manager = LDataManager::new("m", ib4.clone(), ib4, 0);
        manager.set_patch_hierarchy(&hierarchy);
        manager.register_init_strategy(Box::new(StandardInitializer::new(
            vec![StructureSpec {
                name: "pair".to_string(),
                level_number: 0,
                vertices: vec![[0.25; NDIM], [0.75; NDIM]],
                anchors: Vec::new(),
                rods: Vec::new(),
                instruments: Vec::new(),
                sources: Vec::new(),
            }],
            Vec::new(),
        )));
        manager.initialize_level_data(0, 0.0, false, true).unwrap();
        (manager, hierarchy)
    }

    #[test]
    fn test_tether_force_restores_targets() {
        let (manager, hierarchy) = setup();
        let mut tether = TetherForce::new(10.0, 0.0);
        tether.initialize_level_data(&hierarchy, 0, 0.0, true, &manager).unwrap();
        assert_eq!(tether.target(1, 0), Some([0.75; NDIM]));

        let mut x = manager.ldata(POSN_DATA_NAME, 0).unwrap().clone();
        x.local_array_mut(0).unwrap()[0] += 0.1;
        let u = manager.ldata(VEL_DATA_NAME, 0).unwrap().clone();
        let mut f = manager.create_ldata("F", 0, NDIM).unwrap();
        tether.compute_lagrangian_force(&mut f, &x, &u, &hierarchy, 0, 0.0, &manager).unwrap();
        let values = f.local_form_array(0);
        assert!((values[0] + 1.0).abs() < 1e-12);
        assert!(values[1..].iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_prescribed_sources_follow_node() {
        let (manager, hierarchy) = setup();
        let mut sources = PrescribedSources::new();
        sources.add_source(
            0,
            PointSource {
                location: [0.0; NDIM],
                radius: 0.2,
                strength: 2.0,
                node: Some(1),
            },
        );
        assert_eq!(sources.num_sources(&hierarchy, 0, 0.0, &manager), 1);
        assert_eq!(sources.num_sources(&hierarchy, 1, 0.0, &manager), 0);

        let mut x_src = vec![[f64::NAN; NDIM]];
        let mut r_src = vec![f64::NAN];
        let x = manager.ldata(POSN_DATA_NAME, 0);
        sources.source_locations(&mut x_src, &mut r_src, x, &hierarchy, 0, 0.0, &manager).unwrap();
        assert_eq!(x_src[0], [0.75; NDIM]);
        assert_eq!(r_src[0], 0.2);

        let mut q = vec![0.0];
        sources.compute_source_strengths(&mut q, &hierarchy, 0, 0.0, &manager).unwrap();
        assert_eq!(q, vec![2.0]);
        sources.set_source_pressures(&[4.0], &hierarchy, 0, 0.0, &manager).unwrap();
        assert_eq!(sources.pressures(0), &[4.0]);
    }

    #[test]
    fn test_kinetic_energy_monitor() {
        let (mut manager, hierarchy) = setup();
        manager.ldata_mut(VEL_DATA_NAME, 0).unwrap().set_all(1.0);
        let mut monitor = KineticEnergyMonitor::new();
        monitor.postprocess_data(&FieldStore::new(), &manager, &hierarchy, 0.5).unwrap();
        let (t, e) = monitor.history()[0];
        assert_eq!(t, 0.5);
        assert!((e - NDIM as f64).abs() < 1e-12);
    }
}
