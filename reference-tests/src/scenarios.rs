//! Reference scenarios with exactly known answers.

use std::collections::BTreeSet;

use ib_kernel::delta::BUILTIN_KERNELS;
use ib_kernel::{
    interpolate_point, spread_point, FieldStore, GridGeometry, KernelLibrary, LData, LevelData, PatchHierarchy, Point,
    NDIM,
};
use ib_orchestrator::config::IBMethodConfig;
use ib_orchestrator::init::{StandardInitializer, StructureSpec};
use ib_orchestrator::ldata_manager::{LDataManager, POSN_DATA_NAME};
use ib_orchestrator::runner::PrescribedFlow;
use ib_orchestrator::strategies::LagrangianForceStrategy;
use ib_orchestrator::{CoupledStepper, IBMethod, IbResult, TimeSteppingType};

use crate::{CheckResult, ReferenceTest};

const TOL: f64 = 1e-12;

/// All reference tests in run order.
pub fn all_tests() -> Vec<ReferenceTest> {
    vec![
        ReferenceTest {
            name: "Kernel Moments".to_string(),
            scenario: kernel_moments,
        },
        ReferenceTest {
            name: "Interpolation/Spreading Adjointness".to_string(),
            scenario: interp_spread_adjointness,
        },
        ReferenceTest {
            name: "Uniform Advection".to_string(),
            scenario: uniform_advection,
        },
        ReferenceTest {
            name: "Anchored Nodes".to_string(),
            scenario: anchored_nodes,
        },
        ReferenceTest {
            name: "Force Conservation".to_string(),
            scenario: force_conservation,
        },
        ReferenceTest {
            name: "Redistribution".to_string(),
            scenario: redistribution,
        },
    ]
}

fn err(e: impl std::fmt::Display) -> String {
    e.to_string()
}

fn structure(name: &str, vertices: Vec<Point>, anchors: Vec<usize>) -> StructureSpec {
    StructureSpec {
        name: name.to_string(),
        level_number: 0,
        vertices,
        anchors,
        rods: Vec::new(),
        instruments: Vec::new(),
        sources: Vec::new(),
    }
}

fn periodic_box(n: i64, num_ranks: usize) -> PatchHierarchy {
    let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [n; NDIM], [true; NDIM]);
    PatchHierarchy::uniform(geometry, [2; NDIM], num_ranks)
}

fn advected_stepper(
    scheme: TimeSteppingType,
    structures: Vec<StructureSpec>,
    velocity: Point,
    num_ranks: usize,
) -> Result<CoupledStepper, String> {
    let config = IBMethodConfig {
        time_stepping_type: scheme.to_string(),
        ..IBMethodConfig::default()
    };
    let mut ib = IBMethod::new("IBMethod", config).map_err(err)?;
    ib.register_init_strategy(Box::new(StandardInitializer::new(structures, Vec::new())));
    let mut fields = FieldStore::new();
    let flow = PrescribedFlow::new(&mut fields, ib.minimum_ghost_cell_width(), velocity);
    let mut stepper = CoupledStepper::new(ib, periodic_box(8, num_ranks), fields, Box::new(flow));
    stepper.initialize(0.0).map_err(err)?;
    Ok(stepper)
}

fn positions(stepper: &CoupledStepper) -> Result<Vec<f64>, String> {
    stepper
        .ib_method()
        .l_data_manager()
        .gather_ldata(POSN_DATA_NAME, 0)
        .ok_or_else(|| "no position data on level 0".to_string())
}

/// Distance on the unit periodic interval.
fn periodic_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(1.0);
    d.min(1.0 - d)
}

/// Partition of unity and vanishing first moment of every built-in kernel.
fn kernel_moments() -> Result<Vec<CheckResult>, String> {
    let library = KernelLibrary::new();
    let mut checks = Vec::new();
    for name in BUILTIN_KERNELS {
        let kernel = library.lookup(name).map_err(err)?;
        let mut zeroth = 0.0_f64;
        let mut first = 0.0_f64;
        for k in 0..=20 {
            let s = 3.0 + 0.05 * k as f64;
            let stencil = kernel.stencil_1d(s);
            let mut m0 = 0.0;
            let mut m1 = 0.0;
            for (i, w) in stencil.weights[..stencil.width].iter().enumerate() {
                m0 += w;
                m1 += w * ((stencil.start + i as i64) as f64 - s);
            }
            zeroth = zeroth.max((m0 - 1.0).abs());
            first = first.max(m1.abs());
        }
        checks.push(CheckResult::within(&format!("{} zeroth moment", name), zeroth, TOL));
        checks.push(CheckResult::within(&format!("{} first moment", name), first, TOL));
    }
    Ok(checks)
}

/// `sum_i f_i u_i h^d == F . U(X)` for a spread point force and a smooth field.
fn interp_spread_adjointness() -> Result<Vec<CheckResult>, String> {
    let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [16; NDIM], [false; NDIM]);
    let library = KernelLibrary::new();
    let mut checks = Vec::new();
    let x: Point = std::array::from_fn(|d| 0.41 + 0.07 * d as f64);

    for name in BUILTIN_KERNELS {
        let kernel = library.lookup(name).map_err(err)?;
        let ghosts = kernel.min_ghost_width();
        let mut u = LevelData::new(geometry.domain_box(), ghosts, 1);
        for cell in u.ghost_box().cells() {
            let xc = geometry.cell_center(&cell, 1);
            let value: f64 = xc.iter().enumerate().map(|(d, v)| ((d + 1) as f64 * v).sin()).sum();
            u.set(&cell, 0, value);
        }
        let mut f = LevelData::new(geometry.domain_box(), ghosts, 1);
        let force = 0.75;
        spread_point(&kernel, &geometry, 1, &mut f, &x, &[force]);

        let mut ux = [0.0];
        interpolate_point(&kernel, &geometry, 1, &u, &x, &mut ux);
        let grid_work: f64 = f
            .values()
            .iter()
            .zip(u.values())
            .map(|(fi, ui)| fi * ui)
            .sum::<f64>()
            * geometry.cell_volume(1);
        let point_work = force * ux[0];
        checks.push(CheckResult::within(name, (grid_work - point_work).abs(), TOL));
    }
    Ok(checks)
}

/// Every scheme carries markers exactly with a uniform flow.
fn uniform_advection() -> Result<Vec<CheckResult>, String> {
    let x0: Vec<Point> = vec![[0.3; NDIM], [0.55; NDIM], [0.9; NDIM]];
    let velocity: Point = std::array::from_fn(|d| 0.5 - 0.25 * d as f64);
    let (dt, steps) = (0.05, 8);

    let mut checks = Vec::new();
    for scheme in [
        TimeSteppingType::ForwardEuler,
        TimeSteppingType::MidpointRule,
        TimeSteppingType::TrapezoidalRule,
    ] {
        let mut stepper = advected_stepper(scheme, vec![structure("markers", x0.clone(), Vec::new())], velocity, 2)?;
        for _ in 0..steps {
            stepper.step(dt).map_err(err)?;
        }
        let x = positions(&stepper)?;
        let t = stepper.time();
        let mut max_error = 0.0_f64;
        for (n, p) in x0.iter().enumerate() {
            for d in 0..NDIM {
                let exact = p[d] + velocity[d] * t;
                max_error = max_error.max(periodic_distance(x[n * NDIM + d], exact));
            }
        }
        checks.push(CheckResult::within(&scheme.to_string(), max_error, 1e-10));
    }
    Ok(checks)
}

/// Anchored nodes keep their positions while free nodes move.
fn anchored_nodes() -> Result<Vec<CheckResult>, String> {
    let x0: Vec<Point> = vec![[0.25; NDIM], [0.5; NDIM], [0.75; NDIM]];
    let mut stepper = advected_stepper(
        TimeSteppingType::MidpointRule,
        vec![structure("tethered", x0.clone(), vec![1])],
        [0.4; NDIM],
        1,
    )?;
    for _ in 0..5 {
        stepper.step(0.1).map_err(err)?;
    }
    let x = positions(&stepper)?;
    let held = (0..NDIM)
        .map(|d| (x[NDIM + d] - x0[1][d]).abs())
        .fold(0.0_f64, f64::max);
    let moved = (0..NDIM)
        .map(|d| periodic_distance(x[d], x0[0][d] + 0.2))
        .fold(0.0_f64, f64::max);
    Ok(vec![
        CheckResult::within("anchored node fixed", held, TOL),
        CheckResult::within("free node advected", moved, 1e-10),
    ])
}

/// Unit force on every node.
struct UnitForce;

impl LagrangianForceStrategy for UnitForce {
    fn compute_lagrangian_force(
        &mut self,
        f: &mut LData,
        _x: &LData,
        _u: &LData,
        _hierarchy: &PatchHierarchy,
        _level_number: usize,
        _data_time: f64,
        _manager: &LDataManager,
    ) -> IbResult<()> {
        for part in f.local_parts_mut() {
            let n = part.num_local() * NDIM;
            part.values_mut()[..n].iter_mut().for_each(|v| *v += 1.0);
        }
        Ok(())
    }
}

/// Spreading preserves the total Lagrangian force, including across
/// periodic boundaries and rank splits.
fn force_conservation() -> Result<Vec<CheckResult>, String> {
    let hierarchy = periodic_box(8, 2);
    let vertices: Vec<Point> = (0..5).map(|k| [0.02 + 0.24 * k as f64; NDIM]).collect();
    let num_nodes = vertices.len() as f64;

    let mut ib = IBMethod::new("IBMethod", IBMethodConfig::default()).map_err(err)?;
    ib.register_init_strategy(Box::new(StandardInitializer::new(
        vec![structure("chain", vertices, Vec::new())],
        Vec::new(),
    )));
    ib.register_lagrangian_force_function(Box::new(UnitForce));

    let mut fields = FieldStore::new();
    let ghosts = ib.minimum_ghost_cell_width();
    let u_idx = fields.register("u", NDIM, ghosts);
    let f_idx = fields.register("f", NDIM, ghosts);
    fields.allocate_all(&hierarchy);
    ib.initialize_patch_hierarchy(&hierarchy, &mut fields, u_idx, &[], &[], 0, 0.0, true)
        .map_err(err)?;

    ib.preprocess_integrate_data(0.0, 0.1, 1).map_err(err)?;
    ib.compute_lagrangian_force(0.0).map_err(err)?;
    ib.spread_force(&mut fields, f_idx, None, &[], 0.0).map_err(err)?;
    ib.postprocess_integrate_data(0.0, 0.1, 1).map_err(err)?;

    let max_error = (0..NDIM)
        .map(|k| (fields.integral(f_idx, k, &hierarchy) - num_nodes).abs())
        .fold(0.0_f64, f64::max);
    Ok(vec![CheckResult::within("total force", max_error, TOL)])
}

/// Nodes land on the rank owning their cell after each rebalance and no
/// Lagrangian index is lost or duplicated.
fn redistribution() -> Result<Vec<CheckResult>, String> {
    let x0: Vec<Point> = vec![[0.45; NDIM], [0.2; NDIM], [0.7; NDIM], [0.95; NDIM], [0.05; NDIM]];
    let structures = vec![
        structure("a", x0[..2].to_vec(), Vec::new()),
        structure("b", x0[2..].to_vec(), Vec::new()),
    ];
    let mut stepper = advected_stepper(TimeSteppingType::ForwardEuler, structures, [0.25; NDIM], 3)?;

    let mut misplaced = 0usize;
    let mut bad_index_sets = 0usize;
    for _ in 0..3 {
        for _ in 0..4 {
            stepper.step(0.1).map_err(err)?;
        }
        stepper.rebalance().map_err(err)?;

        let manager = stepper.ib_method().l_data_manager();
        let hierarchy = stepper.hierarchy();
        let level = hierarchy.level(0).ok_or("missing level 0")?;
        let mesh = manager.mesh(0).ok_or("missing Lagrangian mesh")?;
        let x = manager.ldata(POSN_DATA_NAME, 0).ok_or("missing positions")?;
        let mut seen = BTreeSet::new();
        let mut duplicates = false;
        for (rank, nodes) in mesh.ranks().iter().enumerate() {
            let values = x.local_form_array(rank);
            for node in nodes.local_nodes() {
                duplicates |= !seen.insert(node.lagrangian_index);
                let xi = ib_kernel::ldata::point_at(values, node.local_index);
                let cell = hierarchy.geometry.cell_index(&xi, 1);
                let owner = level.patch_containing(&cell).map(|p| level.patches[p].owner);
                if owner != Some(rank) {
                    misplaced += 1;
                }
            }
        }
        if duplicates || seen != (0..x0.len()).collect() {
            bad_index_sets += 1;
        }
    }

    let x = positions(&stepper)?;
    let mut max_error = 0.0_f64;
    for (n, p) in x0.iter().enumerate() {
        for d in 0..NDIM {
            max_error = max_error.max(periodic_distance(x[n * NDIM + d], p[d] + 0.3));
        }
    }
    Ok(vec![
        CheckResult::expect("ownership", misplaced == 0, format!("{} misplaced node(s)", misplaced)),
        CheckResult::expect(
            "index set",
            bad_index_sets == 0,
            format!("{} rebalance(s) lost or duplicated nodes", bad_index_sets),
        ),
        CheckResult::within("trajectories", max_error, 1e-10),
    ])
}
