//! Flow meters built from tagged Lagrangian nodes
//!
//! Nodes tagged with an instrumentation spec form one net per meter, ordered
//! by their position within the meter.  In two dimensions a net is an open
//! polyline and the flux is taken through its segments; in three dimensions
//! it is a closed polygon, triangulated as a fan about its centroid.

use ib_kernel::ldata::point_at;
use ib_kernel::{interpolate_point, FieldStore, LData, PatchHierarchy, Point, NDIM};
use tracing::{debug, warn};

use crate::error::{IbError, IbResult};
use crate::ldata_manager::LDataManager;

/// Reads flow rates and mean pressures through named meters.
pub trait InstrumentReader: Send {
    /// Meter names, indexed by meter number.
    fn instrument_names(&self) -> &[String];

    /// Whether any meter is defined.
    fn is_instrumented(&self) -> bool {
        !self.instrument_names().is_empty()
    }

    /// Locate the meter nets from the current positions.
    fn initialize_hierarchy_dependent_data(
        &mut self,
        manager: &LDataManager,
        x_data: &[Option<LData>],
        timestep_num: u64,
        data_time: f64,
    ) -> IbResult<()>;

    /// Measure velocity field `u_idx` and pressure field `p_idx` through the
    /// nets.  Both fields must have their ghost cells filled.
    #[allow(clippy::too_many_arguments)]
    fn read_instrument_data(
        &mut self,
        fields: &FieldStore,
        u_idx: usize,
        p_idx: usize,
        hierarchy: &PatchHierarchy,
        manager: &LDataManager,
        timestep_num: u64,
        data_time: f64,
    ) -> IbResult<()>;

    /// Volume flow rate through each meter from the last reading.
    fn flow_values(&self) -> &[f64];

    /// Mean pressure over each meter from the last reading.
    fn mean_pressure_values(&self) -> &[f64];
}

/// One quadrature point of a meter net.
#[derive(Debug, Clone, Copy)]
struct MeterElement {
    center: Point,
    // oriented area (or length-weighted normal in 2D)
    normal: Point,
}

/// Flow meters whose nets are the tagged structure nodes.
#[derive(Debug, Clone, Default)]
pub struct PlanarFlowMeter {
    names: Vec<String>,
    elements: Vec<Vec<MeterElement>>,
    flow_values: Vec<f64>,
    mean_pressure_values: Vec<f64>,
}

impl PlanarFlowMeter {
    /// Meters with the given names, indexed by meter number.
    pub fn new(names: Vec<String>) -> Self {
        let n = names.len();
        Self {
            names,
            elements: vec![Vec::new(); n],
            flow_values: vec![0.0; n],
            mean_pressure_values: vec![0.0; n],
        }
    }
}

fn sub(a: &Point, b: &Point) -> Point {
    std::array::from_fn(|d| a[d] - b[d])
}

fn dot(a: &Point, b: &Point) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Quadrature elements of a net with ordered vertices.
fn net_elements(vertices: &[Point]) -> Vec<MeterElement> {
    if vertices.len() < 2 {
        return Vec::new();
    }
    if NDIM == 2 {
        return vertices
            .windows(2)
            .map(|w| {
                let t = sub(&w[1], &w[0]);
                let mut normal = [0.0; NDIM];
                normal[0] = t[1];
                normal[1] = -t[0];
                MeterElement {
                    center: std::array::from_fn(|d| 0.5 * (w[0][d] + w[1][d])),
                    normal,
                }
            })
            .collect();
    }
    let n = vertices.len() as f64;
    let centroid: Point = std::array::from_fn(|d| vertices.iter().map(|v| v[d]).sum::<f64>() / n);
    (0..vertices.len())
        .map(|k| {
            let a = vertices[k];
            let b = vertices[(k + 1) % vertices.len()];
            let ra = sub(&a, &centroid);
            let rb = sub(&b, &centroid);
            let mut normal = [0.0; NDIM];
            for d in 0..NDIM {
                let (d1, d2) = ((d + 1) % NDIM, (d + 2) % NDIM);
                normal[d] = 0.5 * (ra[d1] * rb[d2] - ra[d2] * rb[d1]);
            }
            MeterElement {
                center: std::array::from_fn(|d| (a[d] + b[d] + centroid[d]) / 3.0),
                normal,
            }
        })
        .collect()
}

impl InstrumentReader for PlanarFlowMeter {
    fn instrument_names(&self) -> &[String] {
        &self.names
    }

    fn initialize_hierarchy_dependent_data(
        &mut self,
        manager: &LDataManager,
        x_data: &[Option<LData>],
        timestep_num: u64,
        data_time: f64,
    ) -> IbResult<()> {
        let mut vertices: Vec<Vec<Option<Point>>> = vec![Vec::new(); self.names.len()];
        for (ln, x) in x_data.iter().enumerate() {
            let (Some(x), Some(mesh)) = (x, manager.mesh(ln)) else {
                continue;
            };
            for (rank_nodes, x_part) in mesh.ranks().iter().zip(x.parts()) {
                for (i, node) in rank_nodes.local_nodes().iter().enumerate() {
                    let Some(spec) = node.specs.instrument else {
                        continue;
                    };
                    let Some(meter) = vertices.get_mut(spec.meter_idx) else {
                        warn!("node {} references undefined meter {}", node.lagrangian_index, spec.meter_idx);
                        continue;
                    };
                    if meter.len() <= spec.meter_node_idx {
                        meter.resize(spec.meter_node_idx + 1, None);
                    }
                    meter[spec.meter_node_idx] = Some(point_at(x_part.values(), i));
                }
            }
        }
        for (m, meter) in vertices.into_iter().enumerate() {
            let points: Vec<Point> = meter.iter().flatten().copied().collect();
            if points.len() != meter.len() {
                return Err(IbError::Config(format!(
                    "flow meter {} is missing {} of its {} nodes",
                    self.names[m],
                    meter.len() - points.len(),
                    meter.len()
                )));
            }
            self.elements[m] = net_elements(&points);
        }
        debug!("flow meter nets located at step {} (t = {})", timestep_num, data_time);
        Ok(())
    }

    fn read_instrument_data(
        &mut self,
        fields: &FieldStore,
        u_idx: usize,
        p_idx: usize,
        hierarchy: &PatchHierarchy,
        manager: &LDataManager,
        timestep_num: u64,
        data_time: f64,
    ) -> IbResult<()> {
        let geometry = &hierarchy.geometry;
        let kernel = manager.interp_kernel();
        for (m, elements) in self.elements.iter().enumerate() {
            let mut flow = 0.0;
            let mut p_sum = 0.0;
            let mut area = 0.0;
            for element in elements {
                // sample on the finest level that covers the element
                let ln = (0..hierarchy.num_levels())
                    .rev()
                    .find(|&ln| {
                        hierarchy.level(ln).is_some_and(|level| {
                            let ratio = level.ratio_to_level_zero;
                            let cell = geometry.wrap_periodic(&geometry.cell_index(&element.center, ratio), ratio);
                            level.contains_cell(&cell)
                        })
                    })
                    .ok_or(IbError::MissingLevel(0))?;
                let ratio = hierarchy.level(ln).map_or(1, |l| l.ratio_to_level_zero);
                let u_data = fields
                    .level_data(u_idx, ln)
                    .ok_or(IbError::MissingField { field: u_idx, level: ln })?;
                let p_data = fields
                    .level_data(p_idx, ln)
                    .ok_or(IbError::MissingField { field: p_idx, level: ln })?;
                let mut u = [0.0; NDIM];
                interpolate_point(kernel, geometry, ratio, u_data, &element.center, &mut u);
                let mut p = [0.0];
                interpolate_point(kernel, geometry, ratio, p_data, &element.center, &mut p);
                let da = dot(&element.normal, &element.normal).sqrt();
                flow += dot(&u, &element.normal);
                p_sum += p[0] * da;
                area += da;
            }
            self.flow_values[m] = flow;
            self.mean_pressure_values[m] = if area > 0.0 { p_sum / area } else { 0.0 };
        }
        debug!(
            "flow meters read at step {} (t = {}): {:?}",
            timestep_num, data_time, self.flow_values
        );
        Ok(())
    }

    fn flow_values(&self) -> &[f64] {
        &self.flow_values
    }

    fn mean_pressure_values(&self) -> &[f64] {
        &self.mean_pressure_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::{MeterVertex, StandardInitializer, StructureSpec};
    use crate::ldata_manager::POSN_DATA_NAME;
    use ib_kernel::{GridGeometry, KernelLibrary};

    fn vertex(y: f64, z: f64) -> Point {
        std::array::from_fn(|d| match d {
            0 => 0.5,
            1 => y,
            _ => z,
        })
    }

    fn meter_vertices() -> Vec<Point> {
        if NDIM == 2 {
            vec![vertex(0.25, 0.0), vertex(0.75, 0.0)]
        } else {
            vec![vertex(0.25, 0.25), vertex(0.75, 0.25), vertex(0.75, 0.75), vertex(0.25, 0.75)]
        }
    }

    #[test]
    fn test_uniform_flow_through_meter() {
        let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [8; NDIM], [true; NDIM]);
        let hierarchy = PatchHierarchy::uniform(geometry, [1; NDIM], 1);
        let ib4 = KernelLibrary::new().lookup("IB_4").unwrap();
        let mut manager = LDataManager::new("m", ib4.clone(), ib4, 0);
        manager.set_patch_hierarchy(&hierarchy);
        let vertices = meter_vertices();
        let instruments = (0..vertices.len()).map(|v| MeterVertex { vertex: v, meter: 0 }).collect();
        manager.register_init_strategy(Box::new(StandardInitializer::new(
            vec![StructureSpec {
                name: "meter".to_string(),
                level_number: 0,
                vertices,
                anchors: Vec::new(),
                rods: Vec::new(),
                instruments,
                sources: Vec::new(),
            }],
            vec!["inlet".to_string()],
        )));
        manager.initialize_level_data(0, 0.0, false, true).unwrap();

        let mut fields = FieldStore::new();
        let u_idx = fields.register("u", NDIM, 3);
        let p_idx = fields.register("p", 1, 3);
        fields.allocate_all(&hierarchy);
        for v in fields.level_data_mut(u_idx, 0).unwrap().values_mut().chunks_mut(NDIM) {
            v[0] = 1.0;
        }
        fields.set_to_scalar(p_idx, 2.0);

        let mut panel = PlanarFlowMeter::new(vec!["inlet".to_string()]);
        assert!(panel.is_instrumented());
        let x_data = vec![manager.ldata(POSN_DATA_NAME, 0).cloned()];
        panel.initialize_hierarchy_dependent_data(&manager, &x_data, 0, 0.0).unwrap();
        panel
            .read_instrument_data(&fields, u_idx, p_idx, &hierarchy, &manager, 0, 0.0)
            .unwrap();

        let expected = if NDIM == 2 { 0.5 } else { 0.25 };
        assert!((panel.flow_values()[0] - expected).abs() < 1e-12);
        assert!((panel.mean_pressure_values()[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_panel() {
        let panel = PlanarFlowMeter::new(Vec::new());
        assert!(!panel.is_instrumented());
        assert!(panel.flow_values().is_empty());
    }
}
