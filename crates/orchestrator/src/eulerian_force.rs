//! Total Eulerian body force seen by the fluid solver
//!
//! The fluid solver asks for one force field per step: an optional
//! user-prescribed body force plus the force the IB method spread onto the
//! grid.  At the initial time the field is zero.

use ib_kernel::{FieldStore, GridGeometry, LevelData, PatchHierarchy};

use crate::error::{IbError, IbResult};

/// User-prescribed body force on the grid.
pub trait BodyForce: Send + Sync {
    /// Overwrite `data` (one level) with the force at `data_time`.
    fn set_data_on_level(&self, data: &mut LevelData, geometry: &GridGeometry, ratio: i64, data_time: f64);
}

/// Spatially uniform body force, e.g. a driving pressure gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantBodyForce {
    value: Vec<f64>,
}

impl ConstantBodyForce {
    /// Force with components `value`.
    pub fn new(value: Vec<f64>) -> Self {
        Self { value }
    }
}

impl BodyForce for ConstantBodyForce {
    fn set_data_on_level(&self, data: &mut LevelData, _geometry: &GridGeometry, _ratio: i64, _data_time: f64) {
        let depth = data.depth();
        for cell in data.values_mut().chunks_mut(depth) {
            for (k, v) in cell.iter_mut().enumerate() {
                *v = self.value.get(k).copied().unwrap_or(0.0);
            }
        }
    }
}

/// Combines the body force and the spread IB force into one field.
pub struct EulerianForceFunction {
    f_ib_idx: usize,
    body_force: Option<Box<dyn BodyForce>>,
}

impl EulerianForceFunction {
    /// Combiner reading the spread IB force from field `f_ib_idx`.
    pub fn new(f_ib_idx: usize) -> Self {
        Self {
            f_ib_idx,
            body_force: None,
        }
    }

    /// Add a user body force to the IB force.
    pub fn register_body_force(&mut self, body_force: Box<dyn BodyForce>) {
        self.body_force = Some(body_force);
    }

    /// Field holding the spread IB force.
    pub fn ib_force_index(&self) -> usize {
        self.f_ib_idx
    }

    /// Fill field `f_idx` on every level of `hierarchy`.
    pub fn set_data_on_patch_hierarchy(
        &self,
        fields: &mut FieldStore,
        f_idx: usize,
        hierarchy: &PatchHierarchy,
        data_time: f64,
        initial_time: bool,
    ) -> IbResult<()> {
        for ln in 0..hierarchy.num_levels() {
            self.set_data_on_level(fields, f_idx, hierarchy, ln, data_time, initial_time)?;
        }
        Ok(())
    }

    /// Fill field `f_idx` on level `ln`.
    pub fn set_data_on_level(
        &self,
        fields: &mut FieldStore,
        f_idx: usize,
        hierarchy: &PatchHierarchy,
        ln: usize,
        data_time: f64,
        initial_time: bool,
    ) -> IbResult<()> {
        let level = hierarchy.level(ln).ok_or(IbError::MissingLevel(ln))?;
        let (f_data, f_ib_data) = fields.pair_mut(f_idx, self.f_ib_idx, ln);
        let f_data = f_data.ok_or(IbError::MissingField { field: f_idx, level: ln })?;
        if initial_time {
            f_data.fill(0.0);
            return Ok(());
        }
        match &self.body_force {
            Some(body_force) => {
                body_force.set_data_on_level(f_data, &hierarchy.geometry, level.ratio_to_level_zero, data_time)
            }
            None => f_data.fill(0.0),
        }
        let f_ib_data = f_ib_data.ok_or(IbError::MissingField {
            field: self.f_ib_idx,
            level: ln,
        })?;
        let depth = f_data.depth().min(f_ib_data.depth());
        for patch in &level.patches {
            for cell in patch.cell_box.cells() {
                for k in 0..depth {
                    if let Some(v) = f_ib_data.get(&cell, k) {
                        f_data.add(&cell, k, v);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ib_kernel::NDIM;

    fn setup() -> (PatchHierarchy, FieldStore, usize, usize) {
        let geometry = GridGeometry::new([0.0; NDIM], [1.0; NDIM], [4; NDIM], [true; NDIM]);
        let hierarchy = PatchHierarchy::uniform(geometry, [2; NDIM], 2);
        let mut fields = FieldStore::new();
        let f_idx = fields.register("f", NDIM, 1);
        let f_ib_idx = fields.register("f_ib", NDIM, 1);
        fields.allocate_all(&hierarchy);
        fields.set_to_scalar(f_ib_idx, 2.0);
        (hierarchy, fields, f_idx, f_ib_idx)
    }

    #[test]
    fn test_zero_at_initial_time() {
        let (hierarchy, mut fields, f_idx, f_ib_idx) = setup();
        fields.set_to_scalar(f_idx, 7.0);
        let combiner = EulerianForceFunction::new(f_ib_idx);
        combiner
            .set_data_on_patch_hierarchy(&mut fields, f_idx, &hierarchy, 0.0, true)
            .unwrap();
        assert_eq!(fields.max_norm(f_idx, &hierarchy), 0.0);
    }

    #[test]
    fn test_ib_force_alone() {
        let (hierarchy, mut fields, f_idx, f_ib_idx) = setup();
        let combiner = EulerianForceFunction::new(f_ib_idx);
        combiner
            .set_data_on_patch_hierarchy(&mut fields, f_idx, &hierarchy, 0.1, false)
            .unwrap();
        assert!((fields.integral(f_idx, 0, &hierarchy) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_body_force_plus_ib_force() {
        let (hierarchy, mut fields, f_idx, f_ib_idx) = setup();
        let mut combiner = EulerianForceFunction::new(f_ib_idx);
        let mut g = vec![0.0; NDIM];
        g[NDIM - 1] = -1.0;
        combiner.register_body_force(Box::new(ConstantBodyForce::new(g)));
        combiner
            .set_data_on_patch_hierarchy(&mut fields, f_idx, &hierarchy, 0.1, false)
            .unwrap();
        assert!((fields.integral(f_idx, 0, &hierarchy) - 2.0).abs() < 1e-12);
        assert!((fields.integral(f_idx, NDIM - 1, &hierarchy) - 1.0).abs() < 1e-12);
    }
}
