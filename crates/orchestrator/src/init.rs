//! Structure input: which levels carry Lagrangian data and what it is.
//!
//! The data manager asks an [`LInitStrategy`] for the structures on a level
//! when the level is first created at the initial time.  The
//! [`StandardInitializer`] serves structures described in the run
//! configuration.

use ib_kernel::lnode::ROD_MATERIAL_PARAMS;
use ib_kernel::{AnchorPointSpec, InstrumentationSpec, NodeSpecs, Point, RodForceSpec, SourceSpec};
use serde::{Deserialize, Serialize};

/// One structure as handed to the data manager.
///
/// Indices inside `specs` are relative to the structure (vertex numbers);
/// the manager shifts them to Lagrangian indices.
#[derive(Debug, Clone, PartialEq)]
pub struct InitStructure {
    /// Unique structure name.
    pub name: String,
    /// Initial vertex positions.
    pub positions: Vec<Point>,
    /// Specs per vertex, parallel to `positions`.
    pub specs: Vec<NodeSpecs>,
}

/// Source of initial Lagrangian structures.
pub trait LInitStrategy: Send {
    /// Whether `level_number` should hold Lagrangian data.
    fn level_has_lagrangian_data(&self, level_number: usize, can_be_refined: bool) -> bool;

    /// Structures to place on `level_number`.
    fn structures_on_level(&self, level_number: usize) -> Vec<InitStructure>;

    /// Flow meter names, indexed by meter number.
    fn instrument_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Link between two vertices with material parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RodLink {
    /// First vertex.
    pub from: usize,
    /// Second vertex.
    pub to: usize,
    /// Material parameters.
    pub params: [f64; ROD_MATERIAL_PARAMS],
}

/// Vertex that belongs to a flow meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterVertex {
    /// Vertex number.
    pub vertex: usize,
    /// Meter number.
    pub meter: usize,
}

/// Vertex that carries a fluid source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceVertex {
    /// Vertex number.
    pub vertex: usize,
    /// Source number on the level.
    pub source_idx: usize,
}

/// Structure description as found in a configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureSpec {
    /// Unique structure name.
    pub name: String,
    /// Level the structure lives on.
    #[serde(default)]
    pub level_number: usize,
    /// Vertex positions.
    pub vertices: Vec<Point>,
    /// Anchored vertices.
    #[serde(default)]
    pub anchors: Vec<usize>,
    /// Rod links.
    #[serde(default)]
    pub rods: Vec<RodLink>,
    /// Flow meter vertices.
    #[serde(default)]
    pub instruments: Vec<MeterVertex>,
    /// Source vertices.
    #[serde(default)]
    pub sources: Vec<SourceVertex>,
}

impl StructureSpec {
    /// Check vertex references.
    pub fn validate(&self) -> Result<(), String> {
        let n = self.vertices.len();
        if n == 0 {
            return Err(format!("Structure {} has no vertices", self.name));
        }
        let refs = self
            .anchors
            .iter()
            .copied()
            .chain(self.rods.iter().flat_map(|r| [r.from, r.to]))
            .chain(self.instruments.iter().map(|m| m.vertex))
            .chain(self.sources.iter().map(|s| s.vertex));
        for v in refs {
            if v >= n {
                return Err(format!("Structure {} references vertex {} but has {} vertices", self.name, v, n));
            }
        }
        Ok(())
    }

    /// Convert to the form the data manager consumes.
    pub fn to_init_structure(&self) -> InitStructure {
        let mut specs = vec![NodeSpecs::default(); self.vertices.len()];
        for &v in &self.anchors {
            specs[v].anchor = Some(AnchorPointSpec { node_idx: v });
        }
        for link in &self.rods {
            let rod = specs[link.from].rod.get_or_insert_with(|| RodForceSpec {
                node_idx: link.from,
                next_idxs: Vec::new(),
                material_params: Vec::new(),
            });
            rod.next_idxs.push(link.to);
            rod.material_params.push(link.params);
        }
        let mut meter_counts: Vec<usize> = Vec::new();
        for m in &self.instruments {
            if meter_counts.len() <= m.meter {
                meter_counts.resize(m.meter + 1, 0);
            }
            specs[m.vertex].instrument = Some(InstrumentationSpec {
                node_idx: m.vertex,
                meter_idx: m.meter,
                meter_node_idx: meter_counts[m.meter],
            });
            meter_counts[m.meter] += 1;
        }
        for s in &self.sources {
            specs[s.vertex].source = Some(SourceSpec {
                node_idx: s.vertex,
                source_idx: s.source_idx,
            });
        }
        InitStructure {
            name: self.name.clone(),
            positions: self.vertices.clone(),
            specs,
        }
    }
}

/// Serves structures from a list of [`StructureSpec`]s.
#[derive(Debug, Clone, Default)]
pub struct StandardInitializer {
    structures: Vec<StructureSpec>,
    instrument_names: Vec<String>,
}

impl StandardInitializer {
    /// Initializer for the given structures and flow meter names.
    pub fn new(structures: Vec<StructureSpec>, instrument_names: Vec<String>) -> Self {
        Self {
            structures,
            instrument_names,
        }
    }
}

impl LInitStrategy for StandardInitializer {
    fn level_has_lagrangian_data(&self, level_number: usize, _can_be_refined: bool) -> bool {
        self.structures.iter().any(|s| s.level_number == level_number)
    }

    fn structures_on_level(&self, level_number: usize) -> Vec<InitStructure> {
        self.structures
            .iter()
            .filter(|s| s.level_number == level_number)
            .map(StructureSpec::to_init_structure)
            .collect()
    }

    fn instrument_names(&self) -> Vec<String> {
        self.instrument_names.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ib_kernel::NDIM;

    fn ring() -> StructureSpec {
        StructureSpec {
            name: "ring".to_string(),
            level_number: 0,
            vertices: vec![[0.25; NDIM], [0.5; NDIM], [0.75; NDIM]],
            anchors: vec![0],
            rods: vec![
                RodLink { from: 0, to: 1, params: [1.0; ROD_MATERIAL_PARAMS] },
                RodLink { from: 0, to: 2, params: [2.0; ROD_MATERIAL_PARAMS] },
            ],
            instruments: vec![MeterVertex { vertex: 1, meter: 0 }, MeterVertex { vertex: 2, meter: 0 }],
            sources: vec![SourceVertex { vertex: 2, source_idx: 0 }],
        }
    }

    #[test]
    fn test_to_init_structure() {
        let init = ring().to_init_structure();
        assert_eq!(init.positions.len(), 3);
        assert!(init.specs[0].is_anchor());
        assert_eq!(init.specs[0].rod.as_ref().unwrap().next_idxs, vec![1, 2]);
        assert_eq!(init.specs[2].instrument.unwrap().meter_node_idx, 1);
        assert_eq!(init.specs[2].source.unwrap().source_idx, 0);
        assert!(init.specs[1].anchor.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_vertex() {
        let mut spec = ring();
        assert!(spec.validate().is_ok());
        spec.anchors.push(7);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_standard_initializer_levels() {
        let init = StandardInitializer::new(vec![ring()], vec!["meter".to_string()]);
        assert!(init.level_has_lagrangian_data(0, false));
        assert!(!init.level_has_lagrangian_data(1, false));
        assert_eq!(init.structures_on_level(0).len(), 1);
        assert_eq!(init.instrument_names(), vec!["meter".to_string()]);
    }

    #[test]
    fn test_parse_from_json() {
        let json = r#"{"name": "pt", "vertices": [[0.5, 0.5, 0.5]]}"#;
        if NDIM == 3 {
            let spec: StructureSpec = serde_json::from_str(json).unwrap();
            assert_eq!(spec.level_number, 0);
            assert!(spec.anchors.is_empty());
        }
    }
}
