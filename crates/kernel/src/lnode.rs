//! Lagrangian node records and the optional specs attached to them.
//!
//! A node carries its persistent Lagrangian index, its transient local and
//! global indices (valid until the next redistribution), and whatever
//! structural metadata the structure input attached to it.  Positions,
//! velocities and forces are not stored here; they live in
//! [`LData`](crate::ldata::LData) vectors indexed by the local index.

use serde::{Deserialize, Serialize};

/// Marks a node whose velocity and spread force are held at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorPointSpec {
    /// Lagrangian index of the anchored node.
    pub node_idx: usize,
}

/// Number of material parameters carried per rod link.
pub const ROD_MATERIAL_PARAMS: usize = 10;

/// Rod-link material data.  Carried through redistribution, not interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RodForceSpec {
    /// Lagrangian index of the node at the start of each link.
    pub node_idx: usize,
    /// Lagrangian indices of the nodes at the other end of each link.
    pub next_idxs: Vec<usize>,
    /// Material parameters for each link.
    pub material_params: Vec<[f64; ROD_MATERIAL_PARAMS]>,
}

/// Tags a node as belonging to a flow meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationSpec {
    /// Lagrangian index of the tagged node.
    pub node_idx: usize,
    /// Index of the meter the node belongs to.
    pub meter_idx: usize,
    /// Position of the node within the meter.
    pub meter_node_idx: usize,
}

/// Tags a node as the location of a fluid source or sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Lagrangian index of the tagged node.
    pub node_idx: usize,
    /// Index of the source on its level.
    pub source_idx: usize,
}

/// All optional specs a node may carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSpecs {
    /// Anchor tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorPointSpec>,
    /// Rod material data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rod: Option<RodForceSpec>,
    /// Flow meter tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<InstrumentationSpec>,
    /// Source/sink tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
}

impl NodeSpecs {
    /// True when no spec is attached.
    pub fn is_empty(&self) -> bool {
        self.anchor.is_none() && self.rod.is_none() && self.instrument.is_none() && self.source.is_none()
    }

    /// Whether the node is anchored.
    pub fn is_anchor(&self) -> bool {
        self.anchor.is_some()
    }

    /// Rewrite every Lagrangian index held by the specs by adding `offset`.
    pub fn shift_indices(&mut self, offset: usize) {
        if let Some(anchor) = self.anchor.as_mut() {
            anchor.node_idx += offset;
        }
        if let Some(rod) = self.rod.as_mut() {
            rod.node_idx += offset;
            rod.next_idxs.iter_mut().for_each(|i| *i += offset);
        }
        if let Some(instrument) = self.instrument.as_mut() {
            instrument.node_idx += offset;
        }
        if let Some(source) = self.source.as_mut() {
            source.node_idx += offset;
        }
    }
}

/// A Lagrangian node as seen by one rank.
#[derive(Debug, Clone, PartialEq)]
pub struct LNode {
    /// Persistent Lagrangian index.
    pub lagrangian_index: usize,
    /// Index into the owning rank's local+ghost storage.
    pub local_index: usize,
    /// Global (rank-major) index of the owned copy.
    pub global_index: usize,
    /// Attached specs.
    pub specs: NodeSpecs,
}

impl LNode {
    /// Node with unassigned local/global indices.
    pub fn new(lagrangian_index: usize, specs: NodeSpecs) -> Self {
        Self {
            lagrangian_index,
            local_index: 0,
            global_index: 0,
            specs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_indices() {
        let mut specs = NodeSpecs {
            anchor: Some(AnchorPointSpec { node_idx: 2 }),
            rod: Some(RodForceSpec {
                node_idx: 2,
                next_idxs: vec![3],
                material_params: vec![[1.0; ROD_MATERIAL_PARAMS]],
            }),
            instrument: None,
            source: Some(SourceSpec { node_idx: 2, source_idx: 0 }),
        };
        specs.shift_indices(10);
        assert_eq!(specs.anchor.unwrap().node_idx, 12);
        assert_eq!(specs.rod.as_ref().unwrap().next_idxs, vec![13]);
        assert_eq!(specs.source.unwrap().node_idx, 12);
        assert!(specs.is_anchor());
        assert!(!specs.is_empty());
    }

    #[test]
    fn test_empty_specs_serialize_compactly() {
        let json = serde_json::to_string(&NodeSpecs::default()).unwrap();
        assert_eq!(json, "{}");
        let parsed: NodeSpecs = serde_json::from_str(r#"{"anchor":{"node_idx":4}}"#).unwrap();
        assert!(parsed.is_anchor());
    }
}
