//! Per-level partitioning of Lagrangian nodes into local and ghost sets.
//!
//! Every node is *local* (owned) on exactly one rank.  A rank additionally
//! holds read-only *ghost* copies of nodes owned elsewhere that lie close
//! enough to its patches to matter for interpolation, spreading, or force
//! evaluation.  Storage on a rank is ordered local nodes first (sorted by
//! Lagrangian index), then ghosts.

use std::collections::BTreeMap;

use crate::lnode::LNode;
use crate::KernelError;

/// Nodes held by one rank.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankNodes {
    local: Vec<LNode>,
    ghost: Vec<LNode>,
    /// (owner rank, owner local index) for every ghost slot.
    ghost_sources: Vec<(usize, usize)>,
    global_offset: usize,
}

impl RankNodes {
    /// Owned nodes, sorted by Lagrangian index.
    pub fn local_nodes(&self) -> &[LNode] {
        &self.local
    }

    /// Ghost copies.
    pub fn ghost_nodes(&self) -> &[LNode] {
        &self.ghost
    }

    /// Where each ghost slot is copied from.
    pub fn ghost_sources(&self) -> &[(usize, usize)] {
        &self.ghost_sources
    }

    /// Global index of the first owned node.
    pub fn global_offset(&self) -> usize {
        self.global_offset
    }
}

/// Local/ghost node layout of one level across all ranks.
#[derive(Debug, Clone, PartialEq)]
pub struct LMesh {
    level_number: usize,
    ranks: Vec<RankNodes>,
    locator: BTreeMap<usize, (usize, usize)>,
}

impl LMesh {
    /// Build the layout from node ownership and per-rank ghost requests.
    ///
    /// # Arguments
    /// * `level_number` - Level the nodes live on.
    /// * `num_ranks` - Number of ranks.
    /// * `owned` - `(owner rank, node)` pairs; each Lagrangian index must appear once.
    /// * `ghost_requests` - Lagrangian indices each rank wants ghost copies of.
    ///   Requests for nodes the rank owns are ignored.
    pub fn new(
        level_number: usize,
        num_ranks: usize,
        owned: Vec<(usize, LNode)>,
        ghost_requests: Vec<Vec<usize>>,
    ) -> Result<Self, KernelError> {
        let mut ranks: Vec<RankNodes> = (0..num_ranks).map(|_| RankNodes::default()).collect();
        for (rank, node) in owned {
            let slot = ranks.get_mut(rank).ok_or(KernelError::InvalidRank { rank, num_ranks })?;
            slot.local.push(node);
        }

        let mut locator = BTreeMap::new();
        let mut offset = 0;
        for (rank, nodes) in ranks.iter_mut().enumerate() {
            nodes.local.sort_by_key(|n| n.lagrangian_index);
            nodes.global_offset = offset;
            for (li, node) in nodes.local.iter_mut().enumerate() {
                node.local_index = li;
                node.global_index = offset + li;
                if locator.insert(node.lagrangian_index, (rank, li)).is_some() {
                    return Err(KernelError::DuplicateNode(node.lagrangian_index));
                }
            }
            offset += nodes.local.len();
        }

        for (rank, mut requests) in ghost_requests.into_iter().enumerate().take(num_ranks) {
            requests.sort_unstable();
            requests.dedup();
            let mut ghost = Vec::new();
            let mut sources = Vec::new();
            let num_local = ranks[rank].local.len();
            for lag in requests {
                let &(owner, li) = locator.get(&lag).ok_or(KernelError::UnknownNode(lag))?;
                if owner == rank {
                    continue;
                }
                let mut copy = ranks[owner].local[li].clone();
                copy.local_index = num_local + ghost.len();
                ghost.push(copy);
                sources.push((owner, li));
            }
            ranks[rank].ghost = ghost;
            ranks[rank].ghost_sources = sources;
        }

        Ok(Self {
            level_number,
            ranks,
            locator,
        })
    }

    /// Level the mesh describes.
    pub fn level_number(&self) -> usize {
        self.level_number
    }

    /// Number of ranks.
    pub fn num_ranks(&self) -> usize {
        self.ranks.len()
    }

    /// Total number of nodes on the level.
    pub fn num_nodes(&self) -> usize {
        self.locator.len()
    }

    /// Per-rank node storage.
    pub fn rank(&self, rank: usize) -> Option<&RankNodes> {
        self.ranks.get(rank)
    }

    /// Per-rank node storage for every rank.
    pub fn ranks(&self) -> &[RankNodes] {
        &self.ranks
    }

    /// Number of nodes owned by `rank`.
    pub fn num_local_nodes(&self, rank: usize) -> usize {
        self.ranks.get(rank).map_or(0, |r| r.local.len())
    }

    /// Number of ghost copies held by `rank`.
    pub fn num_ghost_nodes(&self, rank: usize) -> usize {
        self.ranks.get(rank).map_or(0, |r| r.ghost.len())
    }

    /// Owner rank and local index of a Lagrangian index.
    pub fn locate(&self, lagrangian_index: usize) -> Option<(usize, usize)> {
        self.locator.get(&lagrangian_index).copied()
    }

    /// Owned node with the given Lagrangian index.
    pub fn node(&self, lagrangian_index: usize) -> Option<&LNode> {
        let (rank, li) = self.locate(lagrangian_index)?;
        self.ranks[rank].local.get(li)
    }

    /// Global index of a Lagrangian index.
    pub fn lagrangian_to_global(&self, lagrangian_index: usize) -> Option<usize> {
        self.node(lagrangian_index).map(|n| n.global_index)
    }

    /// Lagrangian index of a global index.
    pub fn global_to_lagrangian(&self, global_index: usize) -> Option<usize> {
        let rank = self
            .ranks
            .iter()
            .rposition(|r| r.global_offset <= global_index && !r.local.is_empty())?;
        let r = &self.ranks[rank];
        r.local.get(global_index - r.global_offset).map(|n| n.lagrangian_index)
    }

    /// Owned nodes of every rank in Lagrangian-index order.
    pub fn owned_nodes(&self) -> impl Iterator<Item = &LNode> + '_ {
        self.locator.values().map(|&(rank, li)| &self.ranks[rank].local[li])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lnode::NodeSpecs;

    fn node(lag: usize) -> LNode {
        LNode::new(lag, NodeSpecs::default())
    }

    #[test]
    fn test_layout_and_ghosts() {
        let owned = vec![(1, node(3)), (0, node(2)), (0, node(0)), (1, node(1))];
        let mesh = LMesh::new(0, 2, owned, vec![vec![1, 2], vec![0, 0]]).unwrap();
        assert_eq!(mesh.num_nodes(), 4);
        assert_eq!(mesh.num_local_nodes(0), 2);
        assert_eq!(mesh.rank(0).unwrap().local_nodes()[0].lagrangian_index, 0);
        assert_eq!(mesh.rank(1).unwrap().global_offset(), 2);

        // Rank 0 already owns node 2; only node 1 becomes a ghost.
        assert_eq!(mesh.num_ghost_nodes(0), 1);
        let ghost = &mesh.rank(0).unwrap().ghost_nodes()[0];
        assert_eq!(ghost.lagrangian_index, 1);
        assert_eq!(ghost.local_index, 2);
        assert_eq!(mesh.rank(0).unwrap().ghost_sources()[0], (1, 0));
        assert_eq!(mesh.num_ghost_nodes(1), 1);
    }

    #[test]
    fn test_index_mapping_round_trip() {
        let owned = vec![(0, node(5)), (1, node(4)), (1, node(6))];
        let mesh = LMesh::new(0, 3, owned, vec![]).unwrap();
        for lag in [4, 5, 6] {
            let global = mesh.lagrangian_to_global(lag).unwrap();
            assert_eq!(mesh.global_to_lagrangian(global), Some(lag));
        }
        assert_eq!(mesh.lagrangian_to_global(7), None);
        assert_eq!(mesh.global_to_lagrangian(3), None);
        let order: Vec<usize> = mesh.owned_nodes().map(|n| n.lagrangian_index).collect();
        assert_eq!(order, vec![4, 5, 6]);
    }

    #[test]
    fn test_duplicate_owner_rejected() {
        let owned = vec![(0, node(1)), (1, node(1))];
        assert!(matches!(LMesh::new(0, 2, owned, vec![]), Err(KernelError::DuplicateNode(1))));
    }
}
