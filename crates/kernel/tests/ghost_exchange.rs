//! Ghost exchange between simulated ranks.
//!
//! Nodes are spread over three ranks, every rank asks for ghost copies of
//! all nodes it does not own, and after a write and a ghost fill every copy
//! agrees with the owner.

use ib_kernel::{LData, LMesh, LNode, NodeSpecs};

fn mesh(num_nodes: usize, num_ranks: usize) -> LMesh {
    let owned = (0..num_nodes)
        .map(|lag| ((lag * 7) % num_ranks, LNode::new(lag, NodeSpecs::default())))
        .collect();
    let requests = (0..num_ranks).map(|_| (0..num_nodes).collect()).collect();
    LMesh::new(0, num_ranks, owned, requests).unwrap()
}

#[test]
fn ghosts_agree_with_owners_after_fill() {
    let mesh = mesh(10, 3);
    let depth = 2;
    let mut data = LData::new("U", depth, &mesh);
    for rank in 0..mesh.num_ranks() {
        let nodes = mesh.rank(rank).unwrap().local_nodes().to_vec();
        let mut values = data.local_array_mut(rank).unwrap();
        for node in nodes {
            values[node.local_index * depth] = node.lagrangian_index as f64;
            values[node.local_index * depth + 1] = -(node.lagrangian_index as f64);
        }
    }
    assert!(data.needs_ghost_fill());
    data.ghost_fill(&mesh);
    assert!(!data.needs_ghost_fill());

    for rank in 0..mesh.num_ranks() {
        let nodes = mesh.rank(rank).unwrap();
        assert_eq!(nodes.local_nodes().len() + nodes.ghost_nodes().len(), 10);
        let values = data.local_form_array(rank);
        for node in nodes.local_nodes().iter().chain(nodes.ghost_nodes()) {
            assert_eq!(values[node.local_index * depth], node.lagrangian_index as f64);
            assert_eq!(values[node.local_index * depth + 1], -(node.lagrangian_index as f64));
        }
    }
}

#[test]
fn ownership_is_a_partition() {
    let mesh = mesh(25, 4);
    let mut seen = vec![0usize; 25];
    for rank in mesh.ranks() {
        for node in rank.local_nodes() {
            seen[node.lagrangian_index] += 1;
        }
    }
    assert!(seen.iter().all(|&count| count == 1));
    let total: usize = (0..4).map(|r| mesh.num_local_nodes(r)).sum();
    assert_eq!(total, 25);
}
