//! Workload-driven patch distribution across simulated ranks
//!
//! The data manager reports one workload per patch (cells plus weighted
//! Lagrangian nodes).  Patches are handed out largest first, each to the
//! rank carrying the least work so far.  Moving the point data to the new
//! owners is the job of the data manager's redistribution, which the caller
//! brackets around [`rebalance_level`].

use ib_kernel::PatchHierarchy;

use crate::error::{IbError, IbResult};

/// Outcome of a rebalance.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalanceReport {
    /// Work assigned to each rank.
    pub rank_loads: Vec<f64>,
    /// Number of patches whose owner changed.
    pub patches_moved: usize,
}

impl LoadBalanceReport {
    /// Ratio of the heaviest rank's load to the mean load (1.0 is perfect).
    pub fn imbalance(&self) -> f64 {
        let n = self.rank_loads.len().max(1) as f64;
        let mean = self.rank_loads.iter().sum::<f64>() / n;
        let max = self.rank_loads.iter().copied().fold(0.0, f64::max);
        if mean > 0.0 {
            max / mean
        } else {
            1.0
        }
    }
}

/// Owner rank for each patch, largest workload first onto the least loaded
/// rank.  Ties go to the lower patch index and the lower rank.
pub fn assign_patch_owners(workloads: &[f64], num_ranks: usize) -> Vec<usize> {
    let num_ranks = num_ranks.max(1);
    let mut order: Vec<usize> = (0..workloads.len()).collect();
    order.sort_by(|&a, &b| workloads[b].total_cmp(&workloads[a]).then(a.cmp(&b)));

    let mut loads = vec![0.0_f64; num_ranks];
    let mut owners = vec![0; workloads.len()];
    for p in order {
        let mut rank = 0;
        for r in 1..num_ranks {
            if loads[r] < loads[rank] {
                rank = r;
            }
        }
        owners[p] = rank;
        loads[rank] += workloads[p];
    }
    owners
}

/// Reassign the owners of level `ln` according to `workloads` (one entry per
/// patch).
pub fn rebalance_level(hierarchy: &mut PatchHierarchy, ln: usize, workloads: &[f64]) -> IbResult<LoadBalanceReport> {
    let num_ranks = hierarchy.num_ranks();
    let level = hierarchy.level_mut(ln).ok_or(IbError::MissingLevel(ln))?;
    if workloads.len() != level.patches.len() {
        return Err(IbError::Config(format!(
            "level {} has {} patches but {} workload estimates",
            ln,
            level.patches.len(),
            workloads.len()
        )));
    }
    let owners = assign_patch_owners(workloads, num_ranks);
    let mut rank_loads = vec![0.0; num_ranks];
    let mut patches_moved = 0;
    for ((patch, &owner), &work) in level.patches.iter_mut().zip(&owners).zip(workloads) {
        if patch.owner != owner {
            patches_moved += 1;
            patch.owner = owner;
        }
        rank_loads[owner] += work;
    }
    let report = LoadBalanceReport {
        rank_loads,
        patches_moved,
    };
    tracing::info!(
        "Level {} rebalanced over {} ranks: {} patch(es) moved, imbalance {:.3}",
        ln,
        num_ranks,
        report.patches_moved,
        report.imbalance()
    );
    Ok(report)
}
