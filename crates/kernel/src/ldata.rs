//! Distributed per-node vectors with ghost regions and dirty tracking.
//!
//! An [`LData`] holds `depth` values per node for every rank, laid out as the
//! rank's local nodes followed by its ghost nodes (see [`LMesh`]).  Vector
//! operations act on local entries only.  Any write marks the vector as
//! needing a ghost fill; only [`LData::ghost_fill`] clears the mark.

use std::ops::{Deref, DerefMut};

use crate::lmesh::LMesh;
use crate::{KernelError, Point, NDIM};

/// Values held by one rank.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LDataPart {
    num_local: usize,
    values: Vec<f64>,
}

impl LDataPart {
    /// Number of owned nodes.
    pub fn num_local(&self) -> usize {
        self.num_local
    }

    /// Local then ghost values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Mutable local then ghost values.
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }
}

/// A named vector with `depth` components per Lagrangian node.
#[derive(Debug, Clone, PartialEq)]
pub struct LData {
    name: String,
    depth: usize,
    parts: Vec<LDataPart>,
    needs_ghost_fill: bool,
}

/// Scoped mutable access to one rank's local+ghost values.
///
/// Dropping the guard marks the owning vector as needing a ghost fill.
pub struct LocalArrayMut<'a> {
    values: &'a mut [f64],
    dirty: &'a mut bool,
}

impl Deref for LocalArrayMut<'_> {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &*self.values
    }
}

impl DerefMut for LocalArrayMut<'_> {
    fn deref_mut(&mut self) -> &mut [f64] {
        &mut *self.values
    }
}

impl Drop for LocalArrayMut<'_> {
    fn drop(&mut self) {
        *self.dirty = true;
    }
}

/// Extract a point from the first `NDIM` entries of `values`.
#[inline]
pub fn point_at(values: &[f64], node: usize) -> Point {
    std::array::from_fn(|d| values[node * NDIM + d])
}

impl LData {
    /// Zero-initialized vector matching the layout of `mesh`.
    pub fn new(name: &str, depth: usize, mesh: &LMesh) -> Self {
        let parts = mesh
            .ranks()
            .iter()
            .map(|r| LDataPart {
                num_local: r.local_nodes().len(),
                values: vec![0.0; (r.local_nodes().len() + r.ghost_nodes().len()) * depth],
            })
            .collect();
        Self {
            name: name.to_string(),
            depth,
            parts,
            needs_ghost_fill: false,
        }
    }

    /// Build a vector from values given in Lagrangian-index order.
    ///
    /// `global[lag * depth..(lag + 1) * depth]` holds the values of node `lag`.
    /// Ghost entries are filled too, so the result is clean.
    pub fn scatter(name: &str, depth: usize, mesh: &LMesh, global: &[f64]) -> Self {
        let mut data = Self::new(name, depth, mesh);
        for (part, rank) in data.parts.iter_mut().zip(mesh.ranks()) {
            let nodes = rank.local_nodes().iter().chain(rank.ghost_nodes());
            for (slot, node) in nodes.enumerate() {
                let src = node.lagrangian_index * depth;
                if let Some(values) = global.get(src..src + depth) {
                    part.values[slot * depth..(slot + 1) * depth].copy_from_slice(values);
                }
            }
        }
        data
    }

    /// Values of owned nodes in Lagrangian-index order.
    pub fn gather(&self, mesh: &LMesh) -> Vec<f64> {
        let len = mesh.owned_nodes().map(|n| n.lagrangian_index + 1).max().unwrap_or(0);
        let mut global = vec![0.0; len * self.depth];
        for (part, rank) in self.parts.iter().zip(mesh.ranks()) {
            for (li, node) in rank.local_nodes().iter().enumerate() {
                let dst = node.lagrangian_index * self.depth;
                global[dst..dst + self.depth].copy_from_slice(&part.values[li * self.depth..(li + 1) * self.depth]);
            }
        }
        global
    }

    /// Vector name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Components per node.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of ranks.
    pub fn num_ranks(&self) -> usize {
        self.parts.len()
    }

    /// Number of nodes owned by `rank`.
    pub fn num_local_nodes(&self, rank: usize) -> usize {
        self.parts.get(rank).map_or(0, |p| p.num_local)
    }

    /// Number of ghost nodes held by `rank`.
    pub fn num_ghost_nodes(&self, rank: usize) -> usize {
        self.parts
            .get(rank)
            .map_or(0, |p| p.values.len() / self.depth.max(1) - p.num_local)
    }

    /// Total number of owned nodes over all ranks.
    pub fn global_len(&self) -> usize {
        self.parts.iter().map(|p| p.num_local).sum()
    }

    /// Whether ghost values may be stale.
    pub fn needs_ghost_fill(&self) -> bool {
        self.needs_ghost_fill
    }

    /// Record that local values changed outside the provided accessors.
    pub fn mark_modified(&mut self) {
        self.needs_ghost_fill = true;
    }

    /// Read-only local+ghost values of `rank`.
    pub fn local_form_array(&self, rank: usize) -> &[f64] {
        self.parts.get(rank).map_or(&[][..], |p| p.values.as_slice())
    }

    /// Scoped mutable local+ghost values of `rank`.
    pub fn local_array_mut(&mut self, rank: usize) -> Option<LocalArrayMut<'_>> {
        let Self {
            parts,
            needs_ghost_fill,
            ..
        } = self;
        parts.get_mut(rank).map(|p| LocalArrayMut {
            values: p.values.as_mut_slice(),
            dirty: needs_ghost_fill,
        })
    }

    /// Per-rank parts.
    pub fn parts(&self) -> &[LDataPart] {
        &self.parts
    }

    /// Mutable per-rank parts; the vector is marked dirty immediately.
    pub fn local_parts_mut(&mut self) -> &mut [LDataPart] {
        self.needs_ghost_fill = true;
        &mut self.parts
    }

    /// Refresh every ghost entry from its owner and clear the dirty mark.
    ///
    /// Collective: every rank's ghosts are refreshed in one call.
    pub fn ghost_fill(&mut self, mesh: &LMesh) {
        let depth = self.depth;
        let incoming: Vec<Vec<f64>> = mesh
            .ranks()
            .iter()
            .map(|rank| {
                rank.ghost_sources()
                    .iter()
                    .flat_map(|&(owner, li)| self.parts[owner].values[li * depth..(li + 1) * depth].iter().copied())
                    .collect()
            })
            .collect();
        for (part, values) in self.parts.iter_mut().zip(incoming) {
            let start = part.num_local * depth;
            part.values[start..start + values.len()].copy_from_slice(&values);
        }
        self.needs_ghost_fill = false;
    }

    fn check_layout(&self, other: &LData) -> Result<(), KernelError> {
        let same = self.depth == other.depth
            && self.parts.len() == other.parts.len()
            && self
                .parts
                .iter()
                .zip(&other.parts)
                .all(|(a, b)| a.num_local == b.num_local && a.values.len() == b.values.len());
        if same {
            Ok(())
        } else {
            Err(KernelError::LayoutMismatch {
                left: self.name.clone(),
                right: other.name.clone(),
            })
        }
    }

    fn local_values_mut(&mut self) -> impl Iterator<Item = &mut [f64]> + '_ {
        self.needs_ghost_fill = true;
        let depth = self.depth;
        self.parts.iter_mut().map(move |p| &mut p.values[..p.num_local * depth])
    }

    fn local_values(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.parts.iter().map(move |p| &p.values[..p.num_local * self.depth])
    }

    /// Copy local values from `other`.
    pub fn copy_from(&mut self, other: &LData) -> Result<(), KernelError> {
        self.check_layout(other)?;
        for (dst, src) in self.local_values_mut().zip(other.local_values()) {
            dst.copy_from_slice(src);
        }
        Ok(())
    }

    /// Set every local value to `value`.
    pub fn set_all(&mut self, value: f64) {
        for dst in self.local_values_mut() {
            dst.iter_mut().for_each(|v| *v = value);
        }
    }

    /// `self = alpha * self`.
    pub fn scale(&mut self, alpha: f64) {
        for dst in self.local_values_mut() {
            dst.iter_mut().for_each(|v| *v *= alpha);
        }
    }

    /// `self = self + alpha * x`.
    pub fn axpy(&mut self, alpha: f64, x: &LData) -> Result<(), KernelError> {
        self.check_layout(x)?;
        for (dst, xs) in self.local_values_mut().zip(x.local_values()) {
            dst.iter_mut().zip(xs).for_each(|(v, xv)| *v += alpha * xv);
        }
        Ok(())
    }

    /// `self = alpha * x + y`.
    pub fn waxpy(&mut self, alpha: f64, x: &LData, y: &LData) -> Result<(), KernelError> {
        self.check_layout(x)?;
        self.check_layout(y)?;
        let sources = x.local_values().zip(y.local_values());
        for (dst, (xs, ys)) in self.local_values_mut().zip(sources) {
            for ((v, xv), yv) in dst.iter_mut().zip(xs).zip(ys) {
                *v = alpha * xv + yv;
            }
        }
        Ok(())
    }

    /// `self = alpha * x + beta * y + gamma * self`.
    pub fn axpbypcz(&mut self, alpha: f64, x: &LData, beta: f64, y: &LData, gamma: f64) -> Result<(), KernelError> {
        self.check_layout(x)?;
        self.check_layout(y)?;
        let sources = x.local_values().zip(y.local_values());
        for (dst, (xs, ys)) in self.local_values_mut().zip(sources) {
            for ((v, xv), yv) in dst.iter_mut().zip(xs).zip(ys) {
                *v = alpha * xv + beta * yv + gamma * *v;
            }
        }
        Ok(())
    }

    /// Euclidean norm over all local values.
    pub fn norm2(&self) -> f64 {
        self.local_values()
            .flat_map(|s| s.iter())
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt()
    }

    /// Exchange the storage of two vectors without copying values.
    ///
    /// Names stay with their vectors; both become dirty.
    pub fn swap_values(&mut self, other: &mut LData) -> Result<(), KernelError> {
        self.check_layout(other)?;
        std::mem::swap(&mut self.parts, &mut other.parts);
        self.needs_ghost_fill = true;
        other.needs_ghost_fill = true;
        Ok(())
    }

    /// Address of the first value of `rank`, identifying the storage buffer.
    pub fn storage_id(&self, rank: usize) -> Option<*const f64> {
        self.parts.get(rank).map(|p| p.values.as_ptr())
    }
}
