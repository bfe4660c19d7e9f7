//! Block-structured Cartesian grid description and cell-centered field storage.
//!
//! Index-space convention: the physical domain starts at cell index 0 on every
//! level, and level `ln` refines the coarsest index space by its
//! `ratio_to_level_zero`.  Boxes are inclusive at both ends.
//!
//! Field data is held per level in a single [`LevelData`] array covering the
//! bounding box of the level's patches plus a ghost layer.  Patches only
//! describe ownership: a cell belongs to the rank owning the patch that
//! contains it.

use serde::{Deserialize, Serialize};

use crate::{Point, NDIM};

/// Integer cell index.
pub type CellIndex = [i64; NDIM];

/// Floor division for positive divisors.
#[inline]
pub fn floor_div(a: i64, b: i64) -> i64 {
    a.div_euclid(b)
}

// ---------------------------------------------------------------------------
// CellBox
// ---------------------------------------------------------------------------

/// Axis-aligned box of cells, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellBox {
    /// Lowest cell index.
    pub lower: CellIndex,
    /// Highest cell index.
    pub upper: CellIndex,
}

impl CellBox {
    /// Create a box from its corner cells.
    pub fn new(lower: CellIndex, upper: CellIndex) -> Self {
        Self { lower, upper }
    }

    /// True when the box contains no cells.
    pub fn is_empty(&self) -> bool {
        (0..NDIM).any(|d| self.upper[d] < self.lower[d])
    }

    /// Number of cells along axis `d`.
    pub fn extent(&self, d: usize) -> i64 {
        (self.upper[d] - self.lower[d] + 1).max(0)
    }

    /// Total number of cells.
    pub fn num_cells(&self) -> usize {
        (0..NDIM).map(|d| self.extent(d) as usize).product()
    }

    /// Whether `cell` lies inside the box.
    pub fn contains(&self, cell: &CellIndex) -> bool {
        (0..NDIM).all(|d| cell[d] >= self.lower[d] && cell[d] <= self.upper[d])
    }

    /// Grow (or shrink, for negative `width`) the box in every direction.
    pub fn grow(&self, width: i64) -> Self {
        let mut b = *self;
        for d in 0..NDIM {
            b.lower[d] -= width;
            b.upper[d] += width;
        }
        b
    }

    /// Grow the box along a single axis.
    pub fn grow_axis(&self, d: usize, width: i64) -> Self {
        let mut b = *self;
        b.lower[d] -= width;
        b.upper[d] += width;
        b
    }

    /// Intersection with another box (possibly empty).
    pub fn intersect(&self, other: &CellBox) -> Self {
        let mut b = *self;
        for d in 0..NDIM {
            b.lower[d] = b.lower[d].max(other.lower[d]);
            b.upper[d] = b.upper[d].min(other.upper[d]);
        }
        b
    }

    /// Smallest box containing both boxes.
    pub fn union_hull(&self, other: &CellBox) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let mut b = *self;
        for d in 0..NDIM {
            b.lower[d] = b.lower[d].min(other.lower[d]);
            b.upper[d] = b.upper[d].max(other.upper[d]);
        }
        b
    }

    /// Map the box into an index space refined by `ratio`.
    pub fn refine(&self, ratio: i64) -> Self {
        let mut b = *self;
        for d in 0..NDIM {
            b.lower[d] *= ratio;
            b.upper[d] = (b.upper[d] + 1) * ratio - 1;
        }
        b
    }

    /// Map the box into an index space coarsened by `ratio`.
    pub fn coarsen(&self, ratio: i64) -> Self {
        let mut b = *self;
        for d in 0..NDIM {
            b.lower[d] = floor_div(b.lower[d], ratio);
            b.upper[d] = floor_div(b.upper[d], ratio);
        }
        b
    }

    /// Iterate over the cells of the box, axis 0 fastest.
    pub fn cells(&self) -> CellIter {
        CellIter {
            bx: *self,
            next: if self.is_empty() { None } else { Some(self.lower) },
        }
    }
}

/// Iterator over the cells of a [`CellBox`].
#[derive(Debug, Clone)]
pub struct CellIter {
    bx: CellBox,
    next: Option<CellIndex>,
}

impl Iterator for CellIter {
    type Item = CellIndex;

    fn next(&mut self) -> Option<CellIndex> {
        let current = self.next?;
        let mut cell = current;
        let mut d = 0;
        self.next = loop {
            cell[d] += 1;
            if cell[d] <= self.bx.upper[d] {
                break Some(cell);
            }
            cell[d] = self.bx.lower[d];
            d += 1;
            if d == NDIM {
                break None;
            }
        };
        Some(current)
    }
}

// ---------------------------------------------------------------------------
// GridGeometry
// ---------------------------------------------------------------------------

/// Physical extent, coarsest resolution, and periodicity of the domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    /// Physical lower corner.
    pub x_lower: Point,
    /// Physical upper corner.
    pub x_upper: Point,
    /// Number of cells along each axis on the coarsest level.
    pub num_cells: [i64; NDIM],
    /// Periodicity flag per axis.
    pub periodic: [bool; NDIM],
}

impl GridGeometry {
    /// Create a geometry description.
    pub fn new(x_lower: Point, x_upper: Point, num_cells: [i64; NDIM], periodic: [bool; NDIM]) -> Self {
        Self {
            x_lower,
            x_upper,
            num_cells,
            periodic,
        }
    }

    /// Coarsest-level grid spacing.
    pub fn dx(&self) -> Point {
        std::array::from_fn(|d| (self.x_upper[d] - self.x_lower[d]) / self.num_cells[d] as f64)
    }

    /// Grid spacing on a level refined by `ratio`.
    pub fn level_dx(&self, ratio: i64) -> Point {
        let dx = self.dx();
        std::array::from_fn(|d| dx[d] / ratio as f64)
    }

    /// Volume of one cell on a level refined by `ratio`.
    pub fn cell_volume(&self, ratio: i64) -> f64 {
        self.level_dx(ratio).iter().product()
    }

    /// Coarsest-level domain box.
    pub fn domain_box(&self) -> CellBox {
        CellBox::new([0; NDIM], std::array::from_fn(|d| self.num_cells[d] - 1))
    }

    /// Domain box on a level refined by `ratio`.
    pub fn level_domain_box(&self, ratio: i64) -> CellBox {
        self.domain_box().refine(ratio)
    }

    /// Index of the cell containing `x` on a level refined by `ratio`.
    pub fn cell_index(&self, x: &Point, ratio: i64) -> CellIndex {
        let dx = self.level_dx(ratio);
        std::array::from_fn(|d| ((x[d] - self.x_lower[d]) / dx[d]).floor() as i64)
    }

    /// Physical center of `cell` on a level refined by `ratio`.
    pub fn cell_center(&self, cell: &CellIndex, ratio: i64) -> Point {
        let dx = self.level_dx(ratio);
        std::array::from_fn(|d| self.x_lower[d] + (cell[d] as f64 + 0.5) * dx[d])
    }

    /// Map `cell` into the domain along periodic axes.
    pub fn wrap_periodic(&self, cell: &CellIndex, ratio: i64) -> CellIndex {
        let mut wrapped = *cell;
        for d in 0..NDIM {
            if self.periodic[d] {
                wrapped[d] = cell[d].rem_euclid(self.num_cells[d] * ratio);
            }
        }
        wrapped
    }

    /// Whether `cell` lies outside the domain along some non-periodic axis.
    pub fn outside_physical_boundary(&self, cell: &CellIndex, ratio: i64) -> bool {
        (0..NDIM).any(|d| !self.periodic[d] && (cell[d] < 0 || cell[d] >= self.num_cells[d] * ratio))
    }

    /// Periodic images of `cell` shifted by one domain length along any
    /// combination of periodic axes, excluding `cell` itself.
    pub fn periodic_images(&self, cell: &CellIndex, ratio: i64) -> Vec<CellIndex> {
        let mut images = vec![*cell];
        for d in 0..NDIM {
            if !self.periodic[d] {
                continue;
            }
            let period = self.num_cells[d] * ratio;
            let mut shifted = Vec::with_capacity(images.len() * 2);
            for image in &images {
                let mut lo = *image;
                lo[d] -= period;
                let mut hi = *image;
                hi[d] += period;
                shifted.push(lo);
                shifted.push(hi);
            }
            images.extend(shifted);
        }
        images.remove(0);
        images
    }
}

// ---------------------------------------------------------------------------
// Patches, levels, hierarchy
// ---------------------------------------------------------------------------

/// A box of cells owned by one rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Cells covered by the patch in the level's index space.
    pub cell_box: CellBox,
    /// Rank that owns the patch.
    pub owner: usize,
}

/// One refinement level: a disjoint set of patches sharing a resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchLevel {
    /// Level number (0 = coarsest).
    pub level_number: usize,
    /// Refinement ratio relative to level 0.
    pub ratio_to_level_zero: i64,
    /// Patches on the level.
    pub patches: Vec<Patch>,
}

impl PatchLevel {
    /// Create a level from explicit patches.
    pub fn new(level_number: usize, ratio_to_level_zero: i64, patches: Vec<Patch>) -> Self {
        Self {
            level_number,
            ratio_to_level_zero,
            patches,
        }
    }

    /// Create a level by chopping `region` into `chop[d]` pieces per axis and
    /// assigning the pieces round-robin to `num_ranks` ranks.
    pub fn chopped(level_number: usize, ratio_to_level_zero: i64, region: CellBox, chop: [i64; NDIM], num_ranks: usize) -> Self {
        let pieces = CellBox::new([0; NDIM], std::array::from_fn(|d| chop[d].max(1) - 1));
        let mut patches = Vec::with_capacity(pieces.num_cells());
        for (k, piece) in pieces.cells().enumerate() {
            let mut lower = [0; NDIM];
            let mut upper = [0; NDIM];
            for d in 0..NDIM {
                let n = region.extent(d);
                let parts = chop[d].max(1);
                lower[d] = region.lower[d] + piece[d] * n / parts;
                upper[d] = region.lower[d] + (piece[d] + 1) * n / parts - 1;
            }
            let cell_box = CellBox::new(lower, upper);
            if !cell_box.is_empty() {
                patches.push(Patch {
                    cell_box,
                    owner: k % num_ranks.max(1),
                });
            }
        }
        Self::new(level_number, ratio_to_level_zero, patches)
    }

    /// Bounding box of all patches.
    pub fn bounding_box(&self) -> CellBox {
        self.patches
            .iter()
            .fold(CellBox::new([0; NDIM], [-1; NDIM]), |acc, p| acc.union_hull(&p.cell_box))
    }

    /// Index of the patch containing `cell`, if any.
    pub fn patch_containing(&self, cell: &CellIndex) -> Option<usize> {
        self.patches.iter().position(|p| p.cell_box.contains(cell))
    }

    /// Whether some patch of the level contains `cell`.
    pub fn contains_cell(&self, cell: &CellIndex) -> bool {
        self.patch_containing(cell).is_some()
    }

    /// Total number of cells on the level.
    pub fn num_cells(&self) -> usize {
        self.patches.iter().map(|p| p.cell_box.num_cells()).sum()
    }
}

/// Ordered collection of refinement levels over one geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchHierarchy {
    /// Domain description.
    pub geometry: GridGeometry,
    levels: Vec<PatchLevel>,
    num_ranks: usize,
}

impl PatchHierarchy {
    /// Empty hierarchy distributed over `num_ranks` ranks.
    pub fn new(geometry: GridGeometry, num_ranks: usize) -> Self {
        Self {
            geometry,
            levels: Vec::new(),
            num_ranks: num_ranks.max(1),
        }
    }

    /// Single-level hierarchy covering the domain, chopped into patches.
    pub fn uniform(geometry: GridGeometry, chop: [i64; NDIM], num_ranks: usize) -> Self {
        let mut hierarchy = Self::new(geometry, num_ranks);
        let domain = hierarchy.geometry.domain_box();
        hierarchy.set_level(PatchLevel::chopped(0, 1, domain, chop, hierarchy.num_ranks));
        hierarchy
    }

    /// Insert or replace a level; finer levels beyond it are kept.
    pub fn set_level(&mut self, level: PatchLevel) {
        let ln = level.level_number;
        if ln < self.levels.len() {
            self.levels[ln] = level;
        } else {
            debug_assert_eq!(ln, self.levels.len(), "levels must be added coarsest first");
            self.levels.push(level);
        }
    }

    /// Drop every level finer than `ln`.
    pub fn remove_finer_levels(&mut self, ln: usize) {
        self.levels.truncate(ln + 1);
    }

    /// Number of ranks the hierarchy is distributed over.
    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// Number of levels.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Finest level number (0 for an empty hierarchy).
    pub fn finest_level_number(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// Level `ln`, if present.
    pub fn level(&self, ln: usize) -> Option<&PatchLevel> {
        self.levels.get(ln)
    }

    /// Mutable level `ln`, if present.
    pub fn level_mut(&mut self, ln: usize) -> Option<&mut PatchLevel> {
        self.levels.get_mut(ln)
    }

    /// Refinement ratio between level `ln` and level `ln - 1`.
    pub fn ratio_to_coarser(&self, ln: usize) -> i64 {
        match (ln, self.levels.get(ln)) {
            (0, _) | (_, None) => 1,
            (_, Some(level)) => level.ratio_to_level_zero / self.levels[ln - 1].ratio_to_level_zero,
        }
    }

    /// Whether a level finer than `ln` exists.
    pub fn finer_level_exists(&self, ln: usize) -> bool {
        ln + 1 < self.levels.len()
    }

    /// Whether `cell` of level `ln` is covered by a patch of level `ln + 1`.
    pub fn covered_by_finer(&self, ln: usize, cell: &CellIndex) -> bool {
        match self.levels.get(ln + 1) {
            Some(fine) => {
                let ratio = self.ratio_to_coarser(ln + 1);
                let refined = CellBox::new(*cell, *cell).refine(ratio);
                fine.patches.iter().any(|p| !p.cell_box.intersect(&refined).is_empty())
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// LevelData
// ---------------------------------------------------------------------------

/// Cell-centered data over one level with a ghost layer.
///
/// Values are stored cell-major with the `depth` components of a cell
/// contiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelData {
    interior: CellBox,
    ghost_box: CellBox,
    ghost_width: i64,
    depth: usize,
    values: Vec<f64>,
}

impl LevelData {
    /// Zero-initialized data over `interior` grown by `ghost_width`.
    pub fn new(interior: CellBox, ghost_width: usize, depth: usize) -> Self {
        let ghost_box = interior.grow(ghost_width as i64);
        Self {
            interior,
            ghost_box,
            ghost_width: ghost_width as i64,
            depth,
            values: vec![0.0; ghost_box.num_cells() * depth],
        }
    }

    /// Number of components per cell.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Ghost-layer width.
    pub fn ghost_width(&self) -> usize {
        self.ghost_width as usize
    }

    /// Box the data was allocated for, without ghosts.
    pub fn interior_box(&self) -> CellBox {
        self.interior
    }

    /// Allocated box including ghosts.
    pub fn ghost_box(&self) -> CellBox {
        self.ghost_box
    }

    /// Offset of the first component of `cell`, or `None` outside the ghost box.
    #[inline]
    pub fn offset(&self, cell: &CellIndex) -> Option<usize> {
        if !self.ghost_box.contains(cell) {
            return None;
        }
        let mut offset = 0usize;
        let mut stride = 1usize;
        for d in 0..NDIM {
            offset += (cell[d] - self.ghost_box.lower[d]) as usize * stride;
            stride *= self.ghost_box.extent(d) as usize;
        }
        Some(offset * self.depth)
    }

    /// Component `k` of `cell`, or `None` outside the ghost box.
    pub fn get(&self, cell: &CellIndex, k: usize) -> Option<f64> {
        self.offset(cell).map(|o| self.values[o + k])
    }

    /// Overwrite component `k` of `cell`; ignored outside the ghost box.
    pub fn set(&mut self, cell: &CellIndex, k: usize, value: f64) {
        if let Some(o) = self.offset(cell) {
            self.values[o + k] = value;
        }
    }

    /// Add to component `k` of `cell`; ignored outside the ghost box.
    pub fn add(&mut self, cell: &CellIndex, k: usize, value: f64) {
        if let Some(o) = self.offset(cell) {
            self.values[o + k] += value;
        }
    }

    /// Set every value, ghosts included.
    pub fn fill(&mut self, value: f64) {
        self.values.iter_mut().for_each(|v| *v = value);
    }

    /// Raw values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Mutable raw values.
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Fold contributions accumulated in ghost cells outside the domain along
    /// periodic axes back onto their periodic images, then zero those ghosts.
    pub fn fold_periodic_ghosts(&mut self, geometry: &GridGeometry, ratio: i64) {
        if !geometry.periodic.iter().any(|p| *p) {
            return;
        }
        let domain = geometry.level_domain_box(ratio);
        let ghost_cells: Vec<CellIndex> = self.ghost_box.cells().filter(|c| !domain.contains(c)).collect();
        for cell in ghost_cells {
            let image = geometry.wrap_periodic(&cell, ratio);
            if image == cell {
                continue;
            }
            let (Some(src), Some(dst)) = (self.offset(&cell), self.offset(&image)) else {
                continue;
            };
            for k in 0..self.depth {
                let v = self.values[src + k];
                self.values[dst + k] += v;
                self.values[src + k] = 0.0;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FieldStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Field {
    name: String,
    depth: usize,
    ghost_width: usize,
    levels: Vec<Option<LevelData>>,
}

/// Registry of cell-centered grid fields addressed by integer index.
#[derive(Debug, Clone, Default)]
pub struct FieldStore {
    fields: Vec<Field>,
}

impl FieldStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a field and return its index. No storage is allocated yet.
    pub fn register(&mut self, name: &str, depth: usize, ghost_width: usize) -> usize {
        self.fields.push(Field {
            name: name.to_string(),
            depth,
            ghost_width,
            levels: Vec::new(),
        });
        self.fields.len() - 1
    }

    /// Number of registered fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no field is registered.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Name of field `idx`.
    pub fn name(&self, idx: usize) -> Option<&str> {
        self.fields.get(idx).map(|f| f.name.as_str())
    }

    /// Depth of field `idx`.
    pub fn depth(&self, idx: usize) -> Option<usize> {
        self.fields.get(idx).map(|f| f.depth)
    }

    /// Ghost width of field `idx`.
    pub fn ghost_width(&self, idx: usize) -> Option<usize> {
        self.fields.get(idx).map(|f| f.ghost_width)
    }

    /// (Re)allocate zeroed storage for field `idx` on every level of `hierarchy`.
    pub fn allocate(&mut self, idx: usize, hierarchy: &PatchHierarchy) {
        if let Some(field) = self.fields.get_mut(idx) {
            field.levels = (0..hierarchy.num_levels())
                .map(|ln| {
                    hierarchy
                        .level(ln)
                        .map(|level| LevelData::new(level.bounding_box(), field.ghost_width, field.depth))
                })
                .collect();
        }
    }

    /// (Re)allocate every registered field.
    pub fn allocate_all(&mut self, hierarchy: &PatchHierarchy) {
        for idx in 0..self.fields.len() {
            self.allocate(idx, hierarchy);
        }
    }

    /// Data of field `idx` on level `ln`.
    pub fn level_data(&self, idx: usize, ln: usize) -> Option<&LevelData> {
        self.fields.get(idx)?.levels.get(ln)?.as_ref()
    }

    /// Mutable data of field `idx` on level `ln`.
    pub fn level_data_mut(&mut self, idx: usize, ln: usize) -> Option<&mut LevelData> {
        self.fields.get_mut(idx)?.levels.get_mut(ln)?.as_mut()
    }

    /// Mutable data of field `idx` on levels `ln - 1` (coarse) and `ln` (fine).
    pub fn coarse_fine_mut(&mut self, idx: usize, ln: usize) -> Option<(&mut LevelData, &mut LevelData)> {
        let field = self.fields.get_mut(idx)?;
        if ln == 0 || ln >= field.levels.len() {
            return None;
        }
        let (coarse, fine) = field.levels.split_at_mut(ln);
        Some((coarse[ln - 1].as_mut()?, fine[0].as_mut()?))
    }

    /// Two distinct fields on the same level: `dst` mutable, `src` shared.
    pub fn pair_mut(&mut self, dst: usize, src: usize, ln: usize) -> (Option<&mut LevelData>, Option<&LevelData>) {
        if dst == src || dst >= self.fields.len() || src >= self.fields.len() {
            return (None, None);
        }
        let (d, s) = if dst < src {
            let (lo, hi) = self.fields.split_at_mut(src);
            (&mut lo[dst], &hi[0])
        } else {
            let (lo, hi) = self.fields.split_at_mut(dst);
            (&mut hi[0], &lo[src])
        };
        (d.levels.get_mut(ln).and_then(Option::as_mut), s.levels.get(ln).and_then(Option::as_ref))
    }

    /// Set every value of field `idx` on every level.
    pub fn set_to_scalar(&mut self, idx: usize, value: f64) {
        if let Some(field) = self.fields.get_mut(idx) {
            for data in field.levels.iter_mut().flatten() {
                data.fill(value);
            }
        }
    }

    /// Composite-grid integral of component `k` of field `idx`.
    ///
    /// Each patch cell contributes its value times the cell volume unless a
    /// finer level covers it.
    pub fn integral(&self, idx: usize, k: usize, hierarchy: &PatchHierarchy) -> f64 {
        self.composite_cells(idx, hierarchy)
            .map(|(data, cell, volume)| data.get(&cell, k).unwrap_or(0.0) * volume)
            .sum()
    }

    /// Composite-grid maximum absolute value over all components of field `idx`.
    pub fn max_norm(&self, idx: usize, hierarchy: &PatchHierarchy) -> f64 {
        self.composite_cells(idx, hierarchy)
            .map(|(data, cell, _)| {
                (0..data.depth())
                    .map(|k| data.get(&cell, k).unwrap_or(0.0).abs())
                    .fold(0.0, f64::max)
            })
            .fold(0.0, f64::max)
    }

    fn composite_cells<'a>(
        &'a self,
        idx: usize,
        hierarchy: &'a PatchHierarchy,
    ) -> impl Iterator<Item = (&'a LevelData, CellIndex, f64)> + 'a {
        (0..hierarchy.num_levels()).flat_map(move |ln| {
            let data = self.level_data(idx, ln);
            let level = hierarchy.level(ln);
            let volume = level.map_or(0.0, |l| hierarchy.geometry.cell_volume(l.ratio_to_level_zero));
            level
                .into_iter()
                .flat_map(|l| l.patches.iter())
                .flat_map(|p| p.cell_box.cells())
                .filter(move |cell| !hierarchy.covered_by_finer(ln, cell))
                .filter_map(move |cell| data.map(|d| (d, cell, volume)))
        })
    }
}
