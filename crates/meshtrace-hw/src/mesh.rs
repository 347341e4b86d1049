//! Mesh coordinate space.
//!
//! A mesh is an N-dimensional grid of chips. Traces target axis-aligned
//! rectangles of that grid ([`MeshCoordinateRange`]), and the trace
//! assembler needs three set operations on them: intersection, a test for
//! overlap, and subtraction of one rectangle from another, which yields a
//! set of disjoint rectangles ([`MeshCoordinateRangeSet`]).
//!
//! Coordinates are enumerated in row-major order (last dimension fastest).

use std::fmt;

/// Extent of each mesh dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshShape {
    dims: Vec<u32>,
}

impl MeshShape {
    /// Create a shape. Every dimension must be non-zero.
    ///
    /// # Panics
    ///
    /// Panics on an empty dimension list or a zero-sized dimension.
    #[must_use]
    pub fn new(dims: impl Into<Vec<u32>>) -> Self {
        let dims = dims.into();
        assert!(!dims.is_empty(), "mesh shape needs at least one dimension");
        assert!(
            dims.iter().all(|&d| d > 0),
            "mesh shape {dims:?} has a zero-sized dimension"
        );
        Self { dims }
    }

    /// Number of dimensions.
    #[must_use]
    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    /// Extent of dimension `dim`.
    #[must_use]
    pub fn get(&self, dim: usize) -> u32 {
        self.dims[dim]
    }

    /// All extents.
    #[must_use]
    pub fn dims(&self) -> &[u32] {
        &self.dims
    }

    /// Number of chips in the mesh.
    #[must_use]
    pub fn mesh_size(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }
}

impl fmt::Display for MeshShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dims.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("x"))
    }
}

/// A point in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshCoordinate {
    coords: Vec<u32>,
}

impl MeshCoordinate {
    /// Create a coordinate from its components.
    #[must_use]
    pub fn new(coords: impl Into<Vec<u32>>) -> Self {
        Self {
            coords: coords.into(),
        }
    }

    /// Number of dimensions.
    #[must_use]
    pub fn num_dims(&self) -> usize {
        self.coords.len()
    }

    /// Component along dimension `dim`.
    #[must_use]
    pub fn get(&self, dim: usize) -> u32 {
        self.coords[dim]
    }

    /// All components.
    #[must_use]
    pub fn coords(&self) -> &[u32] {
        &self.coords
    }

    /// Row-major linear index of this coordinate inside `shape`.
    ///
    /// Returns `None` when the coordinate lies outside the shape.
    #[must_use]
    pub fn to_linear_index(&self, shape: &MeshShape) -> Option<usize> {
        if self.num_dims() != shape.num_dims() {
            return None;
        }
        let mut index = 0usize;
        for (&c, &extent) in self.coords.iter().zip(shape.dims()) {
            if c >= extent {
                return None;
            }
            index = index * extent as usize + c as usize;
        }
        Some(index)
    }
}

impl fmt::Display for MeshCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.coords.iter().map(u32::to_string).collect();
        write!(f, "({})", parts.join(","))
    }
}

/// Axis-aligned rectangle of the mesh, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshCoordinateRange {
    start: MeshCoordinate,
    end: MeshCoordinate,
}

impl MeshCoordinateRange {
    /// Create a range from its inclusive corners.
    ///
    /// # Panics
    ///
    /// Panics when the corners have different dimensionality or `start`
    /// exceeds `end` along any dimension.
    #[must_use]
    pub fn new(start: MeshCoordinate, end: MeshCoordinate) -> Self {
        assert_eq!(
            start.num_dims(),
            end.num_dims(),
            "range corners {start} and {end} differ in dimensionality"
        );
        assert!(
            start.coords.iter().zip(&end.coords).all(|(s, e)| s <= e),
            "range start {start} exceeds end {end}"
        );
        Self { start, end }
    }

    /// Range covering a whole mesh.
    #[must_use]
    pub fn from_shape(shape: &MeshShape) -> Self {
        let start = MeshCoordinate::new(vec![0; shape.num_dims()]);
        let end = MeshCoordinate::new(shape.dims().iter().map(|&d| d - 1).collect::<Vec<_>>());
        Self { start, end }
    }

    /// Range covering exactly one chip.
    #[must_use]
    pub fn single(coord: MeshCoordinate) -> Self {
        Self {
            start: coord.clone(),
            end: coord,
        }
    }

    /// Number of dimensions.
    #[must_use]
    pub fn num_dims(&self) -> usize {
        self.start.num_dims()
    }

    /// Inclusive lower corner.
    #[must_use]
    pub fn start_coord(&self) -> &MeshCoordinate {
        &self.start
    }

    /// Inclusive upper corner.
    #[must_use]
    pub fn end_coord(&self) -> &MeshCoordinate {
        &self.end
    }

    /// Extent of the range along each dimension.
    #[must_use]
    pub fn shape(&self) -> MeshShape {
        MeshShape::new(
            self.start
                .coords
                .iter()
                .zip(&self.end.coords)
                .map(|(s, e)| e - s + 1)
                .collect::<Vec<_>>(),
        )
    }

    /// Number of chips covered.
    #[must_use]
    pub fn num_coords(&self) -> usize {
        self.shape().mesh_size()
    }

    /// True if `coord` lies inside the range.
    #[must_use]
    pub fn contains(&self, coord: &MeshCoordinate) -> bool {
        coord.num_dims() == self.num_dims()
            && (0..self.num_dims())
                .all(|d| self.start.get(d) <= coord.get(d) && coord.get(d) <= self.end.get(d))
    }

    /// True if `other` lies entirely inside this range.
    #[must_use]
    pub fn contains_range(&self, other: &Self) -> bool {
        self.contains(&other.start) && self.contains(&other.end)
    }

    /// True if the two ranges share at least one chip.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.num_dims() == other.num_dims()
            && (0..self.num_dims()).all(|d| {
                self.start.get(d) <= other.end.get(d) && other.start.get(d) <= self.end.get(d)
            })
    }

    /// Overlap of the two ranges, or `None` when they are disjoint.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.intersects(other) {
            return None;
        }
        let (start, end): (Vec<u32>, Vec<u32>) = (0..self.num_dims())
            .map(|d| {
                (
                    self.start.get(d).max(other.start.get(d)),
                    self.end.get(d).min(other.end.get(d)),
                )
            })
            .unzip();
        Some(Self {
            start: MeshCoordinate::new(start),
            end: MeshCoordinate::new(end),
        })
    }

    /// Iterate over the covered coordinates in row-major order.
    #[must_use]
    pub fn iter(&self) -> MeshCoordinateRangeIter<'_> {
        MeshCoordinateRangeIter {
            range: self,
            next: Some(self.start.clone()),
        }
    }

    /// Copy of `self` with dimension `dim` limited to `lo..=hi`.
    fn with_dim(&self, dim: usize, lo: u32, hi: u32) -> Self {
        let mut start = self.start.clone();
        let mut end = self.end.clone();
        start.coords[dim] = lo;
        end.coords[dim] = hi;
        Self { start, end }
    }
}

impl fmt::Display for MeshCoordinateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.start, self.end)
    }
}

impl<'a> IntoIterator for &'a MeshCoordinateRange {
    type Item = MeshCoordinate;
    type IntoIter = MeshCoordinateRangeIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Row-major iterator over a [`MeshCoordinateRange`].
#[derive(Debug)]
pub struct MeshCoordinateRangeIter<'a> {
    range: &'a MeshCoordinateRange,
    next: Option<MeshCoordinate>,
}

impl Iterator for MeshCoordinateRangeIter<'_> {
    type Item = MeshCoordinate;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut successor = current.clone();
        for dim in (0..successor.num_dims()).rev() {
            if successor.coords[dim] < self.range.end.get(dim) {
                successor.coords[dim] += 1;
                self.next = Some(successor);
                break;
            }
            successor.coords[dim] = self.range.start.get(dim);
        }
        Some(current)
    }
}

/// A collection of mutually disjoint ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshCoordinateRangeSet {
    ranges: Vec<MeshCoordinateRange>,
}

impl MeshCoordinateRangeSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range. The caller keeps the set disjoint.
    ///
    /// # Panics
    ///
    /// Debug builds panic when `range` overlaps a range already in the set.
    pub fn push(&mut self, range: MeshCoordinateRange) {
        debug_assert!(
            self.ranges.iter().all(|r| !r.intersects(&range)),
            "range {range} overlaps the set"
        );
        self.ranges.push(range);
    }

    /// Member ranges, in insertion order.
    #[must_use]
    pub fn ranges(&self) -> &[MeshCoordinateRange] {
        &self.ranges
    }

    /// Consume the set, yielding its ranges.
    #[must_use]
    pub fn into_ranges(self) -> Vec<MeshCoordinateRange> {
        self.ranges
    }

    /// True when the set covers nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of chips covered by the set.
    #[must_use]
    pub fn num_coords(&self) -> usize {
        self.ranges.iter().map(MeshCoordinateRange::num_coords).sum()
    }

    /// True if any member contains `coord`.
    #[must_use]
    pub fn contains(&self, coord: &MeshCoordinate) -> bool {
        self.ranges.iter().any(|r| r.contains(coord))
    }

    /// Remove `other` from every member, keeping the result disjoint.
    #[must_use]
    pub fn subtract_range(&self, other: &MeshCoordinateRange) -> Self {
        let mut out = Self::new();
        for range in &self.ranges {
            for piece in subtract(range, other).into_ranges() {
                out.push(piece);
            }
        }
        out
    }
}

impl From<MeshCoordinateRange> for MeshCoordinateRangeSet {
    fn from(range: MeshCoordinateRange) -> Self {
        Self {
            ranges: vec![range],
        }
    }
}

/// `parent` minus `other`, as a set of disjoint rectangles.
///
/// The pieces are peeled off one dimension at a time: along each dimension
/// the slab below and the slab above the removed block are emitted, then
/// the remaining block is narrowed to the removed extent on that
/// dimension. Every piece is disjoint from the others and from `other`.
#[must_use]
pub fn subtract(parent: &MeshCoordinateRange, other: &MeshCoordinateRange) -> MeshCoordinateRangeSet {
    let Some(removed) = parent.intersection(other) else {
        return MeshCoordinateRangeSet::from(parent.clone());
    };

    let mut pieces = MeshCoordinateRangeSet::new();
    let mut remaining = parent.clone();
    for dim in 0..parent.num_dims() {
        let (lo, hi) = (remaining.start.get(dim), remaining.end.get(dim));
        let (cut_lo, cut_hi) = (removed.start.get(dim), removed.end.get(dim));
        if lo < cut_lo {
            pieces.push(remaining.with_dim(dim, lo, cut_lo - 1));
        }
        if hi > cut_hi {
            pieces.push(remaining.with_dim(dim, cut_hi + 1, hi));
        }
        remaining = remaining.with_dim(dim, cut_lo, cut_hi);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(c: &[u32]) -> MeshCoordinate {
        MeshCoordinate::new(c.to_vec())
    }

    fn range(s: &[u32], e: &[u32]) -> MeshCoordinateRange {
        MeshCoordinateRange::new(coord(s), coord(e))
    }

    #[test]
    fn full_mesh_range_covers_shape() {
        let shape = MeshShape::new([2, 4]);
        let full = MeshCoordinateRange::from_shape(&shape);
        assert_eq!(full.num_coords(), 8);
        assert_eq!(full.iter().count(), 8);
        assert_eq!(full.end_coord(), &coord(&[1, 3]));
    }

    #[test]
    fn iteration_is_row_major() {
        let r = range(&[0, 1], &[1, 2]);
        let got: Vec<_> = r.iter().collect();
        assert_eq!(
            got,
            vec![coord(&[0, 1]), coord(&[0, 2]), coord(&[1, 1]), coord(&[1, 2])]
        );
    }

    #[test]
    fn linear_index_matches_iteration_order() {
        let shape = MeshShape::new([2, 3]);
        for (i, c) in MeshCoordinateRange::from_shape(&shape).iter().enumerate() {
            assert_eq!(c.to_linear_index(&shape), Some(i));
        }
        assert_eq!(coord(&[2, 0]).to_linear_index(&shape), None);
    }

    #[test]
    fn intersection_of_overlapping_ranges() {
        let a = range(&[0, 0], &[2, 2]);
        let b = range(&[1, 1], &[3, 3]);
        assert!(a.intersects(&b));
        assert_eq!(a.intersection(&b), Some(range(&[1, 1], &[2, 2])));
    }

    #[test]
    fn disjoint_ranges_do_not_intersect() {
        let a = range(&[0, 0], &[0, 3]);
        let b = range(&[1, 0], &[1, 3]);
        assert!(!a.intersects(&b));
        assert_eq!(a.intersection(&b), None);
    }

    #[test]
    fn subtract_corner_from_square() {
        let a = range(&[0, 0], &[1, 1]);
        let b = range(&[0, 0], &[0, 0]);
        let rest = subtract(&a, &b);
        assert_eq!(rest.num_coords(), 3);
        assert!(!rest.contains(&coord(&[0, 0])));
        for c in [[1, 0], [0, 1], [1, 1]] {
            assert!(rest.contains(&coord(&c)));
        }
    }

    #[test]
    fn subtract_center_leaves_disjoint_frame() {
        let a = range(&[0, 0], &[2, 2]);
        let b = range(&[1, 1], &[1, 1]);
        let rest = subtract(&a, &b);
        assert_eq!(rest.num_coords(), 8);
        let ranges = rest.ranges();
        for (i, x) in ranges.iter().enumerate() {
            assert!(!x.intersects(&b));
            for y in &ranges[i + 1..] {
                assert!(!x.intersects(y));
            }
        }
    }

    #[test]
    fn subtract_whole_range_is_empty() {
        let a = range(&[0, 0], &[1, 3]);
        assert!(subtract(&a, &a).is_empty());
    }

    #[test]
    fn subtract_disjoint_keeps_parent() {
        let a = range(&[0, 0], &[0, 3]);
        let b = range(&[1, 0], &[1, 3]);
        assert_eq!(subtract(&a, &b).ranges(), &[a]);
    }

    #[test]
    fn range_set_subtraction_shrinks_coverage() {
        let set = MeshCoordinateRangeSet::from(range(&[0, 0], &[3, 0]));
        let rest = set
            .subtract_range(&range(&[1, 0], &[1, 0]))
            .subtract_range(&range(&[3, 0], &[3, 0]));
        assert_eq!(rest.num_coords(), 2);
        assert!(rest.contains(&coord(&[0, 0])));
        assert!(rest.contains(&coord(&[2, 0])));
    }

    #[test]
    fn three_dimensional_subtraction() {
        let a = range(&[0, 0, 0], &[1, 1, 1]);
        let b = range(&[1, 1, 1], &[1, 1, 1]);
        assert_eq!(subtract(&a, &b).num_coords(), 7);
    }

    #[test]
    fn display_formats() {
        assert_eq!(MeshShape::new([2, 4]).to_string(), "2x4");
        assert_eq!(range(&[0, 1], &[1, 2]).to_string(), "[(0,1)..(1,2)]");
    }
}
