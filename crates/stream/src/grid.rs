use glam::DVec3;

use crate::config::GridConfig;
use crate::error::{ConfigError, GridError};

/// Integer address of a leaf cell, counted from the grid's minimum corner.
///
/// For a fixed configuration the same point always maps to the same address,
/// so the address doubles as the identity of the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeafCoord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl LeafCoord {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

impl std::fmt::Display for LeafCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Slot vector with index reuse. Indices stay valid until removed.
#[derive(Debug)]
struct Arena<N> {
    slots: Vec<Option<N>>,
    free: Vec<u32>,
    len: usize,
}

impl<N> Arena<N> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    fn insert(&mut self, node: N) -> u32 {
        self.len += 1;
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(node);
            idx
        } else {
            self.slots.push(Some(node));
            (self.slots.len() - 1) as u32
        }
    }

    fn remove(&mut self, idx: u32) -> Option<N> {
        let node = self.slots.get_mut(idx as usize)?.take()?;
        self.free.push(idx);
        self.len -= 1;
        Some(node)
    }

    fn get(&self, idx: u32) -> Option<&N> {
        self.slots.get(idx as usize)?.as_ref()
    }

    fn get_mut(&mut self, idx: u32) -> Option<&mut N> {
        self.slots.get_mut(idx as usize)?.as_mut()
    }

    fn iter(&self) -> impl Iterator<Item = &N> {
        self.slots.iter().filter_map(Option::as_ref)
    }
}

/// Interior node. Children index `branches` above the last interior level and
/// `leaves` at it.
#[derive(Debug)]
struct Branch {
    center: DVec3,
    half_extent: f64,
    level: u32,
    parent: Option<(u32, usize)>,
    children: Box<[Option<u32>]>,
    child_count: usize,
}

impl Branch {
    /// Center and half-extent of child `slot` when split `arity` ways per axis.
    fn child_geometry(&self, arity: u32, slot: usize) -> (DVec3, f64) {
        let a = arity as usize;
        let child_half = self.half_extent / f64::from(arity);
        let idx = DVec3::new(
            (slot % a) as f64,
            (slot / a % a) as f64,
            (slot / (a * a)) as f64,
        );
        let origin = self.center - DVec3::splat(self.half_extent);
        (origin + (idx * 2.0 + 1.0) * child_half, child_half)
    }
}

#[derive(Debug)]
struct Leaf<T> {
    coord: LeafCoord,
    center: DVec3,
    parent: u32,
    slot: usize,
    value: T,
}

const ROOT: u32 = 0;

/// Divisible grid: a depth-bounded tree that splits a cube into `arity³`
/// children per level and stores one value per leaf cell.
///
/// Nodes are created on the first `require` inside their region and removed
/// as soon as their last child goes away. The root always exists.
#[derive(Debug)]
pub struct SpatialGrid<T> {
    config: GridConfig,
    cells_per_axis: u32,
    leaf_half_extent: f64,
    branches: Arena<Branch>,
    leaves: Arena<Leaf<T>>,
}

impl<T> SpatialGrid<T> {
    pub fn new(config: GridConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut branches = Arena::new();
        let root = Branch {
            center: config.center,
            half_extent: config.half_extent,
            level: 0,
            parent: None,
            children: vec![None; config.arity.pow(3) as usize].into_boxed_slice(),
            child_count: 0,
        };
        branches.insert(root);
        Ok(Self {
            cells_per_axis: config.cells_per_axis(),
            leaf_half_extent: config.leaf_half_extent(),
            config,
            branches,
            leaves: Arena::new(),
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn cells_per_axis(&self) -> u32 {
        self.cells_per_axis
    }

    pub fn leaf_half_extent(&self) -> f64 {
        self.leaf_half_extent
    }

    /// Minimum corner of the root cube (inclusive).
    pub fn min(&self) -> DVec3 {
        self.config.center - DVec3::splat(self.config.half_extent)
    }

    /// Maximum corner of the root cube (exclusive).
    pub fn max(&self) -> DVec3 {
        self.config.center + DVec3::splat(self.config.half_extent)
    }

    /// Whether `point` lies in the half-open root cube `[min, max)`.
    pub fn covers(&self, point: DVec3) -> bool {
        point.cmpge(self.min()).all() && point.cmplt(self.max()).all()
    }

    /// Whether the cube `center ± half` lies entirely inside the grid.
    pub fn contains_cube(&self, center: DVec3, half: f64) -> bool {
        let lo = center - DVec3::splat(half);
        let hi = center + DVec3::splat(half);
        lo.cmpge(self.min()).all() && hi.cmplt(self.max()).all()
    }

    /// Leaf address of `point`.
    pub fn leaf_coord(&self, point: DVec3) -> Result<LeafCoord, GridError> {
        if !self.covers(point) {
            return Err(GridError::OutOfBounds { point });
        }
        let rel = (point - self.min()) / (self.leaf_half_extent * 2.0);
        // Rounding can push a point just below `max` onto the next index.
        let last = self.cells_per_axis - 1;
        let axis = |v: f64| (v.floor() as u32).min(last);
        Ok(LeafCoord::new(axis(rel.x), axis(rel.y), axis(rel.z)))
    }

    /// Bounds `[min, max)` of a leaf cell.
    pub fn leaf_bounds(&self, coord: LeafCoord) -> (DVec3, DVec3) {
        let size = self.leaf_half_extent * 2.0;
        let lo = self.min() + coord_vec(coord) * size;
        (lo, lo + DVec3::splat(size))
    }

    pub fn leaf_center(&self, coord: LeafCoord) -> DVec3 {
        let (lo, hi) = self.leaf_bounds(coord);
        (lo + hi) * 0.5
    }

    /// Leaf payload for `point`, allocating any missing nodes on the way.
    pub fn require(&mut self, point: DVec3) -> Result<&mut T, GridError>
    where
        T: Default,
    {
        self.require_with(point, |_| T::default())
    }

    /// Like [`require`](Self::require), building a missing leaf with `init`.
    pub fn require_with(
        &mut self,
        point: DVec3,
        init: impl FnOnce(LeafCoord) -> T,
    ) -> Result<&mut T, GridError> {
        let coord = self.leaf_coord(point)?;
        self.require_at_with(coord, init)
    }

    pub fn get(&self, point: DVec3) -> Result<Option<&T>, GridError> {
        let coord = self.leaf_coord(point)?;
        Ok(self.get_at(coord))
    }

    pub fn get_mut(&mut self, point: DVec3) -> Result<Option<&mut T>, GridError> {
        let coord = self.leaf_coord(point)?;
        Ok(self.get_at_mut(coord))
    }

    /// Remove the leaf containing `point` and prune every ancestor left empty.
    pub fn remove_node(&mut self, point: DVec3) -> Result<Option<T>, GridError> {
        let coord = self.leaf_coord(point)?;
        Ok(self.remove_at(coord))
    }

    pub fn get_at(&self, coord: LeafCoord) -> Option<&T> {
        let leaf = self.find_leaf(coord)?;
        self.leaves.get(leaf).map(|leaf| &leaf.value)
    }

    pub fn get_at_mut(&mut self, coord: LeafCoord) -> Option<&mut T> {
        let leaf = self.find_leaf(coord)?;
        self.leaves.get_mut(leaf).map(|leaf| &mut leaf.value)
    }

    pub fn remove_at(&mut self, coord: LeafCoord) -> Option<T> {
        let leaf_id = self.find_leaf(coord)?;
        let leaf = self.leaves.remove(leaf_id)?;

        let mut parent = leaf.parent;
        let mut slot = leaf.slot;
        while let Some(branch) = self.branches.get_mut(parent) {
            branch.children[slot] = None;
            branch.child_count -= 1;
            if branch.child_count > 0 {
                break;
            }
            let Some((up, up_slot)) = branch.parent else {
                break;
            };
            self.branches.remove(parent);
            parent = up;
            slot = up_slot;
        }
        Some(leaf.value)
    }

    /// Every existing leaf whose cell intersects the cube `center ± half`.
    pub fn leaves_in_cube(&self, center: DVec3, half: f64) -> Vec<LeafCoord> {
        let q_lo = center - DVec3::splat(half);
        let q_hi = center + DVec3::splat(half);
        let overlaps = |c: DVec3, h: f64| {
            (c - DVec3::splat(h)).cmple(q_hi).all() && (c + DVec3::splat(h)).cmpge(q_lo).all()
        };

        let mut out = Vec::new();
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            let Some(branch) = self.branches.get(id) else {
                continue;
            };
            let holds_leaves = branch.level + 1 == self.config.depth;
            for child in branch.children.iter().flatten().copied() {
                if holds_leaves {
                    if let Some(leaf) = self.leaves.get(child) {
                        if overlaps(leaf.center, self.leaf_half_extent) {
                            out.push(leaf.coord);
                        }
                    }
                } else if let Some(sub) = self.branches.get(child) {
                    if overlaps(sub.center, sub.half_extent) {
                        stack.push(child);
                    }
                }
            }
        }
        out
    }

    /// Iterate over every existing leaf.
    pub fn iter(&self) -> impl Iterator<Item = (LeafCoord, &T)> {
        self.leaves.iter().map(|leaf| (leaf.coord, &leaf.value))
    }

    /// Number of live nodes, root and leaves included.
    pub fn node_count(&self) -> usize {
        self.branches.len + self.leaves.len
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len
    }

    /// Child count of the interior node at `level` on the path to `coord`,
    /// or `None` if that node does not exist. Level 0 is the root.
    pub fn child_count_at(&self, coord: LeafCoord, level: u32) -> Option<usize> {
        if level >= self.config.depth || !self.is_valid(coord) {
            return None;
        }
        let mut branch = ROOT;
        for l in 0..level {
            branch = self.branches.get(branch)?.children[self.slot_at(coord, l)]?;
        }
        self.branches.get(branch).map(|b| b.child_count)
    }

    fn is_valid(&self, coord: LeafCoord) -> bool {
        coord.x < self.cells_per_axis && coord.y < self.cells_per_axis && coord.z < self.cells_per_axis
    }

    /// Child slot taken by `coord` below the interior node at `level`.
    fn slot_at(&self, coord: LeafCoord, level: u32) -> usize {
        let arity = self.config.arity;
        let span = arity.pow(self.config.depth - level - 1);
        let axis = |v: u32| ((v / span) % arity) as usize;
        let arity = arity as usize;
        axis(coord.x) + arity * (axis(coord.y) + arity * axis(coord.z))
    }

    fn find_leaf(&self, coord: LeafCoord) -> Option<u32> {
        if !self.is_valid(coord) {
            return None;
        }
        let last = self.config.depth - 1;
        let mut branch = ROOT;
        for level in 0..last {
            branch = self.branches.get(branch)?.children[self.slot_at(coord, level)]?;
        }
        self.branches.get(branch)?.children[self.slot_at(coord, last)]
    }

    fn require_at_with(
        &mut self,
        coord: LeafCoord,
        init: impl FnOnce(LeafCoord) -> T,
    ) -> Result<&mut T, GridError> {
        let last = self.config.depth - 1;
        let arity = self.config.arity;
        let children = arity.pow(3) as usize;

        let mut branch = ROOT;
        for level in 0..last {
            let slot = self.slot_at(coord, level);
            let node = self.branch(branch)?;
            let existing = node.children[slot];
            branch = match existing {
                Some(child) => child,
                None => {
                    let (center, half_extent) = node.child_geometry(arity, slot);
                    let child = self.branches.insert(Branch {
                        center,
                        half_extent,
                        level: level + 1,
                        parent: Some((branch, slot)),
                        children: vec![None; children].into_boxed_slice(),
                        child_count: 0,
                    });
                    self.link(branch, slot, child)?;
                    child
                }
            };
        }

        let slot = self.slot_at(coord, last);
        let node = self.branch(branch)?;
        let existing = node.children[slot];
        let leaf = match existing {
            Some(leaf) => leaf,
            None => {
                let (center, _) = node.child_geometry(arity, slot);
                let leaf = self.leaves.insert(Leaf {
                    coord,
                    center,
                    parent: branch,
                    slot,
                    value: init(coord),
                });
                self.link(branch, slot, leaf)?;
                leaf
            }
        };
        self.leaves
            .get_mut(leaf)
            .map(|leaf| &mut leaf.value)
            .ok_or(GridError::StaleNode { index: leaf })
    }

    fn branch(&self, index: u32) -> Result<&Branch, GridError> {
        self.branches.get(index).ok_or(GridError::StaleNode { index })
    }

    fn link(&mut self, parent: u32, slot: usize, child: u32) -> Result<(), GridError> {
        let branch = self
            .branches
            .get_mut(parent)
            .ok_or(GridError::StaleNode { index: parent })?;
        branch.children[slot] = Some(child);
        branch.child_count += 1;
        Ok(())
    }
}

fn coord_vec(coord: LeafCoord) -> DVec3 {
    DVec3::new(coord.x as f64, coord.y as f64, coord.z as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// 8x8x8 units split twice by 2: leaves are 2 units wide, 4 per axis.
    fn small_grid() -> SpatialGrid<u32> {
        SpatialGrid::new(GridConfig {
            center: DVec3::ZERO,
            half_extent: 4.0,
            arity: 2,
            depth: 2,
        })
        .unwrap()
    }

    fn world_grid() -> SpatialGrid<u32> {
        SpatialGrid::new(GridConfig::default()).unwrap()
    }

    #[test]
    fn get_is_none_until_required() {
        let mut grid = small_grid();
        let p = DVec3::new(1.0, -1.0, 3.0);
        assert!(grid.get(p).unwrap().is_none());

        *grid.require(p).unwrap() = 7;
        assert_eq!(grid.get(p).unwrap(), Some(&7));
        // A second require finds the same leaf instead of making a new one.
        *grid.require(p).unwrap() += 1;
        assert_eq!(grid.get(p).unwrap(), Some(&8));
        assert_eq!(grid.leaf_count(), 1);
    }

    #[test]
    fn require_builds_one_node_per_level() {
        let mut grid = small_grid();
        grid.require(DVec3::new(0.5, 0.5, 0.5)).unwrap();
        // root + one interior + one leaf
        assert_eq!(grid.node_count(), 3);

        // Same level-1 parent, different leaf.
        grid.require(DVec3::new(2.5, 0.5, 0.5)).unwrap();
        assert_eq!(grid.node_count(), 4);
    }

    #[test]
    fn remove_prunes_empty_ancestors() {
        let mut grid = small_grid();
        let p = DVec3::new(-3.0, 2.0, 0.0);
        grid.require(p).unwrap();
        let coord = grid.leaf_coord(p).unwrap();
        assert_eq!(grid.child_count_at(coord, 1), Some(1));

        assert_eq!(grid.remove_node(p).unwrap(), Some(0));
        assert!(grid.get(p).unwrap().is_none());
        assert_eq!(grid.child_count_at(coord, 1), None);
        assert_eq!(grid.child_count_at(coord, 0), Some(0));
        assert_eq!(grid.node_count(), 1);
    }

    #[test]
    fn remove_keeps_shared_ancestors() {
        let mut grid = small_grid();
        let a = DVec3::new(0.5, 0.5, 0.5);
        let b = DVec3::new(2.5, 0.5, 0.5);
        grid.require(a).unwrap();
        grid.require(b).unwrap();

        grid.remove_node(a).unwrap();
        let coord = grid.leaf_coord(b).unwrap();
        assert_eq!(grid.child_count_at(coord, 1), Some(1));
        assert_eq!(grid.child_count_at(coord, 0), Some(1));
        assert!(grid.get(b).unwrap().is_some());
    }

    #[test]
    fn removing_missing_leaf_is_none() {
        let mut grid = small_grid();
        assert_eq!(grid.remove_node(DVec3::ZERO).unwrap(), None);
        assert_eq!(grid.node_count(), 1);
    }

    #[test]
    fn outside_points_are_rejected() {
        let mut grid = small_grid();
        // The maximum face is excluded.
        assert!(matches!(
            grid.require(DVec3::new(4.0, 0.0, 0.0)),
            Err(GridError::OutOfBounds { .. })
        ));
        assert!(grid.get(DVec3::new(0.0, -4.5, 0.0)).is_err());
        assert!(grid.get(DVec3::new(f64::NAN, 0.0, 0.0)).is_err());
        // The minimum face is included.
        assert!(grid.require(DVec3::splat(-4.0)).is_ok());
    }

    #[test]
    fn boundary_points_belong_to_the_upper_cell() {
        let grid = small_grid();
        assert_eq!(grid.leaf_coord(DVec3::ZERO).unwrap(), LeafCoord::new(2, 2, 2));
        assert_eq!(
            grid.leaf_coord(DVec3::new(-0.001, 0.0, 0.0)).unwrap(),
            LeafCoord::new(1, 2, 2)
        );
    }

    #[test]
    fn world_scale_coordinates_keep_adjacent_cells_apart() {
        let grid = world_grid();
        let a = grid.leaf_coord(DVec3::new(1_000_000.0, 0.0, 0.0)).unwrap();
        let b = grid.leaf_coord(DVec3::new(999_999.999, 0.0, 0.0)).unwrap();
        assert_eq!(a.x, b.x + 1);
        assert_eq!(a.x, 13_192);
    }

    #[test]
    fn leaf_bounds_follow_the_tree() {
        let mut grid = world_grid();
        let p = DVec3::new(5_150.0, -20.0, 99.0);
        grid.require(p).unwrap();
        let coord = grid.leaf_coord(p).unwrap();
        let (lo, hi) = grid.leaf_bounds(coord);
        assert_eq!(lo, DVec3::new(5_000.0, -200.0, 0.0));
        assert_eq!(hi, DVec3::new(5_200.0, 0.0, 200.0));
        assert_eq!(grid.leaf_center(coord), DVec3::new(5_100.0, -100.0, 100.0));

        let found = grid.leaves_in_cube(grid.leaf_center(coord), 1.0);
        assert_eq!(found, vec![coord]);
    }

    #[test]
    fn leaves_in_cube_skips_distant_cells() {
        let mut grid = world_grid();
        grid.require(DVec3::ZERO).unwrap();
        grid.require(DVec3::new(250.0, 0.0, 0.0)).unwrap();
        grid.require(DVec3::new(5_000.0, 0.0, 0.0)).unwrap();

        let near = grid.leaves_in_cube(DVec3::ZERO, 300.0);
        assert_eq!(near.len(), 2);
        assert!(near.contains(&grid.leaf_coord(DVec3::ZERO).unwrap()));
        assert!(!near.contains(&grid.leaf_coord(DVec3::new(5_000.0, 0.0, 0.0)).unwrap()));
    }

    #[test]
    fn iter_visits_every_leaf() {
        let mut grid = small_grid();
        for (i, x) in [-3.0, -1.0, 1.0, 3.0].into_iter().enumerate() {
            *grid.require(DVec3::new(x, 0.0, 0.0)).unwrap() = i as u32;
        }
        let mut values: Vec<u32> = grid.iter().map(|(_, v)| *v).collect();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2, 3]);
    }

    #[test]
    fn freed_arena_slots_read_as_absent() {
        let mut arena = Arena::new();
        let a = arena.insert('a');
        let b = arena.insert('b');
        assert_eq!(arena.remove(a), Some('a'));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get_mut(99), None);
        assert_eq!(arena.remove(a), None);

        // The freed slot is reused.
        assert_eq!(arena.insert('c'), a);
        assert_eq!(arena.get(a), Some(&'c'));
        assert_eq!(arena.get(b), Some(&'b'));
        assert_eq!(arena.len, 2);
    }

    #[test]
    fn pruned_paths_are_rebuilt_on_require() {
        let mut grid = small_grid();
        let p = DVec3::new(-3.0, -3.0, -3.0);
        for round in 0..3 {
            *grid.require(p).unwrap() = round;
            assert_eq!(grid.node_count(), 3);
            assert_eq!(grid.remove_node(p).unwrap(), Some(round));
            assert_eq!(grid.node_count(), 1);
        }
        assert!(grid.leaves_in_cube(p, 1.0).is_empty());
    }

    #[test]
    fn out_of_range_coords_are_absent() {
        let grid = small_grid();
        assert!(grid.get_at(LeafCoord::new(4, 0, 0)).is_none());
        assert_eq!(grid.child_count_at(LeafCoord::new(0, 9, 0), 0), None);
    }

    proptest! {
        #[test]
        fn required_leaf_contains_its_point(
            x in -4000.0f64..4000.0,
            y in -4000.0f64..4000.0,
            z in -4000.0f64..4000.0,
        ) {
            let mut grid = world_grid();
            let p = DVec3::new(x, y, z);
            prop_assert!(grid.get(p).unwrap().is_none());
            *grid.require(p).unwrap() = 42;
            prop_assert_eq!(grid.get(p).unwrap(), Some(&42));

            let (lo, hi) = grid.leaf_bounds(grid.leaf_coord(p).unwrap());
            prop_assert!(p.cmpge(lo).all() && p.cmplt(hi).all());

            prop_assert_eq!(grid.remove_node(p).unwrap(), Some(42));
            prop_assert_eq!(grid.node_count(), 1);
        }
    }
}
