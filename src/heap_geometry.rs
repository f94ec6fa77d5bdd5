use rand::RngExt;

use crate::HeapError;

/// Shape of a complete k-ary heap of buckets.
///
/// Buckets are numbered breadth-first from the root (bucket 0). The children
/// of bucket `b` are `k * b + 1 ..= k * b + k`, so level `l` holds `k^l`
/// buckets starting at `(k^l - 1) / (k - 1)`.
///
/// The structure is a pure query interface: it holds only the heap base and
/// height, never touches storage, and is `Copy` so every device clone can
/// carry its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapGeometry {
    heap_base: u64,
    height: usize,
}

impl HeapGeometry {
    /// Heap with `height + 1` levels. Fails if `heap_base < 2` or if the
    /// bucket count would not fit in a `u64`.
    pub fn new(heap_base: u64, height: usize) -> Result<Self, HeapError> {
        if heap_base < 2 {
            return Err(HeapError::Configuration(format!(
                "heap_base must be >= 2, got {}",
                heap_base
            )));
        }
        let levels = height
            .checked_add(1)
            .and_then(|l| u32::try_from(l).ok())
            .ok_or_else(|| HeapError::Configuration(format!("heap height {} too large", height)))?;
        if heap_base.checked_pow(levels).is_none() {
            return Err(HeapError::Configuration(format!(
                "heap with base {} and height {} overflows the bucket index space",
                heap_base, height
            )));
        }
        Ok(HeapGeometry { heap_base, height })
    }

    /// Smallest heap of the given base whose leaf level holds at least
    /// `leaf_count` buckets.
    pub fn for_leaf_count(heap_base: u64, leaf_count: u64) -> Result<Self, HeapError> {
        if heap_base < 2 {
            return Err(HeapError::Configuration(format!(
                "heap_base must be >= 2, got {}",
                heap_base
            )));
        }
        let mut height = 0;
        let mut leaves: u64 = 1;
        while leaves < leaf_count {
            leaves = leaves.checked_mul(heap_base).ok_or_else(|| {
                HeapError::Configuration(format!("no heap can hold {} leaves", leaf_count))
            })?;
            height += 1;
        }
        Self::new(heap_base, height)
    }

    pub fn heap_base(&self) -> u64 {
        self.heap_base
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of levels (`height + 1`).
    pub fn levels(&self) -> usize {
        self.height + 1
    }

    pub fn last_level(&self) -> usize {
        self.height
    }

    pub fn bucket_count_at_level(&self, level: usize) -> u64 {
        self.heap_base.pow(level as u32)
    }

    /// Index of the leftmost bucket at `level`. Valid for
    /// `level <= levels()`; `first_bucket_at_level(levels())` equals
    /// `bucket_count()`.
    pub fn first_bucket_at_level(&self, level: usize) -> u64 {
        (self.heap_base.pow(level as u32) - 1) / (self.heap_base - 1)
    }

    pub fn last_bucket_at_level(&self, level: usize) -> u64 {
        self.first_bucket_at_level(level + 1) - 1
    }

    pub fn bucket_count(&self) -> u64 {
        self.first_bucket_at_level(self.levels())
    }

    pub fn leaf_bucket_count(&self) -> u64 {
        self.bucket_count_at_level(self.last_level())
    }

    pub fn first_leaf_bucket(&self) -> u64 {
        self.first_bucket_at_level(self.last_level())
    }

    pub fn last_leaf_bucket(&self) -> u64 {
        self.bucket_count() - 1
    }

    /// Level of bucket `bucket`. The bucket must be inside the heap.
    pub fn bucket_level(&self, bucket: u64) -> usize {
        debug_assert!(bucket < self.bucket_count());
        let mut level = 0;
        while level < self.last_level() && self.first_bucket_at_level(level + 1) <= bucket {
            level += 1;
        }
        level
    }

    pub fn parent(&self, bucket: u64) -> Option<u64> {
        if bucket == 0 {
            None
        } else {
            Some((bucket - 1) / self.heap_base)
        }
    }

    /// The `c`-th child of `bucket`, or `None` for leaves and `c >= heap_base`.
    pub fn child(&self, bucket: u64, c: u64) -> Option<u64> {
        if c >= self.heap_base || self.is_leaf(bucket) {
            return None;
        }
        Some(self.heap_base * bucket + 1 + c)
    }

    /// Ancestor of `bucket` at `level`, found by walking parent links. A
    /// bucket at or above `level` is returned unchanged.
    pub fn ancestor_at_level(&self, bucket: u64, level: usize) -> u64 {
        let mut ancestor = bucket;
        let mut current = self.bucket_level(bucket);
        while current > level {
            ancestor = (ancestor - 1) / self.heap_base;
            current -= 1;
        }
        ancestor
    }

    pub fn is_leaf(&self, bucket: u64) -> bool {
        bucket >= self.first_leaf_bucket()
    }

    /// Bucket indices from `bucket` up to and including the root.
    pub fn path_to_root(&self, bucket: u64) -> Vec<u64> {
        let mut path = Vec::with_capacity(self.bucket_level(bucket) + 1);
        let mut current = Some(bucket);
        while let Some(b) = current {
            path.push(b);
            current = self.parent(b);
        }
        path
    }

    /// Bucket indices from the root down to `bucket`; length is the
    /// bucket's level plus one.
    pub fn path_from_root(&self, bucket: u64) -> Vec<u64> {
        let mut path = self.path_to_root(bucket);
        path.reverse();
        path
    }

    /// Deepest level at which the root paths of `a` and `b` share a bucket.
    pub fn last_common_level(&self, a: u64, b: u64) -> usize {
        let (mut a, mut b) = (a, b);
        let (mut level_a, mut level_b) = (self.bucket_level(a), self.bucket_level(b));
        while level_a > level_b {
            a = (a - 1) / self.heap_base;
            level_a -= 1;
        }
        while level_b > level_a {
            b = (b - 1) / self.heap_base;
            level_b -= 1;
        }
        while a != b {
            a = (a - 1) / self.heap_base;
            b = (b - 1) / self.heap_base;
            level_a -= 1;
        }
        level_a
    }

    /// Uniformly random leaf bucket.
    pub fn random_leaf_bucket<R: RngExt + ?Sized>(&self, rng: &mut R) -> u64 {
        rng.random_range(self.first_leaf_bucket()..=self.last_leaf_bucket())
    }

    /// Navigation view of one bucket.
    pub fn node(&self, bucket: u64) -> HeapNode {
        HeapNode {
            geometry: *self,
            bucket,
            level: self.bucket_level(bucket),
        }
    }
}

/// One bucket of a [`HeapGeometry`], with its level resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapNode {
    geometry: HeapGeometry,
    bucket: u64,
    level: usize,
}

impl HeapNode {
    pub fn bucket(&self) -> u64 {
        self.bucket
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn is_root(&self) -> bool {
        self.bucket == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.level == self.geometry.last_level()
    }

    pub fn parent(&self) -> Option<HeapNode> {
        self.geometry.parent(self.bucket).map(|p| HeapNode {
            geometry: self.geometry,
            bucket: p,
            level: self.level - 1,
        })
    }

    pub fn children(&self) -> Vec<HeapNode> {
        (0..self.geometry.heap_base())
            .filter_map(|c| self.geometry.child(self.bucket, c))
            .map(|b| HeapNode {
                geometry: self.geometry,
                bucket: b,
                level: self.level + 1,
            })
            .collect()
    }

    pub fn path_from_root(&self) -> Vec<u64> {
        self.geometry.path_from_root(self.bucket)
    }

    pub fn path_to_root(&self) -> Vec<u64> {
        self.geometry.path_to_root(self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_heap_shape() {
        let g = HeapGeometry::new(2, 2).unwrap();
        assert_eq!(g.levels(), 3);
        assert_eq!(g.last_level(), 2);
        assert_eq!(g.bucket_count(), 7);
        assert_eq!(g.bucket_count_at_level(0), 1);
        assert_eq!(g.bucket_count_at_level(1), 2);
        assert_eq!(g.bucket_count_at_level(2), 4);
        assert_eq!(g.first_bucket_at_level(0), 0);
        assert_eq!(g.first_bucket_at_level(1), 1);
        assert_eq!(g.first_bucket_at_level(2), 3);
        assert_eq!(g.first_bucket_at_level(3), 7);
        assert_eq!(g.last_bucket_at_level(1), 2);
        assert_eq!(g.first_leaf_bucket(), 3);
        assert_eq!(g.last_leaf_bucket(), 6);
        assert_eq!(g.leaf_bucket_count(), 4);
    }

    #[test]
    fn levels_and_parents() {
        let g = HeapGeometry::new(2, 3).unwrap();
        let expected_levels = [0, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3];
        for (b, &level) in expected_levels.iter().enumerate() {
            assert_eq!(g.bucket_level(b as u64), level, "bucket {}", b);
        }
        assert_eq!(g.parent(0), None);
        assert_eq!(g.parent(1), Some(0));
        assert_eq!(g.parent(2), Some(0));
        assert_eq!(g.parent(5), Some(2));
        assert_eq!(g.parent(14), Some(6));
        assert_eq!(g.child(2, 0), Some(5));
        assert_eq!(g.child(2, 1), Some(6));
        assert_eq!(g.child(2, 2), None);
        assert_eq!(g.child(7, 0), None);
    }

    #[test]
    fn paths() {
        let g = HeapGeometry::new(2, 2).unwrap();
        assert_eq!(g.path_from_root(0), vec![0]);
        assert_eq!(g.path_from_root(5), vec![0, 2, 5]);
        assert_eq!(g.path_to_root(5), vec![5, 2, 0]);
        assert_eq!(g.path_from_root(3), vec![0, 1, 3]);
        for b in 0..g.bucket_count() {
            assert_eq!(g.path_from_root(b).len(), g.bucket_level(b) + 1);
        }
    }

    #[test]
    fn ternary_heap() {
        let g = HeapGeometry::new(3, 2).unwrap();
        assert_eq!(g.bucket_count(), 13);
        assert_eq!(g.first_bucket_at_level(2), 4);
        assert_eq!(g.path_from_root(12), vec![0, 3, 12]);
        assert_eq!(g.node(3).children().iter().map(|n| n.bucket()).collect::<Vec<_>>(), vec![10, 11, 12]);
    }

    #[test]
    fn last_common_level() {
        let g = HeapGeometry::new(2, 3).unwrap();
        assert_eq!(g.last_common_level(7, 8), 2);
        assert_eq!(g.last_common_level(7, 9), 1);
        assert_eq!(g.last_common_level(7, 14), 0);
        assert_eq!(g.last_common_level(7, 7), 3);
        assert_eq!(g.last_common_level(3, 8), 2);
        assert_eq!(g.last_common_level(1, 14), 0);
    }

    #[test]
    fn ancestors() {
        let g = HeapGeometry::new(2, 3).unwrap();
        assert_eq!(g.ancestor_at_level(11, 0), 0);
        assert_eq!(g.ancestor_at_level(11, 1), 2);
        assert_eq!(g.ancestor_at_level(11, 2), 5);
        assert_eq!(g.ancestor_at_level(11, 3), 11);
        assert_eq!(g.ancestor_at_level(2, 3), 2);
    }

    #[test]
    fn node_navigation() {
        let g = HeapGeometry::new(2, 2).unwrap();
        let node = g.node(5);
        assert_eq!(node.level(), 2);
        assert!(node.is_leaf());
        assert!(!node.is_root());
        let parent = node.parent().unwrap();
        assert_eq!(parent.bucket(), 2);
        assert_eq!(parent.level(), 1);
        assert_eq!(parent.children().len(), 2);
        assert!(node.children().is_empty());
        assert!(g.node(0).parent().is_none());
        assert_eq!(node.path_from_root(), vec![0, 2, 5]);
    }

    #[test]
    fn for_leaf_count_picks_minimal_height() {
        assert_eq!(HeapGeometry::for_leaf_count(2, 1).unwrap().height(), 0);
        assert_eq!(HeapGeometry::for_leaf_count(2, 4).unwrap().height(), 2);
        assert_eq!(HeapGeometry::for_leaf_count(2, 5).unwrap().height(), 3);
        assert_eq!(HeapGeometry::for_leaf_count(4, 17).unwrap().height(), 3);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(HeapGeometry::new(1, 3).is_err());
        assert!(HeapGeometry::new(2, 64).is_err());
        assert!(HeapGeometry::new(2, 62).is_ok());
    }

    #[test]
    fn random_leaves_stay_in_leaf_level() {
        let g = HeapGeometry::new(2, 4).unwrap();
        let mut rng = rand::rng();
        for _ in 0..100 {
            assert!(g.is_leaf(g.random_leaf_bucket(&mut rng)));
        }
    }
}
