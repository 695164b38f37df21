//! Free intervals of units or pages, kept in a treap ordered by start index.
//!
//! Each node is augmented with the largest interval count in its subtree so a first-fit
//! search for `n` contiguous items only descends into subtrees that can satisfy it.
//! Adjacent intervals are coalesced on insertion.

const NIL: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct Node {
    start: u32,
    count: u32,
    max_count: u32,
    priority: u32,
    left: u32,
    right: u32,
}

pub struct FreeIntervalTree {
    nodes: Vec<Node>,
    free_nodes: Vec<u32>,
    root: u32,
    total: usize,
    intervals: usize,
    seed: u32,
}

impl Default for FreeIntervalTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeIntervalTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            root: NIL,
            total: 0,
            intervals: 0,
            seed: 0x9e37_79b9,
        }
    }

    /// Number of free items across all intervals.
    pub fn total_count(&self) -> usize {
        self.total
    }

    pub fn interval_count(&self) -> usize {
        self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    /// Largest single interval.
    pub fn max_interval(&self) -> usize {
        if self.root == NIL {
            0
        } else {
            self.nodes[self.root as usize].max_count as usize
        }
    }

    /// Adds `[start, start + count)`, merging it with adjacent intervals.
    pub fn insert(&mut self, start: u32, count: u32) {
        if count == 0 {
            return;
        }
        self.total += count as usize;
        let (mut left, mut right) = self.split(self.root, start);
        let mut start = start;
        let mut count = count;

        let pred = self.rightmost(left);
        if pred != NIL {
            let p = self.nodes[pred as usize];
            assert!(
                p.start + p.count <= start,
                "free interval [{}, {}) overlaps [{}, {})",
                start,
                start + count,
                p.start,
                p.start + p.count
            );
            if p.start + p.count == start {
                left = self.remove_rightmost(left);
                start = p.start;
                count += p.count;
                self.intervals -= 1;
            }
        }
        let succ = self.leftmost(right);
        if succ != NIL {
            let s = self.nodes[succ as usize];
            assert!(
                start + count <= s.start,
                "free interval [{}, {}) overlaps [{}, {})",
                start,
                start + count,
                s.start,
                s.start + s.count
            );
            if start + count == s.start {
                right = self.remove_leftmost(right);
                count += s.count;
                self.intervals -= 1;
            }
        }

        let node = self.new_node(start, count);
        let merged = self.merge(left, node);
        self.root = self.merge(merged, right);
        self.intervals += 1;
    }

    /// Takes `count` contiguous items from the lowest-addressed interval large enough.
    pub fn take(&mut self, count: u32) -> Option<u32> {
        if count == 0 {
            return None;
        }
        let (root, start) = self.take_first_fit(self.root, count);
        self.root = root;
        if start.is_some() {
            self.total -= count as usize;
        }
        start
    }

    /// Removes and returns the highest-addressed interval.
    pub fn pop_highest(&mut self) -> Option<(u32, u32)> {
        let last = self.rightmost(self.root);
        if last == NIL {
            return None;
        }
        let node = self.nodes[last as usize];
        self.root = self.remove_rightmost(self.root);
        self.total -= node.count as usize;
        self.intervals -= 1;
        Some((node.start, node.count))
    }

    /// Visits intervals in address order.
    pub fn for_each(&self, mut f: impl FnMut(u32, u32)) {
        let mut stack = Vec::new();
        let mut cur = self.root;
        while cur != NIL || !stack.is_empty() {
            while cur != NIL {
                stack.push(cur);
                cur = self.nodes[cur as usize].left;
            }
            if let Some(n) = stack.pop() {
                let node = self.nodes[n as usize];
                f(node.start, node.count);
                cur = node.right;
            }
        }
    }

    fn next_priority(&mut self) -> u32 {
        let mut x = self.seed;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.seed = x;
        x
    }

    fn new_node(&mut self, start: u32, count: u32) -> u32 {
        let node = Node {
            start,
            count,
            max_count: count,
            priority: self.next_priority(),
            left: NIL,
            right: NIL,
        };
        if let Some(index) = self.free_nodes.pop() {
            self.nodes[index as usize] = node;
            index
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    fn update(&mut self, t: u32) {
        let node = self.nodes[t as usize];
        let mut max = node.count;
        if node.left != NIL {
            max = max.max(self.nodes[node.left as usize].max_count);
        }
        if node.right != NIL {
            max = max.max(self.nodes[node.right as usize].max_count);
        }
        self.nodes[t as usize].max_count = max;
    }

    fn split(&mut self, t: u32, key: u32) -> (u32, u32) {
        if t == NIL {
            return (NIL, NIL);
        }
        if self.nodes[t as usize].start < key {
            let (l, r) = self.split(self.nodes[t as usize].right, key);
            self.nodes[t as usize].right = l;
            self.update(t);
            (t, r)
        } else {
            let (l, r) = self.split(self.nodes[t as usize].left, key);
            self.nodes[t as usize].left = r;
            self.update(t);
            (l, t)
        }
    }

    fn merge(&mut self, a: u32, b: u32) -> u32 {
        if a == NIL {
            return b;
        }
        if b == NIL {
            return a;
        }
        if self.nodes[a as usize].priority > self.nodes[b as usize].priority {
            let right = self.merge(self.nodes[a as usize].right, b);
            self.nodes[a as usize].right = right;
            self.update(a);
            a
        } else {
            let left = self.merge(a, self.nodes[b as usize].left);
            self.nodes[b as usize].left = left;
            self.update(b);
            b
        }
    }

    fn leftmost(&self, mut t: u32) -> u32 {
        if t == NIL {
            return NIL;
        }
        while self.nodes[t as usize].left != NIL {
            t = self.nodes[t as usize].left;
        }
        t
    }

    fn rightmost(&self, mut t: u32) -> u32 {
        if t == NIL {
            return NIL;
        }
        while self.nodes[t as usize].right != NIL {
            t = self.nodes[t as usize].right;
        }
        t
    }

    fn remove_leftmost(&mut self, t: u32) -> u32 {
        let left = self.nodes[t as usize].left;
        if left == NIL {
            let right = self.nodes[t as usize].right;
            self.free_nodes.push(t);
            return right;
        }
        let new_left = self.remove_leftmost(left);
        self.nodes[t as usize].left = new_left;
        self.update(t);
        t
    }

    fn remove_rightmost(&mut self, t: u32) -> u32 {
        let right = self.nodes[t as usize].right;
        if right == NIL {
            let left = self.nodes[t as usize].left;
            self.free_nodes.push(t);
            return left;
        }
        let new_right = self.remove_rightmost(right);
        self.nodes[t as usize].right = new_right;
        self.update(t);
        t
    }

    fn take_first_fit(&mut self, t: u32, need: u32) -> (u32, Option<u32>) {
        if t == NIL || self.nodes[t as usize].max_count < need {
            return (t, None);
        }
        let node = self.nodes[t as usize];
        if node.left != NIL && self.nodes[node.left as usize].max_count >= need {
            let (left, start) = self.take_first_fit(node.left, need);
            self.nodes[t as usize].left = left;
            self.update(t);
            return (t, start);
        }
        if node.count >= need {
            if node.count == need {
                let merged = self.merge(node.left, node.right);
                self.free_nodes.push(t);
                self.intervals -= 1;
                return (merged, Some(node.start));
            }
            self.nodes[t as usize].start += need;
            self.nodes[t as usize].count -= need;
            self.update(t);
            return (t, Some(node.start));
        }
        let (right, start) = self.take_first_fit(node.right, need);
        self.nodes[t as usize].right = right;
        self.update(t);
        (t, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intervals(tree: &FreeIntervalTree) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        tree.for_each(|s, c| out.push((s, c)));
        out
    }

    #[test]
    fn coalesces_neighbours() {
        let mut tree = FreeIntervalTree::new();
        tree.insert(10, 2);
        tree.insert(14, 2);
        tree.insert(12, 2);
        assert_eq!(intervals(&tree), vec![(10, 6)]);
        assert_eq!(tree.total_count(), 6);
        assert_eq!(tree.interval_count(), 1);
    }

    #[test]
    fn first_fit_prefers_low_addresses() {
        let mut tree = FreeIntervalTree::new();
        tree.insert(100, 8);
        tree.insert(0, 2);
        tree.insert(50, 4);
        assert_eq!(tree.take(3), Some(50));
        assert_eq!(tree.take(2), Some(0));
        assert_eq!(tree.take(8), Some(100));
        assert_eq!(tree.take(1), Some(53));
        assert_eq!(tree.take(1), None);
        assert!(tree.is_empty());
        assert_eq!(tree.total_count(), 0);
    }

    #[test]
    fn pop_highest_returns_last_interval() {
        let mut tree = FreeIntervalTree::new();
        for i in 0..64 {
            tree.insert(i * 4, 2);
        }
        assert_eq!(tree.interval_count(), 64);
        assert_eq!(tree.max_interval(), 2);
        assert_eq!(tree.pop_highest(), Some((252, 2)));
        assert_eq!(tree.total_count(), 126);
    }

    #[test]
    #[should_panic]
    fn overlapping_insert_panics() {
        let mut tree = FreeIntervalTree::new();
        tree.insert(0, 4);
        tree.insert(2, 4);
    }
}
