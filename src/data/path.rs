//! (index, degree) addressed paths into data trees.
//!
//! A path names one node: each segment selects child `index` out of a
//! branch with exactly `degree` children. The degree travels with the path
//! so a writer extending the tree fixes the branch shape as it walks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of a path: child `index` of a branch expected to have `degree`
/// children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathSegment {
    pub index: u32,
    pub degree: u32,
}

impl PathSegment {
    pub fn new(index: u32, degree: u32) -> Self {
        Self { index, degree }
    }
}

/// A sequence of segments from a tree root down to one node. Empty path
/// names the root itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataPath(Vec<PathSegment>);

impl DataPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.0.push(segment);
    }

    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    /// Concatenate `tail` onto this path.
    pub fn join(&self, tail: &DataPath) -> Self {
        let mut segments = self.0.clone();
        segments.extend_from_slice(&tail.0);
        Self(segments)
    }

    /// Drop the last `depth` segments, gathering that many trailing array
    /// dimensions into one group. Depth beyond the path length clamps to
    /// the whole path (full gather back to this path's root).
    pub fn gather(&self, depth: usize) -> Self {
        let keep = self.0.len().saturating_sub(depth);
        Self(self.0[..keep].to_vec())
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "[]");
        }
        for segment in &self.0 {
            write!(f, "[{}:{}]", segment.index, segment.degree)?;
        }
        Ok(())
    }
}

impl FromIterator<PathSegment> for DataPath {
    fn from_iter<I: IntoIterator<Item = PathSegment>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[(u32, u32)]) -> DataPath {
        segments
            .iter()
            .map(|&(index, degree)| PathSegment::new(index, degree))
            .collect()
    }

    #[test]
    fn display_formats_segments() {
        assert_eq!(DataPath::root().to_string(), "[]");
        assert_eq!(path(&[(0, 2), (2, 3)]).to_string(), "[0:2][2:3]");
    }

    #[test]
    fn gather_truncates_trailing_segments() {
        let p = path(&[(0, 2), (2, 3)]);
        assert_eq!(p.gather(0), p);
        assert_eq!(p.gather(1), path(&[(0, 2)]));
        assert_eq!(p.gather(2), DataPath::root());
    }

    #[test]
    fn gather_clamps_past_root() {
        let p = path(&[(1, 2)]);
        assert_eq!(p.gather(5), DataPath::root());
    }

    #[test]
    fn join_concatenates() {
        let seed = path(&[(0, 2)]);
        let tail = path(&[(1, 3)]);
        assert_eq!(seed.join(&tail), path(&[(0, 2), (1, 3)]));
    }
}
