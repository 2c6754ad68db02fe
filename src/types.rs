use serde::{Deserialize, Serialize};
use std::fmt;

pub type LevelType = u32;

/// Refinement level per dimension. The derived `Ord` is lexicographic,
/// which is the ordering used for scheduling tie-breaks and for the
/// deterministic subspace layout of the sparse grid.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LevelVector(pub Vec<LevelType>);

impl LevelVector {
    pub fn new(levels: Vec<LevelType>) -> Self {
        LevelVector(levels)
    }

    pub fn uniform(dim: usize, level: LevelType) -> Self {
        LevelVector(vec![level; dim])
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// L1 norm `|l|_1`.
    pub fn sum(&self) -> u64 {
        self.0.iter().map(|&l| u64::from(l)).sum()
    }

    /// Componentwise `self <= other`.
    pub fn le(&self, other: &LevelVector) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a <= b)
    }

    /// Componentwise maximum.
    pub fn sup(&self, other: &LevelVector) -> LevelVector {
        LevelVector(self.0.iter().zip(&other.0).map(|(&a, &b)| a.max(b)).collect())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LevelType> {
        self.0.iter()
    }
}

impl std::ops::Index<usize> for LevelVector {
    type Output = LevelType;

    fn index(&self, k: usize) -> &LevelType {
        &self.0[k]
    }
}

impl fmt::Debug for LevelVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for LevelVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Boundary treatment per dimension. Determines the number of nodes on an
/// axis of level `l`: `2^l + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Boundary {
    None,
    OneSided,
    TwoSided,
}

impl Boundary {
    pub fn offset(self) -> i64 {
        match self {
            Boundary::None => -1,
            Boundary::OneSided => 0,
            Boundary::TwoSided => 1,
        }
    }

    /// Lowest hierarchical level present on this axis. Boundary nodes form
    /// the level-0 subspace, so axes without boundary start at level 1.
    pub fn level_floor(self) -> LevelType {
        match self {
            Boundary::None => 1,
            Boundary::OneSided | Boundary::TwoSided => 0,
        }
    }
}

/// Number of nodes on an axis of level `l` under boundary flag `b`.
pub fn points_on_axis(l: LevelType, b: Boundary) -> usize {
    ((1i64 << l) + b.offset()) as usize
}

/// Number of nodes the level-`j` hierarchical subspace contributes on one
/// axis under boundary flag `b`.
pub fn subspace_axis_size(j: LevelType, b: Boundary) -> usize {
    if j == 0 {
        match b {
            Boundary::None => 0,
            Boundary::OneSided => 1,
            Boundary::TwoSided => 2,
        }
    } else {
        1 << (j - 1)
    }
}

/// Maps a global axis index of a level-`l` grid to its hierarchical
/// `(level, index-within-subspace)` pair.
pub fn point_level_index(pos: usize, l: LevelType, b: Boundary) -> (LevelType, usize) {
    // grid units: u in [0, 2^l], with missing boundary nodes skipped
    let u = match b {
        Boundary::None => pos + 1,
        Boundary::OneSided | Boundary::TwoSided => pos,
    };
    if u == 0 {
        return (0, 0);
    }
    if u == (1usize << l) {
        return (0, 1);
    }
    let t = u.trailing_zeros();
    let j = l - t;
    let odd = u >> t;
    (j, (odd - 1) / 2)
}

/// Coordinate in [0, 1] of a global axis index.
pub fn coordinate_on_axis(pos: usize, l: LevelType, b: Boundary) -> f64 {
    let u = match b {
        Boundary::None => pos + 1,
        Boundary::OneSided | Boundary::TwoSided => pos,
    };
    u as f64 / (1u64 << l) as f64
}

/// Globally unique, stable identifier of a task for the life of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}
