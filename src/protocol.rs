use crate::types::{Boundary, LevelVector, TaskId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Combination parameters shipped to every process group before the first
/// run. Workers derive the sparse-grid layout and the full-grid
/// decomposition from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombiParameters {
    pub dim: usize,
    pub lmin: LevelVector,
    pub lmax: LevelVector,
    pub boundary: Vec<Boundary>,
    pub ncombi: usize,
    /// Explicit Cartesian decomposition; the doubling heuristic applies when
    /// absent.
    pub parallelization: Option<Vec<usize>>,
}

/// The signals a process group understands. The manager sends a signal
/// point-to-point to the group root, which broadcasts it to the group;
/// every member executes every signal in receive order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Signal {
    UpdateParameters(CombiParameters),
    /// Ship one serialized task, construct it, initialize its grid and
    /// advance it one iteration.
    RunFirst { task: Vec<u8> },
    /// Advance every owned task by one iteration.
    RunNext,
    /// Hierarchize, reduce within the group and across groups,
    /// dehierarchize.
    Combine,
    /// Like `Combine`, followed by the manager-mediated peer exchange.
    CombineThirdLevel,
    /// Serialize the task's persistent state, hand it to the manager and
    /// drop the local instance.
    RescheduleRemove { task: TaskId },
    /// Receive a task blob, reconstruct the task and rebuild its grid from
    /// the current combined state.
    RescheduleAdd { task: Vec<u8> },
    /// Evaluate the combined solution at the given coordinates.
    Interpolate { points: Vec<Vec<f64>> },
    /// Persist the combined sparse grid in wire layout.
    WriteCheckpoint { path: PathBuf },
    Exit,
}

/// Replies from a group root to the manager.
#[derive(Debug)]
pub enum GroupReply {
    Ready { durations: Vec<(TaskId, f64)> },
    Blob(Vec<u8>),
    BlobError(String),
    DsgImage(Vec<u8>),
    Values(Vec<f64>),
    Failed(String),
}

/// Manager-side view of a group's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Available,
    Busy,
    Fail,
}
