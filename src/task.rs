use crate::comm::GroupComm;
use crate::error::{Error, Result};
use crate::fullgrid::DistributedFullGrid;
use crate::types::{Boundary, LevelVector, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The component-grid tuple every task is bound to. Travels with the task
/// across process boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeader {
    pub id: TaskId,
    pub level: LevelVector,
    pub boundary: Vec<Boundary>,
    pub coefficient: f64,
}

/// An opaque user computation bound to one component grid.
///
/// A task is constructed on the manager, shipped to a worker group as a
/// tagged envelope, and may later move between groups. Only the header and
/// the `save_state` payload survive a move; the distributed grid is
/// transient and rebuilt by `init` at the destination.
pub trait Task: Send {
    fn header(&self) -> &TaskHeader;

    /// Stable tag the deserializing side dispatches on. Must be registered
    /// with the `TaskRegistry` of every participating process.
    fn type_tag(&self) -> &'static str;

    /// Builds the transient distributed grid on the worker.
    fn init(&mut self, comm: &GroupComm, parallelization: Option<&[usize]>) -> Result<()>;

    /// Advances the computation by one iteration. Any task-level I/O must
    /// stay on the group communicator.
    fn run(&mut self, comm: &GroupComm) -> Result<()>;

    fn dfg(&self) -> Option<&DistributedFullGrid>;

    fn dfg_mut(&mut self) -> Option<&mut DistributedFullGrid>;

    /// Persistent state beyond the header.
    fn save_state(&self) -> Result<Vec<u8>>;

    fn id(&self) -> TaskId {
        self.header().id
    }

    fn coefficient(&self) -> f64 {
        self.header().coefficient
    }
}

#[derive(Serialize, Deserialize)]
struct TaskEnvelope {
    tag: String,
    header: TaskHeader,
    state: Vec<u8>,
}

pub type TaskFactory = fn(TaskHeader, &[u8]) -> Result<Box<dyn Task>>;

/// Tagged-variant registry for task serialization. Each concrete task type
/// is registered once; the deserializer dispatches on the envelope tag.
#[derive(Default)]
pub struct TaskRegistry {
    factories: HashMap<&'static str, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> TaskRegistry {
        TaskRegistry { factories: HashMap::new() }
    }

    pub fn register(&mut self, tag: &'static str, factory: TaskFactory) {
        if self.factories.insert(tag, factory).is_some() {
            log::warn!("task type tag '{}' registered twice, keeping the last factory", tag);
        }
    }

    pub fn serialize_task(task: &dyn Task) -> Result<Vec<u8>> {
        let envelope = TaskEnvelope {
            tag: task.type_tag().to_string(),
            header: task.header().clone(),
            state: task.save_state()?,
        };
        Ok(bincode::serialize(&envelope)?)
    }

    pub fn deserialize_task(&self, bytes: &[u8]) -> Result<Box<dyn Task>> {
        let envelope: TaskEnvelope = bincode::deserialize(bytes)?;
        let factory = self
            .factories
            .get(envelope.tag.as_str())
            .ok_or_else(|| Error::UnknownTaskTag(envelope.tag.clone()))?;
        factory(envelope.header, &envelope.state)
    }
}

/// Hands out task ids; owned by whoever constructs tasks (the manager side).
#[derive(Debug, Default)]
pub struct TaskIdGen {
    next: u64,
}

impl TaskIdGen {
    pub fn new() -> TaskIdGen {
        TaskIdGen { next: 0 }
    }

    pub fn next_id(&mut self) -> TaskId {
        let id = TaskId(self.next);
        self.next += 1;
        id
    }
}

pub const PERIODIC_WAVE_TAG: &str = "periodic-wave";

#[derive(Debug, Serialize, Deserialize)]
struct PeriodicWaveState {
    dt: f64,
    nsteps: usize,
    steps_total: usize,
}

/// Pseudo time stepping of a product-of-cosines wave; stands in for a PDE
/// solver in the example driver. The accumulated step count is the
/// persistent state carried across rescheduling moves.
pub struct PeriodicWaveTask {
    header: TaskHeader,
    state: PeriodicWaveState,
    dfg: Option<DistributedFullGrid>,
}

impl PeriodicWaveTask {
    pub fn new(header: TaskHeader, dt: f64, nsteps: usize) -> PeriodicWaveTask {
        PeriodicWaveTask {
            header,
            state: PeriodicWaveState { dt, nsteps, steps_total: 0 },
            dfg: None,
        }
    }

    pub fn restore(header: TaskHeader, state: &[u8]) -> Result<Box<dyn Task>> {
        let state: PeriodicWaveState = bincode::deserialize(state)?;
        Ok(Box::new(PeriodicWaveTask { header, state, dfg: None }))
    }

    fn wave(coords: &[f64], t: f64) -> f64 {
        let mut u = (std::f64::consts::PI * t).cos();
        for &x in coords {
            u *= (2.0 * std::f64::consts::PI * x).cos();
        }
        u
    }

    fn fill(&mut self, t: f64) -> Result<()> {
        let dfg = self.dfg.as_mut().ok_or(Error::TaskNotInitialized)?;
        for i in 0..dfg.num_local_elements() {
            let coords = dfg.coordinates(i);
            dfg.data_mut()[i] = Self::wave(&coords, t);
        }
        Ok(())
    }
}

impl Task for PeriodicWaveTask {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn type_tag(&self) -> &'static str {
        PERIODIC_WAVE_TAG
    }

    fn init(&mut self, comm: &GroupComm, parallelization: Option<&[usize]>) -> Result<()> {
        let dfg = DistributedFullGrid::new(
            self.header.level.clone(),
            self.header.boundary.clone(),
            comm,
            parallelization,
        )?;
        self.dfg = Some(dfg);
        self.fill(0.0)
    }

    fn run(&mut self, comm: &GroupComm) -> Result<()> {
        self.state.steps_total += self.state.nsteps;
        let t = self.state.steps_total as f64 * self.state.dt;
        self.fill(t)?;
        comm.barrier()
    }

    fn dfg(&self) -> Option<&DistributedFullGrid> {
        self.dfg.as_ref()
    }

    fn dfg_mut(&mut self) -> Option<&mut DistributedFullGrid> {
        self.dfg.as_mut()
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip_restores_persistent_state() {
        let mut registry = TaskRegistry::new();
        registry.register(PERIODIC_WAVE_TAG, PeriodicWaveTask::restore);

        let mut ids = TaskIdGen::new();
        let header = TaskHeader {
            id: ids.next_id(),
            level: LevelVector::new(vec![2, 3]),
            boundary: vec![Boundary::TwoSided, Boundary::TwoSided],
            coefficient: -1.0,
        };
        let comm = GroupComm::single();
        let mut task = PeriodicWaveTask::new(header, 0.125, 4);
        task.init(&comm, None).unwrap();
        task.run(&comm).unwrap();

        let blob = TaskRegistry::serialize_task(&task).unwrap();
        let restored = registry.deserialize_task(&blob).unwrap();
        assert_eq!(restored.id(), TaskId(0));
        assert_eq!(restored.coefficient(), -1.0);
        // the grid is transient and must be rebuilt at the destination
        assert!(restored.dfg().is_none());
        // persistent step counter survives
        assert_eq!(restored.save_state().unwrap(), task.save_state().unwrap());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let registry = TaskRegistry::new();
        let header = TaskHeader {
            id: TaskId(7),
            level: LevelVector::new(vec![1]),
            boundary: vec![Boundary::TwoSided],
            coefficient: 1.0,
        };
        let task = PeriodicWaveTask::new(header, 0.1, 1);
        let blob = TaskRegistry::serialize_task(&task).unwrap();
        assert!(matches!(registry.deserialize_task(&blob), Err(Error::UnknownTaskTag(_))));
    }
}
