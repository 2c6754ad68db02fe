use combigrid::combischeme::CombiScheme;
use combigrid::comm::{GroupComm, World};
use combigrid::error::Error;
use combigrid::fullgrid::DistributedFullGrid;
use combigrid::loadmodel::{LinearLoadModel, LoadModel};
use combigrid::manager::{ProcessGroupManager, ProcessManager};
use combigrid::protocol::CombiParameters;
use combigrid::rescheduler::{TaskInfo, TaskRescheduler};
use combigrid::task::{Task, TaskHeader, TaskIdGen, TaskRegistry};
use combigrid::types::{Boundary, LevelVector, TaskId};
use combigrid::worker::ProcessGroupWorker;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;

const TESTING_TAG: &str = "testing-persistent";
const FAILING_TAG: &str = "testing-failing-save";

#[derive(Serialize, Deserialize)]
struct PersistentCounter {
    runs: u64,
}

/// Writes 10 into every nodal value on each run and counts its runs; the
/// counter is the persistent state that must survive a migration.
struct TestingTask {
    header: TaskHeader,
    counter: PersistentCounter,
    dfg: Option<DistributedFullGrid>,
}

impl TestingTask {
    fn create(header: TaskHeader) -> TestingTask {
        TestingTask { header, counter: PersistentCounter { runs: 0 }, dfg: None }
    }

    fn restore(header: TaskHeader, state: &[u8]) -> combigrid::Result<Box<dyn Task>> {
        let counter: PersistentCounter =
            bincode::deserialize(state).map_err(combigrid::Error::from)?;
        Ok(Box::new(TestingTask { header, counter, dfg: None }))
    }
}

impl Task for TestingTask {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn type_tag(&self) -> &'static str {
        TESTING_TAG
    }

    fn init(
        &mut self,
        comm: &GroupComm,
        parallelization: Option<&[usize]>,
    ) -> combigrid::Result<()> {
        self.dfg = Some(DistributedFullGrid::new(
            self.header.level.clone(),
            self.header.boundary.clone(),
            comm,
            parallelization,
        )?);
        Ok(())
    }

    fn run(&mut self, _comm: &GroupComm) -> combigrid::Result<()> {
        self.counter.runs += 1;
        self.dfg.as_mut().expect("init precedes run").data_mut().fill(10.0);
        Ok(())
    }

    fn dfg(&self) -> Option<&DistributedFullGrid> {
        self.dfg.as_ref()
    }

    fn dfg_mut(&mut self) -> Option<&mut DistributedFullGrid> {
        self.dfg.as_mut()
    }

    fn save_state(&self) -> combigrid::Result<Vec<u8>> {
        Ok(bincode::serialize(&self.counter).map_err(combigrid::Error::from)?)
    }
}

/// Like `TestingTask`, but refuses to serialize once it has run; used to
/// exercise the abort path of a migration.
struct FailingSaveTask {
    inner: TestingTask,
}

impl FailingSaveTask {
    fn restore(header: TaskHeader, state: &[u8]) -> combigrid::Result<Box<dyn Task>> {
        let counter: PersistentCounter =
            bincode::deserialize(state).map_err(combigrid::Error::from)?;
        Ok(Box::new(FailingSaveTask {
            inner: TestingTask { header, counter, dfg: None },
        }))
    }
}

impl Task for FailingSaveTask {
    fn header(&self) -> &TaskHeader {
        self.inner.header()
    }

    fn type_tag(&self) -> &'static str {
        FAILING_TAG
    }

    fn init(
        &mut self,
        comm: &GroupComm,
        parallelization: Option<&[usize]>,
    ) -> combigrid::Result<()> {
        self.inner.init(comm, parallelization)
    }

    fn run(&mut self, comm: &GroupComm) -> combigrid::Result<()> {
        self.inner.run(comm)
    }

    fn dfg(&self) -> Option<&DistributedFullGrid> {
        self.inner.dfg()
    }

    fn dfg_mut(&mut self) -> Option<&mut DistributedFullGrid> {
        self.inner.dfg_mut()
    }

    fn save_state(&self) -> combigrid::Result<Vec<u8>> {
        if self.inner.counter.runs > 0 {
            return Err(Error::TaskTransfer("persistent state is not serializable".into()));
        }
        self.inner.save_state()
    }
}

/// Moves one task of every group that owns at least two to a random group,
/// mirroring the reference testing policy.
struct MoveOnePerGroupRescheduler;

impl TaskRescheduler for MoveOnePerGroupRescheduler {
    fn eval(
        &self,
        tasks: &[TaskInfo],
        ngroup: usize,
        _load_model: &dyn LoadModel,
    ) -> Vec<(TaskId, usize)> {
        let mut rng = rand::rng();
        let mut moves = Vec::new();
        for g in 0..ngroup {
            let owned: Vec<&TaskInfo> = tasks.iter().filter(|t| t.group == g).collect();
            if owned.len() >= 2 {
                moves.push((owned[0].id, rng.random_range(0..ngroup)));
            }
        }
        moves
    }
}

/// Pathological policy that tries to drain every group into group 0.
struct EmptyingRescheduler;

impl TaskRescheduler for EmptyingRescheduler {
    fn eval(
        &self,
        tasks: &[TaskInfo],
        _ngroup: usize,
        _load_model: &dyn LoadModel,
    ) -> Vec<(TaskId, usize)> {
        tasks.iter().map(|t| (t.id, 0)).collect()
    }
}

struct Instance {
    manager: ProcessManager,
    workers: Vec<thread::JoinHandle<combigrid::Result<ProcessGroupWorker>>>,
}

fn launch(
    ngroup: usize,
    nprocs: usize,
    registry: Arc<TaskRegistry>,
    tasks: Vec<Box<dyn Task>>,
) -> Instance {
    let world = World::build(ngroup, nprocs);
    let workers: Vec<_> = world
        .workers
        .into_iter()
        .map(|ctx| {
            let registry = registry.clone();
            thread::spawn(move || ProcessGroupWorker::new(ctx, registry).run())
        })
        .collect();
    let groups: Vec<_> = world
        .groups
        .into_iter()
        .enumerate()
        .map(|(i, h)| ProcessGroupManager::new(i, h))
        .collect();
    let params = CombiParameters {
        dim: 2,
        lmin: LevelVector::new(vec![2, 2]),
        lmax: LevelVector::new(vec![4, 4]),
        boundary: vec![Boundary::TwoSided, Boundary::TwoSided],
        ncombi: 2,
        parallelization: None,
    };
    let manager = ProcessManager::new(groups, tasks, params, Box::new(LinearLoadModel));
    Instance { manager, workers }
}

fn testing_tasks(scheme: &CombiScheme, ids: &mut TaskIdGen) -> Vec<Box<dyn Task>> {
    scheme
        .iter()
        .map(|(level, coefficient)| {
            Box::new(TestingTask::create(TaskHeader {
                id: ids.next_id(),
                level: level.clone(),
                boundary: vec![Boundary::TwoSided, Boundary::TwoSided],
                coefficient,
            })) as Box<dyn Task>
        })
        .collect()
}

/// Rescheduling between two combines: grid values stay at 10 (the combined
/// constant), the persistent counters survive the moves and every task
/// keeps running everywhere.
#[test]
fn rescheduling_preserves_values_and_persistent_state() {
    let scheme = CombiScheme::adaptive(
        2,
        &LevelVector::new(vec![2, 2]),
        &LevelVector::new(vec![4, 4]),
    )
    .unwrap();
    let mut registry = TaskRegistry::new();
    registry.register(TESTING_TAG, TestingTask::restore);
    let registry = Arc::new(registry);

    let mut ids = TaskIdGen::new();
    let tasks = testing_tasks(&scheme, &mut ids);
    let task_count = tasks.len();

    let mut instance = launch(3, 1, registry, tasks);
    instance.manager.set_rescheduler(Box::new(MoveOnePerGroupRescheduler));

    instance.manager.run_first().unwrap();
    instance.manager.combine().unwrap();
    instance.manager.reschedule().unwrap();
    instance.manager.run_next().unwrap();
    instance.manager.combine().unwrap();

    assert!(instance.manager.ownership_is_consistent());
    let distribution = instance.manager.task_distribution();
    assert!(distribution.iter().all(|ids| !ids.is_empty()), "no group may be emptied");
    let total: usize = distribution.iter().map(|ids| ids.len()).sum();
    assert_eq!(total, task_count);

    instance.manager.exit().unwrap();
    let mut seen = 0;
    for w in instance.workers {
        let worker = w.join().unwrap().unwrap();
        for task in worker.tasks() {
            seen += 1;
            let dfg = task.dfg().expect("every task owns its grid");
            for &v in dfg.data() {
                assert!((v - 10.0).abs() < 1e-9, "grid value drifted to {}", v);
            }
            // first run plus the run after rescheduling
            let state: PersistentCounter =
                bincode::deserialize(&task.save_state().unwrap()).unwrap();
            assert_eq!(state.runs, 2, "persistent counter was not restored");
        }
    }
    assert_eq!(seen, task_count);
}

/// A policy that tries to empty groups must be overridden by the executor:
/// afterwards every group still owns at least one task and none is
/// duplicated.
#[test]
fn emptying_policies_are_neutralized() {
    let scheme = CombiScheme::adaptive(
        2,
        &LevelVector::new(vec![2, 2]),
        &LevelVector::new(vec![4, 4]),
    )
    .unwrap();
    let mut registry = TaskRegistry::new();
    registry.register(TESTING_TAG, TestingTask::restore);
    let registry = Arc::new(registry);

    let mut ids = TaskIdGen::new();
    let tasks = testing_tasks(&scheme, &mut ids);
    let task_count = tasks.len();

    let mut instance = launch(3, 1, registry, tasks);
    instance.manager.set_rescheduler(Box::new(EmptyingRescheduler));

    instance.manager.run_first().unwrap();
    instance.manager.combine().unwrap();
    instance.manager.reschedule().unwrap();

    assert!(instance.manager.ownership_is_consistent());
    let distribution = instance.manager.task_distribution();
    assert!(distribution.iter().all(|ids| !ids.is_empty()));
    assert_eq!(distribution.iter().map(|ids| ids.len()).sum::<usize>(), task_count);

    instance.manager.run_next().unwrap();
    instance.manager.combine().unwrap();
    instance.manager.exit().unwrap();
    for w in instance.workers {
        w.join().unwrap().unwrap();
    }
}

/// A task whose state cannot be serialized stays on its source group; the
/// move is aborted with a warning instead of tearing the run down.
#[test]
fn failed_serialization_aborts_the_move() {
    struct MoveTaskZero;
    impl TaskRescheduler for MoveTaskZero {
        fn eval(
            &self,
            _tasks: &[TaskInfo],
            _ngroup: usize,
            _load_model: &dyn LoadModel,
        ) -> Vec<(TaskId, usize)> {
            vec![(TaskId(0), 1)]
        }
    }

    let mut registry = TaskRegistry::new();
    registry.register(TESTING_TAG, TestingTask::restore);
    registry.register(FAILING_TAG, FailingSaveTask::restore);
    let registry = Arc::new(registry);

    // costs put the failing task and one companion into group 0, so the
    // non-empty guard does not mask the serialization failure
    let boundary = vec![Boundary::TwoSided, Boundary::TwoSided];
    let mut ids = TaskIdGen::new();
    let failing_id = ids.next_id();
    let mut tasks: Vec<Box<dyn Task>> = vec![Box::new(FailingSaveTask {
        inner: TestingTask::create(TaskHeader {
            id: failing_id,
            level: LevelVector::new(vec![2, 4]),
            boundary: boundary.clone(),
            coefficient: 1.0,
        }),
    })];
    for level in [vec![4, 2], vec![3, 3], vec![2, 3]] {
        tasks.push(Box::new(TestingTask::create(TaskHeader {
            id: ids.next_id(),
            level: LevelVector::new(level),
            boundary: boundary.clone(),
            coefficient: 1.0,
        })));
    }

    let mut instance = launch(2, 1, registry, tasks);
    instance.manager.set_rescheduler(Box::new(MoveTaskZero));

    instance.manager.run_first().unwrap();
    instance.manager.combine().unwrap();
    let before = instance.manager.task_distribution();
    instance.manager.reschedule().unwrap();
    let after = instance.manager.task_distribution();

    assert_eq!(before, after, "an aborted move must not change ownership");
    assert!(instance.manager.ownership_is_consistent());

    instance.manager.exit().unwrap();
    for w in instance.workers {
        w.join().unwrap().unwrap();
    }
}
