use combigrid::combischeme::CombiScheme;
use combigrid::comm::{GroupComm, World};
use combigrid::fullgrid::DistributedFullGrid;
use combigrid::loadmodel::LinearLoadModel;
use combigrid::manager::{ProcessGroupManager, ProcessManager};
use combigrid::protocol::CombiParameters;
use combigrid::sparsegrid::DistributedSparseGridUniform;
use combigrid::task::{Task, TaskHeader, TaskIdGen, TaskRegistry};
use combigrid::types::{Boundary, LevelVector};
use combigrid::worker::ProcessGroupWorker;
use std::sync::Arc;
use std::thread;

const CONST_TAG: &str = "testing-const";

/// Simple task setting every nodal value to `l_1 / l_2`.
struct ConstTask {
    header: TaskHeader,
    dfg: Option<DistributedFullGrid>,
}

impl ConstTask {
    fn create(header: TaskHeader) -> ConstTask {
        ConstTask { header, dfg: None }
    }

    fn restore(header: TaskHeader, _state: &[u8]) -> combigrid::Result<Box<dyn Task>> {
        Ok(Box::new(ConstTask { header, dfg: None }))
    }
}

impl Task for ConstTask {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn type_tag(&self) -> &'static str {
        CONST_TAG
    }

    fn init(
        &mut self,
        comm: &GroupComm,
        parallelization: Option<&[usize]>,
    ) -> combigrid::Result<()> {
        let mut dfg = DistributedFullGrid::new(
            self.header.level.clone(),
            self.header.boundary.clone(),
            comm,
            parallelization,
        )?;
        dfg.data_mut().fill(10.0);
        self.dfg = Some(dfg);
        Ok(())
    }

    fn run(&mut self, _comm: &GroupComm) -> combigrid::Result<()> {
        let value = self.header.level[0] as f64 / self.header.level[1] as f64;
        let dfg = self.dfg.as_mut().expect("init precedes run");
        dfg.data_mut().fill(value);
        Ok(())
    }

    fn dfg(&self) -> Option<&DistributedFullGrid> {
        self.dfg.as_ref()
    }

    fn dfg_mut(&mut self) -> Option<&mut DistributedFullGrid> {
        self.dfg.as_mut()
    }

    fn save_state(&self) -> combigrid::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

fn test_registry() -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry.register(CONST_TAG, ConstTask::restore);
    Arc::new(registry)
}

fn small_dsg() -> DistributedSparseGridUniform {
    DistributedSparseGridUniform::new(
        2,
        LevelVector::new(vec![2, 2]),
        LevelVector::new(vec![4, 4]),
        vec![Boundary::TwoSided, Boundary::TwoSided],
    )
    .unwrap()
}

/// Scenario from the numerical reference: adaptive scheme between (2,2)
/// and (4,4), one group of one process, two combination steps; the
/// combined solution interpolates to 4/3 in the domain center.
#[test]
fn combined_solution_interpolates_to_four_thirds() {
    let lmin = LevelVector::new(vec![2, 2]);
    let lmax = LevelVector::new(vec![4, 4]);
    let boundary = vec![Boundary::TwoSided, Boundary::TwoSided];
    let scheme = CombiScheme::adaptive(2, &lmin, &lmax).unwrap();

    let stats_dir = tempfile::tempdir().unwrap();
    let checkpoint_dir = tempfile::tempdir().unwrap();

    let world = World::build(1, 1);
    let registry = test_registry();
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

    let mut ids = TaskIdGen::new();
    let tasks: Vec<Box<dyn Task>> = scheme
        .iter()
        .map(|(level, coefficient)| {
            Box::new(ConstTask::create(TaskHeader {
                id: ids.next_id(),
                level: level.clone(),
                boundary: boundary.clone(),
                coefficient,
            })) as Box<dyn Task>
        })
        .collect();

    let params = CombiParameters {
        dim: 2,
        lmin: lmin.clone(),
        lmax: lmax.clone(),
        boundary: boundary.clone(),
        ncombi: 2,
        parallelization: None,
    };
    let mut manager = ProcessManager::new(groups, tasks, params, Box::new(LinearLoadModel));
    manager.set_stats_dir(stats_dir.path().to_path_buf());
    manager.set_checkpoint_dir(checkpoint_dir.path().to_path_buf());

    manager.run_first().unwrap();
    manager.combine().unwrap();
    manager.combine().unwrap();

    let mid = manager.interpolate_values(&[vec![0.5, 0.5]]).unwrap()[0];
    assert!(
        (mid - 4.0 / 3.0).abs() < 1e-9,
        "midpoint of the combined solution was {}",
        mid
    );

    manager.exit().unwrap();
    for w in workers {
        w.join().unwrap().unwrap();
    }

    // per-iteration statistics and checkpoints were persisted
    for iteration in 0..2 {
        let stats_path = stats_dir.path().join(format!("iteration_{}.json", iteration));
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(stats_path).unwrap()).unwrap();
        assert_eq!(parsed["iteration"], iteration);

        let cp = checkpoint_dir.path().join(format!("dsg_iteration_{}.bin", iteration));
        let dsg = DistributedSparseGridUniform::read_checkpoint(&cp).unwrap();
        assert_eq!(dsg.lmax(), &lmax);
        // the constant combined solution lives in the corner subspace
        for v in dsg.subspace_data(0) {
            assert!((v - 4.0 / 3.0).abs() < 1e-9);
        }
    }
}

fn run_const_instance(ngroup: usize, nprocs: usize) -> f64 {
    let lmin = LevelVector::new(vec![2, 2]);
    let lmax = LevelVector::new(vec![4, 4]);
    let boundary = vec![Boundary::TwoSided, Boundary::TwoSided];
    let scheme = CombiScheme::adaptive(2, &lmin, &lmax).unwrap();

    let world = World::build(ngroup, nprocs);
    let registry = test_registry();
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

    let mut ids = TaskIdGen::new();
    let tasks: Vec<Box<dyn Task>> = scheme
        .iter()
        .map(|(level, coefficient)| {
            Box::new(ConstTask::create(TaskHeader {
                id: ids.next_id(),
                level: level.clone(),
                boundary: boundary.clone(),
                coefficient,
            })) as Box<dyn Task>
        })
        .collect();

    let params = CombiParameters {
        dim: 2,
        lmin,
        lmax,
        boundary,
        ncombi: 2,
        parallelization: None,
    };
    let mut manager = ProcessManager::new(groups, tasks, params, Box::new(LinearLoadModel));
    manager.run_first().unwrap();
    manager.combine().unwrap();
    manager.combine().unwrap();
    let mid = manager.interpolate_values(&[vec![0.5, 0.5]]).unwrap()[0];
    manager.exit().unwrap();
    for w in workers {
        w.join().unwrap().unwrap();
    }
    mid
}

/// The combined value must not depend on how the work is spread over
/// groups and processes.
#[test]
fn combination_is_consistent_across_group_layouts() {
    for (ngroup, nprocs) in [(1, 2), (2, 2), (3, 1)] {
        let mid = run_const_instance(ngroup, nprocs);
        assert!(
            (mid - 4.0 / 3.0).abs() < 1e-9,
            "layout ({} x {}) produced {}",
            ngroup,
            nprocs,
            mid
        );
    }
}

/// Pingpong: rank 1 sends its sparse grid, rank 0 receives and adds; the
/// result is twice the original, the sender stays untouched.
#[test]
fn pingpong_receive_and_add_doubles_the_grid() {
    let comms = GroupComm::local_group(2);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let mut dsg = small_dsg();
                for (i, v) in dsg.data_mut().iter_mut().enumerate() {
                    *v = i as f64 * 0.5 - 3.0;
                }
                let original = dsg.data().to_vec();
                if comm.rank() == 1 {
                    dsg.send_to(0, &comm).unwrap();
                    assert_eq!(dsg.data(), &original[..], "sender must stay untouched");
                } else {
                    dsg.recv_and_add(1, &comm).unwrap();
                    for (a, e) in dsg.data().iter().zip(&original) {
                        assert!((a - 2.0 * e).abs() < 1e-12);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// Two sparse grids constructed from identical parameters serialize to
/// identical byte sequences.
#[test]
fn identical_parameters_yield_identical_bytes() {
    let mut a = small_dsg();
    let mut b = small_dsg();
    assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());

    for (i, v) in a.data_mut().iter_mut().enumerate() {
        *v = (i as f64).cos();
    }
    for (i, v) in b.data_mut().iter_mut().enumerate() {
        *v = (i as f64).cos();
    }
    assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
}

/// Adding a zero-state peer leaves a combined system unchanged.
#[test]
fn zero_peer_is_the_neutral_element() {
    let mut combined = small_dsg();
    for (i, v) in combined.data_mut().iter_mut().enumerate() {
        *v = (i as f64 * 0.11).sin() + 1.0;
    }
    let before = combined.data().to_vec();

    let zero = small_dsg();
    combined.add_from_bytes(&zero.to_bytes().unwrap()).unwrap();
    for (a, e) in combined.data().iter().zip(&before) {
        assert!((a - e).abs() < 1e-12);
    }
}

/// Images of differently parameterized grids are rejected.
#[test]
fn mismatched_images_are_rejected() {
    let mut a = small_dsg();
    let other = DistributedSparseGridUniform::new(
        2,
        LevelVector::new(vec![2, 2]),
        LevelVector::new(vec![5, 5]),
        vec![Boundary::TwoSided, Boundary::TwoSided],
    )
    .unwrap();
    assert!(a.add_from_bytes(&other.to_bytes().unwrap()).is_err());
}
