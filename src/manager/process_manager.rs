use crate::config::{ReduceOp, ThirdLevelConfig};
use crate::error::{Error, Result};
use crate::loadmodel::LoadModel;
use crate::manager::ProcessGroupManager;
use crate::protocol::CombiParameters;
use crate::rescheduler::{TaskInfo, TaskRescheduler};
use crate::sparsegrid::DistributedSparseGridUniform;
use crate::stats::Stats;
use crate::task::{Task, TaskHeader, TaskRegistry};
use crate::third_level::ThirdLevelBridge;
use crate::types::TaskId;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Global scheduler: assigns tasks to groups, drives the iteration loop,
/// orchestrates combination and rescheduling and bridges to the peer
/// instance.
pub struct ProcessManager {
    groups: Vec<ProcessGroupManager>,
    pending_tasks: Vec<Box<dyn Task>>,
    headers: BTreeMap<TaskId, TaskHeader>,
    durations: BTreeMap<TaskId, f64>,
    params: CombiParameters,
    load_model: Box<dyn LoadModel>,
    rescheduler: Option<Box<dyn TaskRescheduler>>,
    third_level: Option<ThirdLevelConfig>,
    bridge: Option<ThirdLevelBridge>,
    bridge_failed: bool,
    stats: Stats,
    stats_dir: Option<PathBuf>,
    checkpoint_dir: Option<PathBuf>,
    iteration: usize,
    params_distributed: bool,
}

impl ProcessManager {
    pub fn new(
        groups: Vec<ProcessGroupManager>,
        tasks: Vec<Box<dyn Task>>,
        params: CombiParameters,
        load_model: Box<dyn LoadModel>,
    ) -> ProcessManager {
        let headers =
            tasks.iter().map(|t| (t.id(), t.header().clone())).collect();
        ProcessManager {
            groups,
            pending_tasks: tasks,
            headers,
            durations: BTreeMap::new(),
            params,
            load_model,
            rescheduler: None,
            third_level: None,
            bridge: None,
            bridge_failed: false,
            stats: Stats::new(),
            stats_dir: None,
            checkpoint_dir: None,
            iteration: 0,
            params_distributed: false,
        }
    }

    pub fn set_rescheduler(&mut self, rescheduler: Box<dyn TaskRescheduler>) {
        self.rescheduler = Some(rescheduler);
    }

    pub fn set_third_level(&mut self, config: ThirdLevelConfig) {
        self.third_level = Some(config);
    }

    pub fn set_stats_dir(&mut self, dir: PathBuf) {
        self.stats_dir = Some(dir);
    }

    pub fn set_checkpoint_dir(&mut self, dir: PathBuf) {
        self.checkpoint_dir = Some(dir);
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Task ids per group, in group order.
    pub fn task_distribution(&self) -> Vec<Vec<TaskId>> {
        self.groups.iter().map(|g| g.task_ids().to_vec()).collect()
    }

    /// Ownership invariant: every known task id appears in exactly one
    /// group's list.
    pub fn ownership_is_consistent(&self) -> bool {
        let mut seen = std::collections::BTreeSet::new();
        for g in &self.groups {
            for id in g.task_ids() {
                if !seen.insert(*id) {
                    return false;
                }
            }
        }
        seen.len() == self.headers.len() && self.headers.keys().all(|id| seen.contains(id))
    }

    /// Ships the combination parameters to every group.
    pub fn update_combi_parameters(&mut self) -> Result<()> {
        for g in &mut self.groups {
            g.update_parameters(self.params.clone())?;
        }
        for g in &mut self.groups {
            g.wait_ready()?;
        }
        self.params_distributed = true;
        Ok(())
    }

    /// Distributes the tasks with a greedy longest-processing-time packing
    /// over the load model's cost estimates and runs the first iteration.
    pub fn run_first(&mut self) -> Result<()> {
        if !self.params_distributed {
            self.update_combi_parameters()?;
        }
        self.stats.start("run_first");

        let mut tasks = std::mem::take(&mut self.pending_tasks);
        let cost = |t: &Box<dyn Task>| {
            self.load_model.eval(&t.header().level, &t.header().boundary)
        };
        // stable sort keeps construction order among equal costs
        tasks.sort_by(|a, b| cost(b).total_cmp(&cost(a)));

        let ngroup = self.groups.len();
        let mut projected = vec![0.0f64; ngroup];
        let mut shipped = vec![0usize; ngroup];
        for task in tasks {
            let target = (0..ngroup)
                .min_by(|&a, &b| projected[a].total_cmp(&projected[b]).then(a.cmp(&b)))
                .unwrap_or(0);
            let task_cost = self.load_model.eval(&task.header().level, &task.header().boundary);
            let blob = TaskRegistry::serialize_task(task.as_ref())?;
            log::info!(
                "assigning {} with l = {} to group {}",
                task.id(),
                task.header().level,
                target
            );
            self.groups[target].run_first(blob, task.id())?;
            projected[target] += task_cost;
            shipped[target] += 1;
        }

        for g in 0..ngroup {
            for _ in 0..shipped[g] {
                let durations = self.groups[g].wait_ready()?;
                self.durations.extend(durations);
            }
        }
        self.stats.stop("run_first");
        Ok(())
    }

    /// Advances every task by one iteration.
    pub fn run_next(&mut self) -> Result<()> {
        self.stats.start("run_next");
        for g in &mut self.groups {
            g.run_next()?;
        }
        for g in &mut self.groups {
            let durations = g.wait_ready()?;
            self.durations.extend(durations);
        }
        self.stats.stop("run_next");
        Ok(())
    }

    /// One sparse-grid combination across all groups.
    pub fn combine(&mut self) -> Result<()> {
        self.stats.start("combine");
        for g in &mut self.groups {
            g.combine()?;
        }
        for g in &mut self.groups {
            g.wait_ready()?;
        }
        self.stats.stop("combine");
        self.finish_iteration()
    }

    /// Combination followed by the exchange with the peer instance. Any
    /// bridge failure degrades to the intra-instance result; the run goes
    /// on without the third level.
    pub fn combine_third_level(&mut self) -> Result<()> {
        self.stats.start("combine_third_level");
        for g in &mut self.groups {
            g.combine_third_level()?;
        }
        let own = self.groups[0].recv_dsg_image()?;
        let merged = self.exchange_with_peer(own);
        for g in &mut self.groups {
            g.send_data(merged.clone())?;
        }
        for g in &mut self.groups {
            g.wait_ready()?;
        }
        self.stats.stop("combine_third_level");
        self.finish_iteration()
    }

    fn exchange_with_peer(&mut self, own: Vec<u8>) -> Vec<u8> {
        let Some(config) = self.third_level.clone() else {
            return own;
        };
        if self.bridge_failed {
            return own;
        }
        if self.bridge.is_none() {
            match ThirdLevelBridge::connect(&config) {
                Ok(bridge) => self.bridge = Some(bridge),
                Err(e) => {
                    log::warn!("third-level connect failed, continuing without it: {}", e);
                    self.bridge_failed = true;
                    return own;
                }
            }
        }
        let bridge = self.bridge.as_mut().expect("bridge was just connected");
        match bridge.exchange(&own) {
            Ok(peer) => match merge_images(&own, &peer, config.reduce) {
                Ok(merged) => merged,
                Err(e) => {
                    log::warn!("peer image rejected, keeping the own state: {}", e);
                    self.bridge_failed = true;
                    self.bridge = None;
                    own
                }
            },
            Err(e) => {
                log::warn!("third-level exchange failed, continuing without it: {}", e);
                self.bridge_failed = true;
                self.bridge = None;
                own
            }
        }
    }

    fn finish_iteration(&mut self) -> Result<()> {
        if let Some(dir) = self.checkpoint_dir.clone() {
            let path = dir.join(format!("dsg_iteration_{}.bin", self.iteration));
            if let Err(e) = std::fs::create_dir_all(&dir) {
                log::error!("cannot create checkpoint directory {}: {}", dir.display(), e);
            } else {
                self.groups[0].write_checkpoint(path)?;
                self.groups[0].wait_ready()?;
            }
        }
        if let Some(dir) = self.stats_dir.clone() {
            self.stats.write_iteration(&dir, self.iteration);
        }
        self.iteration += 1;
        Ok(())
    }

    /// Applies the rescheduling policy between iterations. Every accepted
    /// move is one atomic ownership transfer; moves that would empty their
    /// source group are dropped regardless of the policy.
    pub fn reschedule(&mut self) -> Result<()> {
        let Some(policy) = self.rescheduler.as_ref() else {
            return Ok(());
        };
        let mut infos = Vec::new();
        for g in &self.groups {
            for id in g.task_ids() {
                let header = self.headers.get(id).ok_or_else(|| {
                    Error::Comm(format!("{} is assigned but unknown to the manager", id))
                })?;
                infos.push(TaskInfo {
                    id: *id,
                    group: g.group_index(),
                    level: header.level.clone(),
                    boundary: header.boundary.clone(),
                    duration: self.durations.get(id).copied(),
                });
            }
        }

        let moves = policy.eval(&infos, self.groups.len(), self.load_model.as_ref());
        log::info!("rescheduler proposed {} move(s)", moves.len());
        for (id, dest) in moves {
            if dest >= self.groups.len() {
                log::warn!("dropping move of {} to unknown group {}", id, dest);
                continue;
            }
            let Some(src) =
                self.groups.iter().position(|g| g.task_ids().contains(&id))
            else {
                log::warn!("dropping move of unknown task {}", id);
                continue;
            };
            if src == dest {
                continue;
            }
            if self.groups[src].task_ids().len() <= 1 {
                log::info!(
                    "dropping move of {}: group {} would be left without tasks",
                    id,
                    src
                );
                continue;
            }
            let Some(blob) = self.groups[src].reschedule_remove(id)? else {
                continue;
            };
            self.groups[dest].reschedule_add(blob, id)?;
            log::info!("moved {} from group {} to group {}", id, src, dest);
        }
        debug_assert!(self.ownership_is_consistent());
        Ok(())
    }

    /// Evaluates the combined solution at the given unit-cube points.
    pub fn interpolate_values(&mut self, points: &[Vec<f64>]) -> Result<Vec<f64>> {
        for g in &mut self.groups {
            g.interpolate(points.to_vec())?;
        }
        let mut totals = vec![0.0; points.len()];
        for g in &mut self.groups {
            let partial = g.recv_values()?;
            if partial.len() != totals.len() {
                return Err(Error::Comm(format!(
                    "group {} returned {} values for {} points",
                    g.group_index(),
                    partial.len(),
                    totals.len()
                )));
            }
            for (t, p) in totals.iter_mut().zip(partial) {
                *t += p;
            }
        }
        Ok(totals)
    }

    /// Terminates all worker loops and releases the bridge.
    pub fn exit(&mut self) -> Result<()> {
        for g in &mut self.groups {
            g.exit()?;
        }
        if let Some(bridge) = &mut self.bridge {
            bridge.finalize();
        }
        Ok(())
    }
}

fn merge_images(own: &[u8], peer: &[u8], reduce: ReduceOp) -> Result<Vec<u8>> {
    match reduce {
        ReduceOp::Replace => Ok(peer.to_vec()),
        ReduceOp::Sum => {
            let mut dsg = DistributedSparseGridUniform::from_bytes(own)?;
            dsg.add_from_bytes(peer)?;
            dsg.to_bytes()
        }
    }
}
