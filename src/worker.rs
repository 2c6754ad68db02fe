use crate::comm::WorkerContext;
use crate::error::{Error, Result};
use crate::hierarchization::{dehierarchize, hierarchize};
use crate::protocol::{CombiParameters, GroupReply, Signal};
use crate::sparsegrid::DistributedSparseGridUniform;
use crate::task::{Task, TaskRegistry};
use crate::types::TaskId;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Worker-side lifecycle of one combination iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Running,
    CombineReady,
    Combined,
}

/// Event loop of one worker process. Owns the local tasks and the local
/// sparse grid; reacts to the signals broadcast through the group root.
pub struct ProcessGroupWorker {
    ctx: WorkerContext,
    registry: Arc<TaskRegistry>,
    params: Option<CombiParameters>,
    tasks: Vec<Box<dyn Task>>,
    dsg: Option<DistributedSparseGridUniform>,
    state: WorkerState,
}

impl ProcessGroupWorker {
    pub fn new(ctx: WorkerContext, registry: Arc<TaskRegistry>) -> ProcessGroupWorker {
        ProcessGroupWorker {
            ctx,
            registry,
            params: None,
            tasks: Vec::new(),
            dsg: None,
            state: WorkerState::Idle,
        }
    }

    pub fn group_index(&self) -> usize {
        self.ctx.group_index
    }

    pub fn tasks(&self) -> &[Box<dyn Task>] {
        &self.tasks
    }

    pub fn sparse_grid(&self) -> Option<&DistributedSparseGridUniform> {
        self.dsg.as_ref()
    }

    /// Runs the loop until `Exit`; returns the worker for post-run
    /// inspection.
    pub fn run(mut self) -> Result<ProcessGroupWorker> {
        loop {
            if matches!(self.wait()?, Signal::Exit) {
                return Ok(self);
            }
        }
    }

    /// Blocks for the next signal. The group root receives it point-to-point
    /// from the manager and broadcasts it; every member sees every signal in
    /// the same order.
    pub fn wait(&mut self) -> Result<Signal> {
        let signal = if let Some(link) = &self.ctx.manager {
            let signal = link.wait_signal()?;
            self.ctx.group.broadcast(0, Some(bincode::serialize(&signal)?))?;
            signal
        } else {
            let bytes = self.ctx.group.broadcast(0, None)?;
            bincode::deserialize(&bytes)?
        };

        if let Err(e) = self.dispatch(&signal) {
            log::error!(
                "group {} rank {} failed on {:?}: {}",
                self.ctx.group_index,
                self.ctx.group.rank(),
                signal,
                e
            );
            if let Some(link) = &self.ctx.manager {
                let _ = link.reply(GroupReply::Failed(e.to_string()));
            }
            return Err(e);
        }
        Ok(signal)
    }

    fn expect_state(&self, allowed: &[WorkerState]) {
        if !allowed.contains(&self.state) {
            log::warn!(
                "group {} rank {} is in state {:?}, expected one of {:?}",
                self.ctx.group_index,
                self.ctx.group.rank(),
                self.state,
                allowed
            );
        }
    }

    fn reply(&self, reply: GroupReply) -> Result<()> {
        match &self.ctx.manager {
            Some(link) => link.reply(reply),
            None => Ok(()),
        }
    }

    fn parameters(&self) -> Result<&CombiParameters> {
        self.params.as_ref().ok_or_else(|| {
            Error::Comm("combination parameters were not distributed before use".into())
        })
    }

    fn dispatch(&mut self, signal: &Signal) -> Result<()> {
        match signal {
            Signal::UpdateParameters(params) => {
                self.params = Some(params.clone());
                self.reply(GroupReply::Ready { durations: Vec::new() })
            }
            Signal::RunFirst { task } => {
                self.expect_state(&[WorkerState::Idle, WorkerState::CombineReady]);
                let mut task = self.registry.deserialize_task(task)?;
                let parallelization = self.parameters()?.parallelization.clone();
                task.init(&self.ctx.group, parallelization.as_deref())?;
                self.state = WorkerState::Running;
                let started = Instant::now();
                task.run(&self.ctx.group)?;
                let duration = started.elapsed().as_secs_f64();
                let id = task.id();
                log::debug!(
                    "group {} computed task {} with l = {}",
                    self.ctx.group_index,
                    id,
                    task.header().level
                );
                self.tasks.push(task);
                self.state = WorkerState::CombineReady;
                self.reply(GroupReply::Ready { durations: vec![(id, duration)] })
            }
            Signal::RunNext => {
                self.expect_state(&[WorkerState::Idle, WorkerState::CombineReady]);
                self.state = WorkerState::Running;
                let mut durations = Vec::with_capacity(self.tasks.len());
                for task in &mut self.tasks {
                    let started = Instant::now();
                    task.run(&self.ctx.group)?;
                    durations.push((task.id(), started.elapsed().as_secs_f64()));
                }
                self.state = WorkerState::CombineReady;
                self.reply(GroupReply::Ready { durations })
            }
            Signal::Combine => {
                self.combine_uniform()?;
                self.state = WorkerState::Combined;
                self.update_full_grids()?;
                self.state = WorkerState::Idle;
                self.reply(GroupReply::Ready { durations: Vec::new() })
            }
            Signal::CombineThirdLevel => {
                self.combine_uniform()?;
                self.state = WorkerState::Combined;
                self.exchange_with_peer_system()?;
                self.update_full_grids()?;
                self.state = WorkerState::Idle;
                self.reply(GroupReply::Ready { durations: Vec::new() })
            }
            Signal::RescheduleRemove { task } => self.reschedule_remove(*task),
            Signal::RescheduleAdd { task } => {
                self.reschedule_add(task)?;
                self.reply(GroupReply::Ready { durations: Vec::new() })
            }
            Signal::Interpolate { points } => {
                let values = self.interpolate(points)?;
                match values {
                    Some(values) => self.reply(GroupReply::Values(values)),
                    None => Ok(()),
                }
            }
            Signal::WriteCheckpoint { path } => {
                self.write_checkpoint(path);
                self.reply(GroupReply::Ready { durations: Vec::new() })
            }
            Signal::Exit => Ok(()),
        }
    }

    /// Hierarchizes every owned grid into the sparse grid, then reduces
    /// within the group and across the peer groups.
    fn combine_uniform(&mut self) -> Result<()> {
        let params = self.parameters()?.clone();
        if self.dsg.is_none() {
            self.dsg = Some(DistributedSparseGridUniform::new(
                params.dim,
                params.lmin.clone(),
                params.lmax.clone(),
                params.boundary.clone(),
            )?);
        }
        let dsg = self.dsg.as_mut().ok_or(Error::TaskNotInitialized)?;
        dsg.set_zero();
        for task in &mut self.tasks {
            let coeff = task.coefficient();
            let dfg = task.dfg_mut().ok_or(Error::TaskNotInitialized)?;
            hierarchize(dfg, &self.ctx.group)?;
            dsg.add_full_grid_contribution(dfg, coeff)?;
        }
        dsg.allreduce(&self.ctx.group)?;
        if self.ctx.ngroup > 1 {
            dsg.allreduce(&self.ctx.cross)?;
        }
        Ok(())
    }

    /// Scatters the combined sparse grid back into every owned grid and
    /// dehierarchizes.
    fn update_full_grids(&mut self) -> Result<()> {
        let dsg = self.dsg.as_ref().ok_or(Error::TaskNotInitialized)?;
        for task in &mut self.tasks {
            let dfg = task.dfg_mut().ok_or(Error::TaskNotInitialized)?;
            dsg.extract_to_full_grid(dfg)?;
            dehierarchize(dfg, &self.ctx.group)?;
        }
        Ok(())
    }

    /// Manager-mediated exchange with the peer system: group 0 hands its
    /// image to the manager, every group receives the merged image back.
    fn exchange_with_peer_system(&mut self) -> Result<()> {
        let dsg = self.dsg.as_mut().ok_or(Error::TaskNotInitialized)?;
        if let Some(link) = &self.ctx.manager {
            if self.ctx.group_index == 0 {
                link.reply(GroupReply::DsgImage(dsg.to_bytes()?))?;
            }
            let merged = link.recv_data()?;
            self.ctx.group.broadcast(0, Some(merged.clone()))?;
            dsg.assign_from_bytes(&merged)
        } else {
            let merged = self.ctx.group.broadcast(0, None)?;
            dsg.assign_from_bytes(&merged)
        }
    }

    fn reschedule_remove(&mut self, id: TaskId) -> Result<()> {
        let pos = self.tasks.iter().position(|t| t.id() == id);
        let Some(pos) = pos else {
            // deterministic on every rank, no flag exchange needed
            return self.reply(GroupReply::BlobError(format!("{} is not owned here", id)));
        };

        if self.ctx.is_group_root() {
            match TaskRegistry::serialize_task(self.tasks[pos].as_ref()) {
                Ok(blob) => {
                    self.ctx.group.broadcast(0, Some(vec![1]))?;
                    self.tasks.remove(pos);
                    self.reply(GroupReply::Blob(blob))
                }
                Err(e) => {
                    log::warn!("serialization of {} failed, task stays: {}", id, e);
                    self.ctx.group.broadcast(0, Some(vec![0]))?;
                    self.reply(GroupReply::BlobError(e.to_string()))
                }
            }
        } else {
            let flag = self.ctx.group.broadcast(0, None)?;
            if flag == [1] {
                self.tasks.remove(pos);
            }
            Ok(())
        }
    }

    fn reschedule_add(&mut self, blob: &[u8]) -> Result<()> {
        let mut task = self.registry.deserialize_task(blob)?;
        let parallelization = self.parameters()?.parallelization.clone();
        task.init(&self.ctx.group, parallelization.as_deref())?;
        // restore the combined values the source group last saw
        if let Some(dsg) = &self.dsg {
            let dfg = task.dfg_mut().ok_or(Error::TaskNotInitialized)?;
            dsg.extract_to_full_grid(dfg)?;
            dehierarchize(dfg, &self.ctx.group)?;
        }
        log::debug!("group {} adopted task {}", self.ctx.group_index, task.id());
        self.tasks.push(task);
        Ok(())
    }

    /// Evaluates the coefficient-weighted sum of the owned grids at the
    /// given points. Returns `Some` on the group root only.
    fn interpolate(&mut self, points: &[Vec<f64>]) -> Result<Option<Vec<f64>>> {
        let mut partial = vec![0.0; points.len()];
        let mut on_root = false;
        for task in &self.tasks {
            let coeff = task.coefficient();
            let dfg = task.dfg().ok_or(Error::TaskNotInitialized)?;
            if let Some(fg) = dfg.gather_full_grid(&self.ctx.group, 0)? {
                for (value, point) in partial.iter_mut().zip(points) {
                    *value += coeff * fg.interpolate(point);
                }
                on_root = true;
            }
        }
        if self.ctx.group.rank() == 0 {
            on_root = true;
        }
        Ok(if on_root { Some(partial) } else { None })
    }

    fn write_checkpoint(&self, path: &Path) {
        if !self.ctx.is_group_root() {
            return;
        }
        let Some(dsg) = &self.dsg else {
            log::warn!("checkpoint requested before the first combination, skipping");
            return;
        };
        match dsg.write_checkpoint(path) {
            Ok(()) => log::info!("wrote sparse grid checkpoint to {}", path.display()),
            Err(e) => log::error!("checkpoint write to {} failed: {}", path.display(), e),
        }
    }
}
