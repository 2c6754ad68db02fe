use crate::comm::GroupHandle;
use crate::error::{Error, Result};
use crate::protocol::{CombiParameters, GroupReply, GroupStatus, Signal};
use crate::types::TaskId;
use std::path::PathBuf;

/// Manager-side proxy for one worker group. Every call translates to a
/// signal sent to the group root; replies arrive on the paired channel.
pub struct ProcessGroupManager {
    group_index: usize,
    handle: GroupHandle,
    status: GroupStatus,
    task_ids: Vec<TaskId>,
}

impl ProcessGroupManager {
    pub fn new(group_index: usize, handle: GroupHandle) -> ProcessGroupManager {
        ProcessGroupManager {
            group_index,
            handle,
            status: GroupStatus::Available,
            task_ids: Vec::new(),
        }
    }

    pub fn group_index(&self) -> usize {
        self.group_index
    }

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    fn signal(&mut self, signal: Signal) -> Result<()> {
        if self.handle.send_signal(signal).is_err() {
            self.status = GroupStatus::Fail;
            return Err(Error::GroupFailed(self.group_index));
        }
        self.status = GroupStatus::Busy;
        Ok(())
    }

    fn recv_reply(&mut self) -> Result<GroupReply> {
        match self.handle.recv_reply() {
            Ok(reply) => Ok(reply),
            Err(_) => {
                self.status = GroupStatus::Fail;
                Err(Error::GroupFailed(self.group_index))
            }
        }
    }

    pub fn update_parameters(&mut self, params: CombiParameters) -> Result<()> {
        self.signal(Signal::UpdateParameters(params))
    }

    pub fn run_first(&mut self, task_blob: Vec<u8>, id: TaskId) -> Result<()> {
        self.signal(Signal::RunFirst { task: task_blob })?;
        self.task_ids.push(id);
        Ok(())
    }

    pub fn run_next(&mut self) -> Result<()> {
        self.signal(Signal::RunNext)
    }

    pub fn combine(&mut self) -> Result<()> {
        self.signal(Signal::Combine)
    }

    pub fn combine_third_level(&mut self) -> Result<()> {
        self.signal(Signal::CombineThirdLevel)
    }

    pub fn interpolate(&mut self, points: Vec<Vec<f64>>) -> Result<()> {
        self.signal(Signal::Interpolate { points })
    }

    pub fn write_checkpoint(&mut self, path: PathBuf) -> Result<()> {
        self.signal(Signal::WriteCheckpoint { path })
    }

    pub fn exit(&mut self) -> Result<()> {
        self.signal(Signal::Exit)?;
        self.status = GroupStatus::Available;
        Ok(())
    }

    /// Pushes the merged sparse-grid image to the group root during a
    /// third-level combination.
    pub fn send_data(&mut self, bytes: Vec<u8>) -> Result<()> {
        if self.handle.send_data(bytes).is_err() {
            self.status = GroupStatus::Fail;
            return Err(Error::GroupFailed(self.group_index));
        }
        Ok(())
    }

    /// Waits for the `Ready` acknowledging the last signal.
    pub fn wait_ready(&mut self) -> Result<Vec<(TaskId, f64)>> {
        match self.recv_reply()? {
            GroupReply::Ready { durations } => {
                self.status = GroupStatus::Available;
                Ok(durations)
            }
            GroupReply::Failed(message) => {
                self.status = GroupStatus::Fail;
                log::error!("group {} reported failure: {}", self.group_index, message);
                Err(Error::GroupFailed(self.group_index))
            }
            other => {
                self.status = GroupStatus::Fail;
                Err(Error::Comm(format!(
                    "group {} sent {:?} while a Ready was expected",
                    self.group_index, other
                )))
            }
        }
    }

    pub fn recv_dsg_image(&mut self) -> Result<Vec<u8>> {
        match self.recv_reply()? {
            GroupReply::DsgImage(bytes) => Ok(bytes),
            GroupReply::Failed(message) => {
                self.status = GroupStatus::Fail;
                log::error!("group {} reported failure: {}", self.group_index, message);
                Err(Error::GroupFailed(self.group_index))
            }
            other => Err(Error::Comm(format!(
                "group {} sent {:?} while a sparse grid image was expected",
                self.group_index, other
            ))),
        }
    }

    pub fn recv_values(&mut self) -> Result<Vec<f64>> {
        match self.recv_reply()? {
            GroupReply::Values(values) => {
                self.status = GroupStatus::Available;
                Ok(values)
            }
            GroupReply::Failed(message) => {
                self.status = GroupStatus::Fail;
                log::error!("group {} reported failure: {}", self.group_index, message);
                Err(Error::GroupFailed(self.group_index))
            }
            other => Err(Error::Comm(format!(
                "group {} sent {:?} while interpolated values were expected",
                self.group_index, other
            ))),
        }
    }

    /// Removes a task for migration. `Ok(None)` means the move was aborted
    /// on the worker side and the task stays where it is.
    pub fn reschedule_remove(&mut self, id: TaskId) -> Result<Option<Vec<u8>>> {
        self.signal(Signal::RescheduleRemove { task: id })?;
        match self.recv_reply()? {
            GroupReply::Blob(blob) => {
                self.task_ids.retain(|&t| t != id);
                self.status = GroupStatus::Available;
                Ok(Some(blob))
            }
            GroupReply::BlobError(message) => {
                log::warn!(
                    "group {} kept {} during rescheduling: {}",
                    self.group_index,
                    id,
                    message
                );
                self.status = GroupStatus::Available;
                Ok(None)
            }
            GroupReply::Failed(message) => {
                self.status = GroupStatus::Fail;
                log::error!("group {} reported failure: {}", self.group_index, message);
                Err(Error::GroupFailed(self.group_index))
            }
            other => Err(Error::Comm(format!(
                "group {} sent {:?} while a task blob was expected",
                self.group_index, other
            ))),
        }
    }

    pub fn reschedule_add(&mut self, task_blob: Vec<u8>, id: TaskId) -> Result<()> {
        self.signal(Signal::RescheduleAdd { task: task_blob })?;
        self.wait_ready()?;
        self.task_ids.push(id);
        Ok(())
    }
}
