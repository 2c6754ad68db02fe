//! In-process SPMD runtime. Every simulated process is one OS thread; all
//! coordination runs over tagged, ordered channels. Collectives are
//! implemented root-side: members send to rank 0, which combines and
//! redistributes.

use crate::error::{Error, Result};
use crate::protocol::{GroupReply, Signal};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::mpsc;

// Collective-internal tags.
const TAG_GATHER: u32 = 1;
const TAG_BCAST: u32 = 2;
const TAG_REDUCE: u32 = 3;

/// Tag base for the axis exchanges of the hierarchization kernels; the
/// dimension index is added on top.
pub const TAG_POLE_EXCHANGE: u32 = 16;
/// Tag for direct sparse-grid transfers between ranks.
pub const TAG_SPARSE_GRID: u32 = 64;
/// Tag base for full-grid gathers.
pub const TAG_FULL_GRID: u32 = 96;

struct CommMsg {
    src: usize,
    tag: u32,
    bytes: Vec<u8>,
}

/// A communicator over a fixed set of ranks. Point-to-point sends never
/// block (channels are unbounded); receives match on `(src, tag)` and park
/// non-matching traffic in a pending queue, so collectives issued in the
/// same order on every member cannot interfere.
pub struct GroupComm {
    rank: usize,
    senders: Vec<mpsc::Sender<CommMsg>>,
    inbox: mpsc::Receiver<CommMsg>,
    pending: RefCell<VecDeque<CommMsg>>,
}

impl GroupComm {
    /// Builds the communicators of one group of `size` ranks.
    pub fn local_group(size: usize) -> Vec<GroupComm> {
        let mut senders = Vec::with_capacity(size);
        let mut inboxes = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            inboxes.push(rx);
        }
        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| GroupComm {
                rank,
                senders: senders.clone(),
                inbox,
                pending: RefCell::new(VecDeque::new()),
            })
            .collect()
    }

    /// Single-rank communicator; collectives degenerate to the identity.
    pub fn single() -> GroupComm {
        GroupComm::local_group(1).pop().unwrap()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.senders.len()
    }

    pub fn send(&self, dst: usize, tag: u32, bytes: Vec<u8>) -> Result<()> {
        self.senders[dst]
            .send(CommMsg { src: self.rank, tag, bytes })
            .map_err(|_| Error::Comm(format!("rank {} is gone", dst)))
    }

    pub fn recv(&self, src: usize, tag: u32) -> Result<Vec<u8>> {
        {
            let mut pending = self.pending.borrow_mut();
            if let Some(pos) = pending.iter().position(|m| m.src == src && m.tag == tag) {
                return Ok(pending.remove(pos).map(|m| m.bytes).unwrap_or_default());
            }
        }
        loop {
            let msg = self
                .inbox
                .recv()
                .map_err(|_| Error::Comm(format!("inbox of rank {} closed", self.rank)))?;
            if msg.src == src && msg.tag == tag {
                return Ok(msg.bytes);
            }
            self.pending.borrow_mut().push_back(msg);
        }
    }

    /// Broadcast from `root`; `data` is read on the root only.
    pub fn broadcast(&self, root: usize, data: Option<Vec<u8>>) -> Result<Vec<u8>> {
        if self.rank == root {
            let bytes = data.ok_or_else(|| Error::Comm("broadcast root without data".into()))?;
            for dst in 0..self.size() {
                if dst != root {
                    self.send(dst, TAG_BCAST, bytes.clone())?;
                }
            }
            Ok(bytes)
        } else {
            self.recv(root, TAG_BCAST)
        }
    }

    /// Every rank contributes `bytes`; every rank receives all contributions
    /// in rank order.
    pub fn allgather(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        if self.rank == 0 {
            let mut parts = vec![Vec::new(); self.size()];
            parts[0] = bytes;
            for src in 1..self.size() {
                parts[src] = self.recv(src, TAG_GATHER)?;
            }
            let packed = bincode::serialize(&parts)?;
            for dst in 1..self.size() {
                self.send(dst, TAG_BCAST, packed.clone())?;
            }
            Ok(parts)
        } else {
            self.send(0, TAG_GATHER, bytes)?;
            let packed = self.recv(0, TAG_BCAST)?;
            Ok(bincode::deserialize(&packed)?)
        }
    }

    /// Elementwise sum over all ranks; afterwards every rank holds the
    /// identical reduced buffer.
    pub fn allreduce_sum(&self, buf: &mut [f64]) -> Result<()> {
        if self.size() == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            for src in 1..self.size() {
                let bytes = self.recv(src, TAG_REDUCE)?;
                let part: Vec<f64> = bincode::deserialize(&bytes)?;
                if part.len() != buf.len() {
                    return Err(Error::Comm(format!(
                        "allreduce length mismatch: {} vs {}",
                        part.len(),
                        buf.len()
                    )));
                }
                for (a, b) in buf.iter_mut().zip(part) {
                    *a += b;
                }
            }
            let packed = bincode::serialize(&buf.to_vec())?;
            for dst in 1..self.size() {
                self.send(dst, TAG_BCAST, packed.clone())?;
            }
        } else {
            self.send(0, TAG_REDUCE, bincode::serialize(&buf.to_vec())?)?;
            let packed = self.recv(0, TAG_BCAST)?;
            let reduced: Vec<f64> = bincode::deserialize(&packed)?;
            buf.copy_from_slice(&reduced);
        }
        Ok(())
    }

    pub fn barrier(&self) -> Result<()> {
        self.allgather(Vec::new()).map(|_| ())
    }
}

/// Root-side end of the point-to-point link with the manager.
pub struct ManagerLink {
    signal_rx: mpsc::Receiver<Signal>,
    reply_tx: mpsc::Sender<GroupReply>,
    data_rx: mpsc::Receiver<Vec<u8>>,
}

impl ManagerLink {
    pub fn wait_signal(&self) -> Result<Signal> {
        self.signal_rx.recv().map_err(|_| Error::Comm("manager is gone".into()))
    }

    pub fn reply(&self, reply: GroupReply) -> Result<()> {
        self.reply_tx.send(reply).map_err(|_| Error::Comm("manager is gone".into()))
    }

    pub fn recv_data(&self) -> Result<Vec<u8>> {
        self.data_rx.recv().map_err(|_| Error::Comm("manager is gone".into()))
    }
}

/// Manager-side end of the link with one group root.
pub struct GroupHandle {
    signal_tx: mpsc::Sender<Signal>,
    reply_rx: mpsc::Receiver<GroupReply>,
    data_tx: mpsc::Sender<Vec<u8>>,
}

impl GroupHandle {
    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        self.signal_tx.send(signal).map_err(|_| Error::Comm("group root is gone".into()))
    }

    pub fn recv_reply(&self) -> Result<GroupReply> {
        self.reply_rx.recv().map_err(|_| Error::Comm("group root is gone".into()))
    }

    pub fn send_data(&self, bytes: Vec<u8>) -> Result<()> {
        self.data_tx.send(bytes).map_err(|_| Error::Comm("group root is gone".into()))
    }
}

/// Everything one worker process needs: its place in the world, the group
/// communicator, the cross-group communicator linking the same local rank
/// of every group, and (on the group root) the manager link.
pub struct WorkerContext {
    pub group_index: usize,
    pub ngroup: usize,
    pub nprocs: usize,
    pub group: GroupComm,
    pub cross: GroupComm,
    pub manager: Option<ManagerLink>,
}

impl WorkerContext {
    pub fn is_group_root(&self) -> bool {
        self.group.rank() == 0
    }
}

/// The explicit process-world context. Built once at startup; the worker
/// contexts are moved into their threads, the group handles stay with the
/// manager.
pub struct World {
    pub groups: Vec<GroupHandle>,
    pub workers: Vec<WorkerContext>,
}

impl World {
    pub fn build(ngroup: usize, nprocs: usize) -> World {
        let mut group_comms: Vec<Vec<GroupComm>> =
            (0..ngroup).map(|_| GroupComm::local_group(nprocs)).collect();
        // one cross communicator per local rank, spanning all groups
        let mut cross_comms: Vec<Vec<GroupComm>> =
            (0..nprocs).map(|_| GroupComm::local_group(ngroup)).collect();

        let mut groups = Vec::with_capacity(ngroup);
        let mut workers = Vec::with_capacity(ngroup * nprocs);
        for g in 0..ngroup {
            let (signal_tx, signal_rx) = mpsc::channel();
            let (reply_tx, reply_rx) = mpsc::channel();
            let (data_tx, data_rx) = mpsc::channel();
            groups.push(GroupHandle { signal_tx, reply_rx, data_tx });
            let mut link = Some(ManagerLink { signal_rx, reply_tx, data_rx });

            let mut comms = std::mem::take(&mut group_comms[g]);
            for (r, group) in comms.drain(..).enumerate() {
                let cross = cross_comms[r].remove(0);
                workers.push(WorkerContext {
                    group_index: g,
                    ngroup,
                    nprocs,
                    group,
                    cross,
                    manager: if r == 0 { link.take() } else { None },
                });
            }
        }
        World { groups, workers }
    }
}
