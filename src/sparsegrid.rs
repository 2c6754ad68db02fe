use crate::combischeme::{check_bounds, downset_cut, levels_in_box};
use crate::comm::{GroupComm, TAG_SPARSE_GRID};
use crate::error::{Error, Result};
use crate::fullgrid::DistributedFullGrid;
use crate::types::{point_level_index, subspace_axis_size, Boundary, LevelVector};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct SubspaceInfo {
    pub level: LevelVector,
    pub size: usize,
    pub offset: usize,
}

/// Serialized form of the sparse grid; doubles as wire image and
/// checkpoint format.
#[derive(Serialize, Deserialize)]
struct DsgImage {
    lmin: LevelVector,
    lmax: LevelVector,
    boundary: Vec<Boundary>,
    data: Vec<f64>,
}

/// The hierarchical sparse-grid buffer used as the reduction target of the
/// combination step.
///
/// Subspace enumeration is a deterministic function of
/// `(lmin, lmax, boundary)`: all levels `l'` with
/// `floor(boundary) <= l' <= lmax` and `|sup(l', lmin)|_1 <= |lmin|_1 + c`,
/// lexicographically ordered into one flat buffer. Two instances built from
/// identical parameters therefore produce byte-identical serializations.
///
/// Every rank holds full-size subspace buffers; entries outside the rank's
/// slab stay zero until the group allreduce, after which all ranks hold
/// bit-identical contents.
#[derive(Debug, Clone)]
pub struct DistributedSparseGridUniform {
    lmin: LevelVector,
    lmax: LevelVector,
    boundary: Vec<Boundary>,
    subspaces: Vec<SubspaceInfo>,
    data: Vec<f64>,
}

impl DistributedSparseGridUniform {
    pub fn new(
        dim: usize,
        lmin: LevelVector,
        lmax: LevelVector,
        boundary: Vec<Boundary>,
    ) -> Result<DistributedSparseGridUniform> {
        check_bounds(dim, &lmin, &lmax)?;
        if boundary.len() != dim {
            return Err(Error::GridLayout(format!(
                "boundary flags have length {}, grid is {}-dimensional",
                boundary.len(),
                dim
            )));
        }

        let floor = LevelVector::new((0..dim).map(|k| boundary[k].level_floor()).collect());
        let n_cut = downset_cut(&lmin, &lmax);

        let mut subspaces = Vec::new();
        let mut offset = 0;
        for level in levels_in_box(&floor, &lmax) {
            if level.sup(&lmin).sum() > n_cut {
                continue;
            }
            let size: usize = (0..dim)
                .map(|k| subspace_axis_size(level[k], boundary[k]))
                .product();
            subspaces.push(SubspaceInfo { level, size, offset });
            offset += size;
        }

        Ok(DistributedSparseGridUniform {
            lmin,
            lmax,
            boundary,
            subspaces,
            data: vec![0.0; offset],
        })
    }

    pub fn dim(&self) -> usize {
        self.lmin.dim()
    }

    pub fn lmin(&self) -> &LevelVector {
        &self.lmin
    }

    pub fn lmax(&self) -> &LevelVector {
        &self.lmax
    }

    pub fn boundary(&self) -> &[Boundary] {
        &self.boundary
    }

    pub fn num_subspaces(&self) -> usize {
        self.subspaces.len()
    }

    pub fn subspaces(&self) -> &[SubspaceInfo] {
        &self.subspaces
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn subspace_data(&self, i: usize) -> &[f64] {
        let s = &self.subspaces[i];
        &self.data[s.offset..s.offset + s.size]
    }

    pub fn index_of(&self, level: &LevelVector) -> Option<usize> {
        self.subspaces.binary_search_by(|s| s.level.cmp(level)).ok()
    }

    pub fn set_zero(&mut self) {
        self.data.fill(0.0);
    }

    fn check_grid(&self, dfg: &DistributedFullGrid) -> Result<()> {
        if dfg.boundary() != self.boundary {
            return Err(Error::GridLayout(format!(
                "full grid boundary {:?} differs from sparse grid boundary {:?}",
                dfg.boundary(),
                self.boundary
            )));
        }
        if !dfg.level().le(&self.lmax) {
            return Err(Error::GridLayout(format!(
                "full grid level {} exceeds lmax {}",
                dfg.level(),
                self.lmax
            )));
        }
        Ok(())
    }

    /// Position of a full-grid node inside this sparse grid, as
    /// `(subspace, linear index within the subspace)`.
    fn locate(&self, dfg: &DistributedFullGrid, global: &[usize]) -> Result<(usize, usize)> {
        let dim = self.dim();
        let mut level = Vec::with_capacity(dim);
        let mut sub_idx = 0;
        let mut stride = 1;
        for k in 0..dim {
            let (j, idx) = point_level_index(global[k], dfg.level()[k], self.boundary[k]);
            level.push(j);
            sub_idx += idx * stride;
            stride *= subspace_axis_size(j, self.boundary[k]);
        }
        let level = LevelVector::new(level);
        let i = self.index_of(&level).ok_or_else(|| {
            Error::GridLayout(format!("subspace {} is not part of this sparse grid", level))
        })?;
        Ok((i, sub_idx))
    }

    /// Accumulates the hierarchical coefficients of an already hierarchized
    /// full grid, scaled by the combination coefficient.
    pub fn add_full_grid_contribution(
        &mut self,
        dfg: &DistributedFullGrid,
        coeff: f64,
    ) -> Result<()> {
        self.check_grid(dfg)?;
        for i in 0..dfg.num_local_elements() {
            let global = dfg.global_index(i);
            let (s, idx) = self.locate(dfg, &global)?;
            let pos = self.subspaces[s].offset + idx;
            self.data[pos] += coeff * dfg.data()[i];
        }
        Ok(())
    }

    /// Inverse scatter: overwrites the local slab of a full grid with the
    /// matching hierarchical coefficients, ready for dehierarchization.
    pub fn extract_to_full_grid(&self, dfg: &mut DistributedFullGrid) -> Result<()> {
        self.check_grid(dfg)?;
        for i in 0..dfg.num_local_elements() {
            let global = dfg.global_index(i);
            let (s, idx) = self.locate(dfg, &global)?;
            let pos = self.subspaces[s].offset + idx;
            dfg.data_mut()[i] = self.data[pos];
        }
        Ok(())
    }

    /// Elementwise sum over all ranks of `comm`; used both within a group
    /// and across groups on the cross communicator.
    pub fn allreduce(&mut self, comm: &GroupComm) -> Result<()> {
        comm.allreduce_sum(&mut self.data)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&DsgImage {
            lmin: self.lmin.clone(),
            lmax: self.lmax.clone(),
            boundary: self.boundary.clone(),
            data: self.data.clone(),
        })?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DistributedSparseGridUniform> {
        let image: DsgImage = bincode::deserialize(bytes)?;
        let mut dsg = DistributedSparseGridUniform::new(
            image.lmin.dim(),
            image.lmin,
            image.lmax,
            image.boundary,
        )?;
        if image.data.len() != dsg.data.len() {
            return Err(Error::GridLayout(format!(
                "image carries {} coefficients, layout requires {}",
                image.data.len(),
                dsg.data.len()
            )));
        }
        dsg.data = image.data;
        Ok(dsg)
    }

    fn check_image(&self, other: &DistributedSparseGridUniform) -> Result<()> {
        if other.lmin != self.lmin || other.lmax != self.lmax || other.boundary != self.boundary {
            return Err(Error::GridLayout(
                "sparse grid images built from different parameters".into(),
            ));
        }
        Ok(())
    }

    /// Replaces the own coefficients with a deserialized image.
    pub fn assign_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let other = DistributedSparseGridUniform::from_bytes(bytes)?;
        self.check_image(&other)?;
        self.data = other.data;
        Ok(())
    }

    /// Adds a deserialized image elementwise.
    pub fn add_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let other = DistributedSparseGridUniform::from_bytes(bytes)?;
        self.check_image(&other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(())
    }

    pub fn send_to(&self, dst: usize, comm: &GroupComm) -> Result<()> {
        comm.send(dst, TAG_SPARSE_GRID, self.to_bytes()?)
    }

    /// Receives the serialized image from another rank and adds it
    /// elementwise.
    pub fn recv_and_add(&mut self, src: usize, comm: &GroupComm) -> Result<()> {
        let bytes = comm.recv(src, TAG_SPARSE_GRID)?;
        self.add_from_bytes(&bytes)
    }

    pub fn write_checkpoint(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn read_checkpoint(path: &Path) -> Result<DistributedSparseGridUniform> {
        let bytes = std::fs::read(path)?;
        DistributedSparseGridUniform::from_bytes(&bytes)
    }
}
