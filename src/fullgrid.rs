use crate::comm::{GroupComm, TAG_FULL_GRID};
use crate::error::{Error, Result};
use crate::types::{coordinate_on_axis, points_on_axis, Boundary, LevelVector};
use serde::{Deserialize, Serialize};

/// Row-major linear index with dimension 0 running fastest.
pub fn linear_index(shape: &[usize], multi: &[usize]) -> usize {
    let mut idx = 0;
    for k in (0..shape.len()).rev() {
        idx = idx * shape[k] + multi[k];
    }
    idx
}

pub fn unravel_index(shape: &[usize], mut idx: usize) -> Vec<usize> {
    let mut multi = vec![0; shape.len()];
    for k in 0..shape.len() {
        multi[k] = idx % shape[k];
        idx /= shape[k];
    }
    multi
}

/// Default Cartesian decomposition: start at `(1,...,1)` and repeatedly
/// double along the axis with the largest points-per-process ratio until
/// all processes are used. Requires a power-of-two process count.
pub fn default_decomposition(level: &LevelVector, nprocs: usize) -> Result<Vec<usize>> {
    if !nprocs.is_power_of_two() {
        return Err(Error::Config(format!(
            "the decomposition heuristic requires a power-of-two group size, got {}",
            nprocs
        )));
    }
    let dim = level.dim();
    let mut p = vec![1usize; dim];
    let mut prod = 1usize;
    while prod != nprocs {
        let mut k_max = 0;
        let mut max_ratio = 0.0;
        for k in 0..dim {
            let ratio = (1u64 << level[k]) as f64 / p[k] as f64;
            if ratio > max_ratio {
                max_ratio = ratio;
                k_max = k;
            }
        }
        p[k_max] *= 2;
        prod *= 2;
    }
    Ok(p)
}

#[derive(Serialize, Deserialize)]
struct Brick {
    lower: Vec<usize>,
    upper: Vec<usize>,
    data: Vec<f64>,
}

/// One component grid distributed over a process group by Cartesian
/// decomposition. Each rank owns a contiguous brick of nodal values.
/// Decompositions are a deterministic function of `(level, boundary,
/// group shape)`, so grids sharing these parameters align subspace-exactly.
#[derive(Debug, Clone)]
pub struct DistributedFullGrid {
    level: LevelVector,
    boundary: Vec<Boundary>,
    procs: Vec<usize>,
    coords: Vec<usize>,
    global_points: Vec<usize>,
    lower: Vec<usize>,
    upper: Vec<usize>,
    data: Vec<f64>,
}

impl DistributedFullGrid {
    pub fn new(
        level: LevelVector,
        boundary: Vec<Boundary>,
        comm: &GroupComm,
        parallelization: Option<&[usize]>,
    ) -> Result<DistributedFullGrid> {
        let dim = level.dim();
        if boundary.len() != dim {
            return Err(Error::Config(format!(
                "boundary flags have length {}, grid is {}-dimensional",
                boundary.len(),
                dim
            )));
        }
        let nprocs = comm.size();
        let procs = match parallelization {
            Some(p) => {
                if p.len() != dim || p.iter().product::<usize>() != nprocs {
                    return Err(Error::Config(format!(
                        "parallelization {:?} does not match group size {}",
                        p, nprocs
                    )));
                }
                p.to_vec()
            }
            None => default_decomposition(&level, nprocs)?,
        };

        let global_points: Vec<usize> =
            (0..dim).map(|k| points_on_axis(level[k], boundary[k])).collect();

        let coords = unravel_index(&procs, comm.rank());
        let lower: Vec<usize> =
            (0..dim).map(|k| coords[k] * global_points[k] / procs[k]).collect();
        let upper: Vec<usize> =
            (0..dim).map(|k| (coords[k] + 1) * global_points[k] / procs[k]).collect();

        let local_len: usize = (0..dim).map(|k| upper[k] - lower[k]).product();
        Ok(DistributedFullGrid {
            level,
            boundary,
            procs,
            coords,
            global_points,
            lower,
            upper,
            data: vec![0.0; local_len],
        })
    }

    pub fn level(&self) -> &LevelVector {
        &self.level
    }

    pub fn boundary(&self) -> &[Boundary] {
        &self.boundary
    }

    pub fn decomposition(&self) -> &[usize] {
        &self.procs
    }

    pub fn process_coords(&self) -> &[usize] {
        &self.coords
    }

    pub fn global_points(&self) -> &[usize] {
        &self.global_points
    }

    pub fn lower(&self) -> &[usize] {
        &self.lower
    }

    pub fn upper(&self) -> &[usize] {
        &self.upper
    }

    pub fn local_shape(&self) -> Vec<usize> {
        (0..self.level.dim()).map(|k| self.upper[k] - self.lower[k]).collect()
    }

    pub fn num_local_elements(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Global multi-index of a local linear index.
    pub fn global_index(&self, local_linear: usize) -> Vec<usize> {
        let shape = self.local_shape();
        let local = unravel_index(&shape, local_linear);
        (0..local.len()).map(|k| self.lower[k] + local[k]).collect()
    }

    /// Unit-cube coordinates of a local linear index.
    pub fn coordinates(&self, local_linear: usize) -> Vec<f64> {
        self.global_index(local_linear)
            .iter()
            .enumerate()
            .map(|(k, &g)| coordinate_on_axis(g, self.level[k], self.boundary[k]))
            .collect()
    }

    /// Collects the grid on `root`; collective over the group. Returns
    /// `Some` on the root, `None` elsewhere.
    pub fn gather_full_grid(&self, comm: &GroupComm, root: usize) -> Result<Option<FullGrid>> {
        let brick = Brick {
            lower: self.lower.clone(),
            upper: self.upper.clone(),
            data: self.data.clone(),
        };
        if comm.rank() != root {
            comm.send(root, TAG_FULL_GRID, bincode::serialize(&brick)?)?;
            return Ok(None);
        }

        let mut full = FullGrid {
            level: self.level.clone(),
            boundary: self.boundary.clone(),
            shape: self.global_points.clone(),
            data: vec![0.0; self.global_points.iter().product()],
        };
        let mut place = |b: &Brick| {
            let shape: Vec<usize> =
                (0..b.lower.len()).map(|k| b.upper[k] - b.lower[k]).collect();
            for (i, &v) in b.data.iter().enumerate() {
                let local = unravel_index(&shape, i);
                let global: Vec<usize> =
                    (0..local.len()).map(|k| b.lower[k] + local[k]).collect();
                let idx = linear_index(&full.shape, &global);
                full.data[idx] = v;
            }
        };
        place(&brick);
        for src in 0..comm.size() {
            if src == root {
                continue;
            }
            let bytes = comm.recv(src, TAG_FULL_GRID)?;
            let remote: Brick = bincode::deserialize(&bytes)?;
            place(&remote);
        }
        Ok(Some(full))
    }
}

/// A fully gathered component grid, used for evaluation on one rank.
#[derive(Debug, Clone)]
pub struct FullGrid {
    pub level: LevelVector,
    pub boundary: Vec<Boundary>,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl FullGrid {
    /// Nodal value at grid-unit position `units` (`u_k` in `0..=2^{l_k}`);
    /// positions without a stored node (missing boundary) count as zero.
    fn value_at_units(&self, units: &[usize]) -> f64 {
        let mut multi = Vec::with_capacity(units.len());
        for (k, &u) in units.iter().enumerate() {
            let n = 1usize << self.level[k];
            let idx = match self.boundary[k] {
                Boundary::None => {
                    if u == 0 || u == n {
                        return 0.0;
                    }
                    u - 1
                }
                Boundary::OneSided => {
                    if u == n {
                        return 0.0;
                    }
                    u
                }
                Boundary::TwoSided => u,
            };
            multi.push(idx);
        }
        self.data[linear_index(&self.shape, &multi)]
    }

    /// Multilinear interpolation at a point of the unit cube.
    pub fn interpolate(&self, point: &[f64]) -> f64 {
        let dim = self.level.dim();
        let mut base = Vec::with_capacity(dim);
        let mut frac = Vec::with_capacity(dim);
        for k in 0..dim {
            let n = 1usize << self.level[k];
            let t = (point[k].clamp(0.0, 1.0)) * n as f64;
            let mut i0 = t.floor() as usize;
            let mut f = t - i0 as f64;
            if i0 >= n {
                i0 = n - 1;
                f = 1.0;
            }
            base.push(i0);
            frac.push(f);
        }

        let mut value = 0.0;
        for corner in 0..(1usize << dim) {
            let mut weight = 1.0;
            let mut units = Vec::with_capacity(dim);
            for k in 0..dim {
                if (corner >> k) & 1 == 1 {
                    weight *= frac[k];
                    units.push(base[k] + 1);
                } else {
                    weight *= 1.0 - frac[k];
                    units.push(base[k]);
                }
            }
            if weight != 0.0 {
                value += weight * self.value_at_units(&units);
            }
        }
        value
    }
}
