//! Transforms between the nodal representation of a distributed full grid
//! and hierarchical (parent-difference) coefficients. The transform runs
//! one dimension at a time; axes that are split across the group are
//! assembled into full poles by an exchange among the axis peers, and the
//! local slab is written back afterwards.

use crate::comm::{GroupComm, TAG_POLE_EXCHANGE};
use crate::error::Result;
use crate::fullgrid::{linear_index, unravel_index, DistributedFullGrid};
use crate::types::{Boundary, LevelType};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Hierarchize,
    Dehierarchize,
}

pub fn hierarchize(dfg: &mut DistributedFullGrid, comm: &GroupComm) -> Result<()> {
    transform(dfg, comm, Direction::Hierarchize)
}

pub fn dehierarchize(dfg: &mut DistributedFullGrid, comm: &GroupComm) -> Result<()> {
    transform(dfg, comm, Direction::Dehierarchize)
}

/// In-place 1D transform of one pole, in grid units (`u` in `0..=2^l`,
/// missing boundary nodes padded with zero).
fn transform_pole_units(u: &mut [f64], l: LevelType, dir: Direction) {
    let n = 1usize << l;
    match dir {
        Direction::Hierarchize => {
            // fine to coarse: parents still hold nodal values
            for j in (1..=l).rev() {
                let step = 1usize << (l - j);
                let mut i = step;
                while i < n {
                    u[i] -= 0.5 * (u[i - step] + u[i + step]);
                    i += 2 * step;
                }
            }
        }
        Direction::Dehierarchize => {
            // coarse to fine: parents are already nodal again
            for j in 1..=l {
                let step = 1usize << (l - j);
                let mut i = step;
                while i < n {
                    u[i] += 0.5 * (u[i - step] + u[i + step]);
                    i += 2 * step;
                }
            }
        }
    }
}

/// Copies a pole from array positions into the padded grid-unit buffer.
fn pole_to_units(pole: &[f64], l: LevelType, b: Boundary, units: &mut [f64]) {
    let n = 1usize << l;
    units.fill(0.0);
    match b {
        Boundary::None => units[1..n].copy_from_slice(pole),
        Boundary::OneSided => units[..n].copy_from_slice(pole),
        Boundary::TwoSided => units.copy_from_slice(pole),
    }
}

fn units_to_pole(units: &[f64], l: LevelType, b: Boundary, pole: &mut [f64]) {
    let n = 1usize << l;
    match b {
        Boundary::None => pole.copy_from_slice(&units[1..n]),
        Boundary::OneSided => pole.copy_from_slice(&units[..n]),
        Boundary::TwoSided => pole.copy_from_slice(units),
    }
}

#[derive(Serialize, Deserialize)]
struct AxisSlab {
    lo: usize,
    hi: usize,
    data: Vec<f64>,
}

fn transform(dfg: &mut DistributedFullGrid, comm: &GroupComm, dir: Direction) -> Result<()> {
    let dim = dfg.level().dim();
    for k in 0..dim {
        if dfg.decomposition()[k] == 1 {
            transform_local_axis(dfg, k, dir);
        } else {
            transform_split_axis(dfg, comm, k, dir)?;
        }
    }
    Ok(())
}

/// Transform along an axis that is fully local to this rank.
fn transform_local_axis(dfg: &mut DistributedFullGrid, k: usize, dir: Direction) {
    let l = dfg.level()[k];
    let b = dfg.boundary()[k];
    let shape = dfg.local_shape();
    let axis_len = shape[k];
    let mut units = vec![0.0; (1usize << l) + 1];
    let mut pole = vec![0.0; axis_len];

    for_each_pole(&shape, k, |base, stride| {
        let data = dfg.data_mut();
        for m in 0..axis_len {
            pole[m] = data[base + m * stride];
        }
        pole_to_units(&pole, l, b, &mut units);
        transform_pole_units(&mut units, l, dir);
        units_to_pole(&units, l, b, &mut pole);
        for m in 0..axis_len {
            data[base + m * stride] = pole[m];
        }
    });
}

/// Transform along an axis split across several ranks: assemble full poles
/// from the axis peers, transform, write the own slab back.
fn transform_split_axis(
    dfg: &mut DistributedFullGrid,
    comm: &GroupComm,
    k: usize,
    dir: Direction,
) -> Result<()> {
    let l = dfg.level()[k];
    let b = dfg.boundary()[k];
    let procs = dfg.decomposition().to_vec();
    let coords = dfg.process_coords().to_vec();
    let axis_points = dfg.global_points()[k];
    let tag = TAG_POLE_EXCHANGE + k as u32;

    // ranks that share this pole bundle: identical coordinates except dim k
    let peer_rank = |j: usize| -> usize {
        let mut c = coords.clone();
        c[k] = j;
        linear_index(&procs, &c)
    };

    let own = AxisSlab {
        lo: dfg.lower()[k],
        hi: dfg.upper()[k],
        data: dfg.data().to_vec(),
    };
    for j in 0..procs[k] {
        if j != coords[k] {
            comm.send(peer_rank(j), tag, bincode::serialize(&own)?)?;
        }
    }

    let local_shape = dfg.local_shape();
    let mut asm_shape = local_shape.clone();
    asm_shape[k] = axis_points;
    let mut assembled = vec![0.0; asm_shape.iter().product()];

    let mut place = |slab: &AxisSlab| {
        let mut slab_shape = local_shape.clone();
        slab_shape[k] = slab.hi - slab.lo;
        for (i, &v) in slab.data.iter().enumerate() {
            let mut multi = unravel_index(&slab_shape, i);
            multi[k] += slab.lo;
            assembled[linear_index(&asm_shape, &multi)] = v;
        }
    };
    place(&own);
    for j in 0..procs[k] {
        if j != coords[k] {
            let bytes = comm.recv(peer_rank(j), tag)?;
            let slab: AxisSlab = bincode::deserialize(&bytes)?;
            place(&slab);
        }
    }

    let mut units = vec![0.0; (1usize << l) + 1];
    let mut pole = vec![0.0; axis_points];
    for_each_pole(&asm_shape, k, |base, stride| {
        for m in 0..axis_points {
            pole[m] = assembled[base + m * stride];
        }
        pole_to_units(&pole, l, b, &mut units);
        transform_pole_units(&mut units, l, dir);
        units_to_pole(&units, l, b, &mut pole);
        for m in 0..axis_points {
            assembled[base + m * stride] = pole[m];
        }
    });

    // keep only the own slab
    let (lo, hi) = (own.lo, own.hi);
    let data = dfg.data_mut();
    let mut slab_shape = local_shape.clone();
    slab_shape[k] = hi - lo;
    for i in 0..data.len() {
        let mut multi = unravel_index(&slab_shape, i);
        multi[k] += lo;
        data[i] = assembled[linear_index(&asm_shape, &multi)];
    }
    Ok(())
}

/// Invokes `f(base, stride)` for every pole along axis `k` of an array of
/// the given shape.
fn for_each_pole(shape: &[usize], k: usize, mut f: impl FnMut(usize, usize)) {
    let stride: usize = shape[..k].iter().product();
    let transverse: Vec<usize> = shape
        .iter()
        .enumerate()
        .filter(|&(d, _)| d != k)
        .map(|(_, &n)| n)
        .collect();
    let count: usize = transverse.iter().product();
    for t in 0..count {
        let tmulti = unravel_index(&transverse, t);
        let mut multi = Vec::with_capacity(shape.len());
        let mut it = tmulti.iter();
        for d in 0..shape.len() {
            if d == k {
                multi.push(0);
            } else {
                multi.push(*it.next().unwrap());
            }
        }
        f(linear_index(shape, &multi), stride);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LevelVector;

    fn fill(dfg: &mut DistributedFullGrid) {
        for i in 0..dfg.num_local_elements() {
            let g = dfg.global_index(i);
            dfg.data_mut()[i] = g.iter().enumerate().map(|(k, &x)| (k + 2) as f64 * x as f64).sum::<f64>().sin();
        }
    }

    #[test]
    fn round_trip_is_identity_for_all_boundary_kinds() {
        let comm = GroupComm::single();
        for b in [Boundary::None, Boundary::OneSided, Boundary::TwoSided] {
            let mut dfg = DistributedFullGrid::new(
                LevelVector::new(vec![3, 2]),
                vec![b, b],
                &comm,
                None,
            )
            .unwrap();
            fill(&mut dfg);
            let reference = dfg.data().to_vec();
            hierarchize(&mut dfg, &comm).unwrap();
            dehierarchize(&mut dfg, &comm).unwrap();
            for (a, e) in dfg.data().iter().zip(&reference) {
                assert!((a - e).abs() < 1e-12, "round trip drifted for {:?}", b);
            }
        }
    }

    #[test]
    fn constant_grid_collapses_to_boundary_surpluses() {
        let comm = GroupComm::single();
        let mut dfg = DistributedFullGrid::new(
            LevelVector::new(vec![2, 2]),
            vec![Boundary::TwoSided, Boundary::TwoSided],
            &comm,
            None,
        )
        .unwrap();
        dfg.data_mut().fill(4.0);
        hierarchize(&mut dfg, &comm).unwrap();
        // interior surpluses of a constant vanish, corners keep the value
        for i in 0..dfg.num_local_elements() {
            let g = dfg.global_index(i);
            let on_corner = g.iter().all(|&x| x == 0 || x == 4);
            let expected = if on_corner { 4.0 } else { 0.0 };
            assert!((dfg.data()[i] - expected).abs() < 1e-12);
        }
    }
}
