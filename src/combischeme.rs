use crate::error::{Error, Result};
use crate::types::{LevelType, LevelVector};

/// The combination scheme: which component grids exist and with which
/// coefficients their solutions enter the combined sparse-grid solution.
///
/// Both constructors enumerate the downset
/// `D = { l : lmin <= l <= lmax, |l|_1 <= |lmin|_1 + c }` with
/// `c = max_k(lmax_k - lmin_k)`. Dimensions with `lmax_k == lmin_k` are
/// dummy dimensions: they stay fixed and reduce the effective dimension.
#[derive(Debug, Clone)]
pub struct CombiScheme {
    levels: Vec<LevelVector>,
    coefficients: Vec<f64>,
}

impl CombiScheme {
    /// Classical combination technique. Requires `lmax - lmin` to be uniform
    /// across all non-dummy dimensions; emits the `effdim` upper diagonals
    /// with binomial coefficients `(-1)^q * C(effdim - 1, q)`.
    pub fn classical(dim: usize, lmin: &LevelVector, lmax: &LevelVector) -> Result<CombiScheme> {
        check_bounds(dim, lmin, lmax)?;

        let diffs: Vec<LevelType> = (0..dim).map(|k| lmax[k] - lmin[k]).collect();
        let eff_dim = diffs.iter().filter(|&&d| d > 0).count();
        let c = diffs.iter().copied().max().unwrap_or(0);
        if diffs.iter().any(|&d| d != 0 && d != c) {
            return Err(Error::InvalidBounds(format!(
                "classical scheme requires uniform lmax - lmin, got {:?}",
                diffs
            )));
        }

        if eff_dim == 0 {
            return Ok(CombiScheme { levels: vec![lmin.clone()], coefficients: vec![1.0] });
        }

        let n_cut = downset_cut(lmin, lmax);
        let mut levels = Vec::new();
        let mut coefficients = Vec::new();
        for q in 0..eff_dim as u64 {
            let sign = if q % 2 == 0 { 1.0 } else { -1.0 };
            let coeff = sign * binomial(eff_dim as u64 - 1, q) as f64;
            for l in levels_in_box(lmin, lmax) {
                if l.sum() == n_cut - q {
                    levels.push(l);
                    coefficients.push(coeff);
                }
            }
        }
        Ok(CombiScheme { levels, coefficients })
    }

    /// Adaptive (dimension-truncated) combination technique. Coefficients by
    /// inclusion-exclusion restricted to the downset; grids with coefficient
    /// zero are not emitted.
    pub fn adaptive(dim: usize, lmin: &LevelVector, lmax: &LevelVector) -> Result<CombiScheme> {
        check_bounds(dim, lmin, lmax)?;

        let n_cut = downset_cut(lmin, lmax);
        let in_downset =
            |l: &LevelVector| -> bool { l.le(lmax) && l.sum() <= n_cut };

        let mut levels = Vec::new();
        let mut coefficients = Vec::new();
        for l in levels_in_box(lmin, lmax) {
            if l.sum() > n_cut {
                continue;
            }
            let mut coeff = 0.0;
            for z in 0..(1u32 << dim) {
                let shifted = LevelVector::new(
                    (0..dim).map(|k| l[k] + ((z >> k) & 1)).collect(),
                );
                if in_downset(&shifted) {
                    coeff += if z.count_ones() % 2 == 0 { 1.0 } else { -1.0 };
                }
            }
            if coeff != 0.0 {
                levels.push(l);
                coefficients.push(coeff);
            }
        }
        Ok(CombiScheme { levels, coefficients })
    }

    pub fn levels(&self) -> &[LevelVector] {
        &self.levels
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LevelVector, f64)> {
        self.levels.iter().zip(self.coefficients.iter().copied())
    }
}

/// L1 cut of the downset: `|lmin|_1 + max_k(lmax_k - lmin_k)`.
pub fn downset_cut(lmin: &LevelVector, lmax: &LevelVector) -> u64 {
    let c = (0..lmin.dim()).map(|k| lmax[k] - lmin[k]).max().unwrap_or(0);
    lmin.sum() + u64::from(c)
}

pub(crate) fn check_bounds(dim: usize, lmin: &LevelVector, lmax: &LevelVector) -> Result<()> {
    if dim == 0 || lmin.dim() != dim || lmax.dim() != dim {
        return Err(Error::InvalidBounds(format!(
            "expected {}-dimensional bounds, got lmin = {}, lmax = {}",
            dim, lmin, lmax
        )));
    }
    for k in 0..dim {
        if lmin[k] < 1 {
            return Err(Error::InvalidBounds(format!("lmin[{}] must be at least 1", k)));
        }
        if lmax[k] < lmin[k] {
            return Err(Error::InvalidBounds(format!(
                "lmax[{}] = {} is below lmin[{}] = {}",
                k, lmax[k], k, lmin[k]
            )));
        }
    }
    Ok(())
}

/// All level vectors in the componentwise box `[lo, hi]`, lexicographically
/// ordered.
pub fn levels_in_box(lo: &LevelVector, hi: &LevelVector) -> Vec<LevelVector> {
    let dim = lo.dim();
    let mut out = Vec::new();
    let mut current: Vec<LevelType> = (0..dim).map(|k| lo[k]).collect();
    loop {
        out.push(LevelVector::new(current.clone()));
        // odometer increment, last dimension fastest
        let mut k = dim;
        loop {
            if k == 0 {
                return out;
            }
            k -= 1;
            if current[k] < hi[k] {
                current[k] += 1;
                break;
            }
            current[k] = lo[k];
        }
    }
}

fn binomial(n: u64, k: u64) -> u64 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut result = 1u64;
    for i in 0..k {
        result = result * (n - i) / (i + 1);
    }
    result
}
