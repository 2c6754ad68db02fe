use crate::types::{points_on_axis, Boundary, LevelVector};

/// Estimates the relative cost of computing one component grid. Used by the
/// manager for the initial task assignment and consulted by rescheduling
/// policies.
pub trait LoadModel: Send {
    fn eval(&self, level: &LevelVector, boundary: &[Boundary]) -> f64;
}

/// Cost proportional to the number of grid points.
#[derive(Debug, Default)]
pub struct LinearLoadModel;

impl LoadModel for LinearLoadModel {
    fn eval(&self, level: &LevelVector, boundary: &[Boundary]) -> f64 {
        level
            .iter()
            .zip(boundary)
            .map(|(&l, &b)| points_on_axis(l, b) as f64)
            .product()
    }
}
