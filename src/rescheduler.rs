use crate::loadmodel::LoadModel;
use crate::types::{Boundary, LevelVector, TaskId};

/// Everything a rescheduling policy may base its decision on.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub group: usize,
    pub level: LevelVector,
    pub boundary: Vec<Boundary>,
    /// Measured duration of the last run; absent before the first
    /// measurement arrives.
    pub duration: Option<f64>,
}

/// Pure policy proposing task migrations between groups. Recommendations
/// are advisory: the manager applies them in order and silently drops any
/// move that would leave a group without tasks.
pub trait TaskRescheduler {
    fn eval(
        &self,
        tasks: &[TaskInfo],
        ngroup: usize,
        load_model: &dyn LoadModel,
    ) -> Vec<(TaskId, usize)>;
}

/// Greedy load balancing on measured durations: while the makespan
/// improves, move the cheapest task of the most loaded group to the least
/// loaded one. Cost ties pick the task with the lexicographically smaller
/// level vector.
#[derive(Debug, Default)]
pub struct RebalancingTaskRescheduler;

impl RebalancingTaskRescheduler {
    fn cost(task: &TaskInfo, load_model: &dyn LoadModel) -> f64 {
        task.duration
            .unwrap_or_else(|| load_model.eval(&task.level, &task.boundary))
    }
}

impl TaskRescheduler for RebalancingTaskRescheduler {
    fn eval(
        &self,
        tasks: &[TaskInfo],
        ngroup: usize,
        load_model: &dyn LoadModel,
    ) -> Vec<(TaskId, usize)> {
        let mut assignment: Vec<(usize, &TaskInfo)> =
            tasks.iter().map(|t| (t.group, t)).collect();
        let mut load = vec![0.0; ngroup];
        for (g, t) in &assignment {
            load[*g] += Self::cost(t, load_model);
        }

        let mut moves = Vec::new();
        for _ in 0..tasks.len() {
            let g_max = (0..ngroup)
                .max_by(|&a, &b| load[a].total_cmp(&load[b]).then(b.cmp(&a)))
                .unwrap_or(0);
            let g_min = (0..ngroup)
                .min_by(|&a, &b| load[a].total_cmp(&load[b]).then(a.cmp(&b)))
                .unwrap_or(0);
            if g_max == g_min {
                break;
            }
            if assignment.iter().filter(|(g, _)| *g == g_max).count() <= 1 {
                break;
            }

            let candidate = assignment
                .iter()
                .enumerate()
                .filter(|(_, (g, _))| *g == g_max)
                .min_by(|(_, (_, a)), (_, (_, b))| {
                    Self::cost(a, load_model)
                        .total_cmp(&Self::cost(b, load_model))
                        .then_with(|| a.level.cmp(&b.level))
                });
            let Some((idx, (_, task))) = candidate else { break };
            let cost = Self::cost(task, load_model);

            // only move if the target stays below the current maximum
            if load[g_min] + cost >= load[g_max] {
                break;
            }
            moves.push((task.id, g_min));
            load[g_max] -= cost;
            load[g_min] += cost;
            assignment[idx].0 = g_min;
        }
        moves
    }
}
