use clap::Parser;
use combigrid::combischeme::CombiScheme;
use combigrid::comm::World;
use combigrid::config::{Config, SchemeKind};
use combigrid::error::{Error, Result};
use combigrid::loadmodel::LinearLoadModel;
use combigrid::logger;
use combigrid::manager::{ProcessGroupManager, ProcessManager};
use combigrid::protocol::CombiParameters;
use combigrid::rescheduler::RebalancingTaskRescheduler;
use combigrid::task::{PeriodicWaveTask, Task, TaskHeader, TaskIdGen, TaskRegistry, PERIODIC_WAVE_TAG};
use combigrid::worker::ProcessGroupWorker;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Parser)]
#[command(name = "combigrid", about = "Distributed sparse-grid combination driver")]
struct Args {
    /// Parameter file
    #[arg(default_value = "ctparam")]
    config: PathBuf,
}

fn main() {
    logger::init();
    let args = Args::parse();

    log::info!("loading parameters from '{}'", args.config.display());
    if let Err(e) = run(&args.config) {
        log::error!("run aborted: {}", e);
        std::process::exit(1);
    }
}

fn run(config_path: &std::path::Path) -> Result<()> {
    let cfg = Config::load(config_path)?;

    let scheme = match cfg.scheme {
        SchemeKind::Adaptive => CombiScheme::adaptive(cfg.dim, &cfg.lmin, &cfg.lmax)?,
        SchemeKind::Classical => CombiScheme::classical(cfg.dim, &cfg.lmin, &cfg.lmax)?,
    };
    log::info!(
        "combination scheme with {} component grids between lmin = {} and lmax = {}",
        scheme.len(),
        cfg.lmin,
        cfg.lmax
    );

    let mut registry = TaskRegistry::new();
    registry.register(PERIODIC_WAVE_TAG, PeriodicWaveTask::restore);
    let registry = Arc::new(registry);

    let world = World::build(cfg.ngroup, cfg.nprocs);
    let mut worker_handles = Vec::new();
    for ctx in world.workers {
        let registry = registry.clone();
        let name = format!("worker-{}-{}", ctx.group_index, ctx.group.rank());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || ProcessGroupWorker::new(ctx, registry).run().map(|_| ()))?;
        worker_handles.push(handle);
    }

    let groups: Vec<ProcessGroupManager> = world
        .groups
        .into_iter()
        .enumerate()
        .map(|(i, handle)| ProcessGroupManager::new(i, handle))
        .collect();

    let mut ids = TaskIdGen::new();
    let tasks: Vec<Box<dyn Task>> = scheme
        .iter()
        .map(|(level, coefficient)| {
            let header = TaskHeader {
                id: ids.next_id(),
                level: level.clone(),
                boundary: cfg.boundary.clone(),
                coefficient,
            };
            Box::new(PeriodicWaveTask::new(header, cfg.dt, cfg.nsteps)) as Box<dyn Task>
        })
        .collect();

    let params = CombiParameters {
        dim: cfg.dim,
        lmin: cfg.lmin.clone(),
        lmax: cfg.lmax.clone(),
        boundary: cfg.boundary.clone(),
        ncombi: cfg.ncombi,
        parallelization: cfg.parallelization.clone(),
    };

    let mut manager =
        ProcessManager::new(groups, tasks, params, Box::new(LinearLoadModel));
    if cfg.reschedule {
        manager.set_rescheduler(Box::new(RebalancingTaskRescheduler));
    }
    if let Some(third_level) = cfg.third_level.clone() {
        manager.set_third_level(third_level);
    }
    if let Some(dir) = cfg.stats_dir.clone() {
        manager.set_stats_dir(dir);
    }
    if let Some(dir) = cfg.checkpoint_dir.clone() {
        manager.set_checkpoint_dir(dir);
    }

    manager.run_first()?;
    for i in 0..cfg.ncombi {
        if cfg.third_level.is_some() {
            manager.combine_third_level()?;
        } else {
            manager.combine()?;
        }
        if i + 1 < cfg.ncombi {
            if cfg.reschedule {
                manager.reschedule()?;
            }
            manager.run_next()?;
        }
    }
    manager.exit()?;

    for handle in worker_handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Comm("a worker thread panicked".into())),
        }
    }
    log::info!("run finished after {} combination(s)", cfg.ncombi);
    Ok(())
}
