use crate::error::{Error, Result};
use crate::types::{Boundary, LevelVector};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Raw view of the ini-style `ctparam` parameter file. Parsing is strict,
/// unknown keys are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDto {
    pub manager: ManagerSectionDto,
    pub ct: CtSectionDto,
    pub third_level: Option<ThirdLevelSectionDto>,
    pub io: Option<IoSectionDto>,
    pub application: Option<ApplicationSectionDto>,
}

/// Parameters of the example time-stepping task driven by the binary.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationSectionDto {
    pub dt: f64,
    pub nsteps: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerSectionDto {
    pub ngroup: usize,
    pub nprocs: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CtSectionDto {
    pub dim: usize,
    pub lmin: Vec<u32>,
    pub lmax: Vec<u32>,
    pub boundary: Vec<Boundary>,
    pub ncombi: usize,
    #[serde(default)]
    pub scheme: SchemeKind,
    /// Explicit Cartesian decomposition; derived by the doubling heuristic
    /// when absent.
    pub p: Option<Vec<usize>>,
    #[serde(default)]
    pub reschedule: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThirdLevelSectionDto {
    pub host: String,
    pub data_port: u16,
    pub broker_port: u16,
    pub system_name: String,
    #[serde(default)]
    pub reduce: ReduceOp,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoSectionDto {
    pub stats_dir: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemeKind {
    #[default]
    Adaptive,
    Classical,
}

/// How the third-level exchange merges the peer image into the local one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReduceOp {
    #[default]
    Sum,
    Replace,
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub ngroup: usize,
    pub nprocs: usize,
    pub dim: usize,
    pub lmin: LevelVector,
    pub lmax: LevelVector,
    pub boundary: Vec<Boundary>,
    pub ncombi: usize,
    pub scheme: SchemeKind,
    pub parallelization: Option<Vec<usize>>,
    pub reschedule: bool,
    pub third_level: Option<ThirdLevelConfig>,
    pub stats_dir: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
    pub dt: f64,
    pub nsteps: usize,
}

#[derive(Debug, Clone)]
pub struct ThirdLevelConfig {
    pub host: String,
    pub data_port: u16,
    pub broker_port: u16,
    pub system_name: String,
    pub reduce: ReduceOp,
    pub timeout: std::time::Duration,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        let dto: ConfigDto = toml::from_str(&raw)?;
        Config::from_dto(dto)
    }

    pub fn from_dto(dto: ConfigDto) -> Result<Config> {
        if dto.manager.ngroup == 0 || dto.manager.nprocs == 0 {
            return Err(Error::Config("ngroup and nprocs must be positive".into()));
        }
        let dim = dto.ct.dim;
        if dim == 0 {
            return Err(Error::Config("dim must be positive".into()));
        }
        for (name, v) in [("lmin", &dto.ct.lmin), ("lmax", &dto.ct.lmax)] {
            if v.len() != dim {
                return Err(Error::Config(format!("{} must have {} entries", name, dim)));
            }
        }
        if dto.ct.boundary.len() != dim {
            return Err(Error::Config(format!("boundary must have {} entries", dim)));
        }
        if let Some(p) = &dto.ct.p {
            if p.len() != dim {
                return Err(Error::Config(format!("p must have {} entries", dim)));
            }
            if p.iter().product::<usize>() != dto.manager.nprocs {
                return Err(Error::Config(format!(
                    "parallelization {:?} does not multiply up to nprocs = {}",
                    p, dto.manager.nprocs
                )));
            }
        }

        let third_level = dto.third_level.map(|t| ThirdLevelConfig {
            host: t.host,
            data_port: t.data_port,
            broker_port: t.broker_port,
            system_name: t.system_name,
            reduce: t.reduce,
            timeout: std::time::Duration::from_secs(t.timeout_secs),
        });

        let (stats_dir, checkpoint_dir) = match dto.io {
            Some(io) => (io.stats_dir, io.checkpoint_dir),
            None => (None, None),
        };

        let (dt, nsteps) = match dto.application {
            Some(app) => {
                if app.dt <= 0.0 || app.nsteps == 0 {
                    return Err(Error::Config("dt and nsteps must be positive".into()));
                }
                (app.dt, app.nsteps)
            }
            None => (1e-3, 10),
        };

        Ok(Config {
            ngroup: dto.manager.ngroup,
            nprocs: dto.manager.nprocs,
            dim,
            lmin: LevelVector::new(dto.ct.lmin),
            lmax: LevelVector::new(dto.ct.lmax),
            boundary: dto.ct.boundary,
            ncombi: dto.ct.ncombi,
            scheme: dto.ct.scheme,
            parallelization: dto.ct.p,
            reschedule: dto.ct.reschedule,
            third_level,
            stats_dir,
            checkpoint_dir,
            dt,
            nsteps,
        })
    }
}
