// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! Environment configuration and hypervisor binary resolution.
use crate::types::{VmError, VmResult};
use crate::vmerr;
use std::{env, path::PathBuf, time::Duration};

pub const ENV_VBOXMANAGE_PATH: &str = "VBOXMANAGE_PATH";
pub const ENV_LOG_LEVEL: &str = "VBOX_MCP_LOG_LEVEL";
pub const ENV_DEFAULT_TIMEOUT: &str = "VBOX_MCP_DEFAULT_TIMEOUT_SEC";
pub const ENV_WORKER_POOL_SIZE: &str = "VBOX_MCP_WORKER_POOL_SIZE";
pub const ENV_METRIC_INTERVAL: &str = "VBOX_MCP_METRIC_INTERVAL_SEC";
pub const ENV_BACKEND: &str = "VBOX_MCP_BACKEND";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BackendKind {
    VirtualBox,
    HyperV,
}

/// Process configuration, read once at startup. Invalid values are a fatal
/// startup failure (exit code 1), not something to limp along with.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    /// Resolved hypervisor CLI path; `None` puts the server in degraded
    /// mode where only read tools stay listed.
    pub hypervisor_path: Option<PathBuf>,
    pub log_level: log::LevelFilter,
    pub default_timeout: Duration,
    pub worker_pool_size: usize,
    pub metric_interval: Duration,
}

impl Config {
    pub fn from_env() -> VmResult<Self> {
        let backend = match env::var(ENV_BACKEND).ok().as_deref() {
            None | Some("virtualbox") => BackendKind::VirtualBox,
            Some("hyperv") => BackendKind::HyperV,
            Some(x) => {
                return vmerr!(
                    InvalidArguments,
                    "{}: unknown backend {:?} (expected virtualbox or hyperv)",
                    ENV_BACKEND,
                    x
                )
            }
        };

        let log_level = match env::var(ENV_LOG_LEVEL).ok().as_deref() {
            None => log::LevelFilter::Info,
            Some("debug") => log::LevelFilter::Debug,
            Some("info") => log::LevelFilter::Info,
            Some("warn") => log::LevelFilter::Warn,
            Some("error") => log::LevelFilter::Error,
            Some(x) => {
                return vmerr!(
                    InvalidArguments,
                    "{}: unknown level {:?} (expected debug|info|warn|error)",
                    ENV_LOG_LEVEL,
                    x
                )
            }
        };

        let default_timeout = Duration::from_secs(int_from_env(
            ENV_DEFAULT_TIMEOUT,
            120,
            1,
            u64::MAX,
        )?);
        let worker_pool_size =
            int_from_env(ENV_WORKER_POOL_SIZE, default_pool_size() as u64, 1, 1024)?
                as usize;
        let metric_interval = Duration::from_secs(int_from_env(
            ENV_METRIC_INTERVAL,
            5,
            1,
            300,
        )?);

        Ok(Self {
            backend,
            hypervisor_path: resolve_hypervisor(backend),
            log_level,
            default_timeout,
            worker_pool_size,
            metric_interval,
        })
    }

    pub fn degraded(&self) -> bool { self.hypervisor_path.is_none() }
}

fn int_from_env(name: &str, default: u64, min: u64, max: u64) -> VmResult<u64> {
    let raw = match env::var(name) {
        Ok(x) => x,
        Err(_) => return Ok(default),
    };
    let v: u64 = raw.trim().parse().map_err(|_| {
        vmerr!(@e InvalidArguments, "{}: not an integer: {:?}", name, raw)
    })?;
    if v < min || v > max {
        return vmerr!(
            InvalidArguments,
            "{}: {} out of range [{}, {}]",
            name,
            v,
            min,
            max
        );
    }
    Ok(v)
}

fn default_pool_size() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.max(4)
}

/// Resolves the backend CLI: explicit override, then PATH, then the
/// well-known install locations.
fn resolve_hypervisor(backend: BackendKind) -> Option<PathBuf> {
    match backend {
        BackendKind::VirtualBox => {
            if let Ok(p) = env::var(ENV_VBOXMANAGE_PATH) {
                let p = PathBuf::from(p.trim());
                return if p.is_file() {
                    Some(p)
                } else {
                    log::warn!(
                        "{} points at {:?} which does not exist; \
                         running degraded",
                        ENV_VBOXMANAGE_PATH,
                        p
                    );
                    None
                };
            }
            for name in ["VBoxManage", "vboxmanage"] {
                if let Ok(p) = which::which(name) {
                    return Some(p);
                }
            }
            for p in [
                "C:\\Program Files\\Oracle\\VirtualBox\\VBoxManage.exe",
                "/Applications/VirtualBox.app/Contents/MacOS/VBoxManage",
                "/usr/bin/VBoxManage",
                "/usr/local/bin/VBoxManage",
            ] {
                let p = PathBuf::from(p);
                if p.is_file() {
                    return Some(p);
                }
            }
            None
        }
        BackendKind::HyperV => {
            for name in ["powershell", "pwsh"] {
                if let Ok(p) = which::which(name) {
                    return Some(p);
                }
            }
            None
        }
    }
}
