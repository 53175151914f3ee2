//! Host resource sampling

use crate::error::{HiveError, Result};
use async_trait::async_trait;
use serde::Serialize;

/// Host CPU and memory usage, both in percent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HostSample {
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
}

#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn sample(&self) -> Result<HostSample>;
}

/// Reads `/proc/loadavg` and `/proc/meminfo`
pub struct ProcHostProbe {
    cpus: usize,
}

impl ProcHostProbe {
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { cpus }
    }
}

impl Default for ProcHostProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostProbe for ProcHostProbe {
    async fn sample(&self) -> Result<HostSample> {
        let loadavg = tokio::fs::read_to_string("/proc/loadavg").await?;
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await?;
        Ok(HostSample {
            cpu_usage_percent: parse_loadavg(&loadavg, self.cpus)?,
            memory_usage_percent: parse_meminfo(&meminfo)?,
        })
    }
}

/// Fixed sample, for platforms without `/proc` and for tests
pub struct StaticHostProbe {
    pub sample: HostSample,
}

#[async_trait]
impl HostProbe for StaticHostProbe {
    async fn sample(&self) -> Result<HostSample> {
        Ok(self.sample)
    }
}

/// Platform default probe
pub fn default_host_probe() -> std::sync::Arc<dyn HostProbe> {
    if cfg!(target_os = "linux") {
        std::sync::Arc::new(ProcHostProbe::new())
    } else {
        std::sync::Arc::new(StaticHostProbe {
            sample: HostSample::default(),
        })
    }
}

/// One-minute load average as a share of available CPUs, capped at 100
fn parse_loadavg(contents: &str, cpus: usize) -> Result<f64> {
    let one_minute: f64 = contents
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| HiveError::Transient("unreadable /proc/loadavg".into()))?;
    Ok((one_minute / cpus.max(1) as f64 * 100.0).clamp(0.0, 100.0))
}

fn parse_meminfo(contents: &str) -> Result<f64> {
    let field = |name: &str| -> Option<f64> {
        contents
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
    };

    let total = field("MemTotal:")
        .filter(|t| *t > 0.0)
        .ok_or_else(|| HiveError::Transient("MemTotal missing from /proc/meminfo".into()))?;
    let available = field("MemAvailable:")
        .or_else(|| field("MemFree:"))
        .ok_or_else(|| HiveError::Transient("MemAvailable missing from /proc/meminfo".into()))?;

    Ok(((total - available) / total * 100.0).clamp(0.0, 100.0))
}
