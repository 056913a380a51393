#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

use crate::domain::{AgentConfig, ControllerConfig};
use anyhow::{bail, Result as AnyResult};

pub fn validate_target(target_percent: f64) -> AnyResult<()> {
    if !target_percent.is_finite() || target_percent <= 0.0 || target_percent >= 100.0 {
        bail!("target_percent must be in (0, 100), got {target_percent}");
    }
    Ok(())
}

pub fn validate_controller(cfg: &ControllerConfig) -> AnyResult<()> {
    validate_target(cfg.target_percent())?;
    if cfg.check_interval().is_zero() {
        bail!("check_interval_seconds must be > 0");
    }
    if cfg.sample_window().is_zero() {
        bail!("sample_window_seconds must be > 0");
    }
    Ok(())
}

pub fn validate_agent(cfg: &AgentConfig) -> AnyResult<()> {
    if cfg.cpu().is_none() && cfg.memory().is_none() {
        bail!("at least one of cpu or memory control must be enabled");
    }
    if let Some(cpu) = cfg.cpu() {
        validate_controller(&cpu)?;
    }
    let tuning = cfg.memory_tuning();
    let protection = tuning.protection_factor;
    if !protection.is_finite() || protection <= 0.0 || protection > 1.0 {
        bail!("protection_factor must be in (0, 1], got {protection}");
    }
    if let Some(mem) = cfg.memory() {
        validate_controller(&mem)?;
        let ceiling = tuning.protection_percent();
        if mem.target_percent() >= ceiling {
            bail!(format!(
                "memory target {} must be below the protection threshold {ceiling}",
                mem.target_percent()
            ));
        }
    }
    Ok(())
}
