#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

use anyhow::{Context, Result as AnyResult};
use chimp_pressure_agent::domain::{
    DEFAULT_CHECK_INTERVAL_SECONDS, DEFAULT_CPU_WINDOW_SECONDS, DEFAULT_PROTECTION_FACTOR,
    DEFAULT_TARGET_CPU_PERCENT, DEFAULT_TARGET_MEM_PERCENT,
};
use chimp_pressure_agent::sampler::SharedSampler;
use chimp_pressure_agent::{
    serve, AgentConfig, AppState, ControllerConfig, ControllerRunner, Metrics, SystemSampler,
};
use clap::Parser;
use std::panic;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "chimp-pressure-agent")]
#[command(
    version,
    about = "Holds host CPU and memory utilization at target percentages",
    long_about = None
)]
struct Args {
    /// Target host CPU utilization percent
    #[arg(long, env = "PRESSURE_TARGET_CPU", default_value_t = DEFAULT_TARGET_CPU_PERCENT)]
    target_cpu: f64,

    /// Target host memory utilization percent
    #[arg(long, env = "PRESSURE_TARGET_MEM", default_value_t = DEFAULT_TARGET_MEM_PERCENT)]
    target_mem: f64,

    /// Seconds between supervisor decisions
    #[arg(long, env = "PRESSURE_CHECK_INTERVAL", default_value_t = DEFAULT_CHECK_INTERVAL_SECONDS)]
    check_interval: u64,

    /// Seconds the supervisor averages CPU over
    #[arg(long, env = "PRESSURE_CPU_WINDOW", default_value_t = DEFAULT_CPU_WINDOW_SECONDS)]
    cpu_window: u64,

    /// Memory fraction above which emergency free kicks in
    #[arg(long, env = "PRESSURE_PROTECTION_FACTOR", default_value_t = DEFAULT_PROTECTION_FACTOR)]
    protection_factor: f64,

    /// Leave CPU alone
    #[arg(long, env = "PRESSURE_NO_CPU")]
    no_cpu: bool,

    /// Leave memory alone
    #[arg(long, env = "PRESSURE_NO_MEM")]
    no_mem: bool,

    /// Status listener address
    #[arg(long, env = "PRESSURE_BIND", default_value = "0.0.0.0:9105")]
    bind: String,

    /// Do not start the status listener
    #[arg(long, env = "PRESSURE_NO_HTTP")]
    no_http: bool,

    /// Emit JSON log lines
    #[arg(long, env = "PRESSURE_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn agent_config(&self) -> AnyResult<AgentConfig> {
        let cpu = if self.no_cpu {
            None
        } else {
            Some(
                ControllerConfig::new(self.target_cpu, self.check_interval, self.cpu_window)
                    .context("cpu settings")?,
            )
        };
        let memory = if self.no_mem {
            None
        } else {
            Some(
                ControllerConfig::new(self.target_mem, self.check_interval, self.cpu_window)
                    .context("memory settings")?,
            )
        };
        AgentConfig::new(cpu, memory, self.protection_factor)
    }
}

fn init_tracing(json: bool) {
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env());
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        error!(message = "panic occurred", panic = %panic_info);
    }));
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    set_panic_hook();

    let config = args.agent_config()?;
    info!(
        cpu = ?config.cpu(),
        memory = ?config.memory(),
        protection_factor = config.memory_tuning().protection_factor,
        "starting agent"
    );

    let metrics = Metrics::new()?;
    let sampler: SharedSampler = Arc::new(SystemSampler::new());
    let runner = ControllerRunner::new(&config, sampler, metrics);
    runner.start();

    let outcome = if args.no_http {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")
    } else {
        let state = AppState { runner: runner.clone() };
        tokio::select! {
            res = serve(&args.bind, state) => res.context("status listener"),
            res = tokio::signal::ctrl_c() => res.context("wait for ctrl-c"),
        }
    };

    info!("shutting down");
    runner.shutdown().await;
    outcome
}
