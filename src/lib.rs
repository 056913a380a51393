#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

pub mod control;
pub mod cpu_controller;
pub mod domain;
pub mod episode;
pub mod http;
pub mod lib_cpu;
pub mod lib_mem;
pub mod mem_controller;
pub mod metrics;
pub mod sampler;
pub mod service;
pub mod validation;

pub use control::{FeedbackController, FeedbackParams};
pub use cpu_controller::CpuController;
pub use domain::{AgentConfig, AgentStatus, ControllerConfig, ControllerStatus, Resource};
pub use http::{healthz, resource_status, scrape_metrics, serve, status, AppState};
pub use mem_controller::MemoryController;
pub use metrics::Metrics;
pub use sampler::{SystemSampler, UtilizationSampler};
pub use service::ControllerRunner;
pub use validation::validate_target;
