//! Storefront Publish-and-Run E2E Harness
//!
//! This crate deploys the storefront application once per variation and
//! verifies it end to end:
//! - Provisions a uniquely named database per variation
//! - Publishes the application (optionally without source) and starts a host
//! - Probes the base URI with a bounded retry policy
//! - Validates the landing page and static content
//! - Checks that launcher scripts were excluded from the publish output
//! - Disposes the deployment and drops the database on every path
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Publish-and-Run Harness (Rust)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  MatrixRunner                                               │
//! │    └── run_variation(ctx, variation) -> VariationReport     │
//! │          ├── DatabaseProvisioner::provision()               │
//! │          ├── create_deployer(params) -> ApplicationDeployer │
//! │          │     ├── Publisher::publish()                     │
//! │          │     └── HostProcess::spawn() / wait_until_ready  │
//! │          ├── RetryPolicy::retry(GET base URI)               │
//! │          ├── Validator::verify_home_page()                  │
//! │          ├── Validator::verify_static_content_served()      │
//! │          ├── check_publish_exclusion()                      │
//! │          └── ApplicationDeployer::dispose()                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  VariationMatrix (YAML)                                     │
//! │    └── variations: [server_type, runtime_flavor,            │
//! │                     architecture, base_url?, no_source]     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod database;
pub mod deployer;
pub mod error;
pub mod host;
pub mod matrix;
pub mod orchestrator;
pub mod params;
pub mod ports;
pub mod publish;
pub mod retry;
pub mod runner;
pub mod validator;

pub use config::HarnessConfig;
pub use context::HarnessContext;
pub use deployer::{create_deployer, ApplicationDeployer, DeployerState, DeploymentResult};
pub use error::{HarnessError, HarnessResult};
pub use matrix::{Variation, VariationMatrix};
pub use orchestrator::{publish_and_run, run_variation, Outcome, Stage, VariationReport};
pub use params::{Architecture, DeploymentParameters, RuntimeFlavor, ServerType};
pub use retry::RetryPolicy;
pub use runner::{MatrixRunner, RunnerConfig, SuiteResult};
pub use validator::Validator;
