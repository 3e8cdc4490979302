//! Publish-and-run: deploy one variation, probe it, validate it, tear it down
//!
//! ```text
//! Init → DbProvisioned → Deploying → Deployed → Probing → Validating
//!      → PublishExclusionCheck → Cleanup → Succeeded | Failed
//! ```
//!
//! The deployment is disposed on every path, including failures in any
//! earlier stage. The timing summary is logged whether or not the
//! variation passed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, Instrument};
use walkdir::WalkDir;

use crate::context::HarnessContext;
use crate::database::generate_database_name;
use crate::deployer::{create_deployer, ApplicationDeployer};
use crate::error::{HarnessError, HarnessResult};
use crate::matrix::Variation;
use crate::params::DeploymentParameters;
use crate::publish::matches_pattern;
use crate::retry::ProbeError;
use crate::validator::Validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    DbProvisioned,
    Deploying,
    Deployed,
    Probing,
    Validating,
    PublishExclusionCheck,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::DbProvisioned => "db_provisioned",
            Stage::Deploying => "deploying",
            Stage::Deployed => "deployed",
            Stage::Probing => "probing",
            Stage::Validating => "validating",
            Stage::PublishExclusionCheck => "publish_exclusion_check",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed { stage: Stage, error: String },
}

/// What happened to one variation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariationReport {
    pub name: String,
    pub variation: Variation,
    pub database_name: String,
    pub started_at: DateTime<Utc>,
    /// Time from variation start to the first successful probe
    pub cold_start_ms: Option<u64>,
    pub total_ms: u64,
    pub outcome: Outcome,
}

impl VariationReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }
}

/// Run a variation and fail with `HarnessError::Variation` unless every
/// stage passed
pub async fn publish_and_run(ctx: &HarnessContext, variation: &Variation) -> HarnessResult<VariationReport> {
    let (report, result) = run_variation(ctx, variation).await;
    result.map(|_| report)
}

/// Run a variation, always returning its report alongside the result
pub async fn run_variation(ctx: &HarnessContext, variation: &Variation) -> (VariationReport, HarnessResult<()>) {
    let span = info_span!(
        "publish",
        server = %variation.server_type,
        flavor = %variation.runtime_flavor,
        arch = %variation.architecture,
        no_source = variation.no_source,
    );
    run_instrumented(ctx, variation).instrument(span).await
}

async fn run_instrumented(ctx: &HarnessContext, variation: &Variation) -> (VariationReport, HarnessResult<()>) {
    let started = Instant::now();
    let started_at = Utc::now();

    info!(
        "Variation Details : HostType = {}, RuntimeFlavor = {}, Architecture = {}, applicationBaseUrl = {}",
        variation.server_type,
        variation.runtime_flavor,
        variation.architecture,
        variation.application_base_url.as_deref().unwrap_or("<allocated>")
    );

    let database_name = generate_database_name();
    let mut run = VariationRun {
        ctx,
        variation,
        started,
        stage: Stage::Init,
        cold_start: None,
    };

    let result = run.execute(&database_name).await;

    let total = started.elapsed();
    if let Some(cold_start) = run.cold_start {
        info!(
            "[Time]: Approximate time taken for application initialization : '{:.3}' seconds",
            cold_start.as_secs_f64()
        );
    }
    info!(
        "[Time]: Total time taken for this test variation '{:.3}' seconds.",
        total.as_secs_f64()
    );

    let outcome = match &result {
        Ok(()) => {
            info!("Variation {} succeeded", variation);
            Outcome::Succeeded
        }
        Err(e) => {
            error!("Some tests failed. Variation {} stopped at {}: {}", variation, run.stage, e);
            Outcome::Failed {
                stage: run.stage,
                error: e.to_string(),
            }
        }
    };

    let report = VariationReport {
        name: variation.name(),
        variation: variation.clone(),
        database_name,
        started_at,
        cold_start_ms: run.cold_start.map(|d| d.as_millis() as u64),
        total_ms: total.as_millis() as u64,
        outcome,
    };

    let stage = run.stage;
    let result = result.map_err(|source| HarnessError::Variation {
        variation: variation.name(),
        stage,
        source: Box::new(source),
    });
    (report, result)
}

struct VariationRun<'a> {
    ctx: &'a HarnessContext,
    variation: &'a Variation,
    started: Instant,
    stage: Stage,
    cold_start: Option<Duration>,
}

impl VariationRun<'_> {
    async fn execute(&mut self, database_name: &str) -> HarnessResult<()> {
        let params = self.build_parameters(database_name)?;

        self.stage = Stage::Deploying;
        let mut deployer = create_deployer(params, self.ctx);
        let result = self.exercise(deployer.as_mut()).await;

        // Dispose regardless of how the deployment went
        deployer.dispose().await;
        if result.is_ok() {
            self.stage = Stage::Cleanup;
        }
        result
    }

    fn build_parameters(&mut self, database_name: &str) -> HarnessResult<DeploymentParameters> {
        let ctx = self.ctx;
        let variation = self.variation;
        let in_memory = variation.runtime_flavor.uses_in_memory_store();

        let connection_string = if in_memory {
            ctx.database.connection_string(database_name)
        } else {
            ctx.database.provision(database_name)?
        };
        self.stage = Stage::DbProvisioned;
        info!("Pointing storefront DB to '{}'", connection_string);

        let database = ctx.database.clone();
        let name = database_name.to_string();
        let mut builder = DeploymentParameters::builder(
            &ctx.config.application_path,
            variation.server_type,
            variation.runtime_flavor,
            variation.architecture,
        )
        .publish_application_before_deployment(true)
        .publish_with_no_source(variation.no_source)
        .environment_variable(&ctx.config.database.connection_string_key, connection_string)
        .user_additional_cleanup(move |_| {
            // The lightweight runtime keeps its data in memory
            if !in_memory {
                database.drop_database(&name)?;
            }
            Ok(())
        });

        if let Some(url) = &variation.application_base_url {
            builder = builder.application_base_uri_hint(url);
        }
        Ok(builder.build())
    }

    async fn exercise(&mut self, deployer: &mut dyn ApplicationDeployer) -> HarnessResult<()> {
        let deployment = deployer.deploy().await?;
        self.stage = Stage::Deployed;

        let validation = &self.ctx.config.validation;
        let client = Client::builder()
            .timeout(validation.request_timeout())
            .build()?;

        // Request the base address and measure the cold start. Retried
        // because freshly started hosts are flaky on some runtimes.
        self.stage = Stage::Probing;
        let base_uri = deployment.application_base_uri.clone();
        let response = self
            .ctx
            .config
            .retry
            .retry(
                || {
                    let client = client.clone();
                    let url = base_uri.clone();
                    async move {
                        let response = client.get(url).send().await?;
                        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
                            return Err(ProbeError::Unavailable(response.status()));
                        }
                        Ok::<_, ProbeError>(response)
                    }
                },
                &deployment.host_shutdown_token,
            )
            .await?;
        self.cold_start = Some(self.started.elapsed());

        self.stage = Stage::Validating;
        let validator = Validator::new(client, &base_uri, validation.clone())?;
        validator.verify_home_page(response).await?;
        validator.verify_static_content_served().await?;

        self.stage = Stage::PublishExclusionCheck;
        if !self.variation.server_type.is_in_process() {
            check_publish_exclusion(
                &deployment.content_root,
                &self.ctx.config.publish.launcher_script_extension,
            )?;
        }

        Ok(())
    }
}

/// Fail if the top level of `dir` contains launcher scripts with extension `ext`
pub fn check_publish_exclusion(dir: &Path, ext: &str) -> HarnessResult<()> {
    let pattern = format!("*.{}", ext);
    let found: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| matches_pattern(&pattern, &e.file_name().to_string_lossy()))
        .map(|e| e.into_path())
        .collect();

    if found.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::PublishExclusionViolation { files: found })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_check_passes_on_clean_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("web"), "").unwrap();
        std::fs::write(dir.path().join("site.css"), "").unwrap();
        check_publish_exclusion(dir.path(), "cmd").unwrap();
    }

    #[test]
    fn test_exclusion_check_reports_launcher_scripts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("web.cmd"), "").unwrap();
        std::fs::write(dir.path().join("kestrel.CMD"), "").unwrap();
        match check_publish_exclusion(dir.path(), "cmd") {
            Err(HarnessError::PublishExclusionViolation { files }) => assert_eq!(files.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_exclusion_check_is_top_level_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tools")).unwrap();
        std::fs::write(dir.path().join("tools/setup.cmd"), "").unwrap();
        check_publish_exclusion(dir.path(), "cmd").unwrap();
    }

    #[test]
    fn test_outcome_serialization() {
        let failed = Outcome::Failed {
            stage: Stage::Probing,
            error: "refused".to_string(),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "probing");
        assert_eq!(
            serde_json::to_value(Outcome::Succeeded).unwrap()["status"],
            "succeeded"
        );
    }
}
