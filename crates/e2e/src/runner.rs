//! Matrix runner: executes every variation and collects a suite result

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::context::HarnessContext;
use crate::error::HarnessResult;
use crate::matrix::{Variation, VariationMatrix};
use crate::orchestrator::{run_variation, Outcome, VariationReport};

/// Result of running a whole matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub matrix: String,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub results: Vec<VariationReport>,
}

impl SuiteResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Configuration for the matrix runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Variations allowed to run at the same time
    pub concurrency: usize,
    pub output_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            output_dir: PathBuf::from("test-results"),
        }
    }
}

pub struct MatrixRunner {
    ctx: HarnessContext,
    config: RunnerConfig,
}

impl MatrixRunner {
    pub fn new(ctx: HarnessContext, config: RunnerConfig) -> Self {
        Self { ctx, config }
    }

    /// Run every variation in the matrix. Each variation runs exactly once,
    /// failures are recorded rather than retried.
    pub async fn run(&self, matrix: &VariationMatrix) -> SuiteResult {
        self.run_variations(&matrix.name, &matrix.variations).await
    }

    /// Run only the variations carrying `tag`
    pub async fn run_tagged(&self, matrix: &VariationMatrix, tag: &str) -> SuiteResult {
        let filtered: Vec<Variation> = matrix.filter_by_tag(tag).into_iter().cloned().collect();
        self.run_variations(&matrix.name, &filtered).await
    }

    async fn run_variations(&self, name: &str, variations: &[Variation]) -> SuiteResult {
        let start = Instant::now();
        let started_at = Utc::now();
        let concurrency = self.config.concurrency.max(1);

        info!(
            "Running {} variation(s) with concurrency {}...",
            variations.len(),
            concurrency
        );

        let mut results: Vec<VariationReport> = stream::iter(variations)
            .map(|variation| async move {
                let (report, _) = run_variation(&self.ctx, variation).await;
                report
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        let mut passed = 0;
        let mut failed = 0;
        for report in &results {
            match &report.outcome {
                Outcome::Succeeded => {
                    passed += 1;
                    info!("✓ {} ({} ms)", report.name, report.total_ms);
                }
                Outcome::Failed { stage, error } => {
                    failed += 1;
                    error!("✗ {} - {} at {}", report.name, error, stage);
                }
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!("");
        info!(
            "Variation Results: {} passed, {} failed ({} ms)",
            passed, failed, duration_ms
        );

        SuiteResult {
            matrix: name.to_string(),
            started_at,
            total: variations.len(),
            passed,
            failed,
            duration_ms,
            results,
        }
    }

    /// Write suite results to JSON file
    pub fn write_results(&self, results: &SuiteResult) -> HarnessResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;

    #[tokio::test]
    async fn test_empty_matrix() {
        let ctx = HarnessContext::from_config(HarnessConfig::default()).unwrap();
        let runner = MatrixRunner::new(ctx, RunnerConfig::default());
        let matrix = VariationMatrix {
            name: "empty".to_string(),
            variations: Vec::new(),
        };

        let result = runner.run(&matrix).await;
        assert_eq!(result.total, 0);
        assert!(result.success());
    }

    #[test]
    fn test_write_results() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = HarnessContext::from_config(HarnessConfig::default()).unwrap();
        let runner = MatrixRunner::new(
            ctx,
            RunnerConfig {
                concurrency: 2,
                output_dir: dir.path().join("out"),
            },
        );
        let result = SuiteResult {
            matrix: "publish-and-run".to_string(),
            started_at: Utc::now(),
            total: 0,
            passed: 0,
            failed: 0,
            duration_ms: 12,
            results: Vec::new(),
        };

        let path = runner.write_results(&result).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["matrix"], "publish-and-run");
        assert_eq!(written["duration_ms"], 12);
    }
}
