//! Application deployers, one strategy per server type
//!
//! ```text
//! Created ──deploy()──▶ Deployed ──dispose()──▶ Disposed
//!    │                                             ▲
//!    └──deploy() fails──▶ Failed ──dispose()───────┘
//! ```
//!
//! `dispose()` is idempotent, always stops the host and runs the user
//! cleanup hook exactly once.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{CommandTemplate, HarnessConfig};
use crate::context::HarnessContext;
use crate::error::{HarnessError, HarnessResult};
use crate::host::{HostLaunch, HostProcess};
use crate::params::{DeploymentParameters, ServerType};
use crate::ports::{PortAllocator, PortLease};
use crate::publish::{exclusion_rules, PublishRequest, Publisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployerState {
    Created,
    Deployed,
    Failed,
    Disposed,
}

impl fmt::Display for DeployerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployerState::Created => "created",
            DeployerState::Deployed => "deployed",
            DeployerState::Failed => "failed",
            DeployerState::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// Handle to a successful deployment
#[derive(Debug, Clone)]
pub struct DeploymentResult {
    /// Base URI the application answers on, always with a trailing slash
    pub application_base_uri: String,

    /// Directory the host runs from
    pub content_root: PathBuf,

    /// Cancelled if the hosted process exits before the deployment is disposed
    pub host_shutdown_token: CancellationToken,
}

#[async_trait]
pub trait ApplicationDeployer: Send {
    fn parameters(&self) -> &DeploymentParameters;

    fn state(&self) -> DeployerState;

    /// Publish (if requested), start the host and wait for it to accept
    /// connections. Only valid once, from `Created`.
    async fn deploy(&mut self) -> HarnessResult<DeploymentResult>;

    /// Stop the host, release resources and run the cleanup hook
    async fn dispose(&mut self);
}

/// Pick the deployer for the parameters' server type
pub fn create_deployer(params: DeploymentParameters, ctx: &HarnessContext) -> Box<dyn ApplicationDeployer> {
    let core = DeploymentCore::new(params, ctx);
    match core.params.server_type() {
        ServerType::Standalone | ServerType::HttpListener => Box::new(SelfHostDeployer { core }),
        ServerType::InProcessHost => Box::new(InProcessHostDeployer { core }),
    }
}

/// Runs the published application's own launcher
pub struct SelfHostDeployer {
    core: DeploymentCore,
}

#[async_trait]
impl ApplicationDeployer for SelfHostDeployer {
    fn parameters(&self) -> &DeploymentParameters {
        &self.core.params
    }

    fn state(&self) -> DeployerState {
        self.core.state
    }

    async fn deploy(&mut self) -> HarnessResult<DeploymentResult> {
        let template = self.core.config.launch.self_host.clone();
        self.core.deploy(&template).await
    }

    async fn dispose(&mut self) {
        self.core.dispose().await
    }
}

/// Loads the application into an external host process
pub struct InProcessHostDeployer {
    core: DeploymentCore,
}

#[async_trait]
impl ApplicationDeployer for InProcessHostDeployer {
    fn parameters(&self) -> &DeploymentParameters {
        &self.core.params
    }

    fn state(&self) -> DeployerState {
        self.core.state
    }

    async fn deploy(&mut self) -> HarnessResult<DeploymentResult> {
        let template = self.core.config.launch.in_process_host.clone();
        self.core.deploy(&template).await
    }

    async fn dispose(&mut self) {
        self.core.dispose().await
    }
}

/// Lifecycle shared by every strategy
struct DeploymentCore {
    params: DeploymentParameters,
    config: Arc<HarnessConfig>,
    ports: PortAllocator,
    publisher: Arc<dyn Publisher>,
    state: DeployerState,
    host: Option<HostProcess>,
    lease: Option<PortLease>,
    publish_dir: Option<TempDir>,
    cleanup_ran: bool,
}

impl DeploymentCore {
    fn new(params: DeploymentParameters, ctx: &HarnessContext) -> Self {
        Self {
            params,
            config: ctx.config.clone(),
            ports: ctx.ports.clone(),
            publisher: ctx.publisher.clone(),
            state: DeployerState::Created,
            host: None,
            lease: None,
            publish_dir: None,
            cleanup_ran: false,
        }
    }

    async fn deploy(&mut self, template: &CommandTemplate) -> HarnessResult<DeploymentResult> {
        if self.state != DeployerState::Created {
            return Err(HarnessError::InvalidStateTransition {
                from: self.state.to_string(),
                to: DeployerState::Deployed.to_string(),
            });
        }

        match self.start(template).await {
            Ok(result) => {
                self.state = DeployerState::Deployed;
                info!("Application deployed at {}", result.application_base_uri);
                Ok(result)
            }
            Err(e) => {
                self.state = DeployerState::Failed;
                error!("Deployment failed: {}", e);
                Err(e)
            }
        }
    }

    async fn start(&mut self, template: &CommandTemplate) -> HarnessResult<DeploymentResult> {
        let (base_uri, host, lease) = self.resolve_base_uri()?;
        let port = lease.port();
        self.lease = Some(lease);

        let content_root = if self.params.publish_application_before_deployment() {
            self.publish().await?
        } else {
            self.params.application_path().to_path_buf()
        };

        let vars = HashMap::from([
            ("path", content_root.display().to_string()),
            ("url", base_uri.clone()),
            ("port", port.to_string()),
            ("server", self.params.server_type().to_string()),
            ("flavor", self.params.runtime_flavor().to_string()),
            ("arch", self.params.architecture().to_string()),
        ]);
        let (program, args) = template.render(&vars);

        let startup = &self.config.startup;
        let launch = HostLaunch {
            program,
            args,
            working_dir: content_root.clone(),
            env: self.params.environment_variables().to_vec(),
            host,
            port,
            startup_timeout: startup.timeout(),
            poll_interval: startup.poll_interval(),
            shutdown_grace: startup.shutdown_grace(),
        };

        // Keep the handle before waiting so dispose() can stop a host that never got ready
        let process = self.host.insert(HostProcess::spawn(&launch)?);
        process
            .wait_until_ready(launch.startup_timeout, launch.poll_interval)
            .await?;

        Ok(DeploymentResult {
            application_base_uri: base_uri,
            content_root,
            host_shutdown_token: process.shutdown_token(),
        })
    }

    /// Base URI, host name and port lease for this deployment. Without a
    /// hint a port comes from the allocator.
    fn resolve_base_uri(&self) -> HarnessResult<(String, String, PortLease)> {
        match self.params.application_base_uri_hint() {
            Some(hint) => {
                let url = reqwest::Url::parse(hint).map_err(|e| {
                    HarnessError::DeploymentStartupFailed(format!("invalid base URL '{}': {}", hint, e))
                })?;
                let host = url
                    .host_str()
                    .ok_or_else(|| {
                        HarnessError::DeploymentStartupFailed(format!("base URL '{}' has no host", hint))
                    })?
                    .to_string();
                let port = url.port_or_known_default().ok_or_else(|| {
                    HarnessError::DeploymentStartupFailed(format!("base URL '{}' has no port", hint))
                })?;
                let lease = self.ports.reserve(port).map_err(|e| {
                    HarnessError::DeploymentStartupFailed(format!("cannot bind {}: {}", hint, e))
                })?;

                let mut base_uri = url.to_string();
                if !base_uri.ends_with('/') {
                    base_uri.push('/');
                }
                Ok((base_uri, host, lease))
            }
            None => {
                let lease = self.ports.allocate()?;
                let base_uri = format!("http://localhost:{}/", lease.port());
                Ok((base_uri, "localhost".to_string(), lease))
            }
        }
    }

    async fn publish(&mut self) -> HarnessResult<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix("storefront-publish-")
            .tempdir()?;
        let request = PublishRequest {
            application_path: self.params.application_path().to_path_buf(),
            output_dir: dir.path().join("app"),
            no_source: self.params.publish_with_no_source(),
            exclude: exclusion_rules(self.params.server_type(), &self.config.publish),
        };
        self.publish_dir = Some(dir);

        info!(
            "Publishing {} (no_source: {}, exclude: {:?})",
            request.application_path.display(),
            request.no_source,
            request.exclude
        );
        self.publisher.publish(&request).await
    }

    async fn dispose(&mut self) {
        if self.state == DeployerState::Disposed {
            return;
        }

        if let Some(mut host) = self.host.take() {
            let status = host.stop().await;
            info!("Host stopped ({:?})", status);
        }
        self.lease.take();
        if let Some(dir) = self.publish_dir.take() {
            if let Err(e) = dir.close() {
                warn!("Failed to remove published output: {}", e);
            }
        }

        self.state = DeployerState::Disposed;
        self.run_cleanup_hook();
    }

    fn run_cleanup_hook(&mut self) {
        if self.cleanup_ran {
            return;
        }
        self.cleanup_ran = true;

        if let Some(hook) = self.params.user_additional_cleanup().cloned() {
            if let Err(e) = hook(&self.params) {
                let err = HarnessError::CleanupFailed(format!("{:#}", e));
                warn!("{}", err);
            }
        }
    }
}

impl Drop for DeploymentCore {
    fn drop(&mut self) {
        if self.state != DeployerState::Disposed {
            warn!("Deployer dropped without dispose(), tearing down ({})", self.state);
            // Dropping the host hands termination to its watcher task
            self.host.take();
            self.lease.take();
            self.run_cleanup_hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteProvisioner;
    use crate::params::{Architecture, RuntimeFlavor};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context() -> HarnessContext {
        let mut config = HarnessConfig::default();
        let dir = std::env::temp_dir().join("storefront-e2e-deployer-tests");
        config.database.directory = dir.clone();
        config.startup.timeout_secs = 5;
        HarnessContext::from_config(config)
            .unwrap()
            .with_database(Arc::new(SqliteProvisioner::new(dir, "{dir}/{name}")))
    }

    fn params(server: ServerType, counter: Arc<AtomicU32>) -> DeploymentParameters {
        DeploymentParameters::builder(
            std::env::temp_dir(),
            server,
            RuntimeFlavor::Managed,
            Architecture::X64,
        )
        .user_additional_cleanup(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
    }

    #[tokio::test]
    async fn test_factory_keys_on_server_type() {
        let ctx = context();
        for server in [ServerType::Standalone, ServerType::HttpListener, ServerType::InProcessHost] {
            let deployer = create_deployer(params(server, Arc::new(AtomicU32::new(0))), &ctx);
            assert_eq!(deployer.parameters().server_type(), server);
            assert_eq!(deployer.state(), DeployerState::Created);
        }
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_runs_hook_once() {
        let ctx = context();
        let calls = Arc::new(AtomicU32::new(0));
        let mut deployer = create_deployer(params(ServerType::Standalone, calls.clone()), &ctx);

        deployer.dispose().await;
        deployer.dispose().await;

        assert_eq!(deployer.state(), DeployerState::Disposed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deploy_after_dispose_is_rejected() {
        let ctx = context();
        let mut deployer = create_deployer(params(ServerType::Standalone, Arc::new(AtomicU32::new(0))), &ctx);
        deployer.dispose().await;

        let err = deployer.deploy().await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_failing_hook_is_swallowed() {
        let ctx = context();
        let params = DeploymentParameters::builder(
            std::env::temp_dir(),
            ServerType::Standalone,
            RuntimeFlavor::Managed,
            Architecture::X64,
        )
        .user_additional_cleanup(|_| Err(anyhow::anyhow!("database server gone")))
        .build();
        let mut deployer = create_deployer(params, &ctx);

        deployer.dispose().await;
        assert_eq!(deployer.state(), DeployerState::Disposed);
    }

    #[tokio::test]
    async fn test_drop_without_dispose_runs_hook() {
        let ctx = context();
        let calls = Arc::new(AtomicU32::new(0));
        drop(create_deployer(params(ServerType::HttpListener, calls.clone()), &ctx));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_launcher_fails_startup() {
        let ctx = context();
        let calls = Arc::new(AtomicU32::new(0));
        let mut deployer = create_deployer(params(ServerType::Standalone, calls.clone()), &ctx);

        // The default self-host launcher does not exist under the temp dir
        let err = deployer.deploy().await.unwrap_err();
        assert!(matches!(err, HarnessError::DeploymentStartupFailed(_)));
        assert_eq!(deployer.state(), DeployerState::Failed);
        assert_eq!(ctx.ports.in_use(), 1);

        deployer.dispose().await;
        assert_eq!(ctx.ports.in_use(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_occupied_hint_port_fails_startup() {
        let ctx = context();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let params = DeploymentParameters::builder(
            std::env::temp_dir(),
            ServerType::Standalone,
            RuntimeFlavor::Managed,
            Architecture::X64,
        )
        .application_base_uri_hint(format!("http://localhost:{}/", port))
        .build();
        let mut deployer = create_deployer(params, &ctx);

        let err = deployer.deploy().await.unwrap_err();
        assert!(matches!(err, HarnessError::DeploymentStartupFailed(_)));
        deployer.dispose().await;
    }
}
