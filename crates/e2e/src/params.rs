//! Deployment parameters describing one test variation

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Host that serves the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    /// The published application hosts its own HTTP server
    Standalone,
    /// The published application runs on the platform HTTP listener
    HttpListener,
    /// An external host process loads the application in-process
    InProcessHost,
}

impl ServerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerType::Standalone => "standalone",
            ServerType::HttpListener => "http_listener",
            ServerType::InProcessHost => "in_process_host",
        }
    }

    /// In-process hosting runs the application tree as-is, so publish
    /// exclusion rules do not apply to it.
    pub fn is_in_process(&self) -> bool {
        matches!(self, ServerType::InProcessHost)
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime the application executes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeFlavor {
    Managed,
    Core,
    /// Lightweight runtime; the application falls back to an in-memory store
    Lightweight,
}

impl RuntimeFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeFlavor::Managed => "managed",
            RuntimeFlavor::Core => "core",
            RuntimeFlavor::Lightweight => "lightweight",
        }
    }

    /// Whether the application keeps its data in memory on this runtime,
    /// in which case no database is ever dropped.
    pub fn uses_in_memory_store(&self) -> bool {
        matches!(self, RuntimeFlavor::Lightweight)
    }
}

impl fmt::Display for RuntimeFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86,
    X64,
    Arm64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook run once after the deployment has been torn down
pub type CleanupHook = Arc<dyn Fn(&DeploymentParameters) -> anyhow::Result<()> + Send + Sync>;

/// Immutable description of one deployment
#[derive(Clone)]
pub struct DeploymentParameters {
    application_path: PathBuf,
    server_type: ServerType,
    runtime_flavor: RuntimeFlavor,
    architecture: Architecture,
    application_base_uri_hint: Option<String>,
    publish_application_before_deployment: bool,
    publish_with_no_source: bool,
    environment_variables: Vec<(String, String)>,
    user_additional_cleanup: Option<CleanupHook>,
}

impl DeploymentParameters {
    pub fn builder(
        application_path: impl Into<PathBuf>,
        server_type: ServerType,
        runtime_flavor: RuntimeFlavor,
        architecture: Architecture,
    ) -> DeploymentParametersBuilder {
        DeploymentParametersBuilder {
            params: DeploymentParameters {
                application_path: application_path.into(),
                server_type,
                runtime_flavor,
                architecture,
                application_base_uri_hint: None,
                publish_application_before_deployment: false,
                publish_with_no_source: false,
                environment_variables: Vec::new(),
                user_additional_cleanup: None,
            },
        }
    }

    pub fn application_path(&self) -> &Path {
        &self.application_path
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn runtime_flavor(&self) -> RuntimeFlavor {
        self.runtime_flavor
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn application_base_uri_hint(&self) -> Option<&str> {
        self.application_base_uri_hint.as_deref()
    }

    pub fn publish_application_before_deployment(&self) -> bool {
        self.publish_application_before_deployment
    }

    pub fn publish_with_no_source(&self) -> bool {
        self.publish_with_no_source
    }

    /// Environment overrides in insertion order
    pub fn environment_variables(&self) -> &[(String, String)] {
        &self.environment_variables
    }

    pub fn user_additional_cleanup(&self) -> Option<&CleanupHook> {
        self.user_additional_cleanup.as_ref()
    }
}

impl fmt::Debug for DeploymentParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentParameters")
            .field("application_path", &self.application_path)
            .field("server_type", &self.server_type)
            .field("runtime_flavor", &self.runtime_flavor)
            .field("architecture", &self.architecture)
            .field("application_base_uri_hint", &self.application_base_uri_hint)
            .field(
                "publish_application_before_deployment",
                &self.publish_application_before_deployment,
            )
            .field("publish_with_no_source", &self.publish_with_no_source)
            .field(
                "environment_variables",
                &self
                    .environment_variables
                    .iter()
                    .map(|(k, _)| k.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("user_additional_cleanup", &self.user_additional_cleanup.is_some())
            .finish()
    }
}

pub struct DeploymentParametersBuilder {
    params: DeploymentParameters,
}

impl DeploymentParametersBuilder {
    pub fn application_base_uri_hint(mut self, hint: impl Into<String>) -> Self {
        self.params.application_base_uri_hint = Some(hint.into());
        self
    }

    pub fn publish_application_before_deployment(mut self, publish: bool) -> Self {
        self.params.publish_application_before_deployment = publish;
        self
    }

    pub fn publish_with_no_source(mut self, no_source: bool) -> Self {
        self.params.publish_with_no_source = no_source;
        self
    }

    /// Add an environment override. A key that is already present keeps its
    /// position and takes the new value.
    pub fn environment_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.params.environment_variables.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.params.environment_variables.push((key, value)),
        }
        self
    }

    pub fn user_additional_cleanup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&DeploymentParameters) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.params.user_additional_cleanup = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> DeploymentParameters {
        self.params
    }
}
