//! Declarative YAML variation matrices

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::params::{Architecture, RuntimeFlavor, ServerType};

/// One combination of server, runtime, architecture, base URL and
/// source-inclusion mode
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variation {
    pub server_type: ServerType,

    pub runtime_flavor: RuntimeFlavor,

    pub architecture: Architecture,

    /// Base URL the application should listen on (None = allocate a port)
    #[serde(default)]
    pub application_base_url: Option<String>,

    /// Publish without source files
    #[serde(default)]
    pub no_source: bool,

    /// Tags for filtering variations
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Variation {
    pub fn new(
        server_type: ServerType,
        runtime_flavor: RuntimeFlavor,
        architecture: Architecture,
        application_base_url: Option<&str>,
        no_source: bool,
    ) -> Self {
        Self {
            server_type,
            runtime_flavor,
            architecture,
            application_base_url: application_base_url.map(String::from),
            no_source,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Identity used in logs and reports, e.g. `Publish:standalone:managed:x64:false`
    pub fn name(&self) -> String {
        format!(
            "Publish:{}:{}:{}:{}",
            self.server_type, self.runtime_flavor, self.architecture, self.no_source
        )
    }

    fn identity(&self) -> (ServerType, RuntimeFlavor, Architecture, Option<&str>, bool) {
        (
            self.server_type,
            self.runtime_flavor,
            self.architecture,
            self.application_base_url.as_deref(),
            self.no_source,
        )
    }

    fn explicit_port(&self) -> Option<u16> {
        self.application_base_url
            .as_deref()
            .and_then(|u| reqwest::Url::parse(u).ok())
            .and_then(|u| u.port_or_known_default())
    }
}

impl fmt::Display for Variation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A set of variations parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariationMatrix {
    #[serde(default)]
    pub name: String,

    pub variations: Vec<Variation>,
}

impl Default for VariationMatrix {
    /// The stock publish-and-run matrix, ports 5025-5039 reserved for it
    fn default() -> Self {
        Self {
            name: "publish-and-run".to_string(),
            variations: vec![
                Variation::new(
                    ServerType::HttpListener,
                    RuntimeFlavor::Managed,
                    Architecture::X64,
                    Some("http://localhost:5025/"),
                    false,
                )
                .with_tags(&["x64"]),
                Variation::new(
                    ServerType::InProcessHost,
                    RuntimeFlavor::Managed,
                    Architecture::X86,
                    Some("http://localhost:5027/"),
                    false,
                )
                .with_tags(&["x86"]),
                Variation::new(
                    ServerType::InProcessHost,
                    RuntimeFlavor::Managed,
                    Architecture::X86,
                    Some("http://localhost:5028/"),
                    true,
                )
                .with_tags(&["x86"]),
                Variation::new(
                    ServerType::Standalone,
                    RuntimeFlavor::Lightweight,
                    Architecture::X86,
                    Some("http://localhost:5029/"),
                    false,
                )
                .with_tags(&["x86", "lightweight"]),
                Variation::new(
                    ServerType::Standalone,
                    RuntimeFlavor::Lightweight,
                    Architecture::X86,
                    Some("http://localhost:5030/"),
                    true,
                )
                .with_tags(&["x86", "lightweight"]),
            ],
        }
    }
}

impl VariationMatrix {
    /// Parse a matrix from YAML string
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        let matrix: Self = serde_yaml::from_str(yaml)?;
        matrix.validate()?;
        Ok(matrix)
    }

    /// Parse a matrix from a YAML file
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load every YAML matrix under a directory and merge them
    pub fn load_all(dir: &Path) -> HarnessResult<Self> {
        let mut variations = Vec::new();

        let mut files: Vec<_> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        files.sort();

        for path in files {
            variations.extend(Self::from_file(&path)?.variations);
        }

        let merged = Self {
            name: dir.display().to_string(),
            variations,
        };
        merged.validate()?;
        Ok(merged)
    }

    /// Variations carrying `tag`
    pub fn filter_by_tag(&self, tag: &str) -> Vec<&Variation> {
        self.variations
            .iter()
            .filter(|v| v.tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Reject duplicate variations and explicit ports shared by two variations
    pub fn validate(&self) -> HarnessResult<()> {
        let mut seen = HashSet::new();
        let mut ports = HashSet::new();

        for variation in &self.variations {
            if !seen.insert(variation.identity()) {
                return Err(HarnessError::Config(format!(
                    "duplicate variation {}",
                    variation
                )));
            }
            if let Some(url) = &variation.application_base_url {
                let port = variation.explicit_port().ok_or_else(|| {
                    HarnessError::Config(format!("invalid base URL '{}' in {}", url, variation))
                })?;
                if !ports.insert(port) {
                    return Err(HarnessError::Config(format!(
                        "port {} is used by more than one variation",
                        port
                    )));
                }
            }
        }
        Ok(())
    }
}
