//! Publish step: turn an application tree into a deployable directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::{CommandTemplate, PublishConfig, PublisherKind};
use crate::error::{HarnessError, HarnessResult};
use crate::params::ServerType;

/// What to publish and where
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub application_path: PathBuf,
    pub output_dir: PathBuf,
    /// Ship only published output, no source files
    pub no_source: bool,
    /// File patterns (`*.ext` or exact names) that must not be published
    pub exclude: Vec<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish and return the directory the host should run from
    async fn publish(&self, request: &PublishRequest) -> HarnessResult<PathBuf>;
}

/// Exclusion patterns for a server type. Launcher scripts only make sense
/// for in-process hosting, every other host must not see them.
pub fn exclusion_rules(server_type: ServerType, config: &PublishConfig) -> Vec<String> {
    if server_type.is_in_process() {
        Vec::new()
    } else {
        vec![format!("*.{}", config.launcher_script_extension)]
    }
}

pub fn publisher_from_config(config: &PublishConfig) -> HarnessResult<Arc<dyn Publisher>> {
    match config.kind {
        PublisherKind::Directory => Ok(Arc::new(DirectoryPublisher::new(
            config.source_extensions.clone(),
        ))),
        PublisherKind::Command => {
            let template = config.command.clone().ok_or_else(|| {
                HarnessError::Config("publish.command is required for command publishing".into())
            })?;
            Ok(Arc::new(CommandPublisher::new(
                template,
                config.no_source_args.clone(),
                config.exclude_flag.clone(),
            )))
        }
    }
}

pub(crate) fn matches_pattern(pattern: &str, file_name: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(ext) => Path::new(file_name)
            .extension()
            .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
            .unwrap_or(false),
        None => pattern == file_name,
    }
}

/// Copies the application tree into the output directory
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    source_extensions: Vec<String>,
}

impl DirectoryPublisher {
    pub fn new(source_extensions: Vec<String>) -> Self {
        Self { source_extensions }
    }

    fn is_source(&self, file_name: &str) -> bool {
        self.source_extensions
            .iter()
            .any(|ext| matches_pattern(&format!("*.{}", ext), file_name))
    }

    fn copy_tree(&self, request: &PublishRequest) -> HarnessResult<usize> {
        std::fs::create_dir_all(&request.output_dir)?;
        let mut copied = 0;

        for entry in WalkDir::new(&request.application_path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let relative = match entry.path().strip_prefix(&request.application_path) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
                _ => continue,
            };
            let target = request.output_dir.join(&relative);

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
                continue;
            }

            let file_name = entry.file_name().to_string_lossy();
            if request.exclude.iter().any(|p| matches_pattern(p, &file_name)) {
                debug!("Excluded {}", relative.display());
                continue;
            }
            if request.no_source && self.is_source(&file_name) {
                debug!("Skipped source file {}", relative.display());
                continue;
            }

            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }

        Ok(copied)
    }
}

#[async_trait]
impl Publisher for DirectoryPublisher {
    async fn publish(&self, request: &PublishRequest) -> HarnessResult<PathBuf> {
        if !request.application_path.is_dir() {
            return Err(HarnessError::Publish(format!(
                "application path {} is not a directory",
                request.application_path.display()
            )));
        }

        let publisher = self.clone();
        let req = request.clone();
        let copied = tokio::task::spawn_blocking(move || publisher.copy_tree(&req))
            .await
            .map_err(|e| HarnessError::Publish(format!("publish task failed: {}", e)))??;

        info!(
            "Published {} file(s) to {}",
            copied,
            request.output_dir.display()
        );
        Ok(request.output_dir.clone())
    }
}

/// Delegates publishing to an external tool
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    template: CommandTemplate,
    no_source_args: Vec<String>,
    exclude_flag: String,
}

impl CommandPublisher {
    pub fn new(template: CommandTemplate, no_source_args: Vec<String>, exclude_flag: impl Into<String>) -> Self {
        Self {
            template,
            no_source_args,
            exclude_flag: exclude_flag.into(),
        }
    }

    pub fn build_args(&self, request: &PublishRequest) -> (String, Vec<String>) {
        let vars = HashMap::from([
            ("app", request.application_path.display().to_string()),
            ("out", request.output_dir.display().to_string()),
        ]);
        let (program, mut args) = self.template.render(&vars);

        if request.no_source {
            args.extend(self.no_source_args.iter().cloned());
        }
        for pattern in &request.exclude {
            args.push(self.exclude_flag.clone());
            args.push(pattern.clone());
        }

        (program, args)
    }
}

#[async_trait]
impl Publisher for CommandPublisher {
    async fn publish(&self, request: &PublishRequest) -> HarnessResult<PathBuf> {
        let (program, args) = self.build_args(request);
        debug!("Publish command: {} {}", program, args.join(" "));

        let output = Command::new(&program)
            .args(&args)
            .current_dir(&request.application_path)
            .output()
            .await
            .map_err(|e| HarnessError::Publish(format!("failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(HarnessError::Publish(format!(
                "{} exited with {}:\nstdout: {}\nstderr: {}",
                program, output.status, stdout, stderr
            )));
        }

        info!("Published application to {}", request.output_dir.display());
        Ok(request.output_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample_app(root: &Path) -> PathBuf {
        let app = root.join("app");
        fs::create_dir_all(app.join("wwwroot/Content")).unwrap();
        fs::create_dir_all(app.join("Controllers")).unwrap();
        fs::write(app.join("web"), "#!/bin/sh\n").unwrap();
        fs::write(app.join("web.cmd"), "@echo off\n").unwrap();
        fs::write(app.join("Controllers/HomeController.cs"), "class Home {}").unwrap();
        fs::write(app.join("wwwroot/Content/site.css"), "body {}").unwrap();
        app
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("*.cmd", "web.cmd"));
        assert!(matches_pattern("*.cmd", "WEB.CMD"));
        assert!(!matches_pattern("*.cmd", "web.cmdx"));
        assert!(matches_pattern("project.lock", "project.lock"));
        assert!(!matches_pattern("project.lock", "project.json"));
    }

    #[test]
    fn test_exclusion_rules_skip_in_process_host() {
        let config = PublishConfig::default();
        assert_eq!(exclusion_rules(ServerType::Standalone, &config), vec!["*.cmd"]);
        assert_eq!(exclusion_rules(ServerType::HttpListener, &config), vec!["*.cmd"]);
        assert!(exclusion_rules(ServerType::InProcessHost, &config).is_empty());
    }

    #[tokio::test]
    async fn test_directory_publish_honors_exclusions_and_no_source() {
        let dir = tempfile::tempdir().unwrap();
        let app = sample_app(dir.path());
        let out = dir.path().join("out");
        let publisher = DirectoryPublisher::new(vec!["cs".to_string()]);

        let published = publisher
            .publish(&PublishRequest {
                application_path: app,
                output_dir: out.clone(),
                no_source: true,
                exclude: vec!["*.cmd".to_string()],
            })
            .await
            .unwrap();

        assert_eq!(published, out);
        assert!(out.join("web").exists());
        assert!(out.join("wwwroot/Content/site.css").exists());
        assert!(!out.join("web.cmd").exists());
        assert!(!out.join("Controllers/HomeController.cs").exists());
    }

    #[tokio::test]
    async fn test_directory_publish_keeps_source_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let app = sample_app(dir.path());
        let out = dir.path().join("out");

        DirectoryPublisher::new(vec!["cs".to_string()])
            .publish(&PublishRequest {
                application_path: app,
                output_dir: out.clone(),
                no_source: false,
                exclude: Vec::new(),
            })
            .await
            .unwrap();

        assert!(out.join("web.cmd").exists());
        assert!(out.join("Controllers/HomeController.cs").exists());
    }

    #[tokio::test]
    async fn test_missing_application_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectoryPublisher::new(Vec::new())
            .publish(&PublishRequest {
                application_path: dir.path().join("nope"),
                output_dir: dir.path().join("out"),
                no_source: false,
                exclude: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Publish(_)));
    }

    #[test]
    fn test_command_publisher_args() {
        let publisher = CommandPublisher::new(
            CommandTemplate::new("storefront-publish", &["{app}", "--out", "{out}"]),
            vec!["--no-source".to_string()],
            "--exclude",
        );
        let (program, args) = publisher.build_args(&PublishRequest {
            application_path: PathBuf::from("/src/app"),
            output_dir: PathBuf::from("/tmp/out"),
            no_source: true,
            exclude: vec!["*.cmd".to_string()],
        });
        assert_eq!(program, "storefront-publish");
        assert_eq!(
            args,
            vec!["/src/app", "--out", "/tmp/out", "--no-source", "--exclude", "*.cmd"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_publisher_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = CommandPublisher::new(
            CommandTemplate::new("sh", &["-c", "echo broken >&2; exit 3"]),
            Vec::new(),
            "--exclude",
        );
        let err = publisher
            .publish(&PublishRequest {
                application_path: dir.path().to_path_buf(),
                output_dir: dir.path().join("out"),
                no_source: false,
                exclude: Vec::new(),
            })
            .await
            .unwrap_err();
        match err {
            HarnessError::Publish(msg) => assert!(msg.contains("broken")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
