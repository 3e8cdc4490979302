//! Per-variation database provisioning

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::{substitute, DatabaseConfig};
use crate::error::HarnessResult;

/// Opaque name for a fresh variation database: a v4 UUID without hyphens
pub fn generate_database_name() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Backing store the application under test connects to
pub trait DatabaseProvisioner: Send + Sync {
    /// Connection string the application should use for `name`
    fn connection_string(&self, name: &str) -> String;

    /// Create the database and return its connection string
    fn provision(&self, name: &str) -> HarnessResult<String>;

    /// Remove the database. Removing one that does not exist is not an error.
    fn drop_database(&self, name: &str) -> HarnessResult<()>;
}

/// One SQLite file per variation under a shared directory
#[derive(Debug, Clone)]
pub struct SqliteProvisioner {
    directory: PathBuf,
    template: String,
}

impl SqliteProvisioner {
    pub fn new(directory: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            template: template.into(),
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(&config.directory, &config.connection_string_template)
    }

    pub fn database_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.db", name))
    }
}

impl DatabaseProvisioner for SqliteProvisioner {
    fn connection_string(&self, name: &str) -> String {
        let vars = HashMap::from([
            ("dir", self.directory.display().to_string()),
            ("name", name.to_string()),
        ]);
        substitute(&self.template, &vars)
    }

    fn provision(&self, name: &str) -> HarnessResult<String> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.database_path(name);
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA user_version = 1;")?;
        debug!("Provisioned database {}", path.display());
        Ok(self.connection_string(name))
    }

    fn drop_database(&self, name: &str) -> HarnessResult<()> {
        let path = self.database_path(name);
        let mut removed = false;
        for file in [path.clone(), sidecar(&path, "-wal"), sidecar(&path, "-shm")] {
            match std::fs::remove_file(&file) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed {
            info!("Dropped database '{}'", name);
        } else {
            debug!("Database '{}' did not exist", name);
        }
        Ok(())
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_are_hyphen_free_and_distinct() {
        let names: HashSet<String> = (0..256).map(|_| generate_database_name()).collect();
        assert_eq!(names.len(), 256);
        for name in &names {
            assert_eq!(name.len(), 32);
            assert!(!name.contains('-'));
        }
    }

    #[test]
    fn test_connection_string_template() {
        let provisioner = SqliteProvisioner::new("/var/db", "Data Source={dir}/{name}.db;Cache=Shared");
        assert_eq!(
            provisioner.connection_string("abc"),
            "Data Source=/var/db/abc.db;Cache=Shared"
        );
    }

    #[test]
    fn test_provision_then_drop() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = SqliteProvisioner::new(dir.path(), "Data Source={dir}/{name}.db");
        let name = generate_database_name();

        let conn_str = provisioner.provision(&name).unwrap();
        assert!(conn_str.contains(&name));
        assert!(provisioner.database_path(&name).exists());

        provisioner.drop_database(&name).unwrap();
        assert!(!provisioner.database_path(&name).exists());
        assert!(!sidecar(&provisioner.database_path(&name), "-wal").exists());

        // Dropping again is harmless
        provisioner.drop_database(&name).unwrap();
    }
}
