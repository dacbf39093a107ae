use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

fn default_inline_suffix() -> String {
    "gocryptfs.diriv".to_owned()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drivefs")
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mount_point: PathBuf,
    pub data_dir: PathBuf,
    pub debug: bool,
    pub allow_other: bool,
    /// Files whose basename ends in this suffix are stored inline in the
    /// metadata store instead of on the remote.
    pub inline_suffix: String,
}

impl Config {
    pub fn new(mount_point: PathBuf, data_dir: Option<PathBuf>) -> Result<Self> {
        let config = Config {
            mount_point,
            data_dir: data_dir.unwrap_or_else(default_data_dir),
            debug: false,
            allow_other: false,
            inline_suffix: default_inline_suffix(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mount_point.as_os_str().is_empty() {
            bail!("mount point must not be empty");
        }
        if self.data_dir.as_os_str().is_empty() {
            bail!("data dir must not be empty");
        }
        if self.inline_suffix.is_empty() {
            bail!("inline suffix must not be empty");
        }
        Ok(())
    }

    /// The embedded metadata store. The engine is directory-based; the
    /// directory is kept private to the owning user.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("drive.db")
    }

    /// Working copies and pending upload snapshots.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join("token.json")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        create_private_dir(&self.data_dir)?;
        create_private_dir(&self.staging_dir())?;
        Ok(())
    }
}

fn create_private_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_hang_off_data_dir() {
        let config = Config::new(PathBuf::from("/mnt/drive"), Some(PathBuf::from("/tmp/d"))).unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/tmp/d/drive.db"));
        assert_eq!(config.staging_dir(), PathBuf::from("/tmp/d/staging"));
        assert_eq!(config.token_path(), PathBuf::from("/tmp/d/token.json"));
    }

    #[test]
    fn empty_mount_point_is_rejected() {
        assert!(Config::new(PathBuf::new(), None).is_err());
    }

    #[test]
    fn ensure_dirs_creates_private_tree() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::new(
            PathBuf::from("/mnt/drive"),
            Some(tmp.path().join("datadir")),
        )
        .unwrap();
        config.ensure_dirs().unwrap();
        assert!(config.staging_dir().is_dir());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&config.data_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
