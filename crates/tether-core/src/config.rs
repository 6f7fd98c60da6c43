//! Runtime configuration.
//!
//! Defaults can be overridden from the environment:
//!
//! - `TETHER_KERNEL_PATH`: extra kernel spec directories, searched first
//! - `TETHER_RUNTIME_DIR`: where generated connection files are written
//! - `TETHER_STARTUP_TIMEOUT_MS`: how long a kernel may take to accept connections

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(200);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Settings shared by every session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Kernel spec directories, highest priority first.
    pub kernel_dirs: Vec<PathBuf>,
    /// Directory for generated connection files.
    pub runtime_dir: PathBuf,
    /// Bounded window for a kernel to start accepting connections.
    pub startup_timeout: Duration,
    /// Time an owned kernel gets to exit after a shutdown request.
    pub shutdown_grace: Duration,
    /// Period the host should call `Tether::tick` with.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kernel_dirs: default_kernel_dirs(),
            runtime_dir: default_runtime_dir(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(paths) = std::env::var_os("TETHER_KERNEL_PATH") {
            let mut dirs: Vec<PathBuf> = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            dirs.append(&mut config.kernel_dirs);
            config.kernel_dirs = dirs;
        }

        if let Some(dir) = std::env::var_os("TETHER_RUNTIME_DIR") {
            config.runtime_dir = PathBuf::from(dir);
        }

        if let Ok(ms) = std::env::var("TETHER_STARTUP_TIMEOUT_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => config.startup_timeout = Duration::from_millis(ms),
                Err(e) => tracing::warn!("Ignoring TETHER_STARTUP_TIMEOUT_MS={}: {}", ms, e),
            }
        }

        config
    }

    /// Search only the given kernel spec directories.
    pub fn with_kernel_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.kernel_dirs = dirs.into_iter().collect();
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Runtime directory, created if missing.
    pub fn ensure_runtime_dir(&self) -> Result<&Path> {
        fs::create_dir_all(&self.runtime_dir)?;
        Ok(&self.runtime_dir)
    }
}

fn default_kernel_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(data) = dirs::data_dir() {
        dirs.push(data.join("tether").join("kernels"));
    }
    dirs.push(PathBuf::from("/usr/local/share/tether/kernels"));
    dirs.push(PathBuf::from("/usr/share/tether/kernels"));
    dirs
}

fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tether")
}
