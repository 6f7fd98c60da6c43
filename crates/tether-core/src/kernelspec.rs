//! Installed kernel discovery.
//!
//! A kernel spec is a directory containing a `kernel.json`:
//!
//! ```json
//! {
//!   "argv": ["tether-echo-kernel", "-f", "{connection_file}"],
//!   "display_name": "Echo",
//!   "language": "text",
//!   "interrupt_mode": "message"
//! }
//! ```
//!
//! The directory name is the kernel name. When the same name exists in
//! several search directories the first one wins.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

const SPEC_FILE: &str = "kernel.json";
const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

/// How a kernel wants to be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMode {
    /// SIGINT to the kernel process.
    #[default]
    Signal,
    /// `Interrupt` request on the control channel.
    Message,
}

#[derive(Debug, Deserialize)]
struct SpecFile {
    argv: Vec<String>,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    interrupt_mode: InterruptMode,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// A launchable kernel type.
#[derive(Debug, Clone)]
pub struct KernelSpec {
    pub name: String,
    pub resource_dir: PathBuf,
    pub argv: Vec<String>,
    pub display_name: String,
    pub language: String,
    pub interrupt_mode: InterruptMode,
    pub env: HashMap<String, String>,
}

impl KernelSpec {
    /// Load the spec stored in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::Protocol(format!("bad kernel spec dir {}", dir.display())))?;
        let text = fs::read_to_string(dir.join(SPEC_FILE))?;
        let spec: SpecFile = serde_json::from_str(&text)?;

        if spec.argv.is_empty() {
            return Err(Error::Protocol(format!(
                "kernel spec '{}' has an empty argv",
                name
            )));
        }

        Ok(Self {
            display_name: if spec.display_name.is_empty() {
                name.clone()
            } else {
                spec.display_name
            },
            name,
            resource_dir: dir.to_path_buf(),
            argv: spec.argv,
            language: spec.language,
            interrupt_mode: spec.interrupt_mode,
            env: spec.env,
        })
    }

    /// Command line for a kernel bound to `connection_file`.
    ///
    /// Bare program names are resolved through `PATH`.
    pub fn command_line(&self, connection_file: &Path) -> Result<(PathBuf, Vec<String>)> {
        let connection_file = connection_file.to_string_lossy();
        let mut argv = self
            .argv
            .iter()
            .map(|arg| arg.replace(CONNECTION_FILE_PLACEHOLDER, &connection_file))
            .map(|arg| arg.replace("{resource_dir}", &self.resource_dir.to_string_lossy()));

        let program = argv.next().unwrap_or_default();
        let program = if Path::new(&program).components().count() > 1 {
            PathBuf::from(program)
        } else {
            which::which(&program).map_err(|e| Error::KernelStart {
                kernel: self.name.clone(),
                message: format!("'{}' not found: {}", program, e),
            })?
        };

        Ok((program, argv.collect()))
    }
}

/// Finds kernel specs on a search path.
#[derive(Debug, Clone)]
pub struct KernelSpecManager {
    dirs: Vec<PathBuf>,
}

impl KernelSpecManager {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Name → spec directory for everything installed.
    pub fn find_all(&self) -> BTreeMap<String, PathBuf> {
        let mut found = BTreeMap::new();
        for dir in &self.dirs {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.join(SPEC_FILE).is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                found.entry(name).or_insert(path);
            }
        }
        found
    }

    /// Sorted names of installed kernels.
    pub fn names(&self) -> Vec<String> {
        self.find_all().into_keys().collect()
    }

    /// Load a spec by name.
    pub fn get(&self, name: &str) -> Result<KernelSpec> {
        let dir = self
            .find_all()
            .remove(name)
            .ok_or_else(|| Error::KernelNotFound(name.to_string()))?;
        KernelSpec::load(&dir)
    }
}
