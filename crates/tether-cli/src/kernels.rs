//! Kernels command implementation.

use tether_core::{Config, KernelSpec, KernelSpecManager};

use crate::colors;

/// Print every kernel spec found on the search path.
pub fn execute(config: &Config) {
    let manager = KernelSpecManager::new(config.kernel_dirs.clone());
    let found = manager.find_all();

    if found.is_empty() {
        println!("{}No kernels found.{}", colors::YELLOW, colors::RESET);
        println!("Searched:");
        for dir in &config.kernel_dirs {
            println!("  {}", dir.display());
        }
        return;
    }

    for (name, dir) in &found {
        match KernelSpec::load(dir) {
            Ok(spec) => println!(
                "{}{}{}  {}{}{} {}({}){}",
                colors::BOLD,
                name,
                colors::RESET,
                colors::CYAN,
                spec.display_name,
                colors::RESET,
                colors::DIM,
                dir.display(),
                colors::RESET
            ),
            Err(e) => {
                tracing::debug!("Unreadable kernel spec {}: {}", dir.display(), e);
                println!(
                    "{}{}{}  {}(unreadable: {}){}",
                    colors::BOLD,
                    name,
                    colors::RESET,
                    colors::RED,
                    e,
                    colors::RESET
                );
            }
        }
    }
}
