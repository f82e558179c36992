/// System module: opaque OS operations used by result delivery

use std::path::Path;
use std::process::Command;

/// OS-level operations the supervisor treats as opaque system calls.
///
/// Delivery code only talks to this trait so tests can substitute a fake.
pub trait SystemOps: Send + Sync {
    /// Whether the result mount point exists.
    fn mount_point_present(&self, mount_point: &Path) -> bool;

    /// Create `mount_point` and mount the volume labelled `label` on it.
    fn mount_by_label(&self, label: &str, mount_point: &Path) -> Result<(), String>;

    /// Flush filesystem buffers.
    fn sync(&self);

    /// Power the machine off.
    fn power_off(&self) -> Result<(), String>;
}

/// Default production implementation of SystemOps
pub struct SystemImpl;

impl SystemImpl {
    pub fn new() -> Self {
        SystemImpl
    }
}

impl Default for SystemImpl {
    fn default() -> Self {
        SystemImpl::new()
    }
}

/// Run a command with separate arguments, logging its output.
fn run_command(program: &str, args: &[&str]) -> Result<(), String> {
    match Command::new(program).args(args).output() {
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                log::info!("[{}] stderr: {}", program, stderr.trim());
            }
            if output.status.success() {
                Ok(())
            } else {
                Err(format!(
                    "{} {} failed with status: {:?}",
                    program,
                    args.join(" "),
                    output.status.code()
                ))
            }
        }
        Err(e) => Err(format!("Failed to execute {}: {}", program, e)),
    }
}

impl SystemOps for SystemImpl {
    fn mount_point_present(&self, mount_point: &Path) -> bool {
        mount_point.is_dir()
    }

    fn mount_by_label(&self, label: &str, mount_point: &Path) -> Result<(), String> {
        std::fs::create_dir_all(mount_point)
            .map_err(|e| format!("Failed to create {}: {}", mount_point.display(), e))?;

        let device = format!("/dev/disk/by-label/{}", label);
        let target = mount_point.to_string_lossy();
        run_command("mount", &[&device, &target])
    }

    fn sync(&self) {
        nix::unistd::sync();
    }

    fn power_off(&self) -> Result<(), String> {
        log::warn!("[System] Powering off");
        run_command("shutdown", &["-h", "now"])
    }
}
