//! Hypervisor process launch.

use std::path::PathBuf;

use tokio::process::Command;
use tracing::info;

use crate::config::{self, VirtualMachine};
use crate::error::{Error, Result};

/// Pick the hypervisor binary for a descriptor's system target.
///
/// CentOS/RHEL install the accelerated binary as `/usr/libexec/qemu-kvm`;
/// prefer it when the target matches the host architecture. The lookup
/// runs against an augmented search path instead of mutating `PATH`.
fn find_binary(vm: &VirtualMachine) -> PathBuf {
    if vm.system_target == "x86_64" && cfg!(target_arch = "x86_64") {
        let path = std::env::var_os("PATH").unwrap_or_default();
        let search = std::env::join_paths(
            std::iter::once(PathBuf::from("/usr/libexec")).chain(std::env::split_paths(&path)),
        )
        .ok();

        if let Some(search) = search {
            if let Ok(found) = which::which_in("qemu-kvm", Some(search), "/") {
                return found;
            }
        }
    }

    PathBuf::from(format!("qemu-system-{}", vm.system_target))
}

/// Launch QEMU for a descriptor. `-daemonize` makes the spawned command
/// return once the guest process has detached and written its PID file;
/// a non-zero exit is a launch failure with the combined output attached.
pub async fn run(vm: &VirtualMachine, name: &str, qmp_socket: &str, pidfile: &str) -> Result<()> {
    let args = config::build_command(vm, name, qmp_socket, pidfile)?;
    let binary = find_binary(vm);

    info!("qemu: {name}: calling {binary:?} with arguments: {args:?}");

    let output = Command::new(&binary).args(&args).output().await.map_err(|e| {
        Error::LaunchFailed {
            name: name.to_string(),
            binary: binary.display().to_string(),
            detail: e.to_string(),
        }
    })?;

    if !output.status.success() {
        let mut detail = output.status.to_string();
        for stream in [&output.stdout, &output.stderr] {
            let text = String::from_utf8_lossy(stream);
            let text = text.trim();
            if !text.is_empty() {
                detail.push_str("\n\n");
                detail.push_str(text);
            }
        }

        return Err(Error::LaunchFailed {
            name: name.to_string(),
            binary: binary.display().to_string(),
            detail,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_binary_falls_back_to_target() {
        let vm = VirtualMachine {
            system_target: "aarch64".to_string(),
            ..VirtualMachine::default()
        };
        assert_eq!(find_binary(&vm), PathBuf::from("qemu-system-aarch64"));
    }

    #[tokio::test]
    async fn test_run_reports_launch_failure() {
        let vm = VirtualMachine {
            system_target: "definitely-missing-target".to_string(),
            drives: vec![crate::config::Drive {
                file: "/foo.img".to_string(),
                ..Default::default()
            }],
            nics: vec![crate::config::Nic {
                mac_address: "52:54:00:fc:70:3b".to_string(),
                ..Default::default()
            }],
            ..VirtualMachine::default()
        };

        let err = run(&vm, "bola", "", "").await.unwrap_err();
        assert!(matches!(err, Error::LaunchFailed { .. }), "got: {err}");
    }
}
