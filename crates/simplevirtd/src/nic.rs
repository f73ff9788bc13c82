//! Per-instance NIC allocation and release.

use tracing::info;

use crate::config::VirtualMachine;
use crate::error::{Error, Result};
use crate::netdev::{Netdev, TapDevice};

/// One allocated bridged NIC: the tap and the bridge it is attached to.
#[derive(Debug)]
pub struct Nic {
    pub tap: TapDevice,
    pub bridge: String,
}

/// Allocate taps for every bridged NIC in the descriptor, in order, and
/// record the assigned device name back into the descriptor. User-mode
/// NICs are skipped. Stops at the first failure: the tap whose bridge
/// attach failed is destroyed, every earlier NIC is released, and all
/// errors come back joined.
pub fn allocate(netdev: &Netdev, vm: &str, config: &mut VirtualMachine) -> Result<Vec<Nic>> {
    let owner = config.run_as.clone();

    let mut nics = Vec::new();
    let mut errs = Vec::new();

    for nic in config.nics.iter_mut() {
        let Some(bridge) = nic.bridge() else {
            continue;
        };
        let bridge = bridge.to_string();

        info!("monitor: {vm}: {bridge}: create qtap");

        let tap = match netdev.create_qtap(&owner) {
            Ok(tap) => tap,
            Err(e) => {
                errs.push(e.to_string());
                break;
            }
        };

        if let Err(e) = netdev.add_to_bridge(&bridge, &tap) {
            errs.push(e.to_string());
            if let Err(e) = netdev.destroy_qtap(&tap) {
                errs.push(e.to_string());
            }
            break;
        }

        info!("monitor: {vm}: {bridge}: {}: done", tap.name);

        nic.device = Some(tap.name.clone());
        nics.push(Nic { tap, bridge });
    }

    if !errs.is_empty() {
        if let Err(e) = cleanup(netdev, vm, &nics) {
            errs.push(e.to_string());
        }
        return Err(Error::NicCleanup(errs.join("\n")));
    }

    Ok(nics)
}

/// Release every NIC in order. Errors are accumulated so a failing tap
/// never prevents the release of the rest.
pub fn cleanup(netdev: &Netdev, vm: &str, nics: &[Nic]) -> Result<()> {
    let mut errs = Vec::new();

    for nic in nics {
        info!("monitor: {vm}: {}: {}: cleanup", nic.bridge, nic.tap.name);

        if let Err(e) = netdev.remove_from_bridge(&nic.bridge, &nic.tap) {
            errs.push(e.to_string());
        }
        if let Err(e) = netdev.destroy_qtap(&nic.tap) {
            errs.push(e.to_string());
        }
    }

    if !errs.is_empty() {
        return Err(Error::NicCleanup(errs.join("\n")));
    }

    Ok(())
}
