//! Persistent TAP devices and bridge membership, via raw ioctls.
//!
//! Interface-name selection races with the kernel namespace, so every
//! allocation runs under the `Netdev` value's lock with a fresh interface
//! enumeration.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::if_nametoindex;
use nix::unistd::{Group, User};
use tracing::debug;

use crate::error::{Error, Result};

// TUN device ioctls (linux/if_tun.h) and bridge ioctls (linux/sockios.h).
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;
const TUNSETOWNER: libc::c_ulong = 0x4004_54cc;
const TUNSETGROUP: libc::c_ulong = 0x4004_54ce;
const SIOCBRADDIF: libc::c_ulong = 0x89a2;
const SIOCBRDELIF: libc::c_ulong = 0x89a3;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Group owning every tap the daemon creates.
pub const TAP_GROUP: &str = "simplevirt";

const TAP_PREFIX: &str = "qtap";

/// An allocated persistent tap interface.
#[derive(Debug, Clone)]
pub struct TapDevice {
    pub name: String,
    pub index: u32,
}

/// Tap allocator. Owns the process-wide allocation lock; held by the
/// supervisor, not stored as a global.
pub struct Netdev {
    alloc: Mutex<()>,
}

impl Netdev {
    pub fn new() -> Self {
        Netdev {
            alloc: Mutex::new(()),
        }
    }

    /// Create a persistent tap owned by `owner` (uid) and the
    /// `simplevirt` group (gid), named `qtap{i}` for the smallest free
    /// `i`. Persistence is set by the last ioctl so any earlier failure
    /// leaves the device tied to the fd and auto-cleaned on close.
    pub fn create_qtap(&self, owner: &str) -> Result<TapDevice> {
        if owner.is_empty() {
            return Err(Error::NetDev(
                "virtual machine owner not defined".to_string(),
            ));
        }

        let _guard = self.alloc.lock().unwrap();

        let name = next_qtap()?;

        let user = User::from_name(owner)
            .map_err(|e| Error::NetDev(format!("failed to look up user {owner}: {e}")))?
            .ok_or_else(|| Error::NetDev(format!("unknown user: {owner}")))?;
        let group = Group::from_name(TAP_GROUP)
            .map_err(|e| Error::NetDev(format!("failed to look up group {TAP_GROUP}: {e}")))?
            .ok_or_else(|| Error::NetDev(format!("unknown group: {TAP_GROUP}")))?;

        let tun = open_tun()?;
        let fd = tun.as_raw_fd();

        let mut ifr = ifreq_with_name(&name)?;
        ifr.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI;

        ioctl_ifreq(fd, TUNSETIFF, "TUNSETIFF", &mut ifr)?;
        ioctl_int(fd, TUNSETOWNER, "TUNSETOWNER", user.uid.as_raw() as libc::c_int)?;
        ioctl_int(fd, TUNSETGROUP, "TUNSETGROUP", group.gid.as_raw() as libc::c_int)?;
        // must stay last, see above
        ioctl_int(fd, TUNSETPERSIST, "TUNSETPERSIST", 1)?;

        let index = if_nametoindex(name.as_str())
            .map_err(|e| Error::NetDev(format!("{name}: {e}")))?;

        debug!("netdev: created tap {name} (index {index})");

        Ok(TapDevice { name, index })
    }

    /// Clear persistence on a tap; the kernel removes the device once the
    /// controlling fd closes.
    pub fn destroy_qtap(&self, tap: &TapDevice) -> Result<()> {
        let tun = open_tun()?;
        let fd = tun.as_raw_fd();

        let mut ifr = ifreq_with_name(&tap.name)?;
        ifr.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI;

        ioctl_ifreq(fd, TUNSETIFF, "TUNSETIFF", &mut ifr)?;
        ioctl_int(fd, TUNSETPERSIST, "TUNSETPERSIST", 0)?;

        debug!("netdev: destroyed tap {}", tap.name);

        Ok(())
    }

    /// Attach a tap to a bridge and bring it up promiscuous.
    pub fn add_to_bridge(&self, bridge: &str, tap: &TapDevice) -> Result<()> {
        let sock = control_socket()?;

        if_nametoindex(bridge).map_err(|e| Error::NetDev(format!("{bridge}: {e}")))?;

        let mut ifr = ifreq_with_name(bridge)?;
        ifr.ifr_ifru.ifru_ifindex = tap.index as libc::c_int;
        ioctl_ifreq(sock.as_raw_fd(), SIOCBRADDIF, "SIOCBRADDIF", &mut ifr)?;

        set_link_up_down(sock.as_raw_fd(), &tap.name, true)
    }

    /// Bring a tap down and detach it from its bridge.
    pub fn remove_from_bridge(&self, bridge: &str, tap: &TapDevice) -> Result<()> {
        let sock = control_socket()?;

        set_link_up_down(sock.as_raw_fd(), &tap.name, false)?;

        let mut ifr = ifreq_with_name(bridge)?;
        ifr.ifr_ifru.ifru_ifindex = tap.index as libc::c_int;
        ioctl_ifreq(sock.as_raw_fd(), SIOCBRDELIF, "SIOCBRDELIF", &mut ifr)
    }
}

fn open_tun() -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(|e| Error::NetDev(format!("failed to open /dev/net/tun: {e}")))
}

fn control_socket() -> Result<OwnedFd> {
    // SAFETY: socket() returns a fresh descriptor or -1.
    let fd = unsafe { libc::socket(libc::AF_LOCAL, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::NetDev(format!(
            "failed to open control socket: {}",
            io::Error::last_os_error()
        )));
    }
    // SAFETY: fd is valid and owned by nothing else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ifreq_with_name(name: &str) -> Result<libc::ifreq> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(Error::NetDev(format!("interface name too long: {name}")));
    }

    // SAFETY: ifreq is plain old data; an all-zero value is valid.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

fn ioctl_ifreq(fd: RawFd, request: libc::c_ulong, op: &'static str, ifr: &mut libc::ifreq) -> Result<()> {
    // SAFETY: ifr points to a properly initialized ifreq for the request.
    if unsafe { libc::ioctl(fd, request, ifr as *mut libc::ifreq) } < 0 {
        return Err(Error::Ioctl {
            op,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn ioctl_int(fd: RawFd, request: libc::c_ulong, op: &'static str, arg: libc::c_int) -> Result<()> {
    // SAFETY: these TUN requests take a plain integer argument.
    if unsafe { libc::ioctl(fd, request, arg) } < 0 {
        return Err(Error::Ioctl {
            op,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Read current interface flags, set or clear UP (plus PROMISC when going
/// up), and write them back.
fn set_link_up_down(fd: RawFd, name: &str, up: bool) -> Result<()> {
    let mut ifr = ifreq_with_name(name)?;
    ioctl_ifreq(fd, libc::SIOCGIFFLAGS, "SIOCGIFFLAGS", &mut ifr)?;

    // SAFETY: SIOCGIFFLAGS filled the flags member of the union.
    unsafe {
        if up {
            ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_PROMISC) as libc::c_short;
        } else {
            ifr.ifr_ifru.ifru_flags &= !(libc::IFF_UP as libc::c_short);
        }
    }

    ioctl_ifreq(fd, libc::SIOCSIFFLAGS, "SIOCSIFFLAGS", &mut ifr)
}

/// Smallest free `qtap{i}` name, against a fresh interface enumeration.
fn next_qtap() -> Result<String> {
    let addrs = getifaddrs().map_err(|e| Error::NetDev(format!("getifaddrs: {e}")))?;

    let mut ids: Vec<u32> = addrs
        .filter_map(|a| qtap_id(&a.interface_name))
        .collect();
    ids.sort_unstable();
    ids.dedup();

    pick_free_qtap(&ids)
}

fn qtap_id(name: &str) -> Option<u32> {
    name.strip_prefix(TAP_PREFIX)?.parse().ok()
}

fn pick_free_qtap(ids: &[u32]) -> Result<String> {
    for i in 0..=ids.len() as u32 {
        if !ids.contains(&i) {
            return Ok(format!("{TAP_PREFIX}{i}"));
        }
    }

    Err(Error::NetDev(
        "failed to find next available qtap interface".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qtap_id() {
        assert_eq!(qtap_id("qtap0"), Some(0));
        assert_eq!(qtap_id("qtap12"), Some(12));
        assert_eq!(qtap_id("qtap"), None);
        assert_eq!(qtap_id("eth0"), None);
        assert_eq!(qtap_id("qtapx"), None);
    }

    #[test]
    fn test_pick_free_qtap_empty() {
        assert_eq!(pick_free_qtap(&[]).unwrap(), "qtap0");
    }

    #[test]
    fn test_pick_free_qtap_sequential() {
        assert_eq!(pick_free_qtap(&[0, 1, 2]).unwrap(), "qtap3");
    }

    #[test]
    fn test_pick_free_qtap_fills_gap() {
        assert_eq!(pick_free_qtap(&[0, 2, 3]).unwrap(), "qtap1");
        assert_eq!(pick_free_qtap(&[1, 2]).unwrap(), "qtap0");
    }

    #[test]
    fn test_ifreq_name_too_long() {
        assert!(ifreq_with_name("qtap000000000000000000").is_err());
        assert!(ifreq_with_name("qtap0").is_ok());
    }
}
