//! Guest descriptors: YAML parsing, validation, and QEMU argv synthesis.
//!
//! A descriptor is re-read from the config directory every time an
//! instance is (re)created, so drives and NICs may change between runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

const DRIVE_INTERFACE_CHOICES: &[&str] =
    &["ide", "scsi", "sd", "mtd", "floppy", "pflash", "virtio", "none"];
const DRIVE_MEDIA_CHOICES: &[&str] = &["disk", "cdrom"];
const DRIVE_CACHE_CHOICES: &[&str] =
    &["none", "writeback", "unsafe", "directsync", "writethrough"];
const DRIVE_FORMAT_CHOICES: &[&str] = &["raw"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Drive {
    pub file: String,
    pub interface: Option<String>,
    pub media: Option<String>,
    pub snapshot: bool,
    pub cache: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Nic {
    pub bridge: Option<String>,
    pub mac_address: String,
    pub model: Option<String>,
    pub net_user_args: BTreeMap<String, String>,

    /// Allocated tap name; assigned at NIC allocation time, never parsed.
    #[serde(skip)]
    pub device: Option<String>,
}

impl Nic {
    /// Bridge name, treating an empty string the same as an absent key.
    pub fn bridge(&self) -> Option<&str> {
        self.bridge.as_deref().filter(|b| !b.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VirtualMachine {
    pub auto_start: bool,

    pub system_target: String,
    pub machine_type: Option<String>,
    pub run_as: String,
    pub enable_kvm: bool,

    pub boot: BTreeMap<String, String>,
    pub drives: Vec<Drive>,
    pub nics: Vec<Nic>,

    pub cpu_model: Option<String>,
    pub cpus: u32,
    pub ram: Option<String>,
    pub vnc_display: Option<String>,

    pub additional_args: Vec<String>,

    pub shutdown_timeout: u64,
    pub maximum_retries: u32,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        VirtualMachine {
            auto_start: false,
            system_target: "x86_64".to_string(),
            machine_type: None,
            run_as: "nobody".to_string(),
            enable_kvm: true,
            boot: BTreeMap::new(),
            drives: Vec::new(),
            nics: Vec::new(),
            cpu_model: None,
            cpus: 0,
            ram: None,
            vnc_display: None,
            additional_args: Vec::new(),
            shutdown_timeout: 60,
            maximum_retries: 5,
        }
    }
}

/// Append `,name=value` to a drive/NIC argument, falling back to `default`
/// (empty means no fallback) and validating against `choices` when given.
fn append_param(
    arg: &mut String,
    name: &str,
    param: Option<&str>,
    default: &str,
    choices: Option<&[&str]>,
    error_name: &str,
) -> Result<()> {
    let value = match param {
        None | Some("") => {
            if default.is_empty() {
                return Ok(());
            }
            default
        }
        Some(v) => v,
    };

    if let Some(choices) = choices {
        if !choices.contains(&value) {
            let joined = choices.join("', '");
            return Err(Error::Config(format!(
                "qemu: {error_name}: invalid value ({value}). valid choices are: '{joined}'"
            )));
        }
    }

    arg.push_str(&format!(",{name}={value}"));
    Ok(())
}

/// Parse and normalize an EUI-48 MAC address (`:` or `-` separated).
/// The error string is the reason reported to the user.
fn parse_mac(addr: &str) -> std::result::Result<String, String> {
    let sep = if addr.contains('-') { '-' } else { ':' };
    let octets: Vec<&str> = addr.split(sep).collect();

    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(format!("address {addr}: invalid MAC address"));
    }

    Ok(octets
        .iter()
        .map(|o| o.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(":"))
}

fn valid_ram(ram: &str) -> bool {
    let digits = ram.strip_suffix(['M', 'G']).unwrap_or(ram);
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };

    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    all_digits(int_part) && frac_part.is_none_or(all_digits)
}

fn build_cmd_drive(idx: usize, drv: &Drive) -> Result<Vec<String>> {
    if drv.file.is_empty() {
        return Err(Error::Config(format!(
            "qemu: drive[{idx}].file: parameter is required"
        )));
    }
    if !Path::new(&drv.file).is_absolute() {
        return Err(Error::Config(format!(
            "qemu: drive[{idx}].file: path must be absolute"
        )));
    }

    // commas inside the path must be doubled for QEMU's option parser
    let mut arg = format!("file={}", drv.file.replace(',', ",,"));

    append_param(
        &mut arg,
        "if",
        drv.interface.as_deref(),
        "virtio",
        Some(DRIVE_INTERFACE_CHOICES),
        &format!("drive[{idx}].interface"),
    )?;
    append_param(
        &mut arg,
        "media",
        drv.media.as_deref(),
        "disk",
        Some(DRIVE_MEDIA_CHOICES),
        &format!("drive[{idx}].media"),
    )?;
    append_param(
        &mut arg,
        "cache",
        drv.cache.as_deref(),
        "none",
        Some(DRIVE_CACHE_CHOICES),
        &format!("drive[{idx}].cache"),
    )?;
    append_param(
        &mut arg,
        "format",
        drv.format.as_deref(),
        "",
        Some(DRIVE_FORMAT_CHOICES),
        &format!("drive[{idx}].format"),
    )?;

    if drv.snapshot {
        arg.push_str(",snapshot=on");
    }

    Ok(vec!["-drive".to_string(), arg])
}

fn build_cmd_drives(drives: &[Drive]) -> Result<Vec<String>> {
    if drives.is_empty() {
        return Err(Error::Config(
            "qemu: drive: at least one drive must be defined".to_string(),
        ));
    }

    let mut rv = Vec::new();
    for (i, drv) in drives.iter().enumerate() {
        rv.extend(build_cmd_drive(i + 1, drv)?);
    }
    Ok(rv)
}

fn build_cmd_nic(idx: usize, nic: &Nic) -> Result<Vec<String>> {
    if nic.mac_address.is_empty() {
        return Err(Error::Config(format!(
            "qemu: nic[{idx}].mac_address: parameter is required"
        )));
    }

    let mac = parse_mac(&nic.mac_address).map_err(|reason| {
        Error::Config(format!(
            "qemu: nic[{idx}].mac_address: invalid value ({reason})"
        ))
    })?;

    let mut arg = String::new();

    if nic.bridge().is_some() {
        let Some(device) = nic.device.as_deref() else {
            return Err(Error::Config(format!("qemu: nic[{idx}]: missing device")));
        };
        arg.push_str(&format!("tap,ifname={device},script=no"));
    } else {
        arg.push_str("user");
        for (k, v) in &nic.net_user_args {
            arg.push_str(&format!(",{k}={v}"));
        }
    }

    arg.push_str(&format!(",mac={mac}"));

    append_param(
        &mut arg,
        "model",
        nic.model.as_deref(),
        "virtio",
        None,
        &format!("nic[{idx}].model"),
    )?;

    Ok(vec!["-nic".to_string(), arg])
}

fn build_cmd_nics(nics: &[Nic]) -> Result<Vec<String>> {
    if nics.is_empty() {
        return Err(Error::Config(
            "qemu: nic: at least one NIC must be defined".to_string(),
        ));
    }

    let mut rv = Vec::new();
    for (i, nic) in nics.iter().enumerate() {
        rv.extend(build_cmd_nic(i + 1, nic)?);
    }
    Ok(rv)
}

/// Synthesize the full QEMU argv for a descriptor. Argument order is fixed
/// and pinned by tests; `name`, `qmp_socket` and `pidfile` are skipped when
/// empty.
pub fn build_command(
    vm: &VirtualMachine,
    name: &str,
    qmp_socket: &str,
    pidfile: &str,
) -> Result<Vec<String>> {
    let mut rv = Vec::new();

    if !name.is_empty() {
        rv.push("-name".to_string());
        rv.push(name.to_string());
    }

    if !qmp_socket.is_empty() {
        rv.push("-qmp".to_string());
        rv.push(format!("unix:{qmp_socket},server,nowait"));
    }

    if !pidfile.is_empty() {
        rv.push("-daemonize".to_string());
        rv.push("-pidfile".to_string());
        rv.push(pidfile.to_string());
    }

    if let Some(machine_type) = &vm.machine_type {
        rv.push("-M".to_string());
        rv.push(machine_type.clone());
    }

    if vm.enable_kvm {
        rv.push("-enable-kvm".to_string());
    }

    if !vm.run_as.is_empty() {
        rv.push("-runas".to_string());
        rv.push(vm.run_as.clone());
    }

    if let Some(cpu_model) = &vm.cpu_model {
        rv.push("-cpu".to_string());
        rv.push(cpu_model.clone());
    }

    if vm.cpus > 0 {
        rv.push("-smp".to_string());
        rv.push(format!("cpus={}", vm.cpus));
    }

    if let Some(ram) = &vm.ram {
        if !valid_ram(ram) {
            return Err(Error::Config(format!(
                "qemu: virtualmachine: invalid RAM size ({ram})"
            )));
        }
        rv.push("-m".to_string());
        rv.push(format!("size={ram}"));
    }

    if !vm.boot.is_empty() {
        let boot: Vec<String> = vm.boot.iter().map(|(k, v)| format!("{k}={v}")).collect();
        rv.push("-boot".to_string());
        rv.push(boot.join(","));
    }

    rv.push("-display".to_string());
    match &vm.vnc_display {
        Some(vnc) => rv.push(format!("vnc={vnc}")),
        None => rv.push("none".to_string()),
    }

    rv.extend(build_cmd_drives(&vm.drives)?);
    rv.extend(build_cmd_nics(&vm.nics)?);
    rv.extend(vm.additional_args.iter().cloned());

    Ok(rv)
}

/// Parse the descriptor for `name` from the config directory, trying
/// `<name>.yml` then `<name>.yaml`. Unknown keys are ignored; absent keys
/// take their defaults.
pub fn parse_config(config_dir: &Path, name: &str) -> Result<VirtualMachine> {
    let mut cfg: Option<PathBuf> = None;
    for file in [format!("{name}.yml"), format!("{name}.yaml")] {
        let path = config_dir.join(file);
        if path.is_file() {
            cfg = Some(path);
            break;
        }
    }

    let Some(cfg) = cfg else {
        return Err(Error::ConfigNotFound(name.to_string()));
    };

    let data = fs::read_to_string(&cfg)?;
    serde_yaml_ng::from_str(&data).map_err(|source| Error::ConfigInvalid {
        name: name.to_string(),
        source,
    })
}

/// Names of all configured virtual machines: file stems of `*.yml` /
/// `*.yaml` entries (dotfiles excluded), deduplicated, in directory order.
pub fn list_configs(config_dir: &Path) -> Result<Vec<String>> {
    let mut rv: Vec<String> = Vec::new();

    for entry in fs::read_dir(config_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }

        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(stem) = config_stem(file_name) else {
            continue;
        };

        if !rv.iter().any(|n| n == stem) {
            rv.push(stem.to_string());
        }
    }

    Ok(rv)
}

fn config_stem(file_name: &str) -> Option<&str> {
    if file_name.starts_with('.') {
        return None;
    }
    let stem = file_name
        .strip_suffix(".yml")
        .or_else(|| file_name.strip_suffix(".yaml"))?;
    (!stem.is_empty()).then_some(stem)
}
