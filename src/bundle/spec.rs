//! Static runtime description shipped with every bundle.
//!
//! Two documents in the pre-1.0 runtime layout: `config.json` (platform,
//! process, root, mount points) and `runtime.json` (mount sources,
//! namespaces, devices, resources, seccomp). Only the platform varies.

use std::collections::BTreeMap;

use oci_spec::image::{Arch, Os};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;

use crate::error::Result;

pub const SPEC_VERSION: &str = "0.2.0";

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Mount point names, in the order the config lists them.
const MOUNT_POINTS: [(&str, &str); 7] = [
    ("proc", "/proc"),
    ("dev", "/dev"),
    ("devpts", "/dev/pts"),
    ("shm", "/dev/shm"),
    ("mqueue", "/dev/mqueue"),
    ("sysfs", "/sys"),
    ("cgroup", "/sys/fs/cgroup"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    /// Host platform, named the way image configs name it (`linux`, `amd64`).
    pub fn host() -> Self {
        Self {
            os: Os::default().to_string(),
            arch: Arch::default().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Process {
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Root {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MountPoint {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Linux {
    pub capabilities: Vec<String>,
}

/// `config.json`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSpec {
    pub version: String,
    pub platform: Platform,
    pub process: Process,
    pub root: Root,
    pub hostname: String,
    pub mounts: Vec<MountPoint>,
    pub linux: Linux,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rlimit {
    #[serde(rename = "type")]
    pub kind: String,
    pub hard: u64,
    pub soft: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Node type as a character code (`c` = 99)
    #[serde(rename = "type")]
    pub kind: u32,
    pub path: String,
    pub major: i64,
    pub minor: i64,
    pub permissions: String,
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Memory {
    pub swappiness: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resources {
    pub memory: Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Seccomp {
    pub default_action: String,
    pub syscalls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinuxRuntime {
    pub rlimits: Vec<Rlimit>,
    pub resources: Resources,
    pub namespaces: Vec<Namespace>,
    pub devices: Vec<Device>,
    pub seccomp: Seccomp,
}

/// `runtime.json`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSpec {
    pub mounts: BTreeMap<String, Mount>,
    pub linux: LinuxRuntime,
}

/// Both documents of a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleSpec {
    pub config: ConfigSpec,
    pub runtime: RuntimeSpec,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl BundleSpec {
    pub fn new(platform: Platform) -> Self {
        Self {
            config: config_spec(platform),
            runtime: runtime_spec(),
        }
    }

    pub fn for_host() -> Self {
        Self::new(Platform::host())
    }

    /// `config.json` and `runtime.json` bytes, tab-indented.
    pub fn documents(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((to_tabbed_json(&self.config)?, to_tabbed_json(&self.runtime)?))
    }
}

fn to_tabbed_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"\t"));
    value.serialize(&mut ser)?;
    Ok(out)
}

fn config_spec(platform: Platform) -> ConfigSpec {
    ConfigSpec {
        version: SPEC_VERSION.to_string(),
        platform,
        process: Process {
            terminal: true,
            user: User { uid: 0, gid: 0 },
            args: strings(&["sh"]),
            env: strings(&[DEFAULT_PATH, "TERM=xterm"]),
            cwd: String::new(),
        },
        root: Root {
            path: "rootfs".to_string(),
            readonly: true,
        },
        hostname: "shell".to_string(),
        mounts: MOUNT_POINTS
            .iter()
            .map(|(name, path)| MountPoint {
                name: name.to_string(),
                path: path.to_string(),
            })
            .collect(),
        linux: Linux {
            capabilities: strings(&["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"]),
        },
    }
}

fn runtime_spec() -> RuntimeSpec {
    let mount = |kind: &str, source: &str, options: Option<&[&str]>| Mount {
        kind: kind.to_string(),
        source: source.to_string(),
        options: options.map(strings),
    };

    let mounts = BTreeMap::from([
        ("proc".to_string(), mount("proc", "proc", None)),
        (
            "dev".to_string(),
            mount("tmpfs", "tmpfs", Some(&["nosuid", "strictatime", "mode=755", "size=65536k"])),
        ),
        (
            "devpts".to_string(),
            mount(
                "devpts",
                "devpts",
                Some(&["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"]),
            ),
        ),
        (
            "shm".to_string(),
            mount("tmpfs", "shm", Some(&["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"])),
        ),
        (
            "mqueue".to_string(),
            mount("mqueue", "mqueue", Some(&["nosuid", "noexec", "nodev"])),
        ),
        (
            "sysfs".to_string(),
            mount("sysfs", "sysfs", Some(&["nosuid", "noexec", "nodev"])),
        ),
        (
            "cgroup".to_string(),
            mount("cgroup", "cgroup", Some(&["nosuid", "noexec", "nodev", "relatime", "ro"])),
        ),
    ]);

    let char_device = |path: &str, major: i64, minor: i64| Device {
        kind: 'c' as u32,
        path: path.to_string(),
        major,
        minor,
        permissions: "rwm".to_string(),
        file_mode: 0o666,
        uid: 0,
        gid: 0,
    };

    RuntimeSpec {
        mounts,
        linux: LinuxRuntime {
            rlimits: vec![Rlimit {
                kind: "RLIMIT_NOFILE".to_string(),
                hard: 1024,
                soft: 1024,
            }],
            resources: Resources {
                memory: Memory { swappiness: -1 },
            },
            namespaces: ["pid", "network", "ipc", "uts", "mount"]
                .into_iter()
                .map(|kind| Namespace {
                    kind: kind.to_string(),
                })
                .collect(),
            devices: vec![
                char_device("/dev/null", 1, 3),
                char_device("/dev/random", 1, 8),
                char_device("/dev/full", 1, 7),
                char_device("/dev/tty", 5, 0),
                char_device("/dev/zero", 1, 5),
                char_device("/dev/urandom", 1, 9),
            ],
            seccomp: Seccomp {
                default_action: "SCMP_ACT_ALLOW".to_string(),
                syscalls: Vec::new(),
            },
        },
    }
}
