use crate::{Result, ShiftError, log_info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Version stamped on exported resource files. Merge-writing into an
/// existing file requires the same major version.
pub const OS_MIGRATE_VERSION: &str = "1.0.1";

/// Hardware facts captured from the source VM. Field names match the
/// discovery JSON verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestInstanceInfo {
    pub hw_processor_count: u32,
    pub hw_memtotal_mb: u64,
    #[serde(default)]
    pub hw_guest_full_name: Option<String>,
    /// "bios" or "efi" as reported by the source hypervisor.
    #[serde(default)]
    pub hw_firmware: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GuestDiskInfo {
    pub capacity_in_kb: u64,
}

/// One discovered NIC. `vlan` is the source port-group name; it doubles as
/// the destination network name when mapped networks are in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicInfo {
    pub mac: String,
    pub vlan: String,
}

/// Immutable snapshot of the source VM, produced by discovery and read-only
/// to everything in this crate. Disk order follows the map's key order so
/// repeated runs see the disks in the same sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestDescriptor {
    pub instance: GuestInstanceInfo,
    #[serde(default)]
    pub guest_disk_info: BTreeMap<String, GuestDiskInfo>,
    #[serde(default)]
    pub nics: Vec<NicInfo>,
}

impl GuestDescriptor {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            ShiftError::Config(format!("failed to read guest descriptor {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            ShiftError::Config(format!("invalid guest descriptor {}: {}", path.display(), e))
        })
    }

    pub fn total_disk_kb(&self) -> u64 {
        self.guest_disk_info.values().map(|d| d.capacity_in_kb).sum()
    }

    pub fn total_disk_mb(&self) -> u64 {
        self.total_disk_kb() / 1024
    }

    pub fn is_uefi(&self) -> bool {
        self.instance
            .hw_firmware
            .as_deref()
            .is_some_and(|fw| fw.eq_ignore_ascii_case("efi"))
    }

    /// Windows guests must be powered off at the source before conversion.
    pub fn is_windows_family(&self) -> bool {
        self.instance
            .hw_guest_full_name
            .as_deref()
            .map(str::to_lowercase)
            .is_some_and(|name| name.contains("windows") || name.contains("microsoft"))
    }
}

/// Flavor parameters in the exported resource file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlavorParams {
    pub name: String,
    pub vcpus: u32,
    pub ram: u64,
    pub disk: u64,
    pub ephemeral: u64,
    pub swap: u64,
    pub rxtx_factor: f64,
    pub is_public: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportedResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub params: FlavorParams,
}

/// Top-level shape of an exported resource file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceExport {
    pub os_migrate_version: String,
    #[serde(default)]
    pub resources: Vec<ExportedResource>,
}

impl ResourceExport {
    pub fn new() -> Self {
        Self {
            os_migrate_version: OS_MIGRATE_VERSION.to_string(),
            resources: Vec::new(),
        }
    }

    fn major(version: &str) -> &str {
        version.split('.').next().unwrap_or(version)
    }

    /// Same-major versions merge; anything else is refused so an old file is
    /// never silently rewritten into a new schema.
    pub fn version_compatible(&self, other: &str) -> bool {
        Self::major(&self.os_migrate_version) == Self::major(other)
    }
}

impl Default for ResourceExport {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the guest's requirements as an `openstack.compute.Flavor`
/// resource.
pub fn flavor_resource(flavor_name: &str, guest: &GuestDescriptor) -> ExportedResource {
    let total_disk_gb = guest.total_disk_mb() / 1024;
    ExportedResource {
        resource_type: "openstack.compute.Flavor".to_string(),
        params: FlavorParams {
            name: flavor_name.to_string(),
            vcpus: guest.instance.hw_processor_count,
            ram: guest.instance.hw_memtotal_mb,
            disk: total_disk_gb,
            ephemeral: 0,
            swap: 0,
            rxtx_factor: 1.0,
            is_public: true,
            description: None,
            extra_specs: BTreeMap::new(),
        },
    }
}

/// Merge-write a resource into a versioned YAML export file. An existing
/// file is loaded, version-checked, and a same-named resource replaced;
/// otherwise the resource is appended.
pub fn write_flavor_export(path: &Path, resource: ExportedResource) -> Result<()> {
    let mut export = if path.exists() {
        let data = fs::read_to_string(path)?;
        let existing: ResourceExport = serde_yml::from_str(&data)?;
        let ours = ResourceExport::new();
        if !ours.version_compatible(&existing.os_migrate_version) {
            return Err(ShiftError::Config(format!(
                "export file {} has os_migrate_version {}, incompatible with {}",
                path.display(),
                existing.os_migrate_version,
                OS_MIGRATE_VERSION
            )));
        }
        existing
    } else {
        ResourceExport::new()
    };

    let name = resource.params.name.clone();
    match export
        .resources
        .iter_mut()
        .find(|r| r.params.name == resource.params.name)
    {
        Some(slot) => *slot = resource,
        None => export.resources.push(resource),
    }

    let rendered = serde_yml::to_string(&export)?;
    fs::write(path, rendered)?;
    log_info!("Exported flavor '{}' to {}", name, path.display());
    Ok(())
}
