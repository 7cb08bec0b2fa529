use crate::convert::{ConversionOptions, DestinationOutputSpec};
use crate::vmware::{Endpoint, SourceConnectionSpec};
use crate::{Result, ShiftError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level `ShiftFile` configuration. Everything is strongly typed and
/// validated up front; nothing reaches command construction unchecked.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShiftConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceConfig {
    pub host: String,
    pub username: String,
    /// File the source password is read from; never stored inline.
    pub password_file: Option<PathBuf>,
    pub datacenter: Option<String>,
    pub cluster: Option<String>,
    pub esxi_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_vddk_libdir")]
    pub vddk_libdir: PathBuf,
    #[serde(default)]
    pub vddk_thumbprint: String,
    #[serde(default)]
    pub conversion_host_id: String,
    #[serde(default = "default_conversion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_vddk_libdir() -> PathBuf {
    PathBuf::from("/usr/lib/vmware-vix-disklib")
}

fn default_conversion_timeout_secs() -> u64 {
    4 * 3600
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            vddk_libdir: default_vddk_libdir(),
            vddk_thumbprint: String::new(),
            conversion_host_id: String::new(),
            timeout_secs: default_conversion_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DestinationConfig {
    #[serde(default)]
    pub security_groups: Vec<String>,
    pub fallback_network: Option<String>,
    #[serde(default)]
    pub mapped_networks: bool,
    pub volume_type: Option<String>,
    pub volume_az: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Where migration records live; defaults to the per-user data dir.
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub cutover: bool,
    #[serde(default)]
    pub skip_conversion: bool,
    #[serde(default)]
    pub adopt_stack: bool,
    #[serde(default)]
    pub create_flavor: bool,
}

impl ShiftConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ShiftError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: ShiftConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Eager validation of everything a migration run will need.
    pub fn validate(&self) -> Result<()> {
        if self.source.host.is_empty() {
            return Err(ShiftError::Config("source.host is required".into()));
        }
        if self.source.username.is_empty() {
            return Err(ShiftError::Config("source.username is required".into()));
        }
        if self.source.datacenter.is_some() && self.source.esxi_host.is_none() {
            return Err(ShiftError::Config(
                "source.esxi_host is required when source.datacenter is set".into(),
            ));
        }
        if !self.migration.skip_conversion {
            if self.conversion.vddk_thumbprint.is_empty() {
                return Err(ShiftError::Config(
                    "conversion.vddk_thumbprint is required".into(),
                ));
            }
            if self.conversion.conversion_host_id.is_empty() {
                return Err(ShiftError::Config(
                    "conversion.conversion_host_id is required".into(),
                ));
            }
        }
        if !self.destination.mapped_networks
            && self
                .destination
                .fallback_network
                .as_deref()
                .unwrap_or("")
                .is_empty()
        {
            return Err(ShiftError::Config(
                "destination.fallback_network is required when mapped_networks is false".into(),
            ));
        }
        Ok(())
    }

    /// The source connection as the conversion invoker sees it. Direct ESXi
    /// unless a datacenter is configured.
    pub fn source_spec(&self) -> SourceConnectionSpec {
        let endpoint = match (&self.source.datacenter, &self.source.esxi_host) {
            (Some(datacenter), Some(esxi_host)) => Endpoint::Vcenter {
                datacenter: datacenter.clone(),
                cluster: self.source.cluster.clone(),
                esxi_host: esxi_host.clone(),
            },
            _ => Endpoint::Esxi,
        };
        SourceConnectionSpec {
            host: self.source.host.clone(),
            username: self.source.username.clone(),
            endpoint,
        }
    }

    pub fn destination_spec(&self) -> DestinationOutputSpec {
        DestinationOutputSpec {
            vddk_libdir: self.conversion.vddk_libdir.clone(),
            vddk_thumbprint: self.conversion.vddk_thumbprint.clone(),
            conversion_host_id: self.conversion.conversion_host_id.clone(),
        }
    }

    pub fn conversion_options(&self) -> ConversionOptions {
        ConversionOptions {
            password_file: self
                .source
                .password_file
                .clone()
                .unwrap_or_else(|| PathBuf::from("/tmp/passwd")),
            timeout: Duration::from_secs(self.conversion.timeout_secs),
            extra_args: self.conversion.extra_args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[source]
host = "vcenter.lab"
username = "administrator@vsphere.local"
password_file = "/etc/vmshift/passwd"
datacenter = "DC1"
esxi_host = "esxi1.lab"

[conversion]
vddk_thumbprint = "AA:BB:CC"
conversion_host_id = "chost-1"
timeout_secs = 7200

[destination]
security_groups = ["default"]
fallback_network = "provider"
volume_type = "fast"

[migration]
cutover = true
"#;

    #[test]
    fn parses_and_validates_a_full_config() {
        let config = ShiftConfig::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.source.host, "vcenter.lab");
        assert!(config.migration.cutover);
        assert_eq!(config.conversion.timeout_secs, 7200);
        assert_eq!(
            config.conversion.vddk_libdir,
            PathBuf::from("/usr/lib/vmware-vix-disklib")
        );
    }

    #[test]
    fn source_spec_uses_vcenter_when_datacenter_set() {
        let config = ShiftConfig::from_str(SAMPLE).unwrap();
        let uri = config.source_spec().connection_uri().unwrap();
        assert!(uri.starts_with("vpx://administrator%40vsphere.local@vcenter.lab/DC1/"));
    }

    #[test]
    fn missing_thumbprint_fails_validation_unless_skipping_conversion() {
        let mut config = ShiftConfig::from_str(SAMPLE).unwrap();
        config.conversion.vddk_thumbprint.clear();
        assert!(matches!(config.validate(), Err(ShiftError::Config(_))));

        config.migration.skip_conversion = true;
        config.validate().unwrap();
    }

    #[test]
    fn unmapped_networks_require_a_fallback() {
        let mut config = ShiftConfig::from_str(SAMPLE).unwrap();
        config.destination.fallback_network = None;
        assert!(matches!(config.validate(), Err(ShiftError::Config(_))));

        config.destination.mapped_networks = true;
        config.validate().unwrap();
    }
}
