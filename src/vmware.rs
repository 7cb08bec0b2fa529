use crate::{Result, ShiftError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How the conversion tool reaches the source hypervisor. The URI scheme
/// encodes the difference: `esx://` talks to a single ESXi host directly,
/// `vpx://` goes through vCenter and needs the inventory path down to the
/// host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    Esxi,
    Vcenter {
        datacenter: String,
        #[serde(default)]
        cluster: Option<String>,
        esxi_host: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConnectionSpec {
    pub host: String,
    pub username: String,
    pub endpoint: Endpoint,
}

/// Reserved characters in the userinfo position collide with the URI's own
/// separators. `@` is the one vSphere usernames actually contain
/// (`administrator@vsphere.local`), and dropping this escape has a history
/// of breaking conversions at exactly one call site or another. Mandatory.
pub fn escape_uri_username(username: &str) -> String {
    username.replace('@', "%40")
}

impl SourceConnectionSpec {
    /// Eager validation: every field the URI needs must be present before
    /// any command line is assembled.
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(ShiftError::Config("source username is required".into()));
        }
        if self.host.is_empty() {
            return Err(ShiftError::Config("source host is required".into()));
        }
        if let Endpoint::Vcenter {
            datacenter,
            esxi_host,
            ..
        } = &self.endpoint
        {
            if datacenter.is_empty() {
                return Err(ShiftError::Config(
                    "datacenter is required for vCenter connections".into(),
                ));
            }
            if esxi_host.is_empty() {
                return Err(ShiftError::Config(
                    "esxi_host is required for vCenter connections".into(),
                ));
            }
        }
        Ok(())
    }

    /// Render the libvirt-style connection URI handed to the conversion
    /// tool. Datacenter/cluster segments appear only on the vCenter path.
    pub fn connection_uri(&self) -> Result<String> {
        self.validate()?;
        let user = escape_uri_username(&self.username);
        let uri = match &self.endpoint {
            Endpoint::Esxi => format!("esx://{}@{}?no_verify=1", user, self.host),
            Endpoint::Vcenter {
                datacenter,
                cluster,
                esxi_host,
            } => {
                let mut path = format!("/{}", datacenter);
                if let Some(cluster) = cluster {
                    path.push('/');
                    path.push_str(cluster);
                }
                path.push('/');
                path.push_str(esxi_host);
                format!("vpx://{}@{}{}?no_verify=1", user, self.host, path)
            }
        };
        Ok(uri)
    }
}

/// Source-side control surface. Cutover powers the source VM off through
/// this seam, and Windows guests are shut down before conversion. The
/// production implementation lives with the hypervisor SDK, outside this
/// crate.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn is_powered_on(&self, vm_name: &str) -> Result<bool>;
    async fn power_off(&self, vm_name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esxi_uri_has_no_inventory_path() {
        let spec = SourceConnectionSpec {
            host: "esxi1.lab".to_string(),
            username: "root".to_string(),
            endpoint: Endpoint::Esxi,
        };
        assert_eq!(spec.connection_uri().unwrap(), "esx://root@esxi1.lab?no_verify=1");
    }

    #[test]
    fn vcenter_uri_includes_datacenter_and_host() {
        let spec = SourceConnectionSpec {
            host: "vcenter.lab".to_string(),
            username: "admin".to_string(),
            endpoint: Endpoint::Vcenter {
                datacenter: "DC1".to_string(),
                cluster: None,
                esxi_host: "esxi1.lab".to_string(),
            },
        };
        assert_eq!(
            spec.connection_uri().unwrap(),
            "vpx://admin@vcenter.lab/DC1/esxi1.lab?no_verify=1"
        );
    }

    #[test]
    fn vcenter_uri_includes_cluster_segment_when_present() {
        let spec = SourceConnectionSpec {
            host: "vcenter.lab".to_string(),
            username: "admin".to_string(),
            endpoint: Endpoint::Vcenter {
                datacenter: "DC1".to_string(),
                cluster: Some("Cluster-A".to_string()),
                esxi_host: "esxi1.lab".to_string(),
            },
        };
        assert_eq!(
            spec.connection_uri().unwrap(),
            "vpx://admin@vcenter.lab/DC1/Cluster-A/esxi1.lab?no_verify=1"
        );
    }

    #[test]
    fn at_sign_in_username_is_percent_encoded() {
        let spec = SourceConnectionSpec {
            host: "vcenter.lab".to_string(),
            username: "administrator@vsphere.local".to_string(),
            endpoint: Endpoint::Vcenter {
                datacenter: "DC1".to_string(),
                cluster: None,
                esxi_host: "esxi1.lab".to_string(),
            },
        };
        let uri = spec.connection_uri().unwrap();
        assert!(uri.contains("administrator%40vsphere.local"));
        assert_eq!(uri.matches('@').count(), 1);
    }

    #[test]
    fn missing_fields_fail_validation_eagerly() {
        let spec = SourceConnectionSpec {
            host: "vcenter.lab".to_string(),
            username: String::new(),
            endpoint: Endpoint::Esxi,
        };
        assert!(matches!(spec.connection_uri(), Err(ShiftError::Config(_))));

        let spec = SourceConnectionSpec {
            host: "vcenter.lab".to_string(),
            username: "admin".to_string(),
            endpoint: Endpoint::Vcenter {
                datacenter: String::new(),
                cluster: None,
                esxi_host: "esxi1.lab".to_string(),
            },
        };
        assert!(matches!(spec.connection_uri(), Err(ShiftError::Config(_))));
    }
}
