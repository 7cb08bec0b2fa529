use crate::cloud::{AddressPair, PortSpec};
use crate::descriptor::NicInfo;
use crate::provision::Provisioner;
use crate::{Result, ShiftError, log_info, log_warn};
use serde::{Deserialize, Serialize};

/// One NIC's destination wiring. `port_id` stays `None` until the port is
/// provisioned, and is set exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    pub nic_index: usize,
    pub mac: String,
    pub network: String,
    pub port_id: Option<String>,
}

impl PortMapping {
    /// Deterministic port name; repeated runs must produce the same name so
    /// the provisioner's lookup-before-create finds earlier work.
    pub fn port_name(&self, vm_name: &str) -> String {
        format!("{}-NIC-{}-VLAN-{}", vm_name, self.nic_index, self.network)
    }
}

/// Pure planning step: decide each NIC's target network. With
/// `mapped == false`, every NIC lands on `fallback_network` regardless of
/// its source VLAN.
pub fn plan_ports(
    nics: &[NicInfo],
    mapped: bool,
    fallback_network: Option<&str>,
) -> Result<Vec<PortMapping>> {
    let fallback = if mapped {
        None
    } else {
        match fallback_network {
            Some(name) if !name.is_empty() => Some(name.to_string()),
            _ => {
                return Err(ShiftError::Config(
                    "fallback network is required when mapped networks are disabled".into(),
                ))
            }
        }
    };

    Ok(nics
        .iter()
        .enumerate()
        .map(|(i, nic)| PortMapping {
            nic_index: i,
            mac: nic.mac.clone(),
            network: fallback.clone().unwrap_or_else(|| nic.vlan.clone()),
            port_id: None,
        })
        .collect())
}

/// Provision one port per planned mapping, in NIC order. Each port carries
/// an allow-all address pair keyed to its own MAC so the guest can keep its
/// OS-level IP configuration instead of relying on DHCP.
///
/// A failure on any NIC aborts the whole batch. Ports already created in
/// this batch are left in place for operator cleanup; visibility is
/// preferred over silent rollback.
pub async fn provision_ports(
    provisioner: &Provisioner<'_>,
    vm_name: &str,
    security_groups: &[String],
    plan: &mut [PortMapping],
) -> Result<()> {
    for mapping in plan.iter_mut() {
        let network = provisioner.cloud().get_network(&mapping.network).await?;
        let spec = PortSpec {
            name: mapping.port_name(vm_name),
            network_id: network.id,
            mac_address: mapping.mac.clone(),
            security_groups: security_groups.to_vec(),
            allowed_address_pairs: vec![AddressPair {
                ip_address: "0.0.0.0/0".to_string(),
                mac_address: mapping.mac.clone(),
            }],
        };
        let ensured = match provisioner.ensure_port(&spec).await {
            Ok(ensured) => ensured,
            Err(err) => {
                let done = plan.iter().filter(|m| m.port_id.is_some()).count();
                log_warn!(
                    "Port provisioning aborted at NIC {} ({} port(s) already created, left for cleanup)",
                    done,
                    done
                );
                return Err(err);
            }
        };
        mapping.port_id = Some(ensured.id);
    }
    log_info!("Provisioned {} port(s) for VM '{}'", plan.len(), vm_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloud;

    fn nics() -> Vec<NicInfo> {
        vec![
            NicInfo {
                mac: "00:50:56:aa:bb:01".to_string(),
                vlan: "VM Network".to_string(),
            },
            NicInfo {
                mac: "00:50:56:aa:bb:02".to_string(),
                vlan: "storage".to_string(),
            },
        ]
    }

    #[test]
    fn mapped_plan_keeps_source_networks() {
        let plan = plan_ports(&nics(), true, None).unwrap();
        assert_eq!(plan[0].network, "VM Network");
        assert_eq!(plan[1].network, "storage");
    }

    #[test]
    fn unmapped_plan_overrides_every_network() {
        let plan = plan_ports(&nics(), false, Some("provider")).unwrap();
        assert!(plan.iter().all(|m| m.network == "provider"));
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn unmapped_plan_without_fallback_is_a_config_error() {
        assert!(matches!(
            plan_ports(&nics(), false, None),
            Err(ShiftError::Config(_))
        ));
        assert!(matches!(
            plan_ports(&nics(), false, Some("")),
            Err(ShiftError::Config(_))
        ));
    }

    #[test]
    fn port_names_are_deterministic() {
        let plan = plan_ports(&nics(), true, None).unwrap();
        assert_eq!(plan[0].port_name("web01"), "web01-NIC-0-VLAN-VM Network");
        assert_eq!(plan[1].port_name("web01"), "web01-NIC-1-VLAN-storage");
    }

    #[tokio::test]
    async fn provisioning_sets_each_port_id_once() {
        let cloud = MemoryCloud::new();
        cloud.seed_network("provider").await;
        let provisioner = crate::provision::Provisioner::new(&cloud);

        let mut plan = plan_ports(&nics(), false, Some("provider")).unwrap();
        provision_ports(&provisioner, "web01", &["default".to_string()], &mut plan)
            .await
            .unwrap();
        assert!(plan.iter().all(|m| m.port_id.is_some()));

        // Replay finds the same ports by name; ids are unchanged.
        let ids: Vec<_> = plan.iter().map(|m| m.port_id.clone()).collect();
        let mut replay = plan_ports(&nics(), false, Some("provider")).unwrap();
        provision_ports(&provisioner, "web01", &["default".to_string()], &mut replay)
            .await
            .unwrap();
        let replay_ids: Vec<_> = replay.iter().map(|m| m.port_id.clone()).collect();
        assert_eq!(ids, replay_ids);
        assert_eq!(cloud.port_count().await, 2);
    }

    #[tokio::test]
    async fn failure_aborts_batch_without_rollback() {
        let cloud = MemoryCloud::new();
        // Only the fallback-free first network exists; the second NIC's
        // network is missing, so its port creation fails.
        cloud.seed_network("VM Network").await;
        let provisioner = crate::provision::Provisioner::new(&cloud);

        let mut plan = plan_ports(&nics(), true, None).unwrap();
        let err = provision_ports(&provisioner, "web01", &[], &mut plan)
            .await
            .unwrap_err();
        assert!(matches!(err, ShiftError::Provisioning(_)));

        // The first port was created and is deliberately left in place.
        assert_eq!(cloud.port_count().await, 1);
        assert!(plan[0].port_id.is_some());
        assert!(plan[1].port_id.is_none());
    }
}
