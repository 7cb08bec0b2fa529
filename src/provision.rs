use crate::cloud::{
    CloudClient, FlavorSpec, PortSpec, ServerSpec, StackSpec, VolumeSpec,
};
use crate::{Result, ShiftError, log_debug, log_info};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Outcome of an ensure operation: the destination identifier plus whether
/// this call created the resource or found it already in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ensured {
    pub id: String,
    pub changed: bool,
}

/// Idempotence backbone: every operation looks up its resource by
/// deterministic name first and only creates on a miss, so the orchestrator
/// can replay any phase after a crash without duplicating resources.
pub struct Provisioner<'a> {
    cloud: &'a dyn CloudClient,
}

impl<'a> Provisioner<'a> {
    pub fn new(cloud: &'a dyn CloudClient) -> Self {
        Self { cloud }
    }

    pub fn cloud(&self) -> &'a dyn CloudClient {
        self.cloud
    }

    pub async fn ensure_flavor(&self, spec: &FlavorSpec) -> Result<Ensured> {
        if let Some(existing) = self.cloud.find_flavor(&spec.name).await? {
            log_debug!("Flavor '{}' already exists: {}", spec.name, existing.id);
            return Ok(Ensured {
                id: existing.id,
                changed: false,
            });
        }
        let flavor = self.cloud.create_flavor(spec).await?;
        log_info!("Created flavor '{}': {}", spec.name, flavor.id);
        Ok(Ensured {
            id: flavor.id,
            changed: true,
        })
    }

    pub async fn ensure_port(&self, spec: &PortSpec) -> Result<Ensured> {
        if let Some(existing) = self.cloud.find_port(&spec.name).await? {
            log_debug!("Port '{}' already exists: {}", spec.name, existing.id);
            return Ok(Ensured {
                id: existing.id,
                changed: false,
            });
        }
        let port = self.cloud.create_port(spec).await?;
        log_info!("Created port '{}': {}", spec.name, port.id);
        Ok(Ensured {
            id: port.id,
            changed: true,
        })
    }

    pub async fn ensure_volume(&self, spec: &VolumeSpec) -> Result<Ensured> {
        if let Some(existing) = self.cloud.find_volume(&spec.name).await? {
            log_debug!("Volume '{}' already exists: {}", spec.name, existing.id);
            return Ok(Ensured {
                id: existing.id,
                changed: false,
            });
        }
        let volume = self.cloud.create_volume(spec).await?;
        log_info!("Created volume '{}': {}", spec.name, volume.id);
        Ok(Ensured {
            id: volume.id,
            changed: true,
        })
    }

    pub async fn ensure_server(&self, spec: &ServerSpec) -> Result<Ensured> {
        if let Some(existing) = self.cloud.find_server(&spec.name).await? {
            log_debug!("Server '{}' already exists: {}", spec.name, existing.id);
            return Ok(Ensured {
                id: existing.id,
                changed: false,
            });
        }
        let server = self.cloud.create_server(spec).await?;
        log_info!("Created server '{}': {}", spec.name, server.id);
        Ok(Ensured {
            id: server.id,
            changed: true,
        })
    }

    /// Adopt pre-existing volumes and the migrated instance under an
    /// orchestration stack. Distinct from stack creation: the destination
    /// service must support adoption explicitly.
    pub async fn ensure_stack(&self, spec: &StackSpec) -> Result<Ensured> {
        if let Some(existing) = self.cloud.find_stack(&spec.name).await? {
            log_debug!("Stack '{}' already exists: {}", spec.name, existing.id);
            return Ok(Ensured {
                id: existing.id,
                changed: false,
            });
        }
        if !self.cloud.supports_stack_adoption() {
            return Err(ShiftError::AdoptionUnsupported(format!(
                "cannot adopt stack '{}': destination lacks adoption support",
                spec.name
            )));
        }
        let stack = self.cloud.adopt_stack(spec).await?;
        log_info!("Adopted stack '{}': {}", spec.name, stack.id);
        Ok(Ensured {
            id: stack.id,
            changed: true,
        })
    }
}

/// Adoption data handed to the orchestration service: one Cinder volume
/// resource per migrated volume plus the migrated instance.
pub fn adoption_data(spec: &StackSpec) -> serde_json::Value {
    let mut resources = serde_json::Map::new();
    for (i, volume_id) in spec.volume_ids.iter().enumerate() {
        let name = format!("volume_{}", i);
        resources.insert(
            name.clone(),
            json!({
                "status": "COMPLETE",
                "name": name,
                "resource_id": volume_id,
                "action": "CREATE",
                "type": "OS::Cinder::Volume",
                "resource_data": {},
                "metadata": {},
            }),
        );
    }
    if let Some(instance_id) = &spec.instance_id {
        resources.insert(
            "migrated_instance".to_string(),
            json!({
                "status": "COMPLETE",
                "name": "migrated_instance",
                "resource_id": instance_id,
                "action": "CREATE",
                "type": "OS::Nova::Server",
                "resource_data": {},
                "metadata": {},
            }),
        );
    }
    json!({
        "action": "CREATE",
        "status": "COMPLETE",
        "name": spec.name,
        "id": "manual-adoption",
        "resources": resources,
        "environment": { "parameters": {} },
        "parameters": {},
    })
}

/// Orchestration template describing the adopted resources.
pub fn adoption_template(spec: &StackSpec) -> String {
    let mut template = format!(
        "heat_template_version: wallaby\ndescription: Migrated VMware workload - {}\n\nresources:\n",
        spec.name
    );
    for i in 0..spec.volume_ids.len() {
        template.push_str(&format!(
            "  volume_{}:\n    type: OS::Cinder::Volume\n    properties:\n      size: 1\n",
            i
        ));
    }
    if spec.instance_id.is_some() {
        template.push_str(
            "  migrated_instance:\n    type: OS::Nova::Server\n    properties:\n      name: migrated-instance\n",
        );
    }
    template.push_str("\noutputs:\n");
    for i in 0..spec.volume_ids.len() {
        template.push_str(&format!(
            "  volume_{}_id:\n    description: Volume {} ID\n    value: {{ get_resource: volume_{} }}\n",
            i, i, i
        ));
    }
    if spec.instance_id.is_some() {
        template.push_str(
            "  instance_id:\n    description: Instance ID\n    value: { get_resource: migrated_instance }\n",
        );
    }
    template
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloud;

    fn port_spec(cloud_net: &str) -> PortSpec {
        PortSpec {
            name: "vm1-NIC-0-VLAN-provider".to_string(),
            network_id: cloud_net.to_string(),
            mac_address: "00:50:56:00:00:01".to_string(),
            security_groups: vec!["default".to_string()],
            allowed_address_pairs: vec![],
        }
    }

    #[tokio::test]
    async fn ensure_port_is_idempotent() {
        let cloud = MemoryCloud::new();
        let net = cloud.seed_network("provider").await;
        let provisioner = Provisioner::new(&cloud);

        let first = provisioner.ensure_port(&port_spec(&net.id)).await.unwrap();
        assert!(first.changed);

        let second = provisioner.ensure_port(&port_spec(&net.id)).await.unwrap();
        assert!(!second.changed);
        assert_eq!(first.id, second.id);
        assert_eq!(cloud.port_count().await, 1);
    }

    #[tokio::test]
    async fn ensure_stack_requires_adoption_capability() {
        let cloud = MemoryCloud::without_adoption();
        let provisioner = Provisioner::new(&cloud);
        let err = provisioner
            .ensure_stack(&StackSpec::new("vm1", vec!["vol-1".to_string()], None))
            .await
            .unwrap_err();
        assert!(matches!(err, ShiftError::AdoptionUnsupported(_)));
    }

    #[test]
    fn adoption_data_lists_volumes_and_instance() {
        let spec = StackSpec::new(
            "vm1",
            vec!["vol-1".to_string(), "vol-2".to_string()],
            Some("server-1".to_string()),
        );
        let data = adoption_data(&spec);
        let resources = data["resources"].as_object().unwrap();
        assert_eq!(resources.len(), 3);
        assert_eq!(resources["volume_0"]["resource_id"], "vol-1");
        assert_eq!(resources["volume_1"]["type"], "OS::Cinder::Volume");
        assert_eq!(resources["migrated_instance"]["resource_id"], "server-1");
    }

    #[test]
    fn adoption_template_covers_every_resource() {
        let spec = StackSpec::new("vm1", vec!["vol-1".to_string()], Some("server-1".to_string()));
        let template = adoption_template(&spec);
        assert!(template.starts_with("heat_template_version: wallaby"));
        assert!(template.contains("volume_0:"));
        assert!(template.contains("migrated_instance:"));
        assert!(template.contains("volume_0_id:"));
        assert!(template.contains("instance_id:"));
    }
}
