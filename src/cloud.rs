use crate::flavor::FlavorCandidate;
use crate::{Result, ShiftError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Metadata key marking a volume as managed by this toolkit.
pub const VOLUME_META_MANAGED: &str = "osm";
/// Metadata key latching whether a volume's disk data has been converted.
pub const VOLUME_META_CONVERTED: &str = "converted";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddressPair {
    pub ip_address: String,
    pub mac_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub network_id: String,
    pub mac_address: String,
    pub security_groups: Vec<String>,
    pub allowed_address_pairs: Vec<AddressPair>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub name: String,
    pub network_id: String,
    pub mac_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavorSpec {
    pub name: String,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
    pub is_public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub size_gb: u64,
    pub volume_type: Option<String>,
    pub availability_zone: Option<String>,
    pub bootable: bool,
    pub metadata: BTreeMap<String, String>,
    /// Image metadata set on UEFI guests (hw_firmware_type etc).
    pub image_metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub status: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub flavor_id: String,
    pub boot_volume: String,
    pub extra_volumes: Vec<String>,
    pub port_ids: Vec<String>,
    pub security_groups: Vec<String>,
    pub key_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSpec {
    pub name: String,
    pub volume_ids: Vec<String>,
    pub instance_id: Option<String>,
    pub timeout_mins: u32,
    pub disable_rollback: bool,
}

impl StackSpec {
    pub fn new(name: &str, volume_ids: Vec<String>, instance_id: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            volume_ids,
            instance_id,
            timeout_mins: 15,
            disable_rollback: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// Capability surface required of the destination cloud. The core never
/// talks to a concrete SDK; production drivers implement this trait outside
/// the crate, and `MemoryCloud` implements it for dry-runs and tests.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn list_flavors(&self) -> Result<Vec<FlavorCandidate>>;
    async fn find_flavor(&self, name: &str) -> Result<Option<FlavorCandidate>>;
    async fn create_flavor(&self, spec: &FlavorSpec) -> Result<FlavorCandidate>;

    async fn get_network(&self, name_or_id: &str) -> Result<Network>;
    async fn find_port(&self, name: &str) -> Result<Option<Port>>;
    async fn create_port(&self, spec: &PortSpec) -> Result<Port>;

    async fn find_volume(&self, name: &str) -> Result<Option<Volume>>;
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume>;

    async fn find_server(&self, name: &str) -> Result<Option<Server>>;
    async fn create_server(&self, spec: &ServerSpec) -> Result<Server>;
    async fn server_status(&self, id: &str) -> Result<String>;

    async fn find_stack(&self, name: &str) -> Result<Option<Stack>>;
    async fn create_stack(&self, spec: &StackSpec) -> Result<Stack>;
    async fn adopt_stack(&self, spec: &StackSpec) -> Result<Stack>;
    fn supports_stack_adoption(&self) -> bool;
}

#[derive(Debug, Default)]
struct MemoryCloudState {
    flavors: Vec<FlavorCandidate>,
    networks: Vec<Network>,
    ports: Vec<Port>,
    volumes: Vec<Volume>,
    servers: Vec<Server>,
    stacks: Vec<Stack>,
    next_id: u64,
}

impl MemoryCloudState {
    fn mint_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }
}

/// In-memory destination cloud. Backs `--dry-run` and the test suite:
/// deterministic ids, every create recorded, no external calls.
pub struct MemoryCloud {
    state: Mutex<MemoryCloudState>,
    adoption_supported: bool,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryCloudState::default()),
            adoption_supported: true,
        }
    }

    pub fn without_adoption() -> Self {
        Self {
            state: Mutex::new(MemoryCloudState::default()),
            adoption_supported: false,
        }
    }

    pub async fn seed_flavor(&self, flavor: FlavorCandidate) {
        self.state.lock().await.flavors.push(flavor);
    }

    pub async fn seed_network(&self, name: &str) -> Network {
        let mut state = self.state.lock().await;
        let network = Network {
            id: state.mint_id("net"),
            name: name.to_string(),
        };
        state.networks.push(network.clone());
        network
    }

    /// Flip a server's reported status, for exercising the cutover gate.
    pub async fn set_server_status(&self, id: &str, status: &str) {
        let mut state = self.state.lock().await;
        if let Some(server) = state.servers.iter_mut().find(|s| s.id == id) {
            server.status = status.to_string();
        }
    }

    pub async fn port_count(&self) -> usize {
        self.state.lock().await.ports.len()
    }

    pub async fn volume_count(&self) -> usize {
        self.state.lock().await.volumes.len()
    }
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudClient for MemoryCloud {
    async fn list_flavors(&self) -> Result<Vec<FlavorCandidate>> {
        Ok(self.state.lock().await.flavors.clone())
    }

    async fn find_flavor(&self, name: &str) -> Result<Option<FlavorCandidate>> {
        let state = self.state.lock().await;
        Ok(state.flavors.iter().find(|f| f.name == name).cloned())
    }

    async fn create_flavor(&self, spec: &FlavorSpec) -> Result<FlavorCandidate> {
        let mut state = self.state.lock().await;
        let flavor = FlavorCandidate {
            id: state.mint_id("flavor"),
            name: spec.name.clone(),
            vcpus: spec.vcpus,
            ram_mb: spec.ram_mb,
            disk_gb: spec.disk_gb,
        };
        state.flavors.push(flavor.clone());
        Ok(flavor)
    }

    async fn get_network(&self, name_or_id: &str) -> Result<Network> {
        let state = self.state.lock().await;
        state
            .networks
            .iter()
            .find(|n| n.id == name_or_id || n.name == name_or_id)
            .cloned()
            .ok_or_else(|| ShiftError::Provisioning(format!("network not found: {}", name_or_id)))
    }

    async fn find_port(&self, name: &str) -> Result<Option<Port>> {
        let state = self.state.lock().await;
        Ok(state.ports.iter().find(|p| p.name == name).cloned())
    }

    async fn create_port(&self, spec: &PortSpec) -> Result<Port> {
        let mut state = self.state.lock().await;
        if !state.networks.iter().any(|n| n.id == spec.network_id) {
            return Err(ShiftError::Provisioning(format!(
                "network not found: {}",
                spec.network_id
            )));
        }
        let port = Port {
            id: state.mint_id("port"),
            name: spec.name.clone(),
            network_id: spec.network_id.clone(),
            mac_address: spec.mac_address.clone(),
        };
        state.ports.push(port.clone());
        Ok(port)
    }

    async fn find_volume(&self, name: &str) -> Result<Option<Volume>> {
        let state = self.state.lock().await;
        Ok(state.volumes.iter().find(|v| v.name == name).cloned())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume> {
        let mut state = self.state.lock().await;
        let volume = Volume {
            id: state.mint_id("vol"),
            name: spec.name.clone(),
            status: "available".to_string(),
            metadata: spec.metadata.clone(),
        };
        state.volumes.push(volume.clone());
        Ok(volume)
    }

    async fn find_server(&self, name: &str) -> Result<Option<Server>> {
        let state = self.state.lock().await;
        Ok(state.servers.iter().find(|s| s.name == name).cloned())
    }

    async fn create_server(&self, spec: &ServerSpec) -> Result<Server> {
        let mut state = self.state.lock().await;
        let server = Server {
            id: state.mint_id("server"),
            name: spec.name.clone(),
            status: "ACTIVE".to_string(),
        };
        state.servers.push(server.clone());
        Ok(server)
    }

    async fn server_status(&self, id: &str) -> Result<String> {
        let state = self.state.lock().await;
        state
            .servers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.status.clone())
            .ok_or_else(|| ShiftError::Provisioning(format!("server not found: {}", id)))
    }

    async fn find_stack(&self, name: &str) -> Result<Option<Stack>> {
        let state = self.state.lock().await;
        Ok(state.stacks.iter().find(|s| s.name == name).cloned())
    }

    async fn create_stack(&self, spec: &StackSpec) -> Result<Stack> {
        let mut state = self.state.lock().await;
        let stack = Stack {
            id: state.mint_id("stack"),
            name: spec.name.clone(),
            status: "CREATE_COMPLETE".to_string(),
        };
        state.stacks.push(stack.clone());
        Ok(stack)
    }

    async fn adopt_stack(&self, spec: &StackSpec) -> Result<Stack> {
        if !self.adoption_supported {
            return Err(ShiftError::AdoptionUnsupported(
                "orchestration service has adoption disabled".into(),
            ));
        }
        let mut state = self.state.lock().await;
        let stack = Stack {
            id: state.mint_id("stack"),
            name: spec.name.clone(),
            status: "ADOPT_IN_PROGRESS".to_string(),
        };
        state.stacks.push(stack.clone());
        Ok(stack)
    }

    fn supports_stack_adoption(&self) -> bool {
        self.adoption_supported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cloud_mints_deterministic_ids() {
        let cloud = MemoryCloud::new();
        let net = cloud.seed_network("provider").await;
        assert_eq!(net.id, "net-0001");

        let port = cloud
            .create_port(&PortSpec {
                name: "p1".to_string(),
                network_id: net.id.clone(),
                mac_address: "00:50:56:00:00:01".to_string(),
                security_groups: vec![],
                allowed_address_pairs: vec![],
            })
            .await
            .unwrap();
        assert_eq!(port.id, "port-0002");
    }

    #[tokio::test]
    async fn create_port_requires_existing_network() {
        let cloud = MemoryCloud::new();
        let err = cloud
            .create_port(&PortSpec {
                name: "p1".to_string(),
                network_id: "net-missing".to_string(),
                mac_address: "00:50:56:00:00:01".to_string(),
                security_groups: vec![],
                allowed_address_pairs: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShiftError::Provisioning(_)));
    }

    #[tokio::test]
    async fn stack_creation_is_distinct_from_adoption() {
        let cloud = MemoryCloud::without_adoption();
        // Creation still works where adoption is unavailable.
        let stack = cloud
            .create_stack(&StackSpec::new("fresh", vec![], None))
            .await
            .unwrap();
        assert_eq!(stack.status, "CREATE_COMPLETE");
    }

    #[tokio::test]
    async fn adoption_gate_reflects_capability() {
        let cloud = MemoryCloud::without_adoption();
        assert!(!cloud.supports_stack_adoption());
        let err = cloud
            .adopt_stack(&StackSpec::new("s", vec![], None))
            .await
            .unwrap_err();
        assert!(matches!(err, ShiftError::AdoptionUnsupported(_)));
    }
}
