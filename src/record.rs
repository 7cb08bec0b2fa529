use crate::convert::ConversionResult;
use crate::network::PortMapping;
use crate::{Result, ShiftError, log_debug, log_info};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Progress of one VM's migration. Phases only advance forward or into
/// `Failed`; nothing re-enters after `Complete`. `StackAdopted` and
/// `Cutover` are optional way-points skipped by runs without those options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Phase {
    Discovered,
    FlavorSelected,
    PortsProvisioned,
    Converted,
    VolumesAttached,
    ServerCreated,
    StackAdopted,
    Cutover,
    Complete,
    Failed { at: Box<Phase>, reason: String },
}

impl Phase {
    pub fn rank(&self) -> u8 {
        match self {
            Phase::Discovered => 0,
            Phase::FlavorSelected => 1,
            Phase::PortsProvisioned => 2,
            Phase::Converted => 3,
            Phase::VolumesAttached => 4,
            Phase::ServerCreated => 5,
            Phase::StackAdopted => 6,
            Phase::Cutover => 7,
            Phase::Complete => 8,
            Phase::Failed { at, .. } => at.rank(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed { .. })
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Failed { at, reason } => write!(f, "Failed at {} ({})", at, reason),
            Phase::Discovered => write!(f, "Discovered"),
            Phase::FlavorSelected => write!(f, "FlavorSelected"),
            Phase::PortsProvisioned => write!(f, "PortsProvisioned"),
            Phase::Converted => write!(f, "Converted"),
            Phase::VolumesAttached => write!(f, "VolumesAttached"),
            Phase::ServerCreated => write!(f, "ServerCreated"),
            Phase::StackAdopted => write!(f, "StackAdopted"),
            Phase::Cutover => write!(f, "Cutover"),
            Phase::Complete => write!(f, "Complete"),
        }
    }
}

/// The mutable unit of migration work, owned exclusively by the
/// orchestrator and persisted after every phase transition so a failed run
/// survives process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub migration_id: Uuid,
    pub vm_name: String,
    pub phase: Phase,
    #[serde(default)]
    pub conversion_cmd: Option<Vec<String>>,
    #[serde(default)]
    pub conversion_result: Option<ConversionResult>,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub volume_ids: Vec<String>,
    #[serde(default)]
    pub flavor_id: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub stack_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn new(vm_name: &str) -> Self {
        let now = Utc::now();
        Self {
            migration_id: Uuid::new_v4(),
            vm_name: vm_name.to_string(),
            phase: Phase::Discovered,
            conversion_cmd: None,
            conversion_result: None,
            port_mappings: Vec::new(),
            volume_ids: Vec::new(),
            flavor_id: None,
            instance_id: None,
            stack_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn port_ids(&self) -> Vec<String> {
        self.port_mappings
            .iter()
            .filter_map(|m| m.port_id.clone())
            .collect()
    }

    /// Advance to `next`. Backward moves and moves out of a terminal phase
    /// are refused; the phase order is an invariant, not a convention.
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(ShiftError::Config(format!(
                "record for '{}' is terminal at {} and cannot advance",
                self.vm_name, self.phase
            )));
        }
        if !matches!(next, Phase::Failed { .. }) && next.rank() <= self.phase.rank() {
            return Err(ShiftError::Config(format!(
                "phase cannot move backwards: {} -> {}",
                self.phase, next
            )));
        }
        log_debug!("VM '{}': {} -> {}", self.vm_name, self.phase, next);
        self.phase = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, reason: String) {
        let at = Box::new(self.phase.clone());
        self.error = Some(reason.clone());
        self.phase = Phase::Failed { at, reason };
        self.updated_at = Utc::now();
    }

    /// Un-fail a record so a re-invocation retries from the phase that
    /// failed. No-op for records in any other state.
    pub fn resume(&mut self) {
        if let Phase::Failed { at, .. } = &self.phase {
            log_info!(
                "VM '{}': resuming from failed phase {}",
                self.vm_name,
                at
            );
            self.phase = (**at).clone();
            self.error = None;
            self.updated_at = Utc::now();
        }
    }
}

/// Sanitize a VMware VM name for use as a file or resource name:
/// non-alphanumerics become underscores, runs collapse, the result is
/// truncated to 64 characters and trailing underscores are stripped.
pub fn safe_vm_name(vm_name: &str) -> String {
    let mut safe = String::with_capacity(vm_name.len());
    let mut last_underscore = false;
    for c in vm_name.chars() {
        if c.is_ascii_alphanumeric() {
            safe.push(c);
            last_underscore = false;
        } else if !last_underscore {
            safe.push('_');
            last_underscore = true;
        }
    }
    safe.truncate(64);
    safe.trim_end_matches('_').to_string()
}

/// Exclusive claim on one VM's record, released on drop. Mutual exclusion
/// is per VM and caller-driven: workers claim before touching the record.
pub struct RecordClaim {
    lock_path: PathBuf,
}

impl Drop for RecordClaim {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Durable store of migration records: one JSON file per VM under the data
/// dir, updated atomically via temp-file + rename.
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Default data dir, `~/.local/share/vmshift/records` or a system
    /// fallback.
    pub fn default_dir() -> PathBuf {
        if let Some(mut dir) = dirs::data_dir() {
            dir.push("vmshift");
            dir.push("records");
            dir
        } else {
            PathBuf::from("/var/lib/vmshift/records")
        }
    }

    fn record_path(&self, vm_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_vm_name(vm_name)))
    }

    fn lock_path(&self, vm_name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", safe_vm_name(vm_name)))
    }

    /// Take the per-VM claim. Fails with `RecordLocked` while another
    /// worker holds it.
    pub fn claim(&self, vm_name: &str) -> Result<RecordClaim> {
        let lock_path = self.lock_path(vm_name);
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => Ok(RecordClaim { lock_path }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(
                ShiftError::RecordLocked(format!("{} is claimed by another worker", vm_name)),
            ),
            Err(err) => Err(err.into()),
        }
    }

    pub fn load(&self, vm_name: &str) -> Result<Option<MigrationRecord>> {
        let path = self.record_path(vm_name);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Load the existing record or start a fresh one at `Discovered`.
    pub fn load_or_create(&self, vm_name: &str) -> Result<MigrationRecord> {
        match self.load(vm_name)? {
            Some(record) => Ok(record),
            None => {
                let record = MigrationRecord::new(vm_name);
                self.save(&record)?;
                log_info!("Created migration record for VM '{}'", vm_name);
                Ok(record)
            }
        }
    }

    /// Atomic write: serialize to a temp file in the same directory, then
    /// rename over the record.
    pub fn save(&self, record: &MigrationRecord) -> Result<()> {
        let path = self.record_path(&record.vm_name);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn safe_vm_name_sanitizes() {
        assert_eq!(safe_vm_name("web server #1 (prod)"), "web_server_1_prod");
        assert_eq!(safe_vm_name("rhel-9.4-3"), "rhel_9_4_3");
        let long = "x".repeat(80);
        assert_eq!(safe_vm_name(&long).len(), 64);
    }

    #[test]
    fn phase_order_is_total_and_forward_only() {
        let mut record = MigrationRecord::new("vm1");
        record.advance(Phase::FlavorSelected).unwrap();
        record.advance(Phase::PortsProvisioned).unwrap();

        // Backwards is refused.
        assert!(record.advance(Phase::FlavorSelected).is_err());
        // Skipping optional way-points is fine; order still holds.
        record.advance(Phase::VolumesAttached).unwrap();
        record.advance(Phase::ServerCreated).unwrap();
        record.advance(Phase::Complete).unwrap();

        // Nothing advances out of Complete.
        assert!(record.advance(Phase::Cutover).is_err());
    }

    #[test]
    fn failure_is_reachable_from_any_phase_and_terminal() {
        let mut record = MigrationRecord::new("vm1");
        record.advance(Phase::FlavorSelected).unwrap();
        record.fail("port quota exceeded".to_string());
        match &record.phase {
            Phase::Failed { at, reason } => {
                assert_eq!(**at, Phase::FlavorSelected);
                assert!(reason.contains("quota"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(record.phase.is_terminal());
        assert!(record.advance(Phase::PortsProvisioned).is_err());
    }

    #[test]
    fn store_round_trips_records() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path()).unwrap();

        let mut record = store.load_or_create("rhel-9.4-3").unwrap();
        record.flavor_id = Some("flavor-0001".to_string());
        record.advance(Phase::FlavorSelected).unwrap();
        store.save(&record).unwrap();

        let loaded = store.load("rhel-9.4-3").unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::FlavorSelected);
        assert_eq!(loaded.flavor_id.as_deref(), Some("flavor-0001"));
    }

    #[test]
    fn second_claim_fails_until_release() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path()).unwrap();

        let claim = store.claim("vm1").unwrap();
        assert!(matches!(
            store.claim("vm1"),
            Err(ShiftError::RecordLocked(_))
        ));
        drop(claim);
        store.claim("vm1").unwrap();
    }
}
