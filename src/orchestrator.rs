use crate::cloud::{
    CloudClient, FlavorSpec, ServerSpec, StackSpec, VolumeSpec, VOLUME_META_CONVERTED,
    VOLUME_META_MANAGED,
};
use crate::convert::{build_command, ConversionOptions, Converter, DestinationOutputSpec};
use crate::descriptor::GuestDescriptor;
use crate::flavor::{self, FlavorRequirements};
use crate::network::{plan_ports, provision_ports};
use crate::provision::Provisioner;
use crate::record::{safe_vm_name, MigrationRecord, Phase, RecordStore};
use crate::vmware::{SourceConnectionSpec, SourceControl};
use crate::{Result, ShiftError, log_error, log_info};
use std::collections::BTreeMap;

/// Per-run knobs for one VM's migration.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub source: SourceConnectionSpec,
    pub destination: DestinationOutputSpec,
    pub conversion: ConversionOptions,
    /// Source VLAN names map 1:1 onto destination networks. When false,
    /// every NIC lands on `fallback_network`.
    pub mapped_networks: bool,
    pub fallback_network: Option<String>,
    pub security_groups: Vec<String>,
    pub volume_type: Option<String>,
    pub volume_az: Option<String>,
    /// Create a flavor sized from the guest instead of best-matching an
    /// existing one.
    pub create_flavor: bool,
    /// Adopt the migrated resources under an orchestration stack.
    pub adopt_stack: bool,
    /// Deactivate the source VM once the destination is confirmed ACTIVE.
    /// Irreversible.
    pub cutover: bool,
    /// Skip the conversion tool entirely; disks need no transformation.
    pub skip_conversion: bool,
}

/// The migration state machine. Owns one MigrationRecord at a time,
/// persists after every transition, and never lets a component error
/// escape: failures land in the record as `Failed { at, reason }`.
///
/// All collaborators are borrowed per call; there is no global connection
/// state.
pub struct Orchestrator<'a> {
    cloud: &'a dyn CloudClient,
    converter: &'a dyn Converter,
    source: &'a dyn SourceControl,
    store: &'a RecordStore,
    options: MigrationOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        cloud: &'a dyn CloudClient,
        converter: &'a dyn Converter,
        source: &'a dyn SourceControl,
        store: &'a RecordStore,
        options: MigrationOptions,
    ) -> Self {
        Self {
            cloud,
            converter,
            source,
            store,
            options,
        }
    }

    /// Drive one VM's migration to completion, resuming from the first
    /// incomplete phase of its persisted record. Component failures are
    /// caught, persisted, and returned inside the record; only persistence
    /// failures surface as `Err`.
    pub async fn run(&self, vm_name: &str, guest: &GuestDescriptor) -> Result<MigrationRecord> {
        let _claim = self.store.claim(vm_name)?;
        let mut record = self.store.load_or_create(vm_name)?;

        if record.phase == Phase::Complete {
            log_info!("VM '{}' already migrated, nothing to do", vm_name);
            return Ok(record);
        }
        if matches!(record.phase, Phase::Failed { .. }) {
            record.resume();
            self.store.save(&record)?;
        }

        while !record.phase.is_terminal() {
            let current = record.phase.clone();
            match self.step(&mut record, guest).await {
                Ok(()) => self.store.save(&record)?,
                Err(err) => {
                    log_error!("VM '{}' failed during {}: {}", vm_name, current, err);
                    record.fail(err.to_string());
                    self.store.save(&record)?;
                }
            }
        }
        Ok(record)
    }

    /// Execute the single transition out of the record's current phase.
    async fn step(&self, record: &mut MigrationRecord, guest: &GuestDescriptor) -> Result<()> {
        match record.phase.clone() {
            Phase::Discovered => {
                self.select_flavor(record, guest).await?;
                record.advance(Phase::FlavorSelected)
            }
            Phase::FlavorSelected => {
                self.provision_ports(record, guest).await?;
                record.advance(Phase::PortsProvisioned)
            }
            Phase::PortsProvisioned => {
                if self.options.skip_conversion {
                    log_info!(
                        "VM '{}': skip_conversion set, bypassing conversion",
                        record.vm_name
                    );
                    self.attach_volumes(record, guest).await?;
                    record.advance(Phase::VolumesAttached)
                } else {
                    self.convert_disks(record, guest).await?;
                    record.advance(Phase::Converted)
                }
            }
            Phase::Converted => {
                self.attach_volumes(record, guest).await?;
                record.advance(Phase::VolumesAttached)
            }
            Phase::VolumesAttached => {
                self.create_server(record).await?;
                record.advance(Phase::ServerCreated)
            }
            Phase::ServerCreated => {
                if self.options.adopt_stack {
                    self.adopt_stack(record).await?;
                    record.advance(Phase::StackAdopted)
                } else if self.options.cutover {
                    self.cut_over(record).await?;
                    record.advance(Phase::Cutover)
                } else {
                    record.advance(Phase::Complete)
                }
            }
            Phase::StackAdopted => {
                if self.options.cutover {
                    self.cut_over(record).await?;
                    record.advance(Phase::Cutover)
                } else {
                    record.advance(Phase::Complete)
                }
            }
            Phase::Cutover => record.advance(Phase::Complete),
            Phase::Complete | Phase::Failed { .. } => Ok(()),
        }
    }

    async fn select_flavor(&self, record: &mut MigrationRecord, guest: &GuestDescriptor) -> Result<()> {
        let flavor_id = if self.options.create_flavor {
            let spec = FlavorSpec {
                name: format!("osm-{}", safe_vm_name(&record.vm_name)),
                vcpus: guest.instance.hw_processor_count,
                ram_mb: guest.instance.hw_memtotal_mb,
                disk_gb: (guest.total_disk_mb() / 1024).max(1),
                is_public: true,
            };
            let provisioner = Provisioner::new(self.cloud);
            let ensured = provisioner.ensure_flavor(&spec).await?;
            log_info!(
                "VM '{}': flavor '{}' {} ({})",
                record.vm_name,
                spec.name,
                if ensured.changed { "created" } else { "reused" },
                ensured.id
            );
            ensured.id
        } else {
            let candidates = self.cloud.list_flavors().await?;
            let requirements = FlavorRequirements::from_guest(guest);
            let matched = flavor::select(&requirements, &candidates)?;
            log_info!(
                "VM '{}': best-match flavor {} (distance {})",
                record.vm_name,
                matched.flavor_id,
                matched.distance
            );
            matched.flavor_id
        };
        record.flavor_id = Some(flavor_id);
        Ok(())
    }

    async fn provision_ports(&self, record: &mut MigrationRecord, guest: &GuestDescriptor) -> Result<()> {
        let mut plan = plan_ports(
            &guest.nics,
            self.options.mapped_networks,
            self.options.fallback_network.as_deref(),
        )?;
        let provisioner = Provisioner::new(self.cloud);
        provision_ports(
            &provisioner,
            &record.vm_name,
            &self.options.security_groups,
            &mut plan,
        )
        .await?;
        record.port_mappings = plan;
        Ok(())
    }

    async fn convert_disks(&self, record: &mut MigrationRecord, guest: &GuestDescriptor) -> Result<()> {
        let cmd = build_command(
            &self.options.source,
            &self.options.destination,
            &self.options.conversion,
            &record.vm_name,
        )?;
        // Persist the command before invoking so a crash mid-conversion
        // still leaves the exact invocation on the record.
        record.conversion_cmd = Some(cmd.clone());
        self.store.save(record)?;

        // Windows guests must be off at the source before conversion.
        if guest.is_windows_family() && self.source.is_powered_on(&record.vm_name).await? {
            log_info!(
                "VM '{}': Windows guest, powering off before conversion",
                record.vm_name
            );
            self.source.power_off(&record.vm_name).await?;
        }

        match self.converter.convert(&cmd).await {
            Ok(result) => {
                record.conversion_result = Some(result);
                Ok(())
            }
            Err(ShiftError::ConversionFailed {
                exit_code,
                stdout,
                stderr,
            }) => {
                // Keep the diagnostic output on the record; the error text
                // that lands in Failed{reason} carries it too.
                record.conversion_result = Some(crate::convert::ConversionResult {
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                    exit_code: exit_code.unwrap_or(-1),
                });
                Err(ShiftError::ConversionFailed {
                    exit_code,
                    stdout,
                    stderr,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn attach_volumes(&self, record: &mut MigrationRecord, guest: &GuestDescriptor) -> Result<()> {
        let provisioner = Provisioner::new(self.cloud);
        let mut volume_ids = Vec::with_capacity(guest.guest_disk_info.len());

        for (i, (disk_id, disk)) in guest.guest_disk_info.iter().enumerate() {
            let mut metadata = BTreeMap::new();
            metadata.insert(VOLUME_META_MANAGED.to_string(), "true".to_string());
            metadata.insert(VOLUME_META_CONVERTED.to_string(), "true".to_string());

            let mut image_metadata = BTreeMap::new();
            if i == 0 && guest.is_uefi() {
                image_metadata.insert("hw_machine_type".to_string(), "q35".to_string());
                image_metadata.insert("hw_firmware_type".to_string(), "uefi".to_string());
            }

            let spec = VolumeSpec {
                name: format!("{}-{}", record.vm_name, disk_id),
                size_gb: disk.capacity_in_kb.div_ceil(1024 * 1024).max(1),
                volume_type: self.options.volume_type.clone(),
                availability_zone: self.options.volume_az.clone(),
                bootable: i == 0,
                metadata,
                image_metadata,
            };
            let ensured = provisioner.ensure_volume(&spec).await?;
            volume_ids.push(ensured.id);
        }

        if volume_ids.is_empty() {
            return Err(ShiftError::Provisioning(format!(
                "VM '{}' has no disks to attach",
                record.vm_name
            )));
        }
        record.volume_ids = volume_ids;
        Ok(())
    }

    async fn create_server(&self, record: &mut MigrationRecord) -> Result<()> {
        let flavor_id = record.flavor_id.clone().ok_or_else(|| {
            ShiftError::Provisioning("record has no flavor_id before server creation".into())
        })?;
        let (boot_volume, extra_volumes) = record
            .volume_ids
            .split_first()
            .map(|(b, rest)| (b.clone(), rest.to_vec()))
            .ok_or_else(|| {
                ShiftError::Provisioning("record has no volumes before server creation".into())
            })?;

        let spec = ServerSpec {
            name: record.vm_name.clone(),
            flavor_id,
            boot_volume,
            extra_volumes,
            port_ids: record.port_ids(),
            security_groups: self.options.security_groups.clone(),
            key_name: None,
        };
        let provisioner = Provisioner::new(self.cloud);
        let ensured = provisioner.ensure_server(&spec).await?;
        record.instance_id = Some(ensured.id);
        Ok(())
    }

    async fn adopt_stack(&self, record: &mut MigrationRecord) -> Result<()> {
        let spec = StackSpec::new(
            &safe_vm_name(&record.vm_name),
            record.volume_ids.clone(),
            record.instance_id.clone(),
        );
        let provisioner = Provisioner::new(self.cloud);
        let ensured = provisioner.ensure_stack(&spec).await?;
        record.stack_id = Some(ensured.id);
        Ok(())
    }

    /// The irreversible step: deactivate the source VM. Runs only once the
    /// destination server is confirmed ACTIVE.
    async fn cut_over(&self, record: &mut MigrationRecord) -> Result<()> {
        let instance_id = record.instance_id.as_deref().ok_or_else(|| {
            ShiftError::Provisioning("record has no instance_id before cutover".into())
        })?;
        let status = self.cloud.server_status(instance_id).await?;
        if status != "ACTIVE" {
            return Err(ShiftError::Provisioning(format!(
                "destination server {} is {} (not ACTIVE), refusing cutover",
                instance_id, status
            )));
        }
        if self.source.is_powered_on(&record.vm_name).await? {
            self.source.power_off(&record.vm_name).await?;
            log_info!("VM '{}': source deactivated, cutover done", record.vm_name);
        }
        Ok(())
    }
}
