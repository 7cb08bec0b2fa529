use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vmshift::{
    Result, ShiftError,
    cloud::{CloudClient, MemoryCloud},
    config::ShiftConfig,
    convert::{build_command, ConversionResult, Converter},
    descriptor::{flavor_resource, write_flavor_export, GuestDescriptor},
    flavor::{self, FlavorCandidate, FlavorRequirements},
    logger,
    orchestrator::{MigrationOptions, Orchestrator},
    record::{Phase, RecordStore},
    vmware::SourceControl,
};

#[derive(Parser)]
#[command(name = "vmshift")]
#[command(about = "VMware to OpenStack workload migration toolkit")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to ShiftFile configuration
    #[arg(short, long, default_value = "ShiftFile")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) one VM's migration
    Migrate {
        /// Name of the source VM
        vm: String,
        /// Path to the discovered guest descriptor JSON
        #[arg(long)]
        guest_info: PathBuf,
        /// Rehearse against the in-memory cloud instead of a live one
        #[arg(long)]
        dry_run: bool,
        /// Optional JSON list of flavor candidates to seed the dry run
        #[arg(long)]
        flavors: Option<PathBuf>,
    },
    /// Show the persisted migration record for a VM
    Status {
        /// Name of the VM
        vm: String,
    },
    /// Best-match a flavor offline from descriptor files
    MatchFlavor {
        /// Path to the discovered guest descriptor JSON
        #[arg(long)]
        guest_info: PathBuf,
        /// Path to a JSON list of flavor candidates
        #[arg(long)]
        flavors: PathBuf,
    },
    /// Export a guest-sized flavor definition to a versioned YAML file
    ExportFlavor {
        /// Name of the VM
        vm: String,
        /// Path to the discovered guest descriptor JSON
        #[arg(long)]
        guest_info: PathBuf,
        /// Output YAML file (merged into if it exists)
        #[arg(long)]
        output: PathBuf,
    },
    /// Print the conversion command that would run for a VM
    ShowCommand {
        /// Name of the VM
        vm: String,
    },
}

/// Dry-run converter: reports success without spawning anything.
struct DryRunConverter;

#[async_trait::async_trait]
impl Converter for DryRunConverter {
    async fn convert(&self, cmd: &[String]) -> Result<ConversionResult> {
        Ok(ConversionResult {
            stdout: format!("dry-run: would execute: {}", cmd.join(" ")),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

/// Dry-run source control: pretends the source VM is running and powers it
/// off on paper only.
struct DryRunSource;

#[async_trait::async_trait]
impl SourceControl for DryRunSource {
    async fn is_powered_on(&self, _vm_name: &str) -> Result<bool> {
        Ok(true)
    }

    async fn power_off(&self, vm_name: &str) -> Result<()> {
        println!("dry-run: would power off source VM '{}'", vm_name);
        Ok(())
    }
}

fn load_flavor_candidates(path: &PathBuf) -> Result<Vec<FlavorCandidate>> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        ShiftError::Config(format!("failed to read flavors {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&data)
        .map_err(|e| ShiftError::Config(format!("invalid flavors {}: {}", path.display(), e)))
}

fn open_store(config: &ShiftConfig) -> Result<RecordStore> {
    let dir = config
        .migration
        .data_dir
        .clone()
        .unwrap_or_else(RecordStore::default_dir);
    RecordStore::new(&dir)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "vmshift=debug");
    }
    logger::init_logger();

    let config = if cli.config.exists() {
        ShiftConfig::from_file(&cli.config)?
    } else {
        logger::warn!(
            "ShiftFile not found at {}, using defaults",
            cli.config.display()
        );
        ShiftConfig::default()
    };

    match cli.command {
        Commands::Migrate {
            vm,
            guest_info,
            dry_run,
            flavors,
        } => {
            config.validate()?;
            let guest = GuestDescriptor::from_file(&guest_info)?;
            let store = open_store(&config)?;

            if !dry_run {
                return Err(ShiftError::Config(
                    "no destination cloud driver is configured in this build; \
                     re-run with --dry-run to rehearse against the in-memory cloud"
                        .into(),
                ));
            }

            let cloud = MemoryCloud::new();
            for nic in &guest.nics {
                if cloud.get_network(&nic.vlan).await.is_err() {
                    cloud.seed_network(&nic.vlan).await;
                }
            }
            if let Some(fallback) = &config.destination.fallback_network {
                if cloud.get_network(fallback).await.is_err() {
                    cloud.seed_network(fallback).await;
                }
            }
            if let Some(path) = &flavors {
                for candidate in load_flavor_candidates(path)? {
                    cloud.seed_flavor(candidate).await;
                }
            }

            let options = MigrationOptions {
                source: config.source_spec(),
                destination: config.destination_spec(),
                conversion: config.conversion_options(),
                mapped_networks: config.destination.mapped_networks,
                fallback_network: config.destination.fallback_network.clone(),
                security_groups: config.destination.security_groups.clone(),
                volume_type: config.destination.volume_type.clone(),
                volume_az: config.destination.volume_az.clone(),
                create_flavor: config.migration.create_flavor,
                adopt_stack: config.migration.adopt_stack,
                cutover: config.migration.cutover,
                skip_conversion: config.migration.skip_conversion,
            };

            let converter = DryRunConverter;
            let source = DryRunSource;
            let orchestrator = Orchestrator::new(&cloud, &converter, &source, &store, options);
            let record = orchestrator.run(&vm, &guest).await?;

            println!("VM '{}' finished at phase: {}", vm, record.phase);
            if let Phase::Failed { at, reason } = &record.phase {
                println!("  failed during: {}", at);
                println!("  reason: {}", reason);
                std::process::exit(1);
            }
        }
        Commands::Status { vm } => {
            let store = open_store(&config)?;
            match store.load(&vm)? {
                Some(record) => {
                    println!("VM:        {}", record.vm_name);
                    println!("Migration: {}", record.migration_id);
                    println!("Phase:     {}", record.phase);
                    println!(
                        "Flavor:    {}",
                        record.flavor_id.as_deref().unwrap_or("-")
                    );
                    println!(
                        "Instance:  {}",
                        record.instance_id.as_deref().unwrap_or("-")
                    );
                    println!("Stack:     {}", record.stack_id.as_deref().unwrap_or("-"));
                    println!("Volumes:   {}", record.volume_ids.join(", "));
                    println!("Ports:     {}", record.port_ids().join(", "));
                    println!("Updated:   {}", record.updated_at);
                    if let Some(error) = &record.error {
                        println!("Error:     {}", error);
                    }
                }
                None => println!("No migration record for VM '{}'", vm),
            }
        }
        Commands::MatchFlavor {
            guest_info,
            flavors,
        } => {
            let guest = GuestDescriptor::from_file(&guest_info)?;
            let candidates = load_flavor_candidates(&flavors)?;
            let requirements = FlavorRequirements::from_guest(&guest);
            let matched = flavor::select(&requirements, &candidates)?;
            println!(
                "Best match: {} (distance {})",
                matched.flavor_id, matched.distance
            );
        }
        Commands::ExportFlavor {
            vm,
            guest_info,
            output,
        } => {
            let guest = GuestDescriptor::from_file(&guest_info)?;
            let name = format!("osm-{}", vmshift::record::safe_vm_name(&vm));
            write_flavor_export(&output, flavor_resource(&name, &guest))?;
            println!("Exported flavor '{}' to {}", name, output.display());
        }
        Commands::ShowCommand { vm } => {
            config.validate()?;
            let cmd = build_command(
                &config.source_spec(),
                &config.destination_spec(),
                &config.conversion_options(),
                &vm,
            )?;
            println!("{}", cmd.join(" "));
        }
    }

    Ok(())
}
