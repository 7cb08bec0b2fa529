use crate::vmware::SourceConnectionSpec;
use crate::{Result, ShiftError, log_info, log_warn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Options of the `-o openstack` output driver: where the VDDK library
/// lives, the source host's certificate thumbprint, and the server-affinity
/// id that pins the converted disks to the conversion host instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationOutputSpec {
    pub vddk_libdir: PathBuf,
    pub vddk_thumbprint: String,
    pub conversion_host_id: String,
}

impl DestinationOutputSpec {
    pub fn validate(&self) -> Result<()> {
        if self.vddk_thumbprint.is_empty() {
            return Err(ShiftError::Config("vddk_thumbprint is required".into()));
        }
        if self.conversion_host_id.is_empty() {
            return Err(ShiftError::Config("conversion_host_id is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOptions {
    /// File the source password is read from (never passed on the argv).
    pub password_file: PathBuf,
    /// Hard wall-clock bound on the conversion process.
    pub timeout: Duration,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            password_file: PathBuf::from("/tmp/passwd"),
            timeout: Duration::from_secs(4 * 3600),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Build the full conversion argv. The shape is fixed by the external
/// tool's contract; everything variable is validated before it lands here.
pub fn build_command(
    source: &SourceConnectionSpec,
    dest: &DestinationOutputSpec,
    opts: &ConversionOptions,
    vm_name: &str,
) -> Result<Vec<String>> {
    dest.validate()?;
    if vm_name.is_empty() {
        return Err(ShiftError::Config("vm_name is required".into()));
    }
    let uri = source.connection_uri()?;

    let mut cmd = vec![
        "virt-v2v".to_string(),
        "-ip".to_string(),
        opts.password_file.display().to_string(),
        "-ic".to_string(),
        uri,
        "-it".to_string(),
        "vddk".to_string(),
        "-io".to_string(),
        format!("vddk-libdir={}", dest.vddk_libdir.display()),
        "-io".to_string(),
        format!("vddk-thumbprint={}", dest.vddk_thumbprint),
        "-o".to_string(),
        "openstack".to_string(),
        "-oo".to_string(),
        format!("server-id={}", dest.conversion_host_id),
    ];
    cmd.extend(opts.extra_args.iter().cloned());
    cmd.push(vm_name.to_string());
    Ok(cmd)
}

/// Seam between the orchestrator and the external conversion process.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, cmd: &[String]) -> Result<ConversionResult>;
}

/// Production converter: spawns the argv, captures output, enforces the
/// hard timeout. Any non-zero exit is a recoverable `ConversionFailed`, not
/// a crash; the orchestrator decides whether to retry.
pub struct VirtV2v {
    timeout: Duration,
}

impl VirtV2v {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Converter for VirtV2v {
    async fn convert(&self, cmd: &[String]) -> Result<ConversionResult> {
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| ShiftError::Config("empty conversion command".into()))?;
        log_info!("Running conversion: {}", cmd.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                log_warn!(
                    "Conversion exceeded {}s timeout, killing process",
                    self.timeout.as_secs()
                );
                return Err(ShiftError::ConversionFailed {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!(
                        "conversion timed out after {}s",
                        self.timeout.as_secs()
                    ),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(ShiftError::ConversionFailed {
                exit_code: output.status.code(),
                stdout,
                stderr,
            });
        }

        log_info!("Conversion finished successfully");
        Ok(ConversionResult {
            stdout,
            stderr,
            exit_code: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmware::Endpoint;

    fn sample_source() -> SourceConnectionSpec {
        SourceConnectionSpec {
            host: "test_host".to_string(),
            username: "test_user".to_string(),
            endpoint: Endpoint::Vcenter {
                datacenter: "Datacenter".to_string(),
                cluster: None,
                esxi_host: "test_esxi".to_string(),
            },
        }
    }

    fn sample_dest() -> DestinationOutputSpec {
        DestinationOutputSpec {
            vddk_libdir: PathBuf::from("/usr/lib/vmware-vix-disklib"),
            vddk_thumbprint: "XX:XX:XX:XX".to_string(),
            conversion_host_id: "test_conversion_id".to_string(),
        }
    }

    #[test]
    fn argv_matches_the_tool_contract() {
        let cmd = build_command(
            &sample_source(),
            &sample_dest(),
            &ConversionOptions::default(),
            "test_vm",
        )
        .unwrap();
        assert_eq!(
            cmd,
            vec![
                "virt-v2v",
                "-ip",
                "/tmp/passwd",
                "-ic",
                "vpx://test_user@test_host/Datacenter/test_esxi?no_verify=1",
                "-it",
                "vddk",
                "-io",
                "vddk-libdir=/usr/lib/vmware-vix-disklib",
                "-io",
                "vddk-thumbprint=XX:XX:XX:XX",
                "-o",
                "openstack",
                "-oo",
                "server-id=test_conversion_id",
                "test_vm",
            ]
        );
    }

    #[test]
    fn extra_args_land_before_the_vm_name() {
        let mut opts = ConversionOptions::default();
        opts.extra_args = vec!["--verbose".to_string()];
        let cmd = build_command(&sample_source(), &sample_dest(), &opts, "vm1").unwrap();
        let len = cmd.len();
        assert_eq!(cmd[len - 2], "--verbose");
        assert_eq!(cmd[len - 1], "vm1");
    }

    #[test]
    fn missing_thumbprint_is_a_config_error() {
        let mut dest = sample_dest();
        dest.vddk_thumbprint.clear();
        let err = build_command(
            &sample_source(),
            &dest,
            &ConversionOptions::default(),
            "vm1",
        )
        .unwrap_err();
        assert!(matches!(err, ShiftError::Config(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_recoverable_failure() {
        let converter = VirtV2v::new(Duration::from_secs(5));
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo progress; echo 'disk read error' >&2; exit 3".to_string(),
        ];
        let err = converter.convert(&cmd).await.unwrap_err();
        match err {
            ShiftError::ConversionFailed {
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(exit_code, Some(3));
                assert!(stdout.contains("progress"));
                assert!(stderr.contains("disk read error"));
            }
            other => panic!("expected ConversionFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn success_captures_output() {
        let converter = VirtV2v::new(Duration::from_secs(5));
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo converted".to_string(),
        ];
        let result = converter.convert(&cmd).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("converted"));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let converter = VirtV2v::new(Duration::from_millis(200));
        let cmd = vec!["sleep".to_string(), "30".to_string()];
        let err = converter.convert(&cmd).await.unwrap_err();
        match err {
            ShiftError::ConversionFailed { exit_code, stderr, .. } => {
                assert_eq!(exit_code, None);
                assert!(stderr.contains("timed out"));
            }
            other => panic!("expected ConversionFailed, got {:?}", other),
        }
    }
}
