//! virt-customize Adapter

use super::process::{run_bounded, RunOutcome};
use crate::domain::{CustomizeOp, CustomizeStatus, DiskCustomizer};
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// [`DiskCustomizer`] backed by libguestfs `virt-customize`
pub struct VirtCustomize {
    binary: String,
}

impl VirtCustomize {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for VirtCustomize {
    fn default() -> Self {
        Self::new("virt-customize")
    }
}

/// Command-line arguments for `ops` applied to `image`
pub fn command_args(image: &Path, ops: &[CustomizeOp]) -> Vec<String> {
    let mut argv = vec!["-a".to_string(), image.display().to_string()];
    for op in ops {
        match op {
            CustomizeOp::Update => argv.push("--update".into()),
            CustomizeOp::Install(pkgs) => {
                argv.push("--install".into());
                argv.push(pkgs.join(","));
            }
            CustomizeOp::CopyIn { source, dest_dir } => {
                argv.push("--copy-in".into());
                argv.push(format!("{}:{}", source.display(), dest_dir));
            }
            CustomizeOp::RunCommand(cmd) => {
                argv.push("--run-command".into());
                argv.push(cmd.clone());
            }
            CustomizeOp::Write { path, content } => {
                argv.push("--write".into());
                argv.push(format!("{}:{}", path, content));
            }
        }
    }
    argv
}

#[async_trait]
impl DiskCustomizer for VirtCustomize {
    async fn customize(
        &self,
        image: &Path,
        ops: &[CustomizeOp],
        timeout: Duration,
    ) -> Result<CustomizeStatus> {
        let argv = command_args(image, ops);
        debug!(image = %image.display(), steps = ops.len(), "Running virt-customize");

        Ok(match run_bounded(&self.binary, &argv, timeout).await? {
            RunOutcome::TimedOut => CustomizeStatus::TimedOut,
            RunOutcome::Finished(out) => {
                if !out.success() {
                    warn!(code = ?out.code, "virt-customize failed");
                }
                CustomizeStatus::Exited {
                    code: out.code,
                    diagnostics: out.diagnostics(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_command_args() {
        let ops = vec![
            CustomizeOp::Update,
            CustomizeOp::Install(vec!["nginx".into(), "curl".into()]),
            CustomizeOp::CopyIn {
                source: PathBuf::from("/srv/motd"),
                dest_dir: "/etc/".into(),
            },
            CustomizeOp::RunCommand("systemctl enable nginx".into()),
            CustomizeOp::Write {
                path: "/etc/cloud/cloud.cfg.d/99.cfg".into(),
                content: "ssh_deletekeys: false\n".into(),
            },
        ];

        assert_eq!(
            command_args(Path::new("/tmp/web.qcow2"), &ops),
            vec![
                "-a",
                "/tmp/web.qcow2",
                "--update",
                "--install",
                "nginx,curl",
                "--copy-in",
                "/srv/motd:/etc/",
                "--run-command",
                "systemctl enable nginx",
                "--write",
                "/etc/cloud/cloud.cfg.d/99.cfg:ssh_deletekeys: false\n",
            ]
        );
    }
}
