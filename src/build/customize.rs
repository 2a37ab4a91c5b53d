//! Customization Planning
//!
//! Composes the ordered list of in-image operations for a template and
//! validates file injections before anything is handed to the customizer.

use super::pipeline::BuildMode;
use crate::catalog::TemplateSpec;
use crate::domain::CustomizeOp;
use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// cloud-init drop-in that keeps SSH host keys across first boot
pub const KEEP_HOST_KEYS_PATH: &str = "/etc/cloud/cloud.cfg.d/99-cloudbuilder-keep-hostkeys.cfg";
pub const KEEP_HOST_KEYS_CONTENT: &str = "ssh_deletekeys: false\n";

pub const ENABLE_PASSWORD_AUTH: &str =
    "sed -i 's/^#*PasswordAuthentication .*/PasswordAuthentication yes/' /etc/ssh/sshd_config";
pub const ENABLE_ROOT_LOGIN: &str =
    "sed -i 's/^#*PermitRootLogin .*/PermitRootLogin yes/' /etc/ssh/sshd_config";

/// Customization work derived from a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomizePlan {
    pub ops: Vec<CustomizeOp>,
    /// Whether anything beyond the always-on steps was requested
    pub requested: bool,
}

impl CustomizePlan {
    /// Whether the customizer should run at all
    pub fn should_run(&self, mode: BuildMode) -> bool {
        self.requested || mode == BuildMode::Update
    }
}

/// Build the ordered operation list for `spec`.
///
/// Relative copy sources resolve against `base_dir`.
pub fn plan(spec: &TemplateSpec, mode: BuildMode, base_dir: &Path) -> Result<CustomizePlan> {
    let mut ops = Vec::new();

    if spec.update_packages || mode == BuildMode::Update {
        ops.push(CustomizeOp::Update);
    }

    if !spec.install_packages.is_empty() {
        ops.push(CustomizeOp::Install(spec.install_packages.clone()));
    }

    for (source, dest) in &spec.copy_files {
        ops.push(copy_op(spec, source, dest, base_dir)?);
    }

    for cmd in &spec.run_commands {
        ops.push(CustomizeOp::RunCommand(cmd.clone()));
    }

    let requested = !ops.is_empty() || spec.ssh_password_auth || spec.ssh_root_login;

    ops.push(CustomizeOp::Write {
        path: KEEP_HOST_KEYS_PATH.to_string(),
        content: KEEP_HOST_KEYS_CONTENT.to_string(),
    });

    if spec.ssh_password_auth {
        ops.push(CustomizeOp::RunCommand(ENABLE_PASSWORD_AUTH.to_string()));
    }
    if spec.ssh_root_login {
        ops.push(CustomizeOp::RunCommand(ENABLE_ROOT_LOGIN.to_string()));
    }

    Ok(CustomizePlan { ops, requested })
}

fn copy_op(spec: &TemplateSpec, source: &str, dest: &str, base_dir: &Path) -> Result<CustomizeOp> {
    let invalid = |reason: String| Error::Validation {
        template: spec.name.clone(),
        reason,
    };

    let mut path = PathBuf::from(source);
    if path.is_relative() {
        path = base_dir.join(path);
    }
    if !path.is_file() {
        return Err(invalid(format!(
            "copy source {} does not exist",
            path.display()
        )));
    }

    if !is_directory_path(dest) {
        return Err(invalid(format!(
            "copy destination {} must be an absolute directory path",
            dest
        )));
    }

    Ok(CustomizeOp::CopyIn {
        source: path,
        dest_dir: dest.to_string(),
    })
}

/// Whether `dest` names a directory inside the image
pub fn is_directory_path(dest: &str) -> bool {
    let path = Path::new(dest);
    if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
        return false;
    }
    if dest.ends_with('/') {
        return true;
    }
    match path.file_name().and_then(|n| n.to_str()) {
        None => true,
        Some(last) => !last.contains('.') || last.ends_with(".d"),
    }
}
