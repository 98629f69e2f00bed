//! First-boot payload (cloud-init NoCloud seed).
//!
//! `user-data` and `meta-data` are staged under `<workdir>/cloud-init/` and
//! packed into `<workdir>/cidata.iso` with the `cidata` volume label, which
//! guest cloud-init picks up on first boot.
//!
//! The whole builder is best-effort from the caller's point of view: every
//! error here is returned, and the lifecycle controller downgrades it to a
//! warning.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{GuestSettings, ToolSettings};
use crate::error::{Result, VmError};
use crate::vm::tools;

pub const VOLUME_LABEL: &str = "cidata";
pub const STAGING_DIR: &str = "cloud-init";
pub const PAYLOAD_IMAGE: &str = "cidata.iso";
pub const KEY_DIR: &str = "ssh";
pub const KEY_NAME: &str = "vm_key";
/// Guest path the bootstrap completion marker is appended to.
pub const BOOTSTRAP_LOG: &str = "/var/log/vmsmith-bootstrap.log";
pub const BOOTSTRAP_MARKER: &str = "vmsmith bootstrap complete";

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct UserData<'a> {
    hostname: &'a str,
    users: Vec<UserEntry<'a>>,
    ssh_pwauth: bool,
    chpasswd: Chpasswd,
    package_update: bool,
    packages: &'a [String],
    runcmd: Vec<String>,
}

#[derive(Debug, Serialize)]
struct UserEntry<'a> {
    name: &'a str,
    sudo: &'static str,
    shell: &'static str,
    groups: &'static str,
    lock_passwd: bool,
    plain_text_passwd: &'a str,
    ssh_authorized_keys: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct Chpasswd {
    expire: bool,
}

#[derive(Debug, Serialize)]
struct MetaData<'a> {
    #[serde(rename = "instance-id")]
    instance_id: String,
    #[serde(rename = "local-hostname")]
    local_hostname: &'a str,
}

/// Render the `#cloud-config` user-data document.
pub fn render_user_data(name: &str, guest: &GuestSettings, public_key: &str) -> Result<String> {
    let doc = UserData {
        hostname: name,
        users: vec![UserEntry {
            name: &guest.user,
            sudo: "ALL=(ALL) NOPASSWD:ALL",
            shell: "/bin/bash",
            groups: "sudo",
            lock_passwd: false,
            plain_text_passwd: &guest.password,
            ssh_authorized_keys: vec![public_key.trim()],
        }],
        ssh_pwauth: true,
        chpasswd: Chpasswd { expire: false },
        package_update: true,
        packages: &guest.packages,
        runcmd: vec![
            "systemctl enable ssh".into(),
            "systemctl start ssh".into(),
            "ufw allow ssh || true".into(),
            format!("echo '{BOOTSTRAP_MARKER}' >> {BOOTSTRAP_LOG}"),
        ],
    };

    let yaml = serde_yaml::to_string(&doc)
        .map_err(|e| VmError::provisioning("first-boot payload", "user-data", e))?;
    Ok(format!("#cloud-config\n{yaml}"))
}

pub fn render_meta_data(name: &str) -> Result<String> {
    let doc = MetaData { instance_id: format!("vmsmith-{name}"), local_hostname: name };
    serde_yaml::to_string(&doc).map_err(|e| VmError::provisioning("first-boot payload", "meta-data", e))
}

// ---------------------------------------------------------------------------
// Key pair
// ---------------------------------------------------------------------------

pub fn key_path(workdir: &Path) -> PathBuf {
    workdir.join(KEY_DIR).join(KEY_NAME)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: PathBuf,
    pub public_key: String,
    /// `false` when the pair already existed.
    pub generated: bool,
}

/// Generate an ed25519 pair under `<workdir>/ssh/`, or reuse the existing one.
pub fn ensure_key_pair(ssh_keygen: &str, workdir: &Path, name: &str) -> Result<KeyPair> {
    let private_key = key_path(workdir);
    let public_path = private_key.with_extension("pub");

    let generated = if private_key.exists() && public_path.exists() {
        false
    } else {
        let dir = workdir.join(KEY_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| VmError::provisioning("ssh key pair", &dir, e))?;
        // ssh-keygen prompts before overwriting a stale half of the pair.
        let _ = std::fs::remove_file(&private_key);
        let _ = std::fs::remove_file(&public_path);

        let comment = format!("vmsmith@{name}");
        let key_arg = private_key.to_string_lossy().into_owned();
        tools::run(
            ssh_keygen,
            ["-t", "ed25519", "-N", "", "-C", comment.as_str(), "-f", key_arg.as_str(), "-q"],
            "generate ssh key pair",
        )
        .map_err(|e| VmError::provisioning("ssh key pair", &private_key, e))?;
        info!(path = %private_key.display(), "generated ssh key pair");
        true
    };

    let public_key = std::fs::read_to_string(&public_path)
        .map_err(|e| VmError::provisioning("ssh key pair", &public_path, e))?
        .trim()
        .to_string();
    Ok(KeyPair { private_key, public_key, generated })
}

// ---------------------------------------------------------------------------
// Packing
// ---------------------------------------------------------------------------

/// Arguments for `packer` to turn `staging` into a hybrid image at `image`.
pub fn packer_args(packer: &str, staging: &Path, image: &Path) -> Vec<String> {
    let image = image.to_string_lossy().into_owned();
    let staging = staging.to_string_lossy().into_owned();
    let is_hdiutil = Path::new(packer).file_name().is_some_and(|f| f == "hdiutil");

    let args: Vec<&str> = if is_hdiutil {
        vec!["makehybrid", "-iso", "-joliet", "-default-volume-name", VOLUME_LABEL, "-ov", "-o", image.as_str(), staging.as_str()]
    } else {
        vec!["-output", image.as_str(), "-volid", VOLUME_LABEL, "-joliet", "-rock", "-quiet", staging.as_str()]
    };
    args.into_iter().map(String::from).collect()
}

/// Pack `staging` into `image`, replacing any image left by an earlier build.
pub fn pack(packer: &str, staging: &Path, image: &Path) -> Result<()> {
    match std::fs::remove_file(image) {
        Ok(()) => debug!(path = %image.display(), "removed stale first-boot payload image"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(VmError::provisioning("first-boot payload", image, e)),
    }
    tools::run(packer, packer_args(packer, staging, image), "pack first-boot payload")
        .map_err(|e| VmError::provisioning("first-boot payload", image, e))?;
    if !image.is_file() {
        return Err(VmError::provisioning("first-boot payload", image, format!("{packer} produced no image")));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub image: PathBuf,
    pub public_key: String,
    /// Private key generated for this VM, when no key was supplied.
    pub generated_key: Option<PathBuf>,
}

/// Stage and pack the first-boot payload for `name` in `workdir`.
///
/// `supplied_key` is public key text; without it a key pair is generated
/// (once) under the working directory.
pub fn build_payload(
    tools: &ToolSettings,
    guest: &GuestSettings,
    name: &str,
    workdir: &Path,
    supplied_key: Option<&str>,
) -> Result<Payload> {
    let (public_key, generated_key) = match supplied_key.map(str::trim).filter(|k| !k.is_empty()) {
        Some(key) => (key.to_string(), None),
        None => {
            let pair = ensure_key_pair(&tools.ssh_keygen, workdir, name)?;
            (pair.public_key, Some(pair.private_key))
        }
    };

    let staging = workdir.join(STAGING_DIR);
    std::fs::create_dir_all(&staging).map_err(|e| VmError::provisioning("first-boot payload", &staging, e))?;

    for (file, contents) in [
        ("user-data", render_user_data(name, guest, &public_key)?),
        ("meta-data", render_meta_data(name)?),
    ] {
        let path = staging.join(file);
        std::fs::write(&path, contents).map_err(|e| VmError::provisioning("first-boot payload", &path, e))?;
    }

    let image = workdir.join(PAYLOAD_IMAGE);
    pack(&tools.payload_packer, &staging, &image)?;
    info!(vm = name, image = %image.display(), "built first-boot payload");

    Ok(Payload { image, public_key, generated_key })
}
