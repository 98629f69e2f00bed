//! Remote shell pass-through.
//!
//! Only builds the `ssh` command line; the session itself replaces the
//! current process.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::vm::cloud_init;

/// Options for every session: guest host keys change whenever a VM is
/// recreated under the same name.
pub const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "ConnectTimeout=10",
];

/// Key generated for the VM by the payload builder, if present.
pub fn default_key(workdir: &Path) -> Option<PathBuf> {
    let key = cloud_init::key_path(workdir);
    key.is_file().then_some(key)
}

pub fn ssh_args(user: &str, ip: Ipv4Addr, key: Option<&Path>) -> Vec<String> {
    let mut args = vec![format!("{user}@{ip}")];
    if let Some(key) = key {
        args.push("-i".into());
        args.push(key.to_string_lossy().into_owned());
    }
    args.extend(SSH_OPTS.iter().map(|s| s.to_string()));
    args
}

/// Replace the current process with `program args...`. Returns only on
/// failure.
#[cfg(unix)]
pub fn exec(program: &str, args: &[String]) -> std::io::Error {
    use std::os::unix::process::CommandExt;
    std::process::Command::new(program).args(args).exec()
}
