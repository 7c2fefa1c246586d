use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Socket home when the daemon runs as root. Owned by root, mode 0700.
pub const SECURE_SOCKET_DIR: &str = "/var/lib/croncommander";
pub const SOCKET_FILE_NAME: &str = "cc-agent.sock";

pub fn effective_uid() -> u32 {
    #[cfg(unix)]
    {
        nix::unistd::Uid::effective().as_raw()
    }
    #[cfg(not(unix))]
    {
        u32::MAX
    }
}

/// Resolves where the report socket lives for this process.
///
/// Root daemons use the secure base directory. Non-root daemons prefer the
/// user's runtime directory and otherwise fall back to a private per-uid
/// subdirectory of the system temp dir; a bare socket in a shared /tmp would
/// be open to hijacking.
pub fn default_socket_path() -> PathBuf {
    if effective_uid() == 0 {
        return socket_path_in(Path::new(SECURE_SOCKET_DIR));
    }
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return socket_path_in(Path::new(&runtime_dir));
        }
    }
    let private = std::env::temp_dir().join(format!("cc-agent-{}", effective_uid()));
    socket_path_in(&private)
}

pub fn socket_path_in(base: &Path) -> PathBuf {
    base.join(SOCKET_FILE_NAME)
}

/// Verifies (creating if absent) the socket's parent directory: a real
/// directory, not a symlink, owned by the effective uid, mode exactly 0700.
/// Any violation is fatal to the IPC endpoint.
#[cfg(unix)]
pub fn ensure_socket_dir(socket_path: &Path) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::{DirBuilderExt, MetadataExt};

    let dir = socket_path
        .parent()
        .with_context(|| format!("socket path {} has no parent", socket_path.display()))?;

    match fs::symlink_metadata(dir) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let _mask = ScopedUmask::new(0o077);
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true).mode(0o700);
            builder
                .create(dir)
                .with_context(|| format!("failed to create socket directory {}", dir.display()))?;
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to stat socket directory {}", dir.display()));
        }
        Ok(_) => {}
    }

    let meta = fs::symlink_metadata(dir)
        .with_context(|| format!("failed to stat socket directory {}", dir.display()))?;
    if meta.file_type().is_symlink() {
        bail!("insecure socket directory: {} is a symlink", dir.display());
    }
    if !meta.is_dir() {
        bail!("socket directory {} is not a directory", dir.display());
    }

    let euid = effective_uid();
    if meta.uid() != euid {
        bail!(
            "insecure socket directory: {} is owned by uid {}, expected {}",
            dir.display(),
            meta.uid(),
            euid
        );
    }
    let mode = meta.mode() & 0o777;
    if mode != 0o700 {
        bail!(
            "insecure socket directory: {} has mode {:o}, expected 0700",
            dir.display(),
            mode
        );
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn ensure_socket_dir(_socket_path: &Path) -> Result<()> {
    bail!("unix domain sockets are not supported on this platform");
}

/// Applies a process umask for the lifetime of the guard.
#[cfg(unix)]
pub struct ScopedUmask {
    previous: nix::sys::stat::Mode,
}

#[cfg(unix)]
impl ScopedUmask {
    pub fn new(mask: u32) -> Self {
        let mode = nix::sys::stat::Mode::from_bits_truncate(mask);
        Self {
            previous: nix::sys::stat::umask(mode),
        }
    }
}

#[cfg(unix)]
impl Drop for ScopedUmask {
    fn drop(&mut self) {
        nix::sys::stat::umask(self.previous);
    }
}

/// Blocks privilege escalation through setuid binaries and file capabilities
/// for the process and everything it execs. Linux kernel 3.5+.
#[cfg(target_os = "linux")]
pub fn set_no_new_privs() {
    if let Err(err) = nix::sys::prctl::set_no_new_privs() {
        warn!(event = "no_new_privs_failed", error = %err);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_no_new_privs() {}

/// Accepts a peer only if it runs as the agent's effective uid or as root.
/// Keeps foreign-uid processes from submitting forged reports through a
/// world-reachable path.
#[cfg(target_os = "linux")]
pub fn verify_peer(stream: &tokio::net::UnixStream) -> std::io::Result<()> {
    let cred = stream.peer_cred()?;
    let peer_uid = cred.uid();
    let euid = effective_uid();
    if peer_uid != euid && peer_uid != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("peer uid {peer_uid} rejected, expected {euid} or 0"),
        ));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn verify_peer(_stream: &tokio::net::UnixStream) -> std::io::Result<()> {
    Ok(())
}

pub fn hostname() -> String {
    #[cfg(unix)]
    {
        match nix::unistd::gethostname() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(_) => "unknown".to_string(),
        }
    }
    #[cfg(not(unix))]
    {
        "unknown".to_string()
    }
}

pub fn current_username() -> String {
    #[cfg(unix)]
    {
        match nix::unistd::User::from_uid(nix::unistd::Uid::effective()) {
            Ok(Some(user)) => user.name,
            _ => "unknown".to_string(),
        }
    }
    #[cfg(not(unix))]
    {
        "unknown".to_string()
    }
}

/// Descriptive OS string for registration: distro name plus version on
/// Linux, the platform family elsewhere.
pub fn os_description() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(contents) = std::fs::read_to_string("/etc/os-release") {
            if let Some(desc) = parse_os_release(&contents) {
                return desc;
            }
        }
    }
    std::env::consts::OS.to_string()
}

fn parse_os_release(contents: &str) -> Option<String> {
    let mut name = None;
    let mut version = None;
    for line in contents.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("NAME=") {
            name = Some(strip_os_release_quotes(value));
        } else if let Some(value) = line.strip_prefix("VERSION=") {
            version = Some(strip_os_release_quotes(value));
        }
    }

    let name = name.filter(|value| !value.is_empty())?;
    match version.filter(|value| !value.is_empty()) {
        Some(version) => Some(format!("{name} {version}")),
        None => Some(name),
    }
}

fn strip_os_release_quotes(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && (value.starts_with('"') || value.starts_with('\'')) {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}
