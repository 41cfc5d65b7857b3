use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::util::run_cmd;

const DEFAULT_KEY_NAME: &str = "id_ed25519";

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

pub fn default_key_path() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".ssh").join(DEFAULT_KEY_NAME))
}

pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut name = OsString::from(private_key.as_os_str());
    name.push(".pub");
    PathBuf::from(name)
}

/// The single authorized_keys line for `private_key`'s `.pub` companion.
pub fn read_public_key(private_key: &Path) -> Result<String> {
    let path = public_key_path(private_key);
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read public key {}", path.display()))?;
    let line = contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .with_context(|| format!("Public key {} is empty", path.display()))?;
    if !line.starts_with("ssh-") && !line.starts_with("ecdsa-") {
        bail!("{} does not look like an OpenSSH public key", path.display());
    }
    Ok(line.to_string())
}

/// Creates an ed25519 key pair at `private_key` unless one already exists.
/// Returns whether a new key was generated.
pub fn ensure_keypair(private_key: &Path, comment: &str) -> Result<bool> {
    if private_key.exists() {
        if !public_key_path(private_key).exists() {
            bail!(
                "{} exists but {} is missing",
                private_key.display(),
                public_key_path(private_key).display()
            );
        }
        return Ok(false);
    }
    if let Some(parent) = private_key.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
            restrict_dir(parent)?;
        }
    }
    let mut cmd = Command::new("ssh-keygen");
    cmd.args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
        .arg(private_key);
    run_cmd(cmd).context("ssh-keygen failed")?;
    tracing::info!(path = %private_key.display(), "generated SSH key pair");
    Ok(true)
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<()> {
    Ok(())
}
