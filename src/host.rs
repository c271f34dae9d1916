//! Host identity resolution.

use anyhow::{bail, Context, Result};

const HOSTNAME_PATHS: &[&str] = &["/proc/sys/kernel/hostname", "/etc/hostname"];

/// Resolve the system identity: the configured override when non-empty,
/// otherwise the OS hostname. An empty result is an error.
pub fn system_id(override_id: &str) -> Result<String> {
    let trimmed = override_id.trim();
    if !trimmed.is_empty() {
        return Ok(trimmed.to_string());
    }

    hostname()
}

/// Read the kernel hostname.
pub fn hostname() -> Result<String> {
    let mut last_err = None;

    for path in HOSTNAME_PATHS {
        match std::fs::read_to_string(path) {
            Ok(raw) => return parse_hostname(&raw).with_context(|| format!("reading {path}")),
            Err(e) => last_err = Some(anyhow::Error::new(e).context(format!("reading {path}"))),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no hostname source available")))
}

fn parse_hostname(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        bail!("hostname is empty");
    }
    Ok(name.to_string())
}
