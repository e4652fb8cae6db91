//! PID file handling for signal dispatch between gateway processes.
use std::{fs, path::Path};

use eyre::{Context, Result, eyre};

/// Where the running gateway records its process id.
pub const PID_FILE: &str = "/tmp/gateway.pid";

pub fn write_pid_file(path: impl AsRef<Path>) -> Result<()> {
    let pid = std::process::id();
    fs::write(path.as_ref(), pid.to_string())
        .wrap_err_with(|| format!("failed to write PID file {}", path.as_ref().display()))
}

pub fn read_pid_file(path: impl AsRef<Path>) -> Result<i32> {
    let raw = fs::read_to_string(path.as_ref())
        .wrap_err_with(|| format!("failed to read PID file {}", path.as_ref().display()))?;
    raw.trim()
        .parse()
        .map_err(|_| eyre!("PID file {} is corrupt: '{raw}'", path.as_ref().display()))
}

pub fn remove_pid_file(path: impl AsRef<Path>) {
    if let Err(e) = fs::remove_file(path.as_ref()) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(
                path = %path.as_ref().display(),
                error = %e,
                "failed to remove PID file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.pid");

        write_pid_file(&path).unwrap();
        let pid = read_pid_file(&path).unwrap();
        assert_eq!(pid, std::process::id() as i32);

        remove_pid_file(&path);
        assert!(read_pid_file(&path).is_err());
    }

    #[test]
    fn corrupt_pid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.pid");
        fs::write(&path, "not-a-pid").unwrap();
        assert!(read_pid_file(&path).is_err());
    }

    #[test]
    fn removing_missing_file_is_silent() {
        remove_pid_file("/tmp/definitely-not-there.pid");
    }
}
