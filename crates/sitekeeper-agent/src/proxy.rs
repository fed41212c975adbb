//! Drives the local reverse proxy via shell commands from configuration —
//! config test, reload, start — the same `std::process::Command` idiom the
//! teacher's CLI uses for its own external-process calls
//! (`zvault-cli::cloud::run_command`), adapted to `tokio::process` so the
//! sync engine never blocks a worker thread on a subprocess.

use tokio::process::Command;

use sitekeeper_core::error::SyncError;

/// Runs `template` with `{path}` substituted, returning an error carrying
/// the process's stderr if it exits non-zero.
pub async fn test_config(template: &str, domain: &str, path: &str) -> Result<(), SyncError> {
    let command = template.replace("{path}", path);
    run(&command)
        .await
        .map_err(|reason| SyncError::ProxyConfigInvalid {
            domain: domain.to_owned(),
            reason,
        })
}

/// Starts the proxy if it is not already running.
pub async fn start(command: &str) -> Result<(), SyncError> {
    run(command).await.map_err(|reason| SyncError::ProxyReload { reason })
}

/// Signals the running proxy to reload its configuration.
pub async fn reload(command: &str) -> Result<(), SyncError> {
    run(command).await.map_err(|reason| SyncError::ProxyReload { reason })
}

/// Whether the proxy process currently appears to be running, checked via
/// `pgrep -x <name>` against the first token of the start command.
pub async fn is_running(start_command: &str) -> bool {
    let Some(program) = start_command.split_whitespace().next() else {
        return false;
    };
    let binary = program.rsplit('/').next().unwrap_or(program);
    Command::new("pgrep")
        .arg("-x")
        .arg(binary)
        .status()
        .await
        .is_ok_and(|status| status.success())
}

async fn run(command: &str) -> Result<(), String> {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return Err("empty command".to_owned());
    };
    let output = Command::new(program)
        .args(parts)
        .output()
        .await
        .map_err(|e| format!("failed to execute '{command}': {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "'{command}' exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}
