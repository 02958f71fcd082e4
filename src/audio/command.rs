use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::MixerError;

/// Run an external tool and capture its stdout.
///
/// The child is killed if it outlives `limit`. A non-zero exit status is an
/// error carrying the tool's stderr.
pub async fn run_command(program: &str, args: &[String], limit: Duration) -> Result<String, MixerError> {
    log::debug!("Running {} {}", program, args.join(" "));

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| MixerError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| MixerError::Spawn {
            program: program.to_string(),
            source,
        })?,
        Err(_) => return Err(MixerError::Timeout(limit)),
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(MixerError::CommandFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
