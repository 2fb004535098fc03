//! Network reachability check.

use crate::error::Result;
use crate::exec::Executor;

/// Host probed by [`check_reachable`]'s standard probe.
pub const DEFAULT_PROBE_HOST: &str = "google.com";

/// Runs the standard reachability probe: four echo requests to `host`.
pub fn check_reachable(executor: &Executor, host: &str) -> Result<bool> {
    probe(executor, &format!("ping -c 4 {host}"))
}

/// Runs an arbitrary probe command and interprets the outcome.
///
/// Reachable means the probe exited successfully and printed something.
/// A non-zero exit is read as "unreachable" rather than as an error; only a
/// probe that cannot be run at all propagates a failure.
pub fn probe(executor: &Executor, command: &str) -> Result<bool> {
    let journal = executor.journal();
    let out = executor.capture_shell(command)?;

    if !out.success() {
        let code = out.status.unwrap_or(-1);
        journal.warn(format!(
            "network probe `{command}` exited with code {code}; unreachable"
        ));
        return Ok(false);
    }
    if out.stdout.trim().is_empty() {
        journal.warn(format!(
            "network probe `{command}` produced no output; unreachable"
        ));
        return Ok(false);
    }

    journal.info("network is reachable");
    Ok(true)
}
