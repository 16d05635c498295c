//! Whitelisted remote command execution. Grounded on `fleet_agent.py`'s
//! `_execute_command` dispatch, restated against the explicit `Command`
//! enum rather than a string-keyed branch.

use fleet_core::crypto;
use fleet_core::wire::Command;
use sysinfo::{PidExt, ProcessExt, System, SystemExt};

pub struct CommandOutcome {
    pub success: bool,
    pub detail: String,
    /// Set by `RestartAgent`: the caller should ack this outcome first,
    /// then schedule a delayed process exit so an init system/supervisor
    /// restarts the agent.
    pub restart_requested: bool,
}

impl CommandOutcome {
    fn ok(detail: impl Into<String>) -> Self {
        Self { success: true, detail: detail.into(), restart_requested: false }
    }
    fn fail(detail: impl Into<String>) -> Self {
        Self { success: false, detail: detail.into(), restart_requested: false }
    }
}

/// Executes a single command. `encryption_key` is read/replaced by
/// `rotate_encryption_key`; the caller persists the returned new key.
pub fn execute(command: &Command, encryption_key: &Option<String>) -> (CommandOutcome, Option<String>) {
    match command {
        Command::KillProcess { pid } => {
            let mut system = System::new();
            system.refresh_processes();
            match system.process(sysinfo::Pid::from_u32(*pid)) {
                Some(process) => {
                    let name = process.name().to_string();
                    if process.kill() {
                        (CommandOutcome::ok(format!("Process {name} (PID: {pid}) terminated")), None)
                    } else {
                        (CommandOutcome::fail(format!("Failed to terminate process {pid}")), None)
                    }
                }
                None => (CommandOutcome::fail(format!("Process {pid} not found")), None),
            }
        }

        Command::RestartAgent => {
            tracing::info!("agent_restart_requested");
            let mut outcome = CommandOutcome::ok("Agent restart initiated");
            outcome.restart_requested = true;
            (outcome, None)
        }

        Command::ClearDnsCache => {
            let result = clear_dns_cache();
            match result {
                Ok(()) => (CommandOutcome::ok("DNS cache cleared"), None),
                Err(e) => (CommandOutcome::fail(format!("Error clearing DNS cache: {e}")), None),
            }
        }

        Command::RotateEncryptionKey { envelope } => {
            let Some(current_key) = encryption_key else {
                return (CommandOutcome::fail("E2EE not enabled on this agent"), None);
            };
            match crypto::decrypt_payload(current_key, envelope) {
                Ok(data) => match data.get("new_key").and_then(|v| v.as_str()) {
                    Some(new_key) => {
                        let new_key = new_key.to_string();
                        (CommandOutcome::ok("Encryption key rotated successfully"), Some(new_key))
                    }
                    None => (CommandOutcome::fail("Invalid key rotation payload"), None),
                },
                Err(e) => (CommandOutcome::fail(format!("Key rotation failed: {e}")), None),
            }
        }

        Command::Unknown => (CommandOutcome::fail("Unknown command action"), None),
    }
}

#[cfg(target_os = "macos")]
fn clear_dns_cache() -> std::io::Result<()> {
    std::process::Command::new("dscacheutil").args(["-flushcache"]).status()?;
    std::process::Command::new("killall").args(["-HUP", "mDNSResponder"]).status()?;
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn clear_dns_cache() -> std::io::Result<()> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "DNS cache clearing is only implemented on macOS"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_agent_flags_outcome_for_delayed_exit() {
        let (outcome, key) = execute(&Command::RestartAgent, &None);
        assert!(outcome.success);
        assert!(outcome.restart_requested);
        assert!(key.is_none());
    }

    #[test]
    fn unknown_command_fails_without_restart() {
        let (outcome, _) = execute(&Command::Unknown, &None);
        assert!(!outcome.success);
        assert!(!outcome.restart_requested);
    }

    #[test]
    fn rotate_key_without_current_key_fails() {
        let envelope = crypto::encrypt_payload(&crypto::generate_envelope_key(), &serde_json::json!({})).unwrap();
        let (outcome, new_key) = execute(&Command::RotateEncryptionKey { envelope }, &None);
        assert!(!outcome.success);
        assert!(new_key.is_none());
    }

    #[test]
    fn rotate_key_decrypts_and_returns_new_key() {
        let old_key = crypto::generate_envelope_key();
        let new_key = crypto::generate_envelope_key();
        let envelope = crypto::encrypt_payload(&old_key, &serde_json::json!({"new_key": new_key})).unwrap();
        let (outcome, returned_key) =
            execute(&Command::RotateEncryptionKey { envelope }, &Some(old_key));
        assert!(outcome.success);
        assert_eq!(returned_key, Some(new_key));
    }

    #[test]
    fn kill_process_reports_missing_pid() {
        let (outcome, _) = execute(&Command::KillProcess { pid: u32::MAX }, &None);
        assert!(!outcome.success);
    }
}
