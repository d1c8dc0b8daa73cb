//! Process attachment metadata.
//!
//! Each attached process publishes a small JSON file
//! `/dev/shm/<ns>.<role>.meta` describing itself, so tooling (and the
//! cleanup utility) can tell whether a namespace is currently in use and by
//! whom. Stale files from crashed processes are detected by probing the
//! recorded pid.

use crate::error::{IpcError, IpcResult};
use crate::platform::{is_process_alive, shm_path};
use axon::ProcessRole;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a process attached to a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMeta {
    /// OS pid of the attached process.
    pub pid: u32,
    /// Role it attached as.
    pub role: ProcessRole,
    /// Attach time, seconds since the epoch.
    pub attached_at_secs: u64,
}

fn meta_name(namespace: &str, role: ProcessRole) -> String {
    format!("{namespace}.{role}.meta")
}

/// Publish this process's attachment record.
///
/// Fails with [`IpcError::ResourceInit`] when a live process already holds
/// the role; silently replaces a record left behind by a dead one.
pub fn publish(namespace: &str, role: ProcessRole, pid: u32) -> IpcResult<()> {
    let name = meta_name(namespace, role);
    if let Some(existing) = read(namespace, role)?
        && existing.pid != pid
        && is_process_alive(existing.pid)
    {
        return Err(IpcError::resource_init(
            &name,
            format!("role {role} already held by live pid {}", existing.pid),
        ));
    }

    let meta = ProcessMeta {
        pid,
        role,
        attached_at_secs: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    };
    let json = serde_json::to_string_pretty(&meta)?;
    std::fs::write(shm_path(&name), json)?;
    Ok(())
}

/// Read a role's attachment record, if present.
pub fn read(namespace: &str, role: ProcessRole) -> IpcResult<Option<ProcessMeta>> {
    let path = shm_path(&meta_name(namespace, role));
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Remove a role's attachment record. Missing files are fine.
pub fn remove(namespace: &str, role: ProcessRole) {
    let _ = std::fs::remove_file(shm_path(&meta_name(namespace, role)));
}

/// Pids of live processes currently attached to the namespace.
pub fn live_attachments(namespace: &str) -> IpcResult<Vec<ProcessMeta>> {
    let mut live = Vec::new();
    for role in [ProcessRole::Server, ProcessRole::Client] {
        if let Some(meta) = read(namespace, role)?
            && is_process_alive(meta.pid)
        {
            live.push(meta);
        }
    }
    Ok(live)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::current_pid;

    fn test_ns(tag: &str) -> String {
        format!("axon_test_meta_{}_{}", current_pid(), tag)
    }

    fn cleanup(ns: &str) {
        remove(ns, ProcessRole::Server);
        remove(ns, ProcessRole::Client);
    }

    #[test]
    fn test_publish_read_remove() {
        let ns = test_ns("round_trip");
        publish(&ns, ProcessRole::Server, current_pid()).unwrap();

        let meta = read(&ns, ProcessRole::Server).unwrap().unwrap();
        assert_eq!(meta.pid, current_pid());
        assert_eq!(meta.role, ProcessRole::Server);

        assert_eq!(live_attachments(&ns).unwrap().len(), 1);
        cleanup(&ns);
        assert!(read(&ns, ProcessRole::Server).unwrap().is_none());
    }

    #[test]
    fn test_live_holder_blocks_role() {
        let ns = test_ns("conflict");
        publish(&ns, ProcessRole::Server, current_pid()).unwrap();
        // A different (fake) pid may not take the role while we live.
        let result = publish(&ns, ProcessRole::Server, current_pid() + 1);
        assert!(matches!(result, Err(IpcError::ResourceInit { .. })));
        cleanup(&ns);
    }

    #[test]
    fn test_stale_record_is_replaced() {
        let ns = test_ns("stale");
        // Pid 0 is never a live peer process.
        let stale = ProcessMeta {
            pid: 0,
            role: ProcessRole::Client,
            attached_at_secs: 0,
        };
        std::fs::write(
            shm_path(&format!("{ns}.client.meta")),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        publish(&ns, ProcessRole::Client, current_pid()).unwrap();
        let meta = read(&ns, ProcessRole::Client).unwrap().unwrap();
        assert_eq!(meta.pid, current_pid());
        cleanup(&ns);
    }
}
