use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::infra::http;
use crate::infra::shell;
use crate::vm::tenant::config::tenant_audit_log_path;

/// Audit event types for per-tenant audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditAction {
    InstanceCreated,
    InstanceStarted,
    InstanceStopped,
    InstanceWarmed,
    InstanceSlept,
    InstanceWoken,
    InstanceDestroyed,
    PoolCreated,
    PoolBuilt,
    PoolDestroyed,
    TenantCreated,
    TenantDestroyed,
    QuotaExceeded,
    SecretsRotated,
    SnapshotCreated,
    SnapshotRestored,
    SnapshotDeleted,
    TransitionDeferred,
    MinRuntimeOverridden,
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub tenant_id: String,
    pub pool_id: Option<String>,
    pub instance_id: Option<String>,
    pub action: AuditAction,
    pub detail: Option<String>,
}

/// Append an audit event to the tenant's audit log.
///
/// Each event is a single JSON line appended to `tenants/<tenant>/audit.log`.
/// The log is append-only — entries are never modified or deleted.
pub fn log_event(
    tenant_id: &str,
    pool_id: Option<&str>,
    instance_id: Option<&str>,
    action: AuditAction,
    detail: Option<&str>,
) -> Result<()> {
    let entry = AuditEntry {
        timestamp: http::utc_now(),
        tenant_id: tenant_id.to_string(),
        pool_id: pool_id.map(|s| s.to_string()),
        instance_id: instance_id.map(|s| s.to_string()),
        action,
        detail: detail.map(|s| s.to_string()),
    };

    let json_line =
        serde_json::to_string(&entry).with_context(|| "Failed to serialize audit entry")?;

    let log_path = tenant_audit_log_path(tenant_id);

    // Append JSON line atomically (>> is append, single write)
    shell::run_in_vm(&format!(
        "echo '{}' >> {}",
        json_line.replace('\'', "'\\''"),
        log_path,
    ))
    .with_context(|| format!("Failed to write audit log for tenant {}", tenant_id))?;

    Ok(())
}

/// Maximum audit log size before rotation (10 MiB).
const MAX_AUDIT_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Number of rotated audit log files to keep.
const KEEP_ROTATED: u32 = 3;

/// Rotate an audit log if it exceeds the size limit.
///
/// Rotation scheme: audit.log → audit.log.1.gz → audit.log.2.gz → audit.log.3.gz
/// Keeps the most recent `KEEP_ROTATED` compressed files.
pub fn rotate_audit_log(tenant_id: &str) -> Result<()> {
    let log_path = tenant_audit_log_path(tenant_id);

    // Check file size
    let size_str =
        shell::run_in_vm_stdout(&format!("stat -c%s {} 2>/dev/null || echo 0", log_path))?;
    let size: u64 = size_str.trim().parse().unwrap_or(0);

    if size < MAX_AUDIT_LOG_BYTES {
        return Ok(());
    }

    // Rotate: shift existing numbered files up, drop oldest
    for i in (1..KEEP_ROTATED).rev() {
        let from = format!("{}.{}.gz", log_path, i);
        let to = format!("{}.{}.gz", log_path, i + 1);
        let _ = shell::run_in_vm(&format!("mv {} {} 2>/dev/null || true", from, to));
    }

    // Compress current log to .1.gz and truncate
    shell::run_in_vm(&format!(
        "gzip -c {} > {}.1.gz && truncate -s 0 {}",
        log_path, log_path, log_path
    ))
    .with_context(|| format!("Failed to rotate audit log for tenant {}", tenant_id))?;

    // Remove any file beyond KEEP_ROTATED
    let oldest = format!("{}.{}.gz", log_path, KEEP_ROTATED + 1);
    let _ = shell::run_in_vm(&format!("rm -f {}", oldest));

    Ok(())
}

/// Read the last N audit log entries for a tenant.
pub fn read_audit_log(tenant_id: &str, last_n: usize) -> Result<Vec<AuditEntry>> {
    let log_path = tenant_audit_log_path(tenant_id);

    let output = shell::run_in_vm_stdout(&format!(
        "tail -n {} {} 2>/dev/null || true",
        last_n, log_path
    ))?;

    let mut entries = Vec::new();
    for line in output.lines().filter(|l| !l.is_empty()) {
        if let Ok(entry) = serde_json::from_str::<AuditEntry>(line) {
            entries.push(entry);
        }
    }

    Ok(entries)
}
