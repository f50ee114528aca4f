//! Public contract of the Network Manager: `prepareNetwork`,
//! `cleanupNetwork`, `getTapIP`, `listTapDevices`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::instrument;
use vmexec_core::CommandRunner;
use vmexec_core::cancel::CancelToken;
use vmexec_core::error::ExecutorError;
use vmexec_core::task::Task;

use crate::bridge;
use crate::ip_alloc::IpAllocator;
use crate::tap::{self, TapRecord};

/// Static configuration the manager is constructed with — the host-side
/// half of the network setup that doesn't vary per task.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub bridge_name: String,
    pub bridge_ip: Option<String>,
    pub nat_enabled: bool,
    pub subnet: Option<String>,
}

struct State {
    bridge_configured: bool,
    nat_configured: bool,
    taps: HashMap<String, TapRecord>,
}

/// Maintains the host bridge, per-task TAP devices, and the IP allocator.
/// One mutex guards `bridge_configured`, `nat_configured`, and the TAP
/// registry; the allocator carries its own lock, matching the component's
/// thread-safety contract.
pub struct NetworkManager {
    runner: Arc<dyn CommandRunner>,
    config: NetworkConfig,
    allocator: Option<IpAllocator>,
    state: Mutex<State>,
}

impl NetworkManager {
    pub fn new(runner: Arc<dyn CommandRunner>, config: NetworkConfig, allocator: Option<IpAllocator>) -> Self {
        Self {
            runner,
            config,
            allocator,
            state: Mutex::new(State {
                bridge_configured: false,
                nat_configured: false,
                taps: HashMap::new(),
            }),
        }
    }

    /// Ensure the bridge, then (first call only) NAT, then one TAP per
    /// network attachment. Fails atomically: any TAP failure rolls back
    /// every TAP this call created for the task. `cancel` is checked before
    /// each per-attachment TAP creation — there is no polling wait inside
    /// this component to interrupt mid-flight, only these checkpoints.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn prepare_network(&self, task: &Task, cancel: &CancelToken) -> Result<(), ExecutorError> {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        self.ensure_bridge()?;
        self.ensure_nat();

        let mut created = Vec::new();
        for (i, attachment) in task.network_attachments.iter().enumerate() {
            if cancel.is_cancelled() {
                for record in &created {
                    let _ = tap::delete_tap(self.runner.as_ref(), &record.tap_name);
                    self.release_ip(&record.ip);
                }
                return Err(ExecutorError::Cancelled);
            }
            match self.create_one(task, i, attachment) {
                Ok(record) => created.push(record),
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "tap creation failed, rolling back task's taps");
                    for record in &created {
                        let _ = tap::delete_tap(self.runner.as_ref(), &record.tap_name);
                        self.release_ip(&record.ip);
                    }
                    return Err(ExecutorError::from(e));
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        for record in created {
            state.taps.insert(record.key(), record);
        }
        Ok(())
    }

    fn create_one(
        &self,
        task: &Task,
        index: usize,
        attachment: &vmexec_core::task::NetworkAttachment,
    ) -> Result<TapRecord> {
        let ip = if attachment.ip_mode == "static" {
            match &self.allocator {
                Some(alloc) => match alloc.allocate(&task.id) {
                    Ok(ip) => ip,
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, error = %e, "ip allocation failed, continuing without one");
                        String::new()
                    }
                },
                None => String::new(),
            }
        } else {
            String::new()
        };

        let bridge_name = if attachment.bridge.is_empty() {
            self.config.bridge_name.clone()
        } else {
            attachment.bridge.clone()
        };

        let (netmask, gateway, subnet) = match &self.allocator {
            Some(alloc) => (alloc.netmask_str(), alloc.gateway_str(), alloc.subnet_str()),
            None => (String::new(), String::new(), String::new()),
        };

        tap::create_tap(
            self.runner.as_ref(),
            &task.id,
            index,
            &bridge_name,
            ip,
            netmask,
            gateway,
            subnet,
        )
    }

    /// Remove every TAP whose key begins with `<task-id>-`, releasing each
    /// associated IP. Never fails; a nonexistent task is a no-op.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn cleanup_network(&self, task: &Task) {
        let prefix = format!("{}-", task.id);
        let removed: Vec<TapRecord> = {
            let mut state = self.state.lock().unwrap();
            let keys: Vec<String> = state.taps.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
            keys.into_iter().filter_map(|k| state.taps.remove(&k)).collect()
        };
        for record in removed {
            let _ = tap::delete_tap(self.runner.as_ref(), &record.tap_name);
            self.release_ip(&record.ip);
        }
    }

    /// The first non-empty IP assigned to `task_id`, or an error if none.
    pub fn get_tap_ip(&self, task_id: &str) -> Result<String, ExecutorError> {
        let prefix = format!("{task_id}-");
        let state = self.state.lock().unwrap();
        state
            .taps
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v)
            .find(|v| !v.ip.is_empty())
            .map(|v| v.ip.clone())
            .ok_or_else(|| ExecutorError::from(anyhow::anyhow!("no IP assigned to task {task_id}")))
    }

    /// Snapshot of every current TAP record.
    pub fn list_tap_devices(&self) -> Vec<TapRecord> {
        self.state.lock().unwrap().taps.values().cloned().collect()
    }

    fn release_ip(&self, ip: &str) {
        if let Some(alloc) = &self.allocator {
            alloc.release(ip);
        }
    }

    fn ensure_bridge(&self) -> Result<(), ExecutorError> {
        {
            let state = self.state.lock().unwrap();
            if state.bridge_configured {
                return Ok(());
            }
        }
        bridge::ensure_bridge(self.runner.as_ref(), &self.config.bridge_name, self.config.bridge_ip.as_deref())
            .map_err(ExecutorError::from)?;
        self.state.lock().unwrap().bridge_configured = true;
        Ok(())
    }

    /// A NAT failure logs a warning and leaves `nat_configured` unset,
    /// permitting a retry on the next task — VMs may lack egress in the
    /// meantime, but tasks still start, per the component contract.
    fn ensure_nat(&self) {
        let Some(subnet) = &self.config.subnet else { return };
        if !self.config.nat_enabled {
            return;
        }
        {
            let state = self.state.lock().unwrap();
            if state.nat_configured {
                return;
            }
        }
        match bridge::setup_nat(self.runner.as_ref(), &self.config.bridge_name, subnet) {
            Ok(()) => self.state.lock().unwrap().nat_configured = true,
            Err(e) => tracing::warn!(error = %e, "NAT setup failed, will retry on next task"),
        }
    }
}
