//! Source registry.
//!
//! Maps each `SourceId` to its record and its running `StreamSupervisor`.
//! Identifiers come from outside (config file, operator tooling); the registry
//! never invents them. Removing a source stops its supervisor and waits for the
//! capture thread to exit before the identifier is gone.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::frame::Frame;
use crate::supervisor::{StreamSupervisor, SupervisorConfig, SupervisorStatus};

/// Stable camera identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: SourceId,
    pub name: String,
    pub address: String,
}

impl SourceRecord {
    pub fn new(id: u64, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: SourceId(id),
            name: name.into(),
            address: address.into(),
        }
    }
}

/// Result of asking for a source's current frame.
#[derive(Clone, Debug)]
pub enum FrameLookup {
    Ready(Frame),
    /// Source exists but has no healthy frame right now.
    NotReady,
    /// No supervisor for this identifier.
    Unknown,
}

/// Non-blocking access to the latest frame of each source.
pub trait FrameProvider {
    fn lookup(&self, id: SourceId) -> FrameLookup;
}

/// Partial update of a record. `None` keeps the current value.
#[derive(Clone, Debug, Default)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
}

pub struct SourceRegistry {
    records: Vec<SourceRecord>,
    supervisors: HashMap<SourceId, StreamSupervisor>,
    config: SupervisorConfig,
}

impl SourceRegistry {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            records: Vec::new(),
            supervisors: HashMap::new(),
            config,
        }
    }

    /// Register a source and start capturing from it.
    pub fn add(&mut self, record: SourceRecord) -> Result<()> {
        validate_record(&record)?;
        if self.supervisors.contains_key(&record.id) {
            return Err(anyhow!("source {} already registered", record.id));
        }
        let supervisor = spawn_supervisor(&record, self.config)?;
        log::info!(
            "source {} '{}' added ({})",
            record.id,
            record.name,
            record.address
        );
        self.supervisors.insert(record.id, supervisor);
        self.records.push(record);
        Ok(())
    }

    /// Stop and forget a source. Returns the removed record.
    pub fn remove(&mut self, id: SourceId) -> Result<SourceRecord> {
        let position = self
            .records
            .iter()
            .position(|record| record.id == id)
            .ok_or_else(|| anyhow!("source {} not registered", id))?;
        if let Some(mut supervisor) = self.supervisors.remove(&id) {
            if let Err(err) = supervisor.stop() {
                log::warn!("{:#}", err);
            }
        }
        let record = self.records.remove(position);
        log::info!("source {} '{}' removed", record.id, record.name);
        Ok(record)
    }

    /// Rename and/or re-point a source. A new address restarts capture.
    pub fn update(&mut self, id: SourceId, update: SourceUpdate) -> Result<()> {
        let current = self
            .record(id)
            .cloned()
            .ok_or_else(|| anyhow!("source {} not registered", id))?;
        let next = SourceRecord {
            id,
            name: update.name.unwrap_or_else(|| current.name.clone()),
            address: update.address.unwrap_or_else(|| current.address.clone()),
        };
        validate_record(&next)?;

        if next.address != current.address {
            self.replace_supervisor(&next)?;
        }
        if let Some(record) = self.records.iter_mut().find(|record| record.id == id) {
            *record = next;
        }
        Ok(())
    }

    /// Tear down the supervisor and start a fresh one at the same address.
    pub fn restart(&mut self, id: SourceId) -> Result<()> {
        let record = self
            .record(id)
            .cloned()
            .ok_or_else(|| anyhow!("source {} not registered", id))?;
        self.replace_supervisor(&record)?;
        log::info!("source {} '{}' restarted", record.id, record.name);
        Ok(())
    }

    /// Restart every source. Returns the identifiers that failed to restart.
    pub fn restart_all(&mut self) -> Vec<SourceId> {
        let ids: Vec<SourceId> = self.records.iter().map(|record| record.id).collect();
        let mut failed = Vec::new();
        for id in ids {
            if let Err(err) = self.restart(id) {
                log::error!("{:#}", err);
                failed.push(id);
            }
        }
        failed
    }

    /// Start the replacement first; the running supervisor is only stopped
    /// once the new one is capturing.
    fn replace_supervisor(&mut self, record: &SourceRecord) -> Result<()> {
        let supervisor = spawn_supervisor(record, self.config)?;
        if let Some(mut old) = self.supervisors.insert(record.id, supervisor) {
            if let Err(err) = old.stop() {
                log::warn!("{:#}", err);
            }
        }
        Ok(())
    }

    /// Records in registration order.
    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }

    pub fn ids(&self) -> Vec<SourceId> {
        self.records.iter().map(|record| record.id).collect()
    }

    pub fn record(&self, id: SourceId) -> Option<&SourceRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.supervisors.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn status(&self, id: SourceId) -> Option<SupervisorStatus> {
        self.supervisors.get(&id).map(|supervisor| supervisor.status())
    }

    /// Latest healthy frame of `id`, if any.
    pub fn frame(&self, id: SourceId) -> Option<Frame> {
        self.supervisors.get(&id).and_then(|supervisor| supervisor.get_frame())
    }

    /// Stop every supervisor. Records are kept.
    pub fn stop_all(&mut self) {
        for (id, mut supervisor) in self.supervisors.drain() {
            if let Err(err) = supervisor.stop() {
                log::warn!("source {}: {:#}", id, err);
            }
        }
    }
}

impl FrameProvider for SourceRegistry {
    fn lookup(&self, id: SourceId) -> FrameLookup {
        match self.supervisors.get(&id) {
            None => FrameLookup::Unknown,
            Some(supervisor) => match supervisor.get_frame() {
                Some(frame) => FrameLookup::Ready(frame),
                None => FrameLookup::NotReady,
            },
        }
    }
}

impl Drop for SourceRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn spawn_supervisor(record: &SourceRecord, config: SupervisorConfig) -> Result<StreamSupervisor> {
    let mut supervisor = StreamSupervisor::for_address(record.id, &record.address, config)?;
    supervisor.start()?;
    Ok(supervisor)
}

fn validate_record(record: &SourceRecord) -> Result<()> {
    if record.name.trim().is_empty() {
        return Err(anyhow!("source {} has an empty name", record.id));
    }
    if record.address.trim().is_empty() {
        return Err(anyhow!("source {} has an empty address", record.id));
    }
    Ok(())
}
