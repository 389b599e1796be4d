//! Authoritative virtual-monitor registry.
//!
//! The director owns the only copy; casters hold mirrors fed by the
//! `monitor_list_sync` snapshot and subsequent deltas. IDs are opaque short
//! strings minted here, never reused within a server lifetime, and never the
//! `"ALL"` sentinel.

use bk_protocol::{ALL_MONITORS, VirtualMonitor};
use std::collections::HashSet;
use uuid::Uuid;

/// Partial update for [`MonitorRegistry::update`]; `None` leaves a field
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct MonitorUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Default)]
pub struct MonitorRegistry {
    /// Insertion-ordered; snapshots and syncs preserve this order.
    monitors: Vec<VirtualMonitor>,
    /// Every ID ever minted, including removed ones.
    used_ids: HashSet<String>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a monitor with a freshly minted ID.
    ///
    /// Name validation (non-empty) is the hub's job; the registry assumes a
    /// valid name.
    pub fn add(
        &mut self,
        name: &str,
        description: Option<String>,
        color: Option<String>,
    ) -> VirtualMonitor {
        let id = self.mint_id();
        let monitor = VirtualMonitor {
            id: id.clone(),
            name: name.to_owned(),
            description,
            color,
        };
        self.used_ids.insert(id);
        self.monitors.push(monitor.clone());
        monitor
    }

    /// Remove a monitor. Absent IDs are a no-op (`None`); the ID stays
    /// retired either way.
    pub fn remove(&mut self, id: &str) -> Option<VirtualMonitor> {
        let index = self.monitors.iter().position(|m| m.id == id)?;
        Some(self.monitors.remove(index))
    }

    /// Apply a partial update in place; `None` when the ID is absent.
    pub fn update(&mut self, id: &str, update: MonitorUpdate) -> Option<VirtualMonitor> {
        let monitor = self.monitors.iter_mut().find(|m| m.id == id)?;
        if let Some(name) = update.name {
            monitor.name = name;
        }
        if let Some(description) = update.description {
            monitor.description = Some(description);
        }
        if let Some(color) = update.color {
            monitor.color = Some(color);
        }
        Some(monitor.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.monitors.iter().any(|m| m.id == id)
    }

    pub fn snapshot(&self) -> Vec<VirtualMonitor> {
        self.monitors.clone()
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Mint a short opaque ID, unique for the life of this registry.
    fn mint_id(&self) -> String {
        loop {
            let hex = Uuid::new_v4().simple().to_string();
            let id = format!("m-{}", &hex[..8]);
            if id != ALL_MONITORS && !self.used_ids.contains(&id) {
                return id;
            }
        }
    }
}
