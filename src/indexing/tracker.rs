use crate::blockchain::subscription::LiveFilter;
use crate::models::Document;
use crate::validation::validate_ethereum_address;
use alloy_primitives::Address;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingChange {
    Tracked(Address),
    Untracked(Address),
}

#[derive(Default)]
struct TrackerState {
    counts: HashMap<Address, usize>,
    /// Referrer document key -> the addresses it references
    referrers: HashMap<String, BTreeSet<Address>>,
    scheduled_backfills: BTreeSet<Address>,
    scheduled_purges: BTreeSet<Address>,
}

/// Reference-counted set of tracked addresses.
///
/// Each referrer (a tracked-address list document) counts once per distinct
/// address it names. An address enters the set, gets a scheduled backfill and
/// joins the live filter on its first reference; it leaves both and gets a
/// scheduled purge when its last reference goes away.
pub struct AddressTracker {
    state: Mutex<TrackerState>,
    live: LiveFilter,
    max_tracked: Option<usize>,
}

impl AddressTracker {
    pub fn new(live: LiveFilter, max_tracked: Option<usize>) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            live,
            max_tracked,
        }
    }

    pub fn live_filter(&self) -> &LiveFilter {
        &self.live
    }

    pub async fn track(&self, address: Address, referrer: &str) -> Option<TrackingChange> {
        let mut state = self.state.lock().await;
        self.track_locked(&mut state, address, referrer).await
    }

    pub async fn untrack(&self, address: Address, referrer: &str) -> Option<TrackingChange> {
        let mut state = self.state.lock().await;
        self.untrack_locked(&mut state, address, referrer).await
    }

    async fn track_locked(
        &self,
        state: &mut TrackerState,
        address: Address,
        referrer: &str,
    ) -> Option<TrackingChange> {
        if state
            .referrers
            .get(referrer)
            .is_some_and(|addresses| addresses.contains(&address))
        {
            return None;
        }

        let count = state.counts.get(&address).copied().unwrap_or(0);
        if count == 0 {
            if let Some(max) = self.max_tracked {
                if state.counts.len() >= max {
                    warn!(
                        "Not tracking {}: already tracking the maximum of {} addresses",
                        address, max
                    );
                    return None;
                }
            }
        }

        state
            .referrers
            .entry(referrer.to_string())
            .or_default()
            .insert(address);
        state.counts.insert(address, count + 1);

        if count > 0 {
            debug!("{} now referenced {} times", address, count + 1);
            return None;
        }

        state.scheduled_purges.remove(&address);
        state.scheduled_backfills.insert(address);
        self.live.watch(address).await;
        info!("Tracking address {}", address);
        Some(TrackingChange::Tracked(address))
    }

    async fn untrack_locked(
        &self,
        state: &mut TrackerState,
        address: Address,
        referrer: &str,
    ) -> Option<TrackingChange> {
        let removed = match state.referrers.get_mut(referrer) {
            Some(addresses) => {
                let removed = addresses.remove(&address);
                if addresses.is_empty() {
                    state.referrers.remove(referrer);
                }
                removed
            }
            None => false,
        };
        if !removed {
            return None;
        }

        let remaining = state.counts.get(&address).copied().unwrap_or(1).saturating_sub(1);
        if remaining > 0 {
            state.counts.insert(address, remaining);
            debug!("{} now referenced {} times", address, remaining);
            return None;
        }

        state.counts.remove(&address);
        state.scheduled_backfills.remove(&address);
        state.scheduled_purges.insert(address);
        self.live.unwatch(&address).await;
        info!("Stopped tracking address {}", address);
        Some(TrackingChange::Untracked(address))
    }

    /// Bring one referrer's membership up to date with `addresses`
    pub async fn sync_document(&self, referrer: &str, addresses: BTreeSet<Address>) -> Vec<TrackingChange> {
        let mut state = self.state.lock().await;
        let previous = state.referrers.get(referrer).cloned().unwrap_or_default();
        let mut changes = Vec::new();

        for address in previous.difference(&addresses) {
            changes.extend(self.untrack_locked(&mut state, *address, referrer).await);
        }
        for address in addresses.difference(&previous) {
            changes.extend(self.track_locked(&mut state, *address, referrer).await);
        }
        changes
    }

    pub async fn remove_referrer(&self, referrer: &str) -> Vec<TrackingChange> {
        self.sync_document(referrer, BTreeSet::new()).await
    }

    /// Re-derive the whole set from every referrer that currently exists
    pub async fn reconcile(
        &self,
        referrers: impl IntoIterator<Item = (String, BTreeSet<Address>)>,
    ) -> Vec<TrackingChange> {
        let current: HashMap<String, BTreeSet<Address>> = referrers.into_iter().collect();
        let known: Vec<String> = self.state.lock().await.referrers.keys().cloned().collect();
        let mut changes = Vec::new();

        for referrer in known.iter().filter(|r| !current.contains_key(*r)) {
            changes.extend(self.remove_referrer(referrer).await);
        }
        for (referrer, addresses) in current {
            changes.extend(self.sync_document(&referrer, addresses).await);
        }
        changes
    }

    pub async fn is_tracked(&self, address: &Address) -> bool {
        self.state.lock().await.counts.contains_key(address)
    }

    pub async fn reference_count(&self, address: &Address) -> usize {
        self.state.lock().await.counts.get(address).copied().unwrap_or(0)
    }

    pub async fn tracked(&self) -> Vec<Address> {
        let state = self.state.lock().await;
        let mut tracked: Vec<Address> = state.counts.keys().copied().collect();
        tracked.sort();
        tracked
    }

    /// Backfills and purges scheduled since the last call
    pub async fn take_scheduled(&self) -> (Vec<Address>, Vec<Address>) {
        let mut state = self.state.lock().await;
        let backfills = std::mem::take(&mut state.scheduled_backfills);
        let purges = std::mem::take(&mut state.scheduled_purges);
        (backfills.into_iter().collect(), purges.into_iter().collect())
    }
}

/// Referrer key for a tracked-address list document
pub fn referrer_key(doc: &Document) -> String {
    format!("{}/{}", doc.doc_type, doc.id)
}

/// Addresses a list document references through `field`: the document id,
/// a scalar attribute, or an array attribute. Invalid entries are skipped.
pub fn referenced_addresses(doc: &Document, field: &str) -> BTreeSet<Address> {
    let raw: Vec<&str> = if field == "id" {
        vec![doc.id.as_str()]
    } else {
        match doc.attribute(field) {
            Some(Value::String(s)) => vec![s.as_str()],
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    };

    raw.into_iter()
        .filter_map(|candidate| match validate_ethereum_address(candidate) {
            Ok(address) => Some(address),
            Err(e) => {
                warn!("{} references an invalid address: {}", referrer_key(doc), e);
                None
            }
        })
        .collect()
}
