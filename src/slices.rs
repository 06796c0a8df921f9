//! Authoritative in-memory slice table (single writer, many observers).
//!
//! All mutations funnel through this store so observers share one total
//! order per slice. Events are published on a broadcast channel while the
//! table lock is held; nobody can observe an intermediate state in which
//! two slices transmit at once.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{LinkError, Result};
use crate::types::{Mode, Slice, SliceDelta, SliceEvent, MAX_SLICES};

const EVENT_CAPACITY: usize = 256;

pub struct SliceStore {
    table: Mutex<Vec<Slice>>,
    events: broadcast::Sender<SliceEvent>,
}

impl SliceStore {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let table = (0..MAX_SLICES).map(Slice::empty).collect();
        Arc::new(Self { table: Mutex::new(table), events })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SliceEvent> {
        self.events.subscribe()
    }

    /// Consistent copy of one row.
    pub fn snapshot(&self, index: usize) -> Option<Slice> {
        self.table.lock().get(index).cloned()
    }

    /// Consistent copy of every allocated row.
    pub fn active(&self) -> Vec<Slice> {
        self.table.lock().iter().filter(|s| s.in_use).cloned().collect()
    }

    fn emit(&self, ev: SliceEvent) {
        // receivers may lag or be absent; the store never blocks on them
        let _ = self.events.send(ev);
    }

    /// Merge a backend push into one row. Idempotent: re-applying the same
    /// delta emits nothing. `in_use` edges produce exactly one
    /// `Added`/`Removed`; any change also produces an `Updated`.
    pub fn apply_push(&self, index: usize, delta: &SliceDelta) -> Result<()> {
        if index >= MAX_SLICES {
            return Err(LinkError::InvariantViolation(format!(
                "slice index {index} out of range"
            )));
        }
        let table = &mut *self.table.lock();

        // a push that keys one slice un-keys every other slice in the same
        // atomic step, so no reader ever sees two transmitters
        let mut cleared: Vec<Slice> = Vec::new();
        if delta.transmit == Some(true) {
            for other in table.iter_mut() {
                if other.index != index && other.transmit {
                    other.transmit = false;
                    cleared.push(other.clone());
                }
            }
        }

        let row = &mut table[index];
        let prior = row.clone();

        if let Some(hz) = delta.frequency_hz {
            row.frequency_hz = hz;
        }
        if let Some(mode) = &delta.mode {
            row.mode = mode.clone();
        }
        if let Some(dax) = delta.dax_channel {
            if dax != 0 {
                row.dax_channel = dax;
            }
        }
        if let Some(tx) = delta.transmit {
            row.transmit = tx;
        }
        if let Some(in_use) = delta.in_use {
            row.in_use = in_use;
        }

        for slice in cleared {
            self.emit(SliceEvent::Updated(slice));
        }

        let added = !prior.in_use && row.in_use;
        let removed = prior.in_use && !row.in_use;
        if removed {
            // release the row; the prior state travels in the event
            let keep_index = row.index;
            *row = Slice::empty(keep_index);
        }
        let current = row.clone();
        if added {
            self.emit(SliceEvent::Added(current.clone()));
        }
        if removed {
            self.emit(SliceEvent::Removed(prior.clone()));
        }
        if prior != current {
            self.emit(SliceEvent::Updated(current));
        }
        Ok(())
    }

    /// Enforce the single-transmitter invariant in one atomic step:
    /// switching a slice on clears every other slice first.
    pub fn set_tx(&self, index: usize, on: bool) -> Result<()> {
        if index >= MAX_SLICES {
            return Err(LinkError::InvariantViolation(format!(
                "slice index {index} out of range"
            )));
        }
        let table = &mut *self.table.lock();
        let mut changed: Vec<Slice> = Vec::new();
        if on {
            for row in table.iter_mut() {
                if row.index != index && row.transmit {
                    row.transmit = false;
                    changed.push(row.clone());
                }
            }
        }
        let row = &mut table[index];
        if row.transmit != on {
            row.transmit = on;
            changed.push(row.clone());
        }
        for slice in changed {
            self.emit(SliceEvent::Updated(slice));
        }
        Ok(())
    }

    /// Drop transmit everywhere; returns the indices that were keyed.
    pub fn clear_all_tx(&self) -> Vec<usize> {
        let table = &mut *self.table.lock();
        let mut cleared = Vec::new();
        for row in table.iter_mut() {
            if row.transmit {
                row.transmit = false;
                cleared.push(row.index);
                self.emit(SliceEvent::Updated(row.clone()));
            }
        }
        cleared
    }

    /// Optimistic frequency write from a CAT set; immediate re-reads see it.
    pub fn set_frequency(&self, index: usize, hz: u64) -> Result<()> {
        self.apply_push(index, &SliceDelta { frequency_hz: Some(hz), ..Default::default() })
    }

    pub fn set_mode(&self, index: usize, mode: Mode) -> Result<()> {
        self.apply_push(index, &SliceDelta { mode: Some(mode), ..Default::default() })
    }

    /// Record (or clear) the decoder-app instance bound to a slice.
    pub fn bind_instance(&self, index: usize, instance_id: Option<String>) {
        if let Some(row) = self.table.lock().get_mut(index) {
            row.instance_id = instance_id;
        } else {
            warn!(index, "bind_instance on out-of-range slice");
        }
    }

    /// Resolve the slice currently bound to an instance id.
    pub fn index_of_instance(&self, instance_id: &str) -> Option<usize> {
        self.table
            .lock()
            .iter()
            .find(|s| s.instance_id.as_deref() == Some(instance_id))
            .map(|s| s.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mode;
    use pretty_assertions::assert_eq;

    fn drain(rx: &mut broadcast::Receiver<SliceEvent>) -> Vec<SliceEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn tx_count(store: &SliceStore) -> usize {
        (0..MAX_SLICES).filter(|i| store.snapshot(*i).unwrap().transmit).count()
    }

    fn push_in_use(store: &SliceStore, index: usize, in_use: bool) {
        store
            .apply_push(index, &SliceDelta { in_use: Some(in_use), ..Default::default() })
            .unwrap();
    }

    #[test]
    fn add_update_remove_cycle_emits_each_once() {
        let store = SliceStore::new();
        let mut rx = store.subscribe();

        let delta = SliceDelta {
            in_use: Some(true),
            frequency_hz: Some(14_074_000),
            mode: Some(Mode::Usb),
            ..Default::default()
        };
        store.apply_push(0, &delta).unwrap();
        // idempotent: same delta again produces nothing
        store.apply_push(0, &delta).unwrap();
        push_in_use(&store, 0, false);
        push_in_use(&store, 0, false);

        let events = drain(&mut rx);
        let added: Vec<_> = events.iter().filter(|e| matches!(e, SliceEvent::Added(_))).collect();
        let removed: Vec<_> =
            events.iter().filter(|e| matches!(e, SliceEvent::Removed(_))).collect();
        assert_eq!(added.len(), 1);
        assert_eq!(removed.len(), 1);
        match &events[0] {
            SliceEvent::Added(s) => {
                assert_eq!(s.frequency_hz, 14_074_000);
                assert_eq!(s.mode, Mode::Usb);
            }
            other => panic!("expected Added first, got {other:?}"),
        }
        // removed carries the prior state, before the row was released
        let removed_state = events
            .iter()
            .find_map(|e| match e {
                SliceEvent::Removed(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(removed_state.frequency_hz, 14_074_000);
        assert!(removed_state.in_use);
    }

    #[test]
    fn at_most_one_transmitter_after_every_operation() {
        let store = SliceStore::new();
        push_in_use(&store, 0, true);
        push_in_use(&store, 1, true);

        store.set_tx(0, true).unwrap();
        assert_eq!(tx_count(&store), 1);
        store.set_tx(1, true).unwrap();
        assert_eq!(tx_count(&store), 1);
        assert!(store.snapshot(1).unwrap().transmit);
        assert!(!store.snapshot(0).unwrap().transmit);
        store.set_tx(1, false).unwrap();
        assert_eq!(tx_count(&store), 0);
    }

    #[test]
    fn backend_push_also_respects_single_transmitter() {
        let store = SliceStore::new();
        push_in_use(&store, 0, true);
        push_in_use(&store, 1, true);
        store
            .apply_push(0, &SliceDelta { transmit: Some(true), ..Default::default() })
            .unwrap();
        store
            .apply_push(1, &SliceDelta { transmit: Some(true), ..Default::default() })
            .unwrap();
        assert_eq!(tx_count(&store), 1);
        assert!(store.snapshot(1).unwrap().transmit);
    }

    #[test]
    fn added_precedes_updated_for_the_same_merge() {
        let store = SliceStore::new();
        let mut rx = store.subscribe();
        push_in_use(&store, 0, true);
        let events = drain(&mut rx);
        assert!(matches!(events[0], SliceEvent::Added(_)));
        assert!(matches!(events[1], SliceEvent::Updated(_)));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn clear_all_tx_reports_keyed_slices_once() {
        let store = SliceStore::new();
        push_in_use(&store, 2, true);
        store.set_tx(2, true).unwrap();
        assert_eq!(store.clear_all_tx(), vec![2]);
        assert_eq!(store.clear_all_tx(), Vec::<usize>::new());
    }

    #[test]
    fn optimistic_cat_write_visible_to_immediate_read() {
        let store = SliceStore::new();
        push_in_use(&store, 0, true);
        store.set_frequency(0, 14_076_000).unwrap();
        assert_eq!(store.snapshot(0).unwrap().frequency_hz, 14_076_000);
    }

    #[test]
    fn out_of_range_rejected() {
        let store = SliceStore::new();
        assert!(store.apply_push(MAX_SLICES, &SliceDelta::default()).is_err());
        assert!(store.set_tx(MAX_SLICES, true).is_err());
    }

    #[test]
    fn instance_binding() {
        let store = SliceStore::new();
        push_in_use(&store, 1, true);
        store.bind_instance(1, Some("Slice-B".into()));
        assert_eq!(store.index_of_instance("Slice-B"), Some(1));
        store.bind_instance(1, None);
        assert_eq!(store.index_of_instance("Slice-B"), None);
    }
}
