//! Response bus: correlates reply ids with whoever is waiting for them.
//!
//! Both tables live behind one lock so a reply is handed to exactly one
//! consumer: the callback registered for its id, or else the first caller to
//! claim it from the stash.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::metrics;
use crate::reply::extract_id;

pub const STASH_CAPACITY: usize = 64;
pub const CALLBACK_CAPACITY: usize = 128;

/// Invoked at most once with the raw reply text. User data travels in the closure.
pub type BusCallback = Box<dyn FnOnce(&str) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// A registered callback received the message.
    Delivered,
    Stashed,
    /// Stashed after evicting the oldest unclaimed entry.
    Evicted(u64),
    /// Missing or non-positive id; nothing to correlate.
    Ignored,
}

#[derive(Default)]
struct Tables {
    stash: VecDeque<(u64, String)>,
    callbacks: HashMap<u64, BusCallback>,
}

pub struct ResponseBus {
    tables: Mutex<Tables>,
    arrived: Condvar,
    stash_capacity: usize,
    callback_capacity: usize,
}

impl Default for ResponseBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBus {
    pub fn new() -> Self {
        Self::with_capacity(STASH_CAPACITY, CALLBACK_CAPACITY)
    }

    pub fn with_capacity(stash_capacity: usize, callback_capacity: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            arrived: Condvar::new(),
            stash_capacity: stash_capacity.max(1),
            callback_capacity: callback_capacity.max(1),
        }
    }

    /// Route an arriving message to its callback, or stash it for a poller.
    pub fn store(&self, json: &str) -> StoreOutcome {
        let Some(id) = extract_id(json) else {
            return StoreOutcome::Ignored;
        };

        let mut tables = self.tables.lock();
        if let Some(callback) = tables.callbacks.remove(&id) {
            drop(tables);
            metrics::record_bus_delivery();
            trace!(target: "cdp-bus", id, "delivered to callback");
            callback(json);
            return StoreOutcome::Delivered;
        }

        let mut outcome = StoreOutcome::Stashed;
        if let Some(pos) = tables.stash.iter().position(|(stashed, _)| *stashed == id) {
            tables.stash.remove(pos);
        } else if tables.stash.len() >= self.stash_capacity {
            if let Some((evicted, _)) = tables.stash.pop_front() {
                metrics::record_bus_eviction();
                debug!(target: "cdp-bus", evicted, "stash full; evicted oldest entry");
                outcome = StoreOutcome::Evicted(evicted);
            }
        }
        tables.stash.push_back((id, json.to_string()));
        drop(tables);

        metrics::record_bus_store();
        self.arrived.notify_all();
        outcome
    }

    /// Non-blocking claim of the reply for `id`.
    pub fn try_get(&self, id: u64) -> Option<String> {
        let mut tables = self.tables.lock();
        take_stashed(&mut tables, id)
    }

    /// Block until the reply for `id` is stashed or `timeout` elapses.
    ///
    /// Only useful while something else (a pump thread) feeds the bus.
    pub fn wait_take(&self, id: u64, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut tables = self.tables.lock();
        loop {
            if let Some(json) = take_stashed(&mut tables, id) {
                return Some(json);
            }
            if self.arrived.wait_until(&mut tables, deadline).timed_out() {
                return take_stashed(&mut tables, id);
            }
        }
    }

    /// Register a one-shot callback for `id`.
    ///
    /// If the reply is already stashed it is delivered immediately, so a
    /// registration that races the arrival still sees the message exactly once.
    /// Returns false when the callback table is full.
    pub fn register_callback(&self, id: u64, callback: BusCallback) -> bool {
        if id == 0 {
            return false;
        }
        let mut tables = self.tables.lock();
        if let Some(json) = take_stashed(&mut tables, id) {
            drop(tables);
            metrics::record_bus_delivery();
            callback(&json);
            return true;
        }
        // first registration wins
        if tables.callbacks.contains_key(&id) || tables.callbacks.len() >= self.callback_capacity {
            return false;
        }
        tables.callbacks.insert(id, callback);
        true
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.tables.lock().callbacks.remove(&id).is_some()
    }

    pub fn stashed(&self) -> usize {
        self.tables.lock().stash.len()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.tables.lock().callbacks.len()
    }

    pub fn clear(&self) {
        let mut tables = self.tables.lock();
        tables.stash.clear();
        tables.callbacks.clear();
    }
}

fn take_stashed(tables: &mut Tables, id: u64) -> Option<String> {
    let pos = tables.stash.iter().position(|(stashed, _)| *stashed == id)?;
    tables.stash.remove(pos).map(|(_, json)| json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn reply(id: u64) -> String {
        format!(r#"{{"id":{id},"result":{{}}}}"#)
    }

    #[test]
    fn stash_and_claim_once() {
        let bus = ResponseBus::new();
        assert_eq!(bus.store(&reply(5)), StoreOutcome::Stashed);
        assert_eq!(bus.try_get(5), Some(reply(5)));
        assert_eq!(bus.try_get(5), None);
    }

    #[test]
    fn ids_without_correlation_are_ignored() {
        let bus = ResponseBus::new();
        assert_eq!(bus.store(r#"{"method":"Page.frameNavigated"}"#), StoreOutcome::Ignored);
        assert_eq!(bus.store(r#"{"id":0}"#), StoreOutcome::Ignored);
        assert_eq!(bus.stashed(), 0);
    }

    #[test]
    fn duplicate_id_replaces_previous_entry() {
        let bus = ResponseBus::new();
        bus.store(r#"{"id":3,"result":{"v":1}}"#);
        bus.store(r#"{"id":3,"result":{"v":2}}"#);
        assert_eq!(bus.stashed(), 1);
        assert_eq!(bus.try_get(3).unwrap(), r#"{"id":3,"result":{"v":2}}"#);
    }

    #[test]
    fn full_stash_evicts_oldest() {
        let bus = ResponseBus::with_capacity(3, 8);
        for id in 1..=3 {
            bus.store(&reply(id));
        }
        assert_eq!(bus.store(&reply(4)), StoreOutcome::Evicted(1));
        assert!(bus.try_get(1).is_none());
        assert!(bus.try_get(4).is_some());
        assert_eq!(bus.stashed(), 2);
    }

    #[test]
    fn callback_fires_once_and_is_removed() {
        let bus = ResponseBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        assert!(bus.register_callback(
            11,
            Box::new(move |json| {
                assert!(json.contains("\"id\":11"));
                seen.fetch_add(1, Ordering::SeqCst);
            })
        ));
        assert_eq!(bus.store(&reply(11)), StoreOutcome::Delivered);
        assert_eq!(bus.store(&reply(11)), StoreOutcome::Stashed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.pending_callbacks(), 0);
    }

    #[test]
    fn late_registration_receives_stashed_reply() {
        let bus = ResponseBus::new();
        bus.store(&reply(21));
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        bus.register_callback(
            21,
            Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(bus.try_get(21).is_none());
    }

    #[test]
    fn callback_table_is_bounded() {
        let bus = ResponseBus::with_capacity(4, 2);
        assert!(bus.register_callback(1, Box::new(|_| {})));
        assert!(bus.register_callback(2, Box::new(|_| {})));
        assert!(!bus.register_callback(3, Box::new(|_| {})));
        assert!(bus.unregister(1));
        assert!(bus.register_callback(3, Box::new(|_| {})));
        assert!(!bus.unregister(99));
    }

    #[test]
    fn delivery_is_exactly_once_under_races() {
        for round in 0..200u64 {
            let bus = Arc::new(ResponseBus::new());
            let id = round + 1;
            let hits = Arc::new(AtomicUsize::new(0));

            let store_bus = Arc::clone(&bus);
            let storer = thread::spawn(move || {
                store_bus.store(&reply(id));
            });

            let cb_hits = Arc::clone(&hits);
            bus.register_callback(
                id,
                Box::new(move |_| {
                    cb_hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
            let polled = bus.try_get(id).is_some() as usize;
            storer.join().unwrap();
            let polled = polled + bus.try_get(id).is_some() as usize;

            assert_eq!(hits.load(Ordering::SeqCst) + polled, 1, "round {round}");
        }
    }

    #[test]
    fn wait_take_wakes_on_store() {
        let bus = Arc::new(ResponseBus::new());
        let feeder = Arc::clone(&bus);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            feeder.store(&reply(8));
        });
        let got = bus.wait_take(8, Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(got, Some(reply(8)));
        assert!(bus.wait_take(9, Duration::from_millis(20)).is_none());
    }
}
