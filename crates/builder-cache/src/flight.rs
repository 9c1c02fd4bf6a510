// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Single-flight execution slots per action id.
//!
//! For each [`ActionId`] at most one executor may run at any time. The first
//! caller to [`join`](FlightMap::join) becomes the **leader** and receives a
//! guard; everyone else becomes a **follower** and blocks until the leader
//! publishes an outcome. A leader that drops its guard without publishing
//! (panic, cancellation) wakes followers with `None`, and the next `join`
//! elects a fresh leader — abandonment never wedges the key.

use std::sync::{Arc, Condvar, Mutex};

use rustc_hash::FxHashMap;

use crate::ActionId;

const SHARDS: usize = 16;

#[derive(Debug)]
struct FlightSlot<T> {
    outcome: Mutex<Publication<T>>,
    cv: Condvar,
}

#[derive(Debug)]
enum Publication<T> {
    Pending,
    /// Leader published a value (`Some`) or abandoned the flight (`None`).
    Done(Option<T>),
}

/// Sharded map of in-flight actions.
#[derive(Debug)]
pub struct FlightMap<T> {
    shards: Vec<Mutex<FxHashMap<ActionId, Arc<FlightSlot<T>>>>>,
}

/// Result of joining a flight.
pub enum Flight<'a, T: Clone> {
    /// This caller must execute the action and publish through the guard.
    Leader(FlightGuard<'a, T>),
    /// Another caller executed; this is its outcome (`None` if abandoned).
    Follower(Option<T>),
}

impl<T: Clone> Default for FlightMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> FlightMap<T> {
    /// Create an empty flight map.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS)
                .map(|_| Mutex::new(FxHashMap::default()))
                .collect(),
        }
    }

    fn shard_for(&self, id: &ActionId) -> &Mutex<FxHashMap<ActionId, Arc<FlightSlot<T>>>> {
        let index = usize::from(id.as_bytes()[0]) % SHARDS;
        &self.shards[index]
    }

    /// Join the flight for `id`: become the leader or wait as a follower.
    pub fn join(&self, id: ActionId) -> Flight<'_, T> {
        let shard = self.shard_for(&id);
        let slot = {
            let mut map = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(slot) = map.get(&id) {
                Some(Arc::clone(slot))
            } else {
                let slot = Arc::new(FlightSlot {
                    outcome: Mutex::new(Publication::Pending),
                    cv: Condvar::new(),
                });
                map.insert(id, slot);
                None
            }
        };

        match slot {
            None => Flight::Leader(FlightGuard {
                map: self,
                id,
                published: false,
            }),
            Some(slot) => {
                let mut outcome = slot
                    .outcome
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                loop {
                    match &*outcome {
                        Publication::Done(value) => return Flight::Follower(value.clone()),
                        Publication::Pending => {
                            outcome = slot
                                .cv
                                .wait(outcome)
                                .unwrap_or_else(std::sync::PoisonError::into_inner);
                        }
                    }
                }
            }
        }
    }

    /// Publish the leader's outcome and clear the slot.
    fn finish(&self, id: &ActionId, value: Option<T>) {
        let shard = self.shard_for(id);
        let slot = {
            let mut map = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            map.remove(id)
        };
        if let Some(slot) = slot {
            let mut outcome = slot
                .outcome
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *outcome = Publication::Done(value);
            slot.cv.notify_all();
        }
    }
}

/// Leadership token for one action id.
///
/// Dropping the guard without [`publish`](FlightGuard::publish) wakes
/// followers empty-handed so they can re-elect.
pub struct FlightGuard<'a, T: Clone> {
    map: &'a FlightMap<T>,
    id: ActionId,
    published: bool,
}

impl<T: Clone> FlightGuard<'_, T> {
    /// The action this guard leads.
    pub fn id(&self) -> ActionId {
        self.id
    }

    /// Publish the outcome to all followers and release leadership.
    pub fn publish(mut self, value: T) {
        self.published = true;
        self.map.finish(&self.id, Some(value));
    }
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        if !self.published {
            self.map.finish(&self.id, None);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use builder_cas::Digest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(byte: u8) -> ActionId {
        ActionId(Digest([byte; 32]))
    }

    #[test]
    fn first_joiner_leads() {
        let map: FlightMap<u32> = FlightMap::new();
        match map.join(id(1)) {
            Flight::Leader(guard) => guard.publish(7),
            Flight::Follower(_) => panic!("first joiner must lead"),
        }
        // Slot is cleared: next join leads again.
        assert!(matches!(map.join(id(1)), Flight::Leader(_)));
    }

    #[test]
    fn followers_share_the_leaders_outcome() {
        let map: Arc<FlightMap<u32>> = Arc::new(FlightMap::new());
        let executions = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let map = Arc::clone(&map);
                    let executions = Arc::clone(&executions);
                    s.spawn(move || match map.join(id(2)) {
                        Flight::Leader(guard) => {
                            // Simulate work; every follower must see 99.
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            executions.fetch_add(1, Ordering::SeqCst);
                            guard.publish(99);
                            99
                        }
                        Flight::Follower(value) => value.unwrap(),
                    })
                })
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), 99);
            }
        });
        // At most one execution ran concurrently — and here, exactly one ran
        // at all, because every other joiner arrived while it was in flight.
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abandoned_leader_wakes_followers_empty_handed() {
        let map: Arc<FlightMap<u32>> = Arc::new(FlightMap::new());

        std::thread::scope(|s| {
            let follower = {
                let map = Arc::clone(&map);
                s.spawn(move || {
                    // Give the leader time to join first.
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    match map.join(id(3)) {
                        Flight::Follower(value) => value,
                        Flight::Leader(_) => Some(0),
                    }
                })
            };
            match map.join(id(3)) {
                Flight::Leader(guard) => {
                    std::thread::sleep(std::time::Duration::from_millis(40));
                    drop(guard); // abandon without publishing
                }
                Flight::Follower(_) => panic!("main thread joined first"),
            }
            let outcome = follower.join().unwrap();
            assert!(
                outcome.is_none() || outcome == Some(0),
                "follower observes abandonment or re-elects"
            );
        });
    }
}
