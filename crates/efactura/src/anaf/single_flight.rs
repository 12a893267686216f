//! Coalescing of concurrent identical operations
//!
//! The first caller for a key runs the operation; callers arriving while it is
//! in progress block until it finishes and receive a clone of its result.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};

enum FlightState<V> {
    Pending,
    Done(V),
    /// The leader panicked; waiters start a new flight
    Abandoned,
}

struct Flight<V> {
    state: Mutex<FlightState<V>>,
    done: Condvar,
}

/// Single-flight group keyed by `K`
pub struct SingleFlight<K, V> {
    flights: Mutex<HashMap<K, Arc<Flight<V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op` for `key`, or wait for the flight already running for it
    pub fn run<F>(&self, key: &K, op: F) -> V
    where
        F: FnOnce() -> V,
    {
        let flight = loop {
            let (flight, leader) = {
                let mut flights = self.flights.lock().unwrap();
                match flights.get(key) {
                    Some(flight) => (Arc::clone(flight), false),
                    None => {
                        let flight = Arc::new(Flight {
                            state: Mutex::new(FlightState::Pending),
                            done: Condvar::new(),
                        });
                        flights.insert(key.clone(), Arc::clone(&flight));
                        (flight, true)
                    }
                }
            };

            if leader {
                break flight;
            }

            let mut state = flight.state.lock().unwrap();
            while matches!(*state, FlightState::Pending) {
                state = flight.done.wait(state).unwrap();
            }
            if let FlightState::Done(value) = &*state {
                return value.clone();
            }
            // Abandoned: try again, possibly as the new leader
        };

        let mut landing = Landing {
            group: self,
            key,
            flight: &flight,
            completed: false,
        };
        let value = op();
        landing.finish(value.clone());
        value
    }

    /// Whether an operation is currently running for `key`
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.flights.lock().unwrap().contains_key(key)
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes the leader's result and unregisters the flight, even on panic
struct Landing<'a, K: Eq + Hash, V> {
    group: &'a SingleFlight<K, V>,
    key: &'a K,
    flight: &'a Flight<V>,
    completed: bool,
}

impl<K: Eq + Hash, V> Landing<'_, K, V> {
    fn finish(&mut self, value: V) {
        self.group.flights.lock().unwrap().remove(self.key);
        *self.flight.state.lock().unwrap() = FlightState::Done(value);
        self.completed = true;
        self.flight.done.notify_all();
    }
}

impl<K: Eq + Hash, V> Drop for Landing<'_, K, V> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Ok(mut flights) = self.group.flights.lock() {
            flights.remove(self.key);
        }
        if let Ok(mut state) = self.flight.state.lock() {
            *state = FlightState::Abandoned;
        }
        self.flight.done.notify_all();
    }
}
