//! endpoint selection over the discovered instance set.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use rand::Rng;

use crate::registry::Instance;

/// picks one instance out of a discovery snapshot. `None` means no instance
/// is available and the call must fail rather than block.
pub trait LoadBalance: Send + Sync {
    fn select<'a>(&self, instances: &'a [Instance]) -> Option<&'a Instance>;
}

/// lock free rotation over the instance list.
#[derive(Default)]
pub struct RoundRobin {
    idx: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for RoundRobin {
    fn select<'a>(&self, instances: &'a [Instance]) -> Option<&'a Instance> {
        if instances.is_empty() {
            return None;
        }
        let i = self.idx.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        instances.get(i as usize % instances.len())
    }
}

/// uniform pick. the thread local rng is already thread safe so no lock is
/// involved.
#[derive(Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalance for Random {
    fn select<'a>(&self, instances: &'a [Instance]) -> Option<&'a Instance> {
        if instances.is_empty() {
            return None;
        }
        instances.get(rand::thread_rng().gen_range(0..instances.len()))
    }
}

/// smooth weighted round robin. weights are keyed by addr so the instance set
/// may drift from the configuration without wedging selection: an addr with
/// no configured weight participates with weight 1, and state for departed
/// addrs is pruned.
///
/// each select adds every instance's weight to its running weight, picks the
/// largest and subtracts the weight total from it, spreading picks instead of
/// bursting them.
pub struct WeightedRoundRobin {
    state: Mutex<WeightedState>,
}

struct WeightedState {
    weights: HashMap<String, i64>,
    current: HashMap<String, i64>,
}

impl WeightedRoundRobin {
    pub fn new<I>(weights: I) -> Self
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        Self {
            state: Mutex::new(WeightedState {
                weights: weights.into_iter().map(|(addr, w)| (addr, w.max(0))).collect(),
                current: HashMap::new(),
            }),
        }
    }
}

impl LoadBalance for WeightedRoundRobin {
    fn select<'a>(&self, instances: &'a [Instance]) -> Option<&'a Instance> {
        if instances.is_empty() {
            return None;
        }

        let mut state = self.state.lock().unwrap();

        state
            .current
            .retain(|addr, _| instances.iter().any(|i| i.addr == *addr));

        let mut total = 0i64;
        let mut best = 0usize;
        let mut best_weight = i64::MIN;

        for (idx, instance) in instances.iter().enumerate() {
            let weight = state.weights.get(&instance.addr).copied().unwrap_or(1);
            total += weight;

            let current = state.current.entry(instance.addr.clone()).or_insert(0);
            *current += weight;

            if *current > best_weight {
                best = idx;
                best_weight = *current;
            }
        }

        let chosen = &instances[best];
        if let Some(current) = state.current.get_mut(&chosen.addr) {
            *current -= total;
        }

        Some(chosen)
    }
}
