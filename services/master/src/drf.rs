//! Dominant Resource Fairness ordering.
//!
//! A client's dominant share is the largest, over all dimensions, of the
//! fraction of the cluster total it holds. Clients are ordered ascending by
//! that share; equal shares fall back to the order clients were added.
//!
//! The allocator runs two levels of sorter: one over roles, and one per role
//! over that role's frameworks.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

use corral_resources::{ResourceError, Resources};

#[derive(Debug, Clone)]
struct Client {
    allocation: Resources,
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct DrfSorter<K> {
    clients: HashMap<K, Client>,
    total: Resources,
    next_seq: u64,
}

impl<K> Default for DrfSorter<K> {
    fn default() -> Self {
        Self {
            clients: HashMap::new(),
            total: Resources::new(),
            next_seq: 0,
        }
    }
}

impl<K: Clone + Eq + Hash> DrfSorter<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client with nothing allocated. Re-adding keeps its position.
    pub fn add(&mut self, client: K) {
        if self.clients.contains_key(&client) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.clients.insert(
            client,
            Client {
                allocation: Resources::new(),
                seq,
            },
        );
    }

    pub fn remove(&mut self, client: &K) {
        self.clients.remove(client);
    }

    pub fn contains(&self, client: &K) -> bool {
        self.clients.contains_key(client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn allocation(&self, client: &K) -> Option<&Resources> {
        self.clients.get(client).map(|c| &c.allocation)
    }

    pub fn allocated(&mut self, client: &K, resources: &Resources) -> Result<(), ResourceError> {
        if let Some(c) = self.clients.get_mut(client) {
            c.allocation.try_add_assign(resources)?;
        }
        Ok(())
    }

    pub fn unallocated(&mut self, client: &K, resources: &Resources) -> Result<(), ResourceError> {
        if let Some(c) = self.clients.get_mut(client) {
            c.allocation.try_sub_assign(resources)?;
        }
        Ok(())
    }

    pub fn add_total(&mut self, resources: &Resources) -> Result<(), ResourceError> {
        self.total.try_add_assign(resources)
    }

    pub fn remove_total(&mut self, resources: &Resources) -> Result<(), ResourceError> {
        self.total.try_sub_assign(resources)
    }

    pub fn total(&self) -> &Resources {
        &self.total
    }

    /// Dominant share of `client`, zero for unknown clients.
    pub fn share(&self, client: &K) -> f64 {
        self.clients
            .get(client)
            .map_or(0.0, |c| dominant_share(&c.allocation, &self.total))
    }

    /// Clients ordered by ascending dominant share, ties by insertion order.
    pub fn sort(&self) -> Vec<K> {
        let mut ranked: Vec<(f64, u64, &K)> = self
            .clients
            .iter()
            .map(|(k, c)| (dominant_share(&c.allocation, &self.total), c.seq, k))
            .collect();
        ranked.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        ranked.into_iter().map(|(_, _, k)| k.clone()).collect()
    }
}

/// Largest per-dimension fraction of `total` held by `allocation`.
///
/// Dimensions absent from the total do not count.
pub fn dominant_share(allocation: &Resources, total: &Resources) -> f64 {
    allocation
        .names()
        .filter_map(|name| {
            let capacity = total.quantity(name);
            (capacity > 0.0).then(|| allocation.quantity(name) / capacity)
        })
        .fold(0.0, f64::max)
}
