// src/rl/replay.rs
//
// Fixed-capacity experience replay ring with uniform sampling.

use std::collections::VecDeque;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: Vec<f64>,
    pub action: usize,
    pub reward: f64,
    pub next_state: Vec<f64>,
    /// No bootstrap from `next_state` when set.
    pub terminal: bool,
}

#[derive(Debug)]
pub struct ReplayBuffer {
    items: VecDeque<Transition>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(4_096)),
            capacity,
        }
    }

    /// Append, evicting the oldest transition once full.
    pub fn push(&mut self, t: Transition) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(t);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `n` transitions drawn uniformly with replacement; empty when the
    /// buffer holds fewer than `n`.
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<&Transition> {
        if n == 0 || self.items.len() < n {
            return Vec::new();
        }
        (0..n)
            .map(|_| &self.items[rng.gen_range(0..self.items.len())])
            .collect()
    }
}
