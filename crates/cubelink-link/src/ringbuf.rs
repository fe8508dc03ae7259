// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use log::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// What a full buffer does with one more item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Evict the oldest pending item; newest status matters more.
    OverwriteOldest,
    /// Refuse the incoming item; the producer keeps it and retries.
    RejectNewest,
}

/// Bounded FIFO with a fixed capacity chosen at construction.
#[derive(Debug)]
pub struct RingBuffer<T> {
    name: &'static str,
    items: VecDeque<T>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: u64,
}

impl<T> RingBuffer<T> {
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        RingBuffer {
            name,
            items: VecDeque::with_capacity(capacity),
            capacity,
            policy,
            dropped: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Items lost to overflow since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Appends `item`. Returns false when the buffer was full, in which case
    /// either the oldest entry or `item` itself was dropped, per policy.
    pub fn push(&mut self, item: T) -> bool {
        match self.try_push(item) {
            Ok(()) => true,
            Err(_) => {
                self.dropped += 1;
                trace!("{}: full, dropped incoming item", self.name);
                false
            }
        }
    }

    /// Like `push` but a rejected item is handed back to the caller.
    /// With `OverwriteOldest` the evicted oldest item is returned instead.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        if !self.is_full() {
            self.items.push_back(item);
            return Ok(());
        }
        match self.policy {
            OverflowPolicy::RejectNewest => Err(item),
            OverflowPolicy::OverwriteOldest => {
                let evicted = self.items.pop_front();
                self.items.push_back(item);
                trace!("{}: full, evicted oldest item", self.name);
                match evicted {
                    Some(old) => Err(old),
                    None => Ok(()),
                }
            }
        }
    }

    /// Puts an item back at the head, used to retry a failed release.
    /// Fails when there is no room.
    pub fn push_front(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_front(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn retain<F: FnMut(&T) -> bool>(&mut self, f: F) {
        self.items.retain(f);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
