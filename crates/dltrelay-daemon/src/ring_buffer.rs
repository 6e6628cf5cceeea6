use std::collections::VecDeque;

use bytes::Bytes;
use tracing::debug;

use crate::error::{DaemonError, Result};

/// Bookkeeping bytes charged per stored message on top of its length.
pub const BLOCK_HEADER_SIZE: usize = 12;

pub const DEFAULT_MIN_SIZE: usize = 500_000;
pub const DEFAULT_MAX_SIZE: usize = 10_000_000;
pub const DEFAULT_STEP_SIZE: usize = 500_000;

/// Size limits of the ring buffer, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufferConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub step_size: usize,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            step_size: DEFAULT_STEP_SIZE,
        }
    }
}

impl RingBufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.min_size > self.max_size || self.step_size == 0 {
            return Err(DaemonError::InvalidBufferConfig {
                min: self.min_size,
                max: self.max_size,
                step: self.step_size,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingBufferError {
    /// No room even at maximum capacity; nothing was stored.
    #[error("ring buffer full")]
    Full,
}

/// Message-granular FIFO with a capacity that grows in fixed steps.
///
/// Messages are stored whole and come back out in push order. Capacity
/// starts at the minimum and only grows when a push does not fit.
#[derive(Debug)]
pub struct RingBuffer {
    config: RingBufferConfig,
    capacity: usize,
    used: usize,
    messages: VecDeque<Bytes>,
}

impl RingBuffer {
    pub fn new(config: RingBufferConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            capacity: config.min_size,
            used: 0,
            messages: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &RingBufferConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes charged against capacity, block headers included.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append one message.
    ///
    /// If it does not fit and one more step stays within the maximum, the
    /// capacity grows by exactly one step and the push is retried once.
    pub fn push(&mut self, message: Bytes) -> std::result::Result<(), RingBufferError> {
        let need = message.len() + BLOCK_HEADER_SIZE;
        if !self.fits(need) {
            if self.capacity + self.config.step_size > self.config.max_size {
                return Err(RingBufferError::Full);
            }
            self.capacity += self.config.step_size;
            debug!(capacity = self.capacity, "ring buffer grown");
            if !self.fits(need) {
                return Err(RingBufferError::Full);
            }
        }
        self.used += need;
        self.messages.push_back(message);
        Ok(())
    }

    /// Concatenate `parts` into one stored message.
    pub fn push_parts(&mut self, parts: &[&[u8]]) -> std::result::Result<(), RingBufferError> {
        let mut message = Vec::with_capacity(parts.iter().map(|part| part.len()).sum());
        for part in parts {
            message.extend_from_slice(part);
        }
        self.push(Bytes::from(message))
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.messages.front()
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        let message = self.messages.pop_front()?;
        self.used -= message.len() + BLOCK_HEADER_SIZE;
        Some(message)
    }

    /// Drop all content and shrink back to the minimum.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.used = 0;
        self.capacity = self.config.min_size;
    }

    /// Shrink an empty buffer back to the minimum.
    pub fn minimize(&mut self) {
        if self.messages.is_empty() && self.capacity != self.config.min_size {
            self.capacity = self.config.min_size;
            self.messages.shrink_to_fit();
            debug!(capacity = self.capacity, "ring buffer minimized");
        }
    }

    fn fits(&self, need: usize) -> bool {
        self.used + need <= self.capacity
    }
}
