//! The set of monitored ports.
//!
//! One bit per possible port number, so the handlers' membership test is a
//! single relaxed load. The control plane owns the write side and
//! serialises its updates behind a mutex; the probe only ever calls
//! [`MonitoredPorts::contains`], which takes no lock.

use log::info;
use portmon_common::types::MAX_MONITORED_PORTS;
use portmon_common::{Error, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

const WORDS: usize = (u16::MAX as usize + 1) / 64;

/// Bounded set of port numbers with a lock-free membership test.
#[derive(Debug)]
pub struct MonitoredPorts {
    bits: Box<[AtomicU64]>,
    len: AtomicUsize,
    capacity: usize,
    writer: Mutex<()>,
}

impl MonitoredPorts {
    pub fn new() -> Self {
        Self::with_capacity(MAX_MONITORED_PORTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bits: (0..WORDS).map(|_| AtomicU64::new(0)).collect(),
            len: AtomicUsize::new(0),
            capacity,
            writer: Mutex::new(()),
        }
    }

    /// Build a set from a list of ports, failing on the first rejected one.
    pub fn from_ports<I: IntoIterator<Item = u16>>(ports: I) -> Result<Self> {
        let set = Self::new();
        for port in ports {
            set.insert(port)?;
        }
        Ok(set)
    }

    #[inline]
    fn locate(port: u16) -> (usize, u64) {
        (port as usize / 64, 1u64 << (port % 64))
    }

    /// Membership test used on the event path.
    #[inline]
    pub fn contains(&self, port: u16) -> bool {
        let (word, bit) = Self::locate(port);
        self.bits[word].load(Ordering::Relaxed) & bit != 0
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        // The guarded section cannot panic, so a poisoned lock is still sound
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start monitoring `port`. Returns `Ok(false)` if it already was.
    pub fn insert(&self, port: u16) -> Result<bool> {
        if port == 0 {
            return Err(Error::InvalidPort(port));
        }
        if self.contains(port) {
            return Ok(false);
        }

        let _writer = self.lock_writer();
        if self.contains(port) {
            return Ok(false);
        }
        if self.len.load(Ordering::Acquire) >= self.capacity {
            return Err(Error::MembershipFull {
                capacity: self.capacity,
            });
        }

        let (word, bit) = Self::locate(port);
        self.len.fetch_add(1, Ordering::AcqRel);
        self.bits[word].fetch_or(bit, Ordering::Release);

        info!("Added port {} to monitoring", port);
        Ok(true)
    }

    /// Stop monitoring `port`. Returns whether it was monitored.
    pub fn remove(&self, port: u16) -> bool {
        let _writer = self.lock_writer();
        let (word, bit) = Self::locate(port);
        let prev = self.bits[word].fetch_and(!bit, Ordering::AcqRel);
        if prev & bit == 0 {
            return false;
        }
        self.len.fetch_sub(1, Ordering::AcqRel);
        info!("Removed port {} from monitoring", port);
        true
    }

    /// Monitored ports in ascending order.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = Vec::with_capacity(self.len());
        for (i, word) in self.bits.iter().enumerate() {
            let mut w = word.load(Ordering::Relaxed);
            while w != 0 {
                let bit = w.trailing_zeros() as usize;
                ports.push((i * 64 + bit) as u16);
                w &= w - 1;
            }
        }
        ports
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MonitoredPorts {
    fn default() -> Self {
        Self::new()
    }
}
