//! Loopback port pool for session endpoints
//!
//! Ports come from a fixed inclusive range. Released ports go onto a free
//! list that is drained before any new port is probed.

use crate::error::PortError;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use tracing::debug;

/// Decides whether a port can be handed out
pub trait PortProbe: Send + Sync {
    /// Returns true if nothing else is bound to `port`
    fn is_available(&self, port: u16) -> bool;
}

/// Binds a throwaway listener on 127.0.0.1
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackProbe;

impl PortProbe for LoopbackProbe {
    fn is_available(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    in_use: HashSet<u16>,
    free: VecDeque<u16>,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    /// Ports currently handed out
    pub in_use: usize,
    /// Released ports waiting for reuse
    pub reusable: usize,
}

/// Port allocator over `[start, end]`
pub struct PortPool {
    start: u16,
    end: u16,
    probe: Arc<dyn PortProbe>,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for PortPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortPool")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl PortPool {
    /// Create pool probing real loopback sockets
    pub fn new(start: u16, end: u16) -> Result<Self, PortError> {
        Self::with_probe(start, end, Arc::new(LoopbackProbe))
    }

    /// Create pool with a custom probe
    pub fn with_probe(
        start: u16,
        end: u16,
        probe: Arc<dyn PortProbe>,
    ) -> Result<Self, PortError> {
        if start > end {
            return Err(PortError::InvalidRange { start, end });
        }
        Ok(Self {
            start,
            end,
            probe,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Allocate a port
    ///
    /// # Errors
    /// - `PortError::Exhausted` if the free list is empty and no port in the
    ///   range is both unused and bindable
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut state = self.state.lock();

        if let Some(port) = state.free.pop_front() {
            state.in_use.insert(port);
            debug!(port, "reusing released port");
            return Ok(port);
        }

        for port in self.start..=self.end {
            if state.in_use.contains(&port) {
                continue;
            }
            if self.probe.is_available(port) {
                state.in_use.insert(port);
                debug!(port, "allocated port");
                return Ok(port);
            }
        }

        Err(PortError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool; no-op for ports not in use
    pub fn release(&self, port: u16) {
        let mut state = self.state.lock();
        if state.in_use.remove(&port) {
            state.free.push_back(port);
            debug!(port, "released port");
        }
    }

    /// Whether `port` is currently handed out
    #[must_use]
    pub fn is_in_use(&self, port: u16) -> bool {
        self.state.lock().in_use.contains(&port)
    }

    /// Range bounds
    #[inline]
    #[must_use]
    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PortStats {
        let state = self.state.lock();
        PortStats {
            in_use: state.in_use.len(),
            reusable: state.free.len(),
        }
    }
}
