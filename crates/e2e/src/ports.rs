//! Port allocation for concurrently running variations

use std::collections::HashSet;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::PortConfig;
use crate::error::{HarnessError, HarnessResult};

/// Hands out ports from a reserved range, never the same one twice while a
/// lease is alive.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            leased: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn from_config(config: &PortConfig) -> Self {
        Self::new(config.range_start..=config.range_end)
    }

    /// Reserve a specific port, e.g. the one named by a base URL hint
    pub fn reserve(&self, port: u16) -> HarnessResult<PortLease> {
        let mut leased = self.leased.lock();
        if leased.contains(&port) || !is_bindable(port) {
            return Err(HarnessError::PortUnavailable(port));
        }
        leased.insert(port);
        debug!("Reserved port {}", port);
        Ok(self.lease(port))
    }

    /// Allocate the first free port in the range, falling back to an
    /// OS-assigned ephemeral port once the range is exhausted.
    pub fn allocate(&self) -> HarnessResult<PortLease> {
        let mut leased = self.leased.lock();
        for port in self.range.clone() {
            if !leased.contains(&port) && is_bindable(port) {
                leased.insert(port);
                debug!("Allocated port {}", port);
                return Ok(self.lease(port));
            }
        }

        let port = ephemeral_port()?;
        leased.insert(port);
        debug!("Port range exhausted, using ephemeral port {}", port);
        Ok(self.lease(port))
    }

    /// Number of outstanding leases
    pub fn in_use(&self) -> usize {
        self.leased.lock().len()
    }

    fn lease(&self, port: u16) -> PortLease {
        PortLease {
            port,
            leased: self.leased.clone(),
        }
    }
}

/// A leased port, returned to the allocator on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.leased.lock().remove(&self.port);
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

fn ephemeral_port() -> HarnessResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
