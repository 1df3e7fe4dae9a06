// ABOUTME: Bounded host port pool for per-user agent sandboxes
// ABOUTME: Hands out the lowest free port in the configured range and takes ports back

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::ops::Range;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq)]
pub enum PortError {
    #[error("No free sandbox port in range {start}..{end}")]
    Exhausted { start: u16, end: u16 },
}

/// Tracks which host ports are held by sandboxes.
///
/// Ports adopted from containers found at startup may lie outside `range`;
/// they are still tracked so they are never handed out twice.
pub struct PortAllocator {
    range: Range<u16>,
    allocated: Mutex<BTreeSet<u16>>,
    probe_host: bool,
}

impl PortAllocator {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            range,
            allocated: Mutex::new(BTreeSet::new()),
            probe_host: false,
        }
    }

    /// Also skip ports another process on this host is already listening on
    pub fn with_host_probe(mut self) -> Self {
        self.probe_host = true;
        self
    }

    pub fn range(&self) -> Range<u16> {
        self.range.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        // The set is always left consistent, so a poisoned lock is still usable
        self.allocated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut allocated = self.lock();

        for port in self.range.clone() {
            if allocated.contains(&port) {
                continue;
            }
            if self.probe_host && !Self::is_bindable(port) {
                debug!("Skipping port {}: in use on host", port);
                continue;
            }
            allocated.insert(port);
            return Ok(port);
        }

        Err(PortError::Exhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Record a port already in use by a sandbox we did not create ourselves
    pub fn mark_allocated(&self, port: u16) {
        self.lock().insert(port);
    }

    /// Return a port to the pool. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) {
        self.lock().remove(&port);
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.lock().len()
    }

    fn is_bindable(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}
