use crate::config::PortRange;
use crate::error::{Error, Result};
use crate::lock_order::{track_lock_acquisition, track_lock_release, LockId};
use parking_lot::Mutex;
use rand::Rng;
use std::net::TcpListener;
use tracing::{debug, warn};

/// Allocator for host ports in a fixed `[min, max)` range.
///
/// Keeps one availability slot per port. A slot is taken by [`allocate`] or
/// [`reserve`] and freed by [`release`]. Before handing out a free slot the
/// allocator binds `0.0.0.0:port` to make sure no untracked process is
/// listening there; the listener is dropped immediately, so the port must be
/// recorded in the registry before the container publishes it.
///
/// # Thread Safety
///
/// The table is guarded by a `parking_lot::Mutex` that is never held across
/// an `.await`, so the allocator can be shared freely between tasks.
///
/// [`allocate`]: PortAllocator::allocate
/// [`reserve`]: PortAllocator::reserve
/// [`release`]: PortAllocator::release
pub struct PortAllocator {
    range: PortRange,
    max_attempts: usize,
    /// `taken[i]` is true when `range.min + i` is assigned.
    taken: Mutex<Vec<bool>>,
    bind_check: bool,
}

impl PortAllocator {
    /// Create an allocator over `range`, probing at most `max_attempts`
    /// candidates per call (`0` probes every free slot).
    pub fn new(range: PortRange, max_attempts: usize) -> Self {
        Self {
            range,
            max_attempts,
            taken: Mutex::new(vec![false; range.len()]),
            bind_check: true,
        }
    }

    /// Disable the TCP bind check. Used by tests that run many allocators
    /// over ranges that may overlap with ports in use on the machine.
    pub fn without_bind_check(mut self) -> Self {
        self.bind_check = false;
        self
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Take a free port.
    ///
    /// Candidates are walked from a random offset so concurrent hosts and
    /// quick relaunches don't keep colliding on the lowest ports.
    ///
    /// # Errors
    ///
    /// [`Error::PortsExhausted`] once the attempt budget or every free slot
    /// has been tried.
    pub fn allocate(&self) -> Result<u16> {
        let len = self.range.len();
        let start = if len == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..len)
        };

        track_lock_acquisition(LockId::PortTable);
        let result = self.allocate_from(start);
        track_lock_release(LockId::PortTable);
        result
    }

    fn allocate_from(&self, start: usize) -> Result<u16> {
        let len = self.range.len();
        let budget = if self.max_attempts == 0 {
            usize::MAX
        } else {
            self.max_attempts
        };

        let mut taken = self.taken.lock();
        let mut attempts = 0;
        for step in 0..len {
            if attempts >= budget {
                break;
            }
            let slot = (start + step) % len;
            if taken[slot] {
                continue;
            }
            attempts += 1;
            let port = self.port_at(slot);
            if self.bind_check && !Self::is_bindable(port) {
                debug!("Port {} is in use by another process, skipping", port);
                continue;
            }
            taken[slot] = true;
            debug!("Allocated port {}", port);
            return Ok(port);
        }

        warn!(
            "No free port in {}..{} after {} attempt(s)",
            self.range.min, self.range.max, attempts
        );
        Err(Error::PortsExhausted {
            min: self.range.min,
            max: self.range.max,
            attempts,
        })
    }

    /// Return `port` to the pool. Releasing a free or out-of-range port is a
    /// no-op.
    pub fn release(&self, port: u16) {
        let Some(slot) = self.slot_of(port) else {
            return;
        };
        track_lock_acquisition(LockId::PortTable);
        {
            let mut taken = self.taken.lock();
            if taken[slot] {
                taken[slot] = false;
                debug!("Released port {}", port);
            }
        }
        track_lock_release(LockId::PortTable);
    }

    /// Mark `port` as taken without probing it.
    ///
    /// Used at startup for ports held by containers that survived a restart.
    /// Returns false if the port is outside the range or already taken.
    pub fn reserve(&self, port: u16) -> bool {
        let Some(slot) = self.slot_of(port) else {
            warn!(
                "Port {} is outside {}..{}; not tracking it",
                port, self.range.min, self.range.max
            );
            return false;
        };
        track_lock_acquisition(LockId::PortTable);
        let reserved = {
            let mut taken = self.taken.lock();
            !std::mem::replace(&mut taken[slot], true)
        };
        track_lock_release(LockId::PortTable);
        reserved
    }

    pub fn is_taken(&self, port: u16) -> bool {
        self.slot_of(port)
            .map(|slot| self.taken.lock()[slot])
            .unwrap_or(false)
    }

    /// Ports currently taken, ascending.
    pub fn taken_ports(&self) -> Vec<u16> {
        self.taken
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, taken)| **taken)
            .map(|(slot, _)| self.port_at(slot))
            .collect()
    }

    pub fn free_count(&self) -> usize {
        self.taken.lock().iter().filter(|taken| !**taken).count()
    }

    fn slot_of(&self, port: u16) -> Option<usize> {
        self.range
            .contains(port)
            .then(|| usize::from(port - self.range.min))
    }

    fn port_at(&self, slot: usize) -> u16 {
        // slot < range.len(), so this stays below range.max
        self.range.min + slot as u16
    }

    fn is_bindable(port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn allocator(min: u16, max: u16) -> PortAllocator {
        PortAllocator::new(PortRange { min, max }, 0).without_bind_check()
    }

    #[test]
    fn test_allocates_every_port_once() {
        let alloc = allocator(30000, 30010);
        let ports: HashSet<u16> = (0..10).map(|_| alloc.allocate().unwrap()).collect();
        assert_eq!(ports.len(), 10);
        assert!(ports.iter().all(|p| (30000..30010).contains(p)));

        let err = alloc.allocate().unwrap_err();
        assert!(err.is_port_exhaustion());
    }

    #[test]
    fn test_release_makes_port_available_again() {
        let alloc = allocator(30000, 30001);
        let port = alloc.allocate().unwrap();
        assert!(alloc.allocate().is_err());

        alloc.release(port);
        assert_eq!(alloc.allocate().unwrap(), port);
    }

    #[test]
    fn test_release_is_idempotent() {
        let alloc = allocator(30000, 30004);
        let port = alloc.allocate().unwrap();
        alloc.release(port);
        alloc.release(port);
        alloc.release(1);
        assert_eq!(alloc.free_count(), 4);
    }

    #[test]
    fn test_reserve_blocks_allocation() {
        let alloc = allocator(30000, 30002);
        assert!(alloc.reserve(30000));
        assert!(!alloc.reserve(30000));
        assert!(!alloc.reserve(29999));
        assert_eq!(alloc.allocate().unwrap(), 30001);
        assert_eq!(alloc.taken_ports(), vec![30000, 30001]);
    }

    #[test]
    fn test_attempt_budget_is_respected() {
        let alloc = PortAllocator::new(PortRange { min: 30000, max: 30100 }, 3).without_bind_check();
        // Budget only counts probes of free slots, so three allocations still succeed
        for _ in 0..3 {
            alloc.allocate().unwrap();
        }
        assert_eq!(alloc.free_count(), 97);
    }

    #[test]
    fn test_empty_range_is_exhausted() {
        let alloc = allocator(30000, 30000);
        match alloc.allocate() {
            Err(Error::PortsExhausted { attempts, .. }) => assert_eq!(attempts, 0),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_bind_check_skips_ports_in_use() {
        // Hold a listener on an OS-assigned port and offer only that port
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let busy = listener.local_addr().unwrap().port();
        let alloc = PortAllocator::new(
            PortRange {
                min: busy,
                max: busy + 1,
            },
            0,
        );
        assert!(alloc.allocate().unwrap_err().is_port_exhaustion());
        assert!(!alloc.is_taken(busy));
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let alloc = Arc::new(allocator(30000, 30064));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || {
                    (0..8)
                        .map(|_| alloc.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {} handed out twice", port);
            }
        }
        assert_eq!(seen.len(), 64);
    }
}
