//! Fixed-size pool of exclusive capture surfaces.
//!
//! Each unit pairs a virtual display with a dedicated audio sink so that
//! concurrent jobs never record over each other. The pool is pre-sized to the
//! concurrency ceiling at startup and never grows; admission and unit
//! availability share the same bound by construction.

use std::sync::{Arc, Mutex};

/// An exclusive virtual display + audio sink pair for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationUnit {
    /// X-style display identifier, e.g. `:100`.
    pub display: String,
    /// PulseAudio null-sink name, e.g. `meetrec-sink-0`.
    pub audio_sink: String,
}

pub struct IsolationPool {
    free: Mutex<Vec<IsolationUnit>>,
    size: usize,
}

impl IsolationPool {
    /// Build a pool of `size` units with display numbers counting up from
    /// `display_base`.
    pub fn new(size: usize, display_base: u32) -> Arc<Self> {
        let units = (0..size)
            .map(|i| IsolationUnit {
                display: format!(":{}", display_base + i as u32),
                audio_sink: format!("meetrec-sink-{}", i),
            })
            .collect();
        Arc::new(Self {
            free: Mutex::new(units),
            size,
        })
    }

    /// Non-blocking acquire. Units are fungible; any free unit satisfies any
    /// job. The lease returns its unit on drop, so release happens on every
    /// exit path out of a job.
    pub fn try_acquire(self: &Arc<Self>) -> Option<UnitLease> {
        let unit = self.free.lock().expect("isolation pool poisoned").pop()?;
        Some(UnitLease {
            unit: Some(unit),
            pool: Arc::clone(self),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.free.lock().expect("isolation pool poisoned").len()
    }

    fn release(&self, unit: IsolationUnit) {
        let mut free = self.free.lock().expect("isolation pool poisoned");
        debug_assert!(free.len() < self.size);
        free.push(unit);
    }
}

/// Holds one unit for the lifetime of a job's capture surface.
pub struct UnitLease {
    unit: Option<IsolationUnit>,
    pool: Arc<IsolationPool>,
}

impl UnitLease {
    pub fn unit(&self) -> &IsolationUnit {
        self.unit.as_ref().expect("lease already released")
    }
}

impl Drop for UnitLease {
    fn drop(&mut self) {
        if let Some(unit) = self.unit.take() {
            self.pool.release(unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_builds_distinct_units() {
        let pool = IsolationPool::new(3, 100);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        let c = pool.try_acquire().unwrap();

        assert_ne!(a.unit(), b.unit());
        assert_ne!(b.unit(), c.unit());
        assert!(a.unit().display.starts_with(':'));
    }

    #[test]
    fn test_acquire_exhaustion_and_release() {
        let pool = IsolationPool::new(2, 100);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_released_unit_is_reusable() {
        let pool = IsolationPool::new(1, 50);
        let display = {
            let lease = pool.try_acquire().unwrap();
            lease.unit().display.clone()
        };
        let again = pool.try_acquire().unwrap();
        assert_eq!(again.unit().display, display);
    }

    #[test]
    fn test_conservation_under_churn() {
        let pool = IsolationPool::new(4, 100);
        for _ in 0..10 {
            let leases: Vec<_> = (0..4).filter_map(|_| pool.try_acquire()).collect();
            assert_eq!(leases.len(), 4);
            assert_eq!(pool.available(), 0);
            drop(leases);
            assert_eq!(pool.available(), 4);
        }
    }
}
