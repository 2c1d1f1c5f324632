//! External IP accounting for one engine.
//!
//! The pool is rebuilt from the engine's configured addresses minus every
//! IP held by one of its packs. Reservations are synchronous, so a caller
//! that checks and reserves under the same lock can never double-allocate.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Default)]
pub struct IpPool {
    full: BTreeSet<Ipv4Addr>,
    free: BTreeSet<Ipv4Addr>,
}

impl IpPool {
    /// `owned` are IPs already held by packs; ones outside `full` are ignored.
    pub fn new(full: BTreeSet<Ipv4Addr>, owned: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let owned: BTreeSet<Ipv4Addr> = owned.into_iter().collect();
        let free = full.difference(&owned).copied().collect();
        Self { full, free }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn free(&self) -> Vec<Ipv4Addr> {
        self.free.iter().copied().collect()
    }

    pub fn full(&self) -> &BTreeSet<Ipv4Addr> {
        &self.full
    }

    /// Take the `n` lowest free addresses, or nothing at all.
    pub fn reserve(&mut self, n: usize) -> EngineResult<Vec<Ipv4Addr>> {
        if self.free.len() < n {
            return Err(EngineError::NoFreeIps {
                needed: n,
                free: self.free.len(),
            });
        }
        let taken: Vec<Ipv4Addr> = self.free.iter().take(n).copied().collect();
        for ip in &taken {
            self.free.remove(ip);
        }
        Ok(taken)
    }

    /// Return addresses to the pool. Addresses no longer configured are
    /// dropped.
    pub fn release(&mut self, ips: impl IntoIterator<Item = Ipv4Addr>) {
        for ip in ips {
            if self.full.contains(&ip) {
                self.free.insert(ip);
            }
        }
    }

    /// Take specific addresses back out of the pool.
    pub fn claim(&mut self, ips: &[Ipv4Addr]) {
        for ip in ips {
            self.free.remove(ip);
        }
    }

    /// Free addresses and pack-held addresses together cover exactly the
    /// configured pool, and do not overlap.
    pub fn is_consistent_with<'a>(&self, held: impl IntoIterator<Item = &'a Ipv4Addr>) -> bool {
        let held: Vec<Ipv4Addr> = held.into_iter().copied().collect();
        let held_set: BTreeSet<Ipv4Addr> = held.iter().copied().collect();
        if held_set.len() != held.len() || !held_set.is_disjoint(&self.free) {
            return false;
        }
        let union: BTreeSet<Ipv4Addr> = held_set
            .iter()
            .filter(|ip| self.full.contains(ip))
            .chain(self.free.iter())
            .copied()
            .collect();
        union == self.full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, n)
    }

    fn pool(n: u8) -> BTreeSet<Ipv4Addr> {
        (1..=n).map(ip).collect()
    }

    #[test]
    fn rebuild_excludes_held_addresses() {
        let p = IpPool::new(pool(4), [ip(2), ip(9)]);
        assert_eq!(p.free(), vec![ip(1), ip(3), ip(4)]);
        assert!(p.is_consistent_with(&[ip(2)]));
    }

    #[test]
    fn reserve_is_all_or_nothing() {
        let mut p = IpPool::new(pool(3), []);
        assert_eq!(p.reserve(2).unwrap(), vec![ip(1), ip(2)]);
        assert!(matches!(
            p.reserve(2),
            Err(EngineError::NoFreeIps { needed: 2, free: 1 })
        ));
        assert_eq!(p.free_count(), 1);
        assert!(p.is_consistent_with(&[ip(1), ip(2)]));
    }

    #[test]
    fn release_ignores_unconfigured_addresses() {
        let mut p = IpPool::new(pool(2), [ip(1), ip(2)]);
        p.release([ip(1), ip(50)]);
        assert_eq!(p.free(), vec![ip(1)]);

        p.claim(&[ip(1)]);
        assert_eq!(p.free_count(), 0);
    }

    #[test]
    fn double_held_address_is_inconsistent() {
        let p = IpPool::new(pool(3), [ip(1)]);
        assert!(!p.is_consistent_with(&[ip(1), ip(1)]));
        assert!(!p.is_consistent_with(&[ip(1), ip(2)]));
        assert!(!p.is_consistent_with(&[]));
    }
}
