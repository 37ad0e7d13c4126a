//! Address Pool (§4.1). Allocates and recycles overlay IPv4 addresses
//! within a configured CIDR, with per-agent stickiness.
//!
//! The reserved-address set (network address, first host, broadcast) is
//! derived here from plain `u32` host-order arithmetic rather than any
//! ported bit-manipulation routine, per the Open Question in §9: the
//! first host is reserved as the coordinator-side gateway address, the
//! network and broadcast addresses are never handed out, and blocks
//! with fewer than one allocatable address (`/31`, `/32`) are rejected
//! at construction.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::RwLock;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("no available IPs in {0}")]
    NoAvailableIps(String),

    #[error("address pool exhausted")]
    Exhausted,

    #[error("{0} is outside the configured CIDR")]
    OutOfRange(Ipv4Addr),

    #[error("{0} is a reserved address")]
    Reserved(Ipv4Addr),

    #[error("{0} is already allocated")]
    AlreadyAllocated(Ipv4Addr),

    #[error("agent {0} has no allocation")]
    NotAllocated(String),
}

fn parse_cidr(cidr: &str) -> Result<(u32, u32), PoolError> {
    let (addr_part, prefix_part) = cidr
        .split_once('/')
        .ok_or_else(|| PoolError::InvalidCidr(cidr.to_string()))?;
    let addr = Ipv4Addr::from_str(addr_part).map_err(|_| PoolError::InvalidCidr(cidr.to_string()))?;
    let prefix: u32 = prefix_part
        .parse()
        .map_err(|_| PoolError::InvalidCidr(cidr.to_string()))?;
    if prefix > 32 {
        return Err(PoolError::InvalidCidr(cidr.to_string()));
    }
    let mask: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    let network = u32::from(addr) & mask;
    Ok((network, mask))
}

struct PoolInner {
    cidr: String,
    network: u32,
    mask: u32,
    /// Addresses available for a fresh (non-sticky) allocation, tail is
    /// the preferred draw so recently released addresses are reused
    /// last (Design Notes §9: "reclaimed addresses SHOULD be appended
    /// to the tail").
    free: VecDeque<u32>,
    allocated: std::collections::HashMap<String, u32>,
    by_ip: std::collections::HashMap<u32, String>,
}

impl PoolInner {
    fn is_in_range(&self, ip: u32) -> bool {
        ip & self.mask == self.network
    }

    fn broadcast(&self) -> u32 {
        self.network | !self.mask
    }

    fn gateway(&self) -> u32 {
        self.network + 1
    }

    fn is_reserved(&self, ip: u32) -> bool {
        ip == self.network || ip == self.broadcast() || ip == self.gateway()
    }
}

/// Thread-safe overlay address allocator. All mutating operations take
/// a single exclusive lock; read-only queries may share it (§4.1,
/// §5 "a map under a lock").
pub struct AddressPool {
    inner: RwLock<PoolInner>,
}

impl AddressPool {
    /// Enumerates all host addresses in `cidr`, skipping the network
    /// address, the first host (reserved as the coordinator gateway),
    /// and the broadcast address. Fails if the block has no remaining
    /// allocatable addresses (`/31`, `/32`).
    pub fn new(cidr: &str) -> Result<Self, PoolError> {
        let (network, mask) = parse_cidr(cidr)?;
        let host_bits = 32 - mask.count_ones();
        let total = 1u64 << host_bits;

        let mut inner = PoolInner {
            cidr: cidr.to_string(),
            network,
            mask,
            free: VecDeque::new(),
            allocated: std::collections::HashMap::new(),
            by_ip: std::collections::HashMap::new(),
        };

        if total < 4 {
            // /31 and /32 (and smaller, impossible) blocks have no room
            // for network + gateway + at least one more host + broadcast.
            return Err(PoolError::NoAvailableIps(cidr.to_string()));
        }

        let broadcast = inner.broadcast();
        let gateway = inner.gateway();
        for offset in 0..total as u32 {
            let ip = network.wrapping_add(offset);
            if ip == network || ip == gateway || ip == broadcast {
                continue;
            }
            inner.free.push_back(ip);
        }

        if inner.free.is_empty() {
            return Err(PoolError::NoAvailableIps(cidr.to_string()));
        }

        Ok(Self { inner: RwLock::new(inner) })
    }

    pub fn cidr(&self) -> String {
        self.inner.read().unwrap().cidr.clone()
    }

    pub fn gateway_ip(&self) -> Ipv4Addr {
        let inner = self.inner.read().unwrap();
        Ipv4Addr::from(inner.gateway())
    }

    /// Dotted-quad subnet mask for the configured block, handed to
    /// agents alongside `assigned_ip` so they can bring the virtual
    /// interface up with the right prefix (§4.4 step 3).
    pub fn netmask(&self) -> Ipv4Addr {
        let inner = self.inner.read().unwrap();
        Ipv4Addr::from(inner.mask)
    }

    /// Allocates an overlay IP for `agent_id`. Idempotent: an agent that
    /// already holds a live allocation gets the same address back.
    pub fn allocate(&self, agent_id: &str) -> Result<Ipv4Addr, PoolError> {
        let mut inner = self.inner.write().unwrap();
        if let Some(&ip) = inner.allocated.get(agent_id) {
            return Ok(Ipv4Addr::from(ip));
        }
        let ip = inner.free.pop_front().ok_or(PoolError::Exhausted)?;
        inner.allocated.insert(agent_id.to_string(), ip);
        inner.by_ip.insert(ip, agent_id.to_string());
        Ok(Ipv4Addr::from(ip))
    }

    /// Allocates a specific address for `agent_id`, e.g. to re-populate
    /// the pool with an agent's previously persisted IP after a
    /// coordinator restart.
    pub fn allocate_specific(&self, agent_id: &str, ip: Ipv4Addr) -> Result<(), PoolError> {
        let mut inner = self.inner.write().unwrap();
        let raw = u32::from(ip);

        if let Some(&existing) = inner.allocated.get(agent_id) {
            if existing == raw {
                return Ok(());
            }
        }

        if !inner.is_in_range(raw) {
            return Err(PoolError::OutOfRange(ip));
        }
        if inner.is_reserved(raw) {
            return Err(PoolError::Reserved(ip));
        }
        if inner.by_ip.contains_key(&raw) {
            return Err(PoolError::AlreadyAllocated(ip));
        }

        // Remove from the free list if present (first-time assignment);
        // if absent, it means this address was never enumerated (should
        // not happen given the range/reserved checks above).
        if let Some(pos) = inner.free.iter().position(|&f| f == raw) {
            inner.free.remove(pos);
        }

        inner.allocated.insert(agent_id.to_string(), raw);
        inner.by_ip.insert(raw, agent_id.to_string());
        Ok(())
    }

    /// Releases `agent_id`'s allocation, returning it to the tail of the
    /// free list so a transient reconnect before a fresh allocation
    /// still tends to see the same address.
    pub fn release(&self, agent_id: &str) -> Result<(), PoolError> {
        let mut inner = self.inner.write().unwrap();
        let ip = inner
            .allocated
            .remove(agent_id)
            .ok_or_else(|| PoolError::NotAllocated(agent_id.to_string()))?;
        inner.by_ip.remove(&ip);
        inner.free.push_back(ip);
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Option<Ipv4Addr> {
        let inner = self.inner.read().unwrap();
        inner.allocated.get(agent_id).copied().map(Ipv4Addr::from)
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        let inner = self.inner.read().unwrap();
        inner.by_ip.contains_key(&u32::from(ip))
    }

    pub fn allocated_count(&self) -> usize {
        self.inner.read().unwrap().allocated.len()
    }

    pub fn free_count(&self) -> usize {
        self.inner.read().unwrap().free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_32_has_no_available_ips() {
        assert_eq!(
            AddressPool::new("10.0.0.5/32").unwrap_err(),
            PoolError::NoAvailableIps("10.0.0.5/32".to_string())
        );
    }

    #[test]
    fn slash_31_has_no_available_ips() {
        assert_eq!(
            AddressPool::new("10.0.0.4/31").unwrap_err(),
            PoolError::NoAvailableIps("10.0.0.4/31".to_string())
        );
    }

    #[test]
    fn slash_16_allocates_2_pow_16_minus_3() {
        let pool = AddressPool::new("10.200.0.0/16").unwrap();
        assert_eq!(pool.free_count(), (1usize << 16) - 3);
    }

    #[test]
    fn reserved_addresses_are_never_allocated() {
        let pool = AddressPool::new("10.0.0.0/30").unwrap();
        // Only 10.0.0.2 is allocatable: .0 network, .1 gateway, .3 broadcast.
        let ip = pool.allocate("a").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 2));
        assert!(pool.allocate("b").is_err());
    }

    #[test]
    fn allocate_is_idempotent_for_the_same_agent() {
        let pool = AddressPool::new("10.200.0.0/16").unwrap();
        let first = pool.allocate("agent-a").unwrap();
        let second = pool.allocate("agent-a").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn release_then_allocate_may_change_but_must_succeed() {
        let pool = AddressPool::new("10.0.0.0/30").unwrap();
        let ip = pool.allocate("a").unwrap();
        pool.release("a").unwrap();
        let reallocated = pool.allocate("b").unwrap();
        assert_eq!(reallocated, ip);
    }

    #[test]
    fn exhaustion_then_release_then_success_scenario() {
        let pool = AddressPool::new("10.0.0.0/30").unwrap();
        let a_ip = pool.allocate("a").unwrap();
        assert_eq!(pool.allocate("b").unwrap_err(), PoolError::Exhausted);
        pool.release("a").unwrap();
        let b_ip = pool.allocate("b").unwrap();
        assert_eq!(b_ip, a_ip);
    }

    #[test]
    fn release_without_allocation_fails() {
        let pool = AddressPool::new("10.200.0.0/16").unwrap();
        assert!(matches!(pool.release("nope"), Err(PoolError::NotAllocated(_))));
    }

    #[test]
    fn allocate_specific_rejects_out_of_range_reserved_and_taken() {
        let pool = AddressPool::new("10.200.0.0/16").unwrap();
        assert!(matches!(
            pool.allocate_specific("x", Ipv4Addr::new(10, 201, 0, 5)),
            Err(PoolError::OutOfRange(_))
        ));
        assert!(matches!(
            pool.allocate_specific("x", Ipv4Addr::new(10, 200, 0, 1)),
            Err(PoolError::Reserved(_))
        ));
        pool.allocate_specific("x", Ipv4Addr::new(10, 200, 0, 9)).unwrap();
        assert!(matches!(
            pool.allocate_specific("y", Ipv4Addr::new(10, 200, 0, 9)),
            Err(PoolError::AlreadyAllocated(_))
        ));
    }

    #[test]
    fn gateway_ip_is_first_host() {
        let pool = AddressPool::new("10.200.0.0/16").unwrap();
        assert_eq!(pool.gateway_ip(), Ipv4Addr::new(10, 200, 0, 1));
    }
}
