//! IP address management.
//!
//! An [`AddressSpace`] tracks which parts of a contiguous IPv4 range are
//! still free. It does not know about networks: a space carved from a CIDR
//! hands out its network and broadcast addresses like any other unless the
//! caller reserves them first.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use ipnet::Ipv4Net;

use vessel_common::{VesselError, VesselResult};

use crate::ip::{Range, next_addr, prev_addr};

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

fn next_space_id() -> u64 {
    NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A collection of free IPv4 ranges inside a pool.
///
/// Sub-spaces reserved from a space remember the identity of their parent,
/// so they can only be released back into the space they came from.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    id: u64,
    parent: Option<u64>,
    network: Option<Ipv4Net>,
    pool: Range,
    available: Vec<Range>,
}

impl AddressSpace {
    /// A space covering every address of `net`.
    #[must_use]
    pub fn from_network(net: Ipv4Net) -> Self {
        let net = net.trunc();
        let pool = Range::from(net);
        Self {
            id: next_space_id(),
            parent: None,
            network: Some(net),
            pool,
            available: vec![pool],
        }
    }

    /// A space covering `first..=last`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when `first > last`.
    pub fn from_range(first: Ipv4Addr, last: Ipv4Addr) -> VesselResult<Self> {
        let pool = Range::new(first, last)?;
        Ok(Self {
            id: next_space_id(),
            parent: None,
            network: None,
            pool,
            available: vec![pool],
        })
    }

    /// Identity of this space.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Identity of the space this one was reserved from.
    #[must_use]
    pub const fn parent(&self) -> Option<u64> {
        self.parent
    }

    /// The CIDR this space was created from, if any.
    #[must_use]
    pub const fn network(&self) -> Option<Ipv4Net> {
        self.network
    }

    /// The full span of the space.
    #[must_use]
    pub const fn pool(&self) -> Range {
        self.pool
    }

    /// The free ranges, in ascending order.
    #[must_use]
    pub fn available_ranges(&self) -> &[Range] {
        &self.available
    }

    /// The span as a pool range: the network when there is one.
    #[must_use]
    pub fn as_range(&self) -> Range {
        self.network.map_or(self.pool, Range::from)
    }

    /// A copy of this space with its whole pool free again.
    ///
    /// Used to hand an entire sub-space back to its parent once every
    /// reservation inside it has been discarded.
    #[must_use]
    pub fn whole(&self) -> Self {
        Self {
            available: vec![self.pool],
            ..self.clone()
        }
    }

    /// Peek at the lowest free network of width `prefix` without reserving it.
    ///
    /// # Errors
    ///
    /// Returns `ExhaustedPool` when no free range can host such a network.
    pub fn next_ip4_net(&self, prefix: u8) -> VesselResult<Ipv4Net> {
        if prefix > 32 {
            return Err(VesselError::invalid_config(format!(
                "invalid network prefix length {}",
                prefix
            )));
        }

        let size = 1u64 << (32 - u32::from(prefix));
        for r in &self.available {
            let first = u64::from(u32::from(r.first_ip));
            let last = u64::from(u32::from(r.last_ip));

            // round the start of the range up to the next network boundary
            let start = first.div_ceil(size) * size;
            let end = start + size - 1;
            if end > last {
                continue;
            }

            let addr = u32::try_from(start).map_err(|_| VesselError::Internal {
                message: format!("network start {} out of IPv4 range", start),
            })?;
            return Ipv4Net::new(Ipv4Addr::from(addr), prefix).map_err(|e| {
                VesselError::Internal {
                    message: e.to_string(),
                }
            });
        }

        Err(VesselError::ExhaustedPool {
            message: format!(
                "could not find IP range for mask /{} in {}",
                prefix, self.pool
            ),
        })
    }

    /// Reserve the lowest free network of width `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `ExhaustedPool` when no free range can host such a network.
    pub fn reserve_next_ip4_net(&mut self, prefix: u8) -> VesselResult<Self> {
        let net = self.next_ip4_net(prefix)?;
        self.reserve_ip4_net(net)
    }

    /// Reserve the given network.
    ///
    /// An unspecified address (`0.0.0.0/N`) reserves the next free network
    /// of that width instead.
    ///
    /// # Errors
    ///
    /// Fails like [`AddressSpace::reserve_ip4_range`].
    pub fn reserve_ip4_net(&mut self, net: Ipv4Net) -> VesselResult<Self> {
        if net.addr().is_unspecified() {
            return self.reserve_next_ip4_net(net.prefix_len());
        }

        let mut sub = self.reserve_ip4_range(net.network(), net.broadcast())?;
        sub.network = Some(net.trunc());
        Ok(sub)
    }

    /// Reserve `first..=last` and return it as a sub-space.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` when the range is not within the pool, and
    /// `OverlappingAllocation` when part of it is already reserved.
    pub fn reserve_ip4_range(&mut self, first: Ipv4Addr, last: Ipv4Addr) -> VesselResult<Self> {
        let wanted = Range::new(first, last)?;

        let Some(index) = self.available.iter().position(|r| r.covers(&wanted)) else {
            let message = if self.pool.covers(&wanted) {
                format!("cannot reserve IP range {}-{}: already in use", first, last)
            } else {
                format!(
                    "cannot reserve IP range {}-{}: not within pool's range {}-{}",
                    first, last, self.pool.first_ip, self.pool.last_ip
                )
            };
            tracing::debug!(%first, %last, "{}", message);

            return Err(if self.pool.covers(&wanted) {
                VesselError::OverlappingAllocation { message }
            } else {
                VesselError::OutOfRange { message }
            });
        };

        tracing::trace!(%first, %last, "Reserving IP range");
        self.split_available(index, wanted);

        let mut sub = Self::from_range(first, last)?;
        sub.parent = Some(self.id);
        Ok(sub)
    }

    fn split_available(&mut self, index: usize, wanted: Range) {
        let hit = self.available.remove(index);
        let mut at = index;

        if hit.first_ip != wanted.first_ip {
            self.available.insert(
                at,
                Range {
                    first_ip: hit.first_ip,
                    last_ip: prev_addr(wanted.first_ip),
                },
            );
            at += 1;
        }

        if hit.last_ip != wanted.last_ip {
            self.available.insert(
                at,
                Range {
                    first_ip: next_addr(wanted.last_ip),
                    last_ip: hit.last_ip,
                },
            );
        }
    }

    /// Reserve the lowest free address.
    ///
    /// # Errors
    ///
    /// Returns `ExhaustedPool` when the space is full.
    pub fn reserve_next_ip4(&mut self) -> VesselResult<Ipv4Addr> {
        let sub = self.reserve_next_ip4_net(32)?;
        Ok(sub.pool.first_ip)
    }

    /// Reserve a single address.
    ///
    /// # Errors
    ///
    /// Fails like [`AddressSpace::reserve_ip4_range`].
    pub fn reserve_ip4(&mut self, ip: Ipv4Addr) -> VesselResult<()> {
        self.reserve_ip4_range(ip, ip).map(|_| ())
    }

    /// Release a sub-space back into this space.
    ///
    /// # Errors
    ///
    /// Fails when `space` was not reserved from this space, when it still
    /// holds reservations of its own, or when its range collides with free
    /// space.
    pub fn release_ip4_range(&mut self, space: &Self) -> VesselResult<()> {
        let Some(freed) = space.available.first().copied() else {
            return Ok(());
        };

        if space.parent != Some(self.id) {
            return Err(VesselError::state_conflict(
                "cannot release subspace into another parent",
            ));
        }

        if space.available.len() > 1 {
            return Err(VesselError::state_conflict(
                "cannot release an address space with more than one available range",
            ));
        }

        self.insert_free(freed)?;
        tracing::trace!(first = %freed.first_ip, last = %freed.last_ip, "Released IP range");
        Ok(())
    }

    /// Release a single address.
    ///
    /// # Errors
    ///
    /// Fails when the address is outside the pool or already free.
    pub fn release_ip4(&mut self, ip: Ipv4Addr) -> VesselResult<()> {
        self.insert_free(Range::single(ip))
    }

    fn insert_free(&mut self, freed: Range) -> VesselResult<()> {
        if !self.pool.covers(&freed) {
            return Err(VesselError::OutOfRange {
                message: format!(
                    "cannot release IP range {}: not within pool's range {}",
                    freed, self.pool
                ),
            });
        }

        let index = self
            .available
            .iter()
            .position(|r| freed.last_ip < r.first_ip)
            .unwrap_or(self.available.len());

        if index > 0 && self.available[index - 1].last_ip >= freed.first_ip {
            return Err(VesselError::OverlappingAllocation {
                message: format!("could not release IP range {}: already free", freed),
            });
        }

        self.available.insert(index, freed);
        self.defragment();
        Ok(())
    }

    /// Merge free ranges that touch.
    pub fn defragment(&mut self) {
        let mut i = 1;
        while i < self.available.len() {
            if next_addr(self.available[i - 1].last_ip) == self.available[i].first_ip {
                self.available[i - 1].last_ip = self.available[i].last_ip;
                self.available.remove(i);
            } else {
                i += 1;
            }
        }
    }
}

/// Spaces are equal when the same addresses are free.
impl PartialEq for AddressSpace {
    fn eq(&self, other: &Self) -> bool {
        self.available == other.available
    }
}

impl Eq for AddressSpace {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ranges(space: &AddressSpace) -> Vec<(Ipv4Addr, Ipv4Addr)> {
        space
            .available_ranges()
            .iter()
            .map(|r| (r.first_ip, r.last_ip))
            .collect()
    }

    #[test]
    fn reserve_ip4_splits_range() {
        let mut space = AddressSpace::from_network(net("10.10.0.0/24"));
        space.reserve_ip4(ip("10.10.0.5")).unwrap();
        assert_eq!(
            ranges(&space),
            vec![
                (ip("10.10.0.0"), ip("10.10.0.4")),
                (ip("10.10.0.6"), ip("10.10.0.255")),
            ]
        );

        // edges do not leave empty residuals
        space.reserve_ip4(ip("10.10.0.0")).unwrap();
        space.reserve_ip4(ip("10.10.0.255")).unwrap();
        assert_eq!(
            ranges(&space),
            vec![
                (ip("10.10.0.1"), ip("10.10.0.4")),
                (ip("10.10.0.6"), ip("10.10.0.254")),
            ]
        );
    }

    #[test]
    fn reserve_errors_are_classified() {
        let mut space = AddressSpace::from_network(net("10.10.0.0/24"));
        space.reserve_ip4(ip("10.10.0.5")).unwrap();

        let err = space.reserve_ip4(ip("10.10.0.5")).unwrap_err();
        assert_eq!(err.kind(), vessel_common::ErrorKind::OverlappingAllocation);

        let err = space.reserve_ip4(ip("10.10.1.5")).unwrap_err();
        assert_eq!(err.kind(), vessel_common::ErrorKind::OutOfRange);
    }

    #[test]
    fn reserve_next_ip4_is_lowest_free() {
        let mut space = AddressSpace::from_network(net("10.20.0.0/24"));
        space.reserve_ip4(ip("10.20.0.0")).unwrap();
        space.reserve_ip4(ip("10.20.0.1")).unwrap();
        assert_eq!(space.reserve_next_ip4().unwrap(), ip("10.20.0.2"));
        assert_eq!(space.reserve_next_ip4().unwrap(), ip("10.20.0.3"));
    }

    #[test]
    fn next_ip4_net_rounds_up_to_boundary() {
        let mut space = AddressSpace::from_network(net("172.16.0.0/12"));
        space.reserve_ip4(ip("172.16.0.0")).unwrap();
        assert_eq!(space.next_ip4_net(16).unwrap(), net("172.17.0.0/16"));

        let mut space = AddressSpace::from_network(net("10.0.0.0/24"));
        space.reserve_ip4_range(ip("10.0.0.0"), ip("10.0.0.2")).unwrap();
        assert_eq!(space.next_ip4_net(25).unwrap(), net("10.0.0.128/25"));
        assert_eq!(space.next_ip4_net(30).unwrap(), net("10.0.0.4/30"));
        assert!(space.next_ip4_net(24).is_err());
    }

    #[test]
    fn next_ip4_net_fills_lowest_hole() {
        let mut space = AddressSpace::from_network(net("172.16.0.0/12"));
        let a = space.reserve_next_ip4_net(16).unwrap();
        let b = space.reserve_next_ip4_net(16).unwrap();
        let _c = space.reserve_next_ip4_net(16).unwrap();
        assert_eq!(b.network(), Some(net("172.17.0.0/16")));

        space.release_ip4_range(&a).unwrap();
        assert_eq!(space.next_ip4_net(16).unwrap(), net("172.16.0.0/16"));
    }

    #[test]
    fn slash_twelve_holds_sixteen_slash_sixteens() {
        let mut space = AddressSpace::from_network(net("172.16.0.0/12"));
        for _ in 0..16 {
            space.reserve_next_ip4_net(16).unwrap();
        }
        let err = space.reserve_next_ip4_net(16).unwrap_err();
        assert_eq!(err.kind(), vessel_common::ErrorKind::ExhaustedPool);
        assert!(space.available_ranges().is_empty());
    }

    #[test]
    fn reserve_ip4_net_with_unspecified_address_takes_next() {
        let mut space = AddressSpace::from_network(net("172.16.0.0/12"));
        let first = space.reserve_ip4_net(net("0.0.0.0/16")).unwrap();
        assert_eq!(first.network(), Some(net("172.16.0.0/16")));
        assert_eq!(first.parent(), Some(space.id()));
    }

    #[test]
    fn release_into_wrong_parent_fails() {
        let mut a = AddressSpace::from_network(net("10.0.0.0/16"));
        let mut b = AddressSpace::from_network(net("10.0.0.0/16"));
        let sub = a.reserve_ip4_net(net("10.0.1.0/24")).unwrap();
        assert!(b.release_ip4_range(&sub).is_err());
        a.release_ip4_range(&sub).unwrap();
        assert_eq!(a, AddressSpace::from_network(net("10.0.0.0/16")));
    }

    #[test]
    fn release_of_fragmented_subspace_fails() {
        let mut space = AddressSpace::from_network(net("10.0.0.0/16"));
        let mut sub = space.reserve_ip4_net(net("10.0.1.0/24")).unwrap();
        sub.reserve_ip4(ip("10.0.1.7")).unwrap();
        assert!(space.release_ip4_range(&sub).is_err());

        sub.release_ip4(ip("10.0.1.7")).unwrap();
        space.release_ip4_range(&sub).unwrap();
        assert_eq!(space.available_ranges().len(), 1);
    }

    #[test]
    fn release_of_free_address_fails() {
        let mut space = AddressSpace::from_network(net("10.0.0.0/24"));
        assert!(space.release_ip4(ip("10.0.0.9")).is_err());
        assert!(space.release_ip4(ip("10.0.1.9")).is_err());
    }

    #[test]
    fn defragment_merges_adjacent_ranges() {
        let mut space = AddressSpace::from_network(net("10.0.0.0/24"));
        for i in 0..=255u8 {
            space.reserve_ip4(Ipv4Addr::new(10, 0, 0, i)).unwrap();
        }
        assert!(space.available_ranges().is_empty());

        for i in [3u8, 1, 2, 200, 0] {
            space.release_ip4(Ipv4Addr::new(10, 0, 0, i)).unwrap();
        }
        assert_eq!(
            ranges(&space),
            vec![
                (ip("10.0.0.0"), ip("10.0.0.3")),
                (ip("10.0.0.200"), ip("10.0.0.200")),
            ]
        );
    }

    #[test]
    fn whole_restores_full_pool() {
        let mut space = AddressSpace::from_network(net("172.16.0.0/12"));
        let mut sub = space.reserve_next_ip4_net(16).unwrap();
        sub.reserve_ip4(ip("172.16.0.1")).unwrap();
        space.release_ip4_range(&sub.whole()).unwrap();
        assert_eq!(space, AddressSpace::from_network(net("172.16.0.0/12")));
    }

    proptest! {
        #[test]
        fn reserve_then_release_restores_space(
            offsets in proptest::collection::vec((0u32..4096, 0u32..64), 1..20)
        ) {
            let base = u32::from(ip("10.0.0.0"));
            let mut space = AddressSpace::from_network(net("10.0.0.0/20"));
            let mut held = Vec::new();

            for (start, len) in offsets {
                let first = base + start;
                let last = (first + len).min(base + 4095);
                let before = space.clone();
                if let Ok(sub) = space.reserve_ip4_range(Ipv4Addr::from(first), Ipv4Addr::from(last)) {
                    let mut probe = space.clone();
                    probe.release_ip4_range(&sub).unwrap();
                    prop_assert_eq!(&probe, &before);
                    held.push(sub);
                }

                let free = space.available_ranges();
                for pair in free.windows(2) {
                    prop_assert!(u32::from(pair[0].last_ip) + 1 < u32::from(pair[1].first_ip));
                }
            }

            for sub in held.iter().rev() {
                space.release_ip4_range(sub).unwrap();
            }
            prop_assert_eq!(space, AddressSpace::from_network(net("10.0.0.0/20")));
        }
    }
}
