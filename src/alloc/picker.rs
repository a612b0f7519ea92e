//! Address and prefix pickers.
//!
//! A picker maps an attempt number to a candidate address across a
//! subnet's eligible pools, which are treated as one concatenated range in
//! declaration order. Attempt 0 follows the configured strategy; retries
//! after a collision always scan upward from the first pool, so when two
//! workers race repeatedly the smaller address wins.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};

use ipnet::Ipv6Net;
use rand::Rng;
use twox_hash::XxHash64;

use crate::configdb::{PdPool, PickerKind, Pool4, Pool6};

const HASH_SEED: u64 = 0x7368_6164_6f77;

pub(crate) fn total4(pools: &[&Pool4]) -> u64 {
    pools.iter().map(|p| p.size()).sum()
}

pub(crate) fn addr4_at(pools: &[&Pool4], mut index: u64) -> Option<Ipv4Addr> {
    for pool in pools {
        let size = pool.size();
        if index < size {
            return Some(Ipv4Addr::from(u32::from(pool.start) + index as u32));
        }
        index -= size;
    }
    None
}

/// Candidate IPv4 address for the given attempt.
pub(crate) fn pick4(
    pools: &[&Pool4],
    kind: PickerKind,
    cursor: &AtomicU64,
    client_key: &[u8],
    attempt: u32,
) -> Option<Ipv4Addr> {
    let total = total4(pools);
    if total == 0 {
        return None;
    }
    let index = match (attempt, kind) {
        (0, PickerKind::Iterative) => cursor.fetch_add(1, Ordering::Relaxed) % total,
        (0, PickerKind::Random) => rand::rng().random_range(0..total),
        (0, PickerKind::Hashed) => XxHash64::oneshot(HASH_SEED, client_key) % total,
        // collision retry: smallest candidates first
        (n, _) => {
            let n = u64::from(n) - 1;
            if n >= total {
                return None;
            }
            n
        }
    };
    addr4_at(pools, index)
}

pub(crate) fn total6(pools: &[&Pool6]) -> u128 {
    pools.iter().map(|p| p.size()).sum()
}

pub(crate) fn addr6_at(pools: &[&Pool6], mut index: u128) -> Option<Ipv6Addr> {
    for pool in pools {
        let size = pool.size();
        if index < size {
            return Some(Ipv6Addr::from(u128::from(pool.start) + index));
        }
        index -= size;
    }
    None
}

pub(crate) fn pick6(
    pools: &[&Pool6],
    kind: PickerKind,
    cursor: &AtomicU64,
    client_key: &[u8],
    attempt: u32,
) -> Option<Ipv6Addr> {
    let total = total6(pools);
    if total == 0 {
        return None;
    }
    let index = match (attempt, kind) {
        (0, PickerKind::Iterative) => u128::from(cursor.fetch_add(1, Ordering::Relaxed)) % total,
        (0, PickerKind::Random) => {
            // pools wider than 2^64 are sampled within their first 2^64
            // addresses, which no real deployment notices
            let bound = u64::try_from(total).unwrap_or(u64::MAX);
            u128::from(rand::rng().random_range(0..bound))
        }
        (0, PickerKind::Hashed) => u128::from(XxHash64::oneshot(HASH_SEED, client_key)) % total,
        (n, _) => {
            let n = u128::from(n) - 1;
            if n >= total {
                return None;
            }
            n
        }
    };
    addr6_at(pools, index)
}

pub(crate) fn total_pd(pools: &[&PdPool]) -> u128 {
    pools.iter().map(|p| p.size()).sum()
}

pub(crate) fn prefix_at(pools: &[&PdPool], mut index: u128) -> Option<Ipv6Net> {
    for pool in pools {
        let size = pool.size();
        if index < size {
            return pool.prefix_at(index);
        }
        index -= size;
    }
    None
}

pub(crate) fn pick_pd(
    pools: &[&PdPool],
    kind: PickerKind,
    cursor: &AtomicU64,
    client_key: &[u8],
    attempt: u32,
) -> Option<Ipv6Net> {
    let total = total_pd(pools);
    if total == 0 {
        return None;
    }
    let index = match (attempt, kind) {
        (0, PickerKind::Iterative) => u128::from(cursor.fetch_add(1, Ordering::Relaxed)) % total,
        (0, PickerKind::Random) => {
            let bound = u64::try_from(total).unwrap_or(u64::MAX);
            u128::from(rand::rng().random_range(0..bound))
        }
        (0, PickerKind::Hashed) => u128::from(XxHash64::oneshot(HASH_SEED, client_key)) % total,
        (n, _) => {
            let n = u128::from(n) - 1;
            if n >= total {
                return None;
            }
            n
        }
    };
    prefix_at(pools, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(start: [u8; 4], end: [u8; 4]) -> Pool4 {
        Pool4::new(Ipv4Addr::from(start), Ipv4Addr::from(end)).unwrap()
    }

    #[test]
    fn pools_concatenate_in_declaration_order() {
        let a = pool([10, 0, 0, 10], [10, 0, 0, 12]);
        let b = pool([10, 0, 0, 100], [10, 0, 0, 101]);
        let pools = [&a, &b];
        assert_eq!(total4(&pools), 5);
        assert_eq!(addr4_at(&pools, 0), Some(Ipv4Addr::new(10, 0, 0, 10)));
        assert_eq!(addr4_at(&pools, 2), Some(Ipv4Addr::new(10, 0, 0, 12)));
        assert_eq!(addr4_at(&pools, 3), Some(Ipv4Addr::new(10, 0, 0, 100)));
        assert_eq!(addr4_at(&pools, 5), None);
    }

    #[test]
    fn iterative_walks_the_range() {
        let a = pool([192, 0, 2, 2], [192, 0, 2, 6]);
        let pools = [&a];
        let cursor = AtomicU64::new(0);
        let picks: Vec<Ipv4Addr> = (0..5)
            .map(|_| pick4(&pools, PickerKind::Iterative, &cursor, &[], 0).unwrap())
            .collect();
        assert_eq!(
            picks,
            (2..=6).map(|o| Ipv4Addr::new(192, 0, 2, o)).collect::<Vec<_>>()
        );
        // wraps around
        assert_eq!(
            pick4(&pools, PickerKind::Iterative, &cursor, &[], 0),
            Some(Ipv4Addr::new(192, 0, 2, 2))
        );
    }

    #[test]
    fn hashed_is_stable_per_client() {
        let a = pool([192, 0, 2, 2], [192, 0, 2, 6]);
        let pools = [&a];
        let cursor = AtomicU64::new(0);
        let first = pick4(&pools, PickerKind::Hashed, &cursor, b"client-a", 0);
        let second = pick4(&pools, PickerKind::Hashed, &cursor, b"client-a", 0);
        assert_eq!(first, second);
    }

    #[test]
    fn retries_scan_from_smallest() {
        let a = pool([192, 0, 2, 2], [192, 0, 2, 6]);
        let pools = [&a];
        let cursor = AtomicU64::new(42);
        for (attempt, octet) in [(1u32, 2u8), (2, 3), (3, 4), (4, 5), (5, 6)] {
            assert_eq!(
                pick4(&pools, PickerKind::Random, &cursor, &[], attempt),
                Some(Ipv4Addr::new(192, 0, 2, octet))
            );
        }
        assert_eq!(pick4(&pools, PickerKind::Random, &cursor, &[], 6), None);
    }

    #[test]
    fn pd_prefixes_step_by_delegated_length() {
        let pd = PdPool::new("2001:db8::/48".parse().unwrap(), 56).unwrap();
        let pools = [&pd];
        assert_eq!(total_pd(&pools), 256);
        assert_eq!(
            prefix_at(&pools, 2),
            Some("2001:db8:0:200::/56".parse().unwrap())
        );
        assert_eq!(prefix_at(&pools, 256), None);
    }
}
