//! Sequential address allocation for applications that need a stable IP.

use std::net::Ipv4Addr;

use parking_lot::Mutex;

use crate::error::{Error, Result};

// Last octet the pool never hands out past.
const LAST_OCTET: u8 = 0xfe;

/// Hands out addresses by bumping the last octet of a cursor.
#[derive(Debug)]
pub struct IpPool {
    current: Mutex<Ipv4Addr>,
}

impl IpPool {
    /// Creates a pool whose first address is `start` + 1.
    pub fn new(start: Ipv4Addr) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Creates a pool that continues past any address in `taken` on the
    /// same /24 as `start`.
    pub fn resume(start: Ipv4Addr, taken: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let subnet = &start.octets()[..3];
        let current = taken
            .into_iter()
            .filter(|ip| &ip.octets()[..3] == subnet)
            .fold(start, |current, ip| current.max(ip));
        Self::new(current)
    }

    /// Returns the next free address.
    pub fn next(&self) -> Result<Ipv4Addr> {
        let mut current = self.current.lock();
        let mut octets = current.octets();
        if octets[3] >= LAST_OCTET {
            return Err(Error::IpPoolExhausted);
        }
        octets[3] += 1;
        *current = Ipv4Addr::from(octets);
        Ok(*current)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn hands_out_increasing_addresses_until_exhausted() {
        let pool = IpPool::new(Ipv4Addr::new(10, 0, 0, 0));
        for expected in 1..=254u8 {
            assert_eq!(pool.next().unwrap(), Ipv4Addr::new(10, 0, 0, expected));
        }
        assert!(matches!(pool.next(), Err(Error::IpPoolExhausted)));
        assert!(matches!(pool.next(), Err(Error::IpPoolExhausted)));
    }

    #[test]
    fn starts_after_seed_address() {
        let pool = IpPool::new(Ipv4Addr::new(127, 1, 0, 250));
        assert_eq!(pool.next().unwrap(), Ipv4Addr::new(127, 1, 0, 251));
        assert_eq!(pool.next().unwrap(), Ipv4Addr::new(127, 1, 0, 252));
        assert_eq!(pool.next().unwrap(), Ipv4Addr::new(127, 1, 0, 253));
        assert_eq!(pool.next().unwrap(), Ipv4Addr::new(127, 1, 0, 254));
        assert!(pool.next().is_err());
    }

    #[test]
    fn resumes_past_recorded_addresses() {
        let pool = IpPool::resume(
            Ipv4Addr::new(10, 0, 0, 0),
            [
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(192, 168, 0, 9),
                Ipv4Addr::new(10, 0, 0, 1),
            ],
        );
        assert_eq!(pool.next().unwrap(), Ipv4Addr::new(10, 0, 0, 3));

        let pool = IpPool::resume(Ipv4Addr::new(10, 0, 0, 0), std::iter::empty());
        assert_eq!(pool.next().unwrap(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn concurrent_callers_never_share_an_address() {
        let pool = Arc::new(IpPool::new(Ipv4Addr::new(10, 1, 0, 0)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..50).map(|_| pool.next().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for ip in handle.join().unwrap() {
                assert!(seen.insert(ip), "{ip} handed out twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }
}
