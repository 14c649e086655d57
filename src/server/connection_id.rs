use std::fmt;
use std::net::SocketAddr;

use siphasher::sip::SipHasher13;

/// Identifies a client connection on a [`Server`](crate::Server).
///
/// Identifiers are a keyed hash of the remote socket address, so they are stable for the lifetime
/// of a server but unpredictable to remote hosts.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

pub struct ConnectionIdHasher {
    key: [u8; 16],
}

impl Default for ConnectionIdHasher {
    fn default() -> Self {
        // This samples the thread-local RNG, which is a CSPRNG (see docs for rand::rngs::StdRng)
        Self::with_key(rand::random())
    }
}

impl ConnectionIdHasher {
    pub fn with_key(key: [u8; 16]) -> Self {
        Self { key }
    }

    pub fn compute(&self, addr: &SocketAddr) -> ConnectionId {
        use core::hash::Hasher;

        let mut hasher = SipHasher13::new_with_key(&self.key);

        match addr {
            SocketAddr::V4(addr) => {
                hasher.write(&addr.ip().octets());
                hasher.write_u16(addr.port());
            }
            SocketAddr::V6(addr) => {
                hasher.write(&addr.ip().octets());
                hasher.write_u16(addr.port());
            }
        }

        ConnectionId(hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_addresses() {
        let hasher = ConnectionIdHasher::with_key([7; 16]);

        let a: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        let c: SocketAddr = "[::1]:5000".parse().unwrap();

        assert_eq!(hasher.compute(&a), hasher.compute(&a));
        assert_ne!(hasher.compute(&a), hasher.compute(&b));
        assert_ne!(hasher.compute(&a), hasher.compute(&c));
    }

    #[test]
    fn keyed() {
        let addr: SocketAddr = "10.0.0.1:7777".parse().unwrap();

        let x = ConnectionIdHasher::with_key([1; 16]);
        let y = ConnectionIdHasher::with_key([2; 16]);

        assert_ne!(x.compute(&addr), y.compute(&addr));
    }
}
