//! Identifier newtypes used in envelope headers and routing tables.

use std::fmt;

/// Gateway-local identifier of one client or worker-link connection.
///
/// Values come from [`IdSequence`] and are not reused while the Gateway runs,
/// so a reply addressed to a closed socket can never reach a newer one. Zero
/// is reserved as [`ConnectionId::NONE`] for traffic without a persistent
/// connection, such as UDP datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Marker for "no connection" (UDP datagrams, unset headers).
    pub const NONE: ConnectionId = ConnectionId(0);

    /// Wraps a raw header value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw value carried in the envelope header.
    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic source of [`ConnectionId`]s.
///
/// Skips zero and, after the 32-bit space wraps, any id the caller still
/// reports as in use.
#[derive(Debug, Default)]
pub struct IdSequence {
    last: u32,
}

impl IdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, in_use: impl Fn(ConnectionId) -> bool) -> ConnectionId {
        loop {
            self.last = self.last.wrapping_add(1);
            let id = ConnectionId(self.last);
            if !id.is_none() && !in_use(id) {
                return id;
            }
        }
    }
}

/// Application-level user identifier bound to a socket after authentication.
///
/// Zero means "not authenticated yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uid(u32);

impl Uid {
    pub const ANONYMOUS: Uid = Uid(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_anonymous(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_sequence_never_repeats() {
        let mut ids = IdSequence::new();
        let first = ids.next(|_| false);
        let second = ids.next(|_| false);
        assert_eq!(first, ConnectionId::new(1));
        assert_eq!(second, ConnectionId::new(2));
    }

    #[test]
    fn test_id_sequence_skips_zero_and_live_ids_after_wrap() {
        let mut ids = IdSequence { last: u32::MAX - 1 };
        assert_eq!(ids.next(|_| false), ConnectionId::new(u32::MAX));
        let live = ConnectionId::new(1);
        assert_eq!(ids.next(|id| id == live), ConnectionId::new(2));
    }

    #[test]
    fn test_uid_anonymous() {
        assert!(Uid::ANONYMOUS.is_anonymous());
        assert!(!Uid::new(5).is_anonymous());
        assert_eq!(Uid::new(5).to_string(), "5");
    }
}
