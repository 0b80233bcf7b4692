//! Identifier sources shared by the engine and the track negotiators.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rand::Rng;
use uuid::Uuid;

pub trait IdGenerator: Send + Sync {
    /// Identifier reported to v2 clients in `SETUP_RESPONSE`.
    fn connection_id(&self) -> String;

    /// RTP synchronization source for a device-sent stream. Never zero.
    fn ssrc(&self) -> u32;

    /// Media id for a device-created `m=` section.
    fn mid(&self) -> String;
}

/// Random connection ids and SSRCs; mids count up per generator.
#[derive(Debug, Default)]
pub struct RandomIds {
    mids: AtomicU64,
}

impl RandomIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for RandomIds {
    fn connection_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn ssrc(&self) -> u32 {
        rand::thread_rng().gen_range(1..=u32::MAX)
    }

    fn mid(&self) -> String {
        format!("device-{}", self.mids.fetch_add(1, Ordering::Relaxed))
    }
}

/// Predictable ids, for tests and reproducible logs.
#[derive(Debug, Default)]
pub struct SequentialIds {
    connections: AtomicU64,
    ssrcs: AtomicU32,
    mids: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIds {
    fn connection_id(&self) -> String {
        format!("connection-{}", self.connections.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn ssrc(&self) -> u32 {
        self.ssrcs.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn mid(&self) -> String {
        format!("device-{}", self.mids.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_unique_and_nonzero() {
        let ids = RandomIds::new();
        assert_ne!(ids.connection_id(), ids.connection_id());
        assert!((0..64).all(|_| ids.ssrc() != 0));
        assert_eq!(ids.mid(), "device-0");
        assert_eq!(ids.mid(), "device-1");
    }

    #[test]
    fn generators_do_not_share_counters() {
        let a = SequentialIds::new();
        let b = SequentialIds::new();
        assert_eq!(a.ssrc(), 1);
        assert_eq!(a.ssrc(), 2);
        assert_eq!(b.ssrc(), 1);
        assert_eq!(b.connection_id(), "connection-1");
    }
}
