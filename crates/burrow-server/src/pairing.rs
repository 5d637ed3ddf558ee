//! Pairing slots: public requests waiting for (or using) a tunnel stream
//!
//! The table itself is plain data guarded by the session lock. Every state
//! change is a single call under that lock, so insert, claim, expiry and
//! drain can never interleave for the same request id.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use burrow_common::BoxedStream;

use crate::error::BrokerError;

/// What a waiting public request eventually receives
pub type TunnelDelivery = Result<BoxedStream, BrokerError>;

/// Lifecycle of one public request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    WaitingForTunnel,
    Relaying,
    Done,
    Failed,
}

struct PairingSlot {
    seq: u64,
    created_at: Instant,
    deadline: Instant,
    status: SlotStatus,
    /// Resolves the task holding the public side; taken on claim or drain
    waiter: Option<oneshot::Sender<TunnelDelivery>>,
}

/// Diagnostic view of a slot
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub request_id: String,
    pub status: SlotStatus,
    pub created_at: Instant,
    pub deadline: Instant,
}

/// Right to hand a tunnel stream to the request that was claimed
pub struct TunnelClaim {
    request_id: String,
    sender: oneshot::Sender<TunnelDelivery>,
}

impl TunnelClaim {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Hand over the tunnel stream. Returns `false` (and drops the stream)
    /// if the public side is gone.
    pub fn deliver(self, stream: BoxedStream) -> bool {
        self.sender.send(Ok(stream)).is_ok()
    }

    /// Report that the tunnel could not be set up after all
    pub fn fail(self, error: BrokerError) {
        let _ = self.sender.send(Err(error));
    }
}

/// Pending requests of one session, keyed by request id
#[derive(Default)]
pub struct PendingRequests {
    slots: HashMap<String, PairingSlot>,
    next_seq: u64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.slots.contains_key(request_id)
    }

    pub fn status(&self, request_id: &str) -> Option<SlotStatus> {
        self.slots.get(request_id).map(|slot| slot.status)
    }

    /// Add a `WaitingForTunnel` slot. Returns `None` if the id is taken.
    pub fn insert(
        &mut self,
        request_id: &str,
        deadline: Instant,
    ) -> Option<oneshot::Receiver<TunnelDelivery>> {
        if self.slots.contains_key(request_id) {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        self.next_seq += 1;
        self.slots.insert(
            request_id.to_string(),
            PairingSlot {
                seq: self.next_seq,
                created_at: Instant::now(),
                deadline,
                status: SlotStatus::WaitingForTunnel,
                waiter: Some(tx),
            },
        );
        Some(rx)
    }

    /// Match an arriving tunnel stream to its slot (`WaitingForTunnel → Relaying`)
    pub fn claim(&mut self, request_id: &str) -> Result<TunnelClaim, BrokerError> {
        let slot = self
            .slots
            .get_mut(request_id)
            .filter(|slot| slot.status == SlotStatus::WaitingForTunnel)
            .ok_or_else(|| BrokerError::UnknownRequest(request_id.to_string()))?;

        let sender = slot
            .waiter
            .take()
            .ok_or_else(|| BrokerError::UnknownRequest(request_id.to_string()))?;

        // The waiting side gave up (public client disconnected)
        if sender.is_closed() {
            self.slots.remove(request_id);
            return Err(BrokerError::UnknownRequest(request_id.to_string()));
        }

        slot.status = SlotStatus::Relaying;
        Ok(TunnelClaim {
            request_id: request_id.to_string(),
            sender,
        })
    }

    /// Remove a slot whose deadline passed, if nobody claimed it first
    ///
    /// Returns `false` when the slot was already claimed or removed, in which
    /// case the claimer decides the outcome.
    pub fn expire(&mut self, request_id: &str) -> bool {
        match self.slots.get(request_id) {
            Some(slot) if slot.status == SlotStatus::WaitingForTunnel => {
                self.slots.remove(request_id);
                true
            }
            _ => false,
        }
    }

    /// Remove a slot once its request is over, recording how it ended
    pub fn finish(&mut self, request_id: &str, status: SlotStatus) -> Option<SlotInfo> {
        self.slots.remove(request_id).map(|slot| SlotInfo {
            request_id: request_id.to_string(),
            status,
            created_at: slot.created_at,
            deadline: slot.deadline,
        })
    }

    /// Fail every waiting slot with `SessionClosed` and forget all slots
    ///
    /// Returns how many slots were dropped. Relaying slots are stopped by the
    /// session's cancellation, not here.
    pub fn drain(&mut self) -> usize {
        let count = self.slots.len();
        for (_, slot) in self.slots.drain() {
            if let Some(waiter) = slot.waiter {
                let _ = waiter.send(Err(BrokerError::SessionClosed));
            }
        }
        count
    }

    /// Snapshot in insertion order
    pub fn snapshot(&self) -> Vec<SlotInfo> {
        let mut slots: Vec<_> = self.slots.iter().collect();
        slots.sort_by_key(|(_, slot)| slot.seq);
        slots
            .into_iter()
            .map(|(request_id, slot)| SlotInfo {
                request_id: request_id.clone(),
                status: slot.status,
                created_at: slot.created_at,
                deadline: slot.deadline,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn test_claim_delivers_stream_once() {
        let mut pending = PendingRequests::new();
        let rx = pending.insert("r1", deadline()).unwrap();

        let claim = pending.claim("r1").unwrap();
        assert_eq!(claim.request_id(), "r1");
        assert_eq!(pending.status("r1"), Some(SlotStatus::Relaying));

        // A second stream for the same id is rejected
        assert!(matches!(
            pending.claim("r1"),
            Err(BrokerError::UnknownRequest(_))
        ));

        let (stream, _peer) = tokio::io::duplex(16);
        assert!(claim.deliver(Box::new(stream)));
        assert!(rx.await.unwrap().is_ok());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut pending = PendingRequests::new();
        assert!(pending.insert("r1", deadline()).is_some());
        assert!(pending.insert("r1", deadline()).is_none());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_unknown_claim_rejected() {
        let mut pending = PendingRequests::new();
        let _rx = pending.insert("r1", deadline()).unwrap();
        assert!(matches!(
            pending.claim("nope"),
            Err(BrokerError::UnknownRequest(_))
        ));
        // The real slot is untouched
        assert_eq!(pending.status("r1"), Some(SlotStatus::WaitingForTunnel));
    }

    #[test]
    fn test_expire_only_waiting_slots() {
        let mut pending = PendingRequests::new();
        let _rx1 = pending.insert("r1", deadline()).unwrap();
        let _rx2 = pending.insert("r2", deadline()).unwrap();
        let _claim = pending.claim("r2").unwrap();

        assert!(pending.expire("r1"));
        assert!(!pending.contains("r1"));
        // Late stream for an expired id
        assert!(pending.claim("r1").is_err());

        // Claimed slots are not expired
        assert!(!pending.expire("r2"));
        assert!(pending.contains("r2"));
    }

    #[test]
    fn test_claim_after_waiter_dropped() {
        let mut pending = PendingRequests::new();
        let rx = pending.insert("r1", deadline()).unwrap();
        drop(rx);

        assert!(pending.claim("r1").is_err());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_drain_fails_waiters() {
        let mut pending = PendingRequests::new();
        let rx1 = pending.insert("r1", deadline()).unwrap();
        let rx2 = pending.insert("r2", deadline()).unwrap();

        assert_eq!(pending.drain(), 2);
        assert!(pending.is_empty());

        assert!(matches!(rx1.await.unwrap(), Err(BrokerError::SessionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(BrokerError::SessionClosed)));
    }

    #[test]
    fn test_snapshot_in_insertion_order() {
        let mut pending = PendingRequests::new();
        let ids = ["zeta", "alpha", "mid"];
        let _receivers: Vec<_> = ids
            .iter()
            .map(|id| pending.insert(id, deadline()).unwrap())
            .collect();

        let order: Vec<_> = pending
            .snapshot()
            .into_iter()
            .map(|info| info.request_id)
            .collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn test_finish_removes_slot() {
        let mut pending = PendingRequests::new();
        let _rx = pending.insert("r1", deadline()).unwrap();
        let _claim = pending.claim("r1").unwrap();

        let info = pending.finish("r1", SlotStatus::Done).unwrap();
        assert_eq!(info.status, SlotStatus::Done);
        assert!(pending.finish("r1", SlotStatus::Done).is_none());
    }
}
