//! Nullable escrow: an in-memory hold-invoice backend.
//!
//! Records every call, can be taken offline, and can be told to fail the
//! next N calls so retry paths are exercised deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use proxy_escrow::{EscrowBackend, EscrowError, HoldStatus};
use proxy_types::{InvoiceId, NodeId, Sats, Timestamp};

/// One hold invoice held by [`NullEscrow`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NullHold {
    pub amount: Sats,
    pub expires_at: Timestamp,
    pub status: HoldStatus,
    pub payee: Option<NodeId>,
    /// Successful settle calls, repeats included.
    pub settle_calls: u32,
    /// Successful cancel calls, repeats included.
    pub cancel_calls: u32,
}

#[derive(Default)]
pub struct NullEscrow {
    holds: Mutex<HashMap<InvoiceId, NullHold>>,
    next_id: AtomicU32,
    offline: AtomicBool,
    fail_next: AtomicU32,
}

impl NullEscrow {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline, every call fails with `BackendUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with `BackendUnavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn hold(&self, invoice: &InvoiceId) -> Option<NullHold> {
        self.holds.lock().unwrap().get(invoice).cloned()
    }

    pub fn holds(&self) -> Vec<(InvoiceId, NullHold)> {
        let mut holds: Vec<_> = self
            .holds
            .lock()
            .unwrap()
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();
        holds.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        holds
    }

    /// Holds neither settled nor cancelled.
    pub fn open_holds(&self) -> usize {
        self.holds
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.status == HoldStatus::Held)
            .count()
    }

    /// Mark a hold expired, as the backend does once `expires_at` passes.
    pub fn expire(&self, invoice: &InvoiceId) {
        if let Some(hold) = self.holds.lock().unwrap().get_mut(invoice) {
            hold.status = HoldStatus::Expired;
        }
    }

    fn gate(&self) -> Result<(), EscrowError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EscrowError::BackendUnavailable("null escrow offline".into()));
        }
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failed.is_ok() {
            return Err(EscrowError::BackendUnavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EscrowBackend for NullEscrow {
    async fn create_hold(
        &self,
        amount: Sats,
        expires_at: Timestamp,
    ) -> Result<InvoiceId, EscrowError> {
        self.gate()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let invoice = InvoiceId::new(format!("inv-{n:06}"));
        self.holds.lock().unwrap().insert(
            invoice.clone(),
            NullHold {
                amount,
                expires_at,
                status: HoldStatus::Held,
                payee: None,
                settle_calls: 0,
                cancel_calls: 0,
            },
        );
        Ok(invoice)
    }

    async fn settle(&self, invoice: &InvoiceId, payee: &NodeId) -> Result<(), EscrowError> {
        self.gate()?;
        let mut holds = self.holds.lock().unwrap();
        let hold = holds
            .get_mut(invoice)
            .ok_or_else(|| EscrowError::UnknownInvoice(invoice.clone()))?;
        match hold.status {
            HoldStatus::Held => {
                hold.status = HoldStatus::Settled;
                hold.payee = Some(*payee);
            }
            HoldStatus::Settled if hold.payee == Some(*payee) => {}
            _ => return Err(EscrowError::AlreadyTerminal(invoice.clone())),
        }
        hold.settle_calls += 1;
        Ok(())
    }

    async fn cancel(&self, invoice: &InvoiceId) -> Result<(), EscrowError> {
        self.gate()?;
        let mut holds = self.holds.lock().unwrap();
        let hold = holds
            .get_mut(invoice)
            .ok_or_else(|| EscrowError::UnknownInvoice(invoice.clone()))?;
        match hold.status {
            HoldStatus::Held => hold.status = HoldStatus::Cancelled,
            HoldStatus::Cancelled => {}
            _ => return Err(EscrowError::AlreadyTerminal(invoice.clone())),
        }
        hold.cancel_calls += 1;
        Ok(())
    }

    async fn status(&self, invoice: &InvoiceId) -> Result<HoldStatus, EscrowError> {
        self.gate()?;
        self.holds
            .lock()
            .unwrap()
            .get(invoice)
            .map(|h| h.status)
            .ok_or_else(|| EscrowError::UnknownInvoice(invoice.clone()))
    }

    async fn ping(&self) -> Result<(), EscrowError> {
        self.gate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settle_is_idempotent_and_exclusive() {
        let escrow = NullEscrow::new();
        let inv = escrow
            .create_hold(Sats::new(100), Timestamp::new(10))
            .await
            .unwrap();
        let node = NodeId::new([1; 16]);
        escrow.settle(&inv, &node).await.unwrap();
        escrow.settle(&inv, &node).await.unwrap();
        assert_eq!(escrow.hold(&inv).unwrap().settle_calls, 2);
        assert!(matches!(
            escrow.cancel(&inv).await,
            Err(EscrowError::AlreadyTerminal(_))
        ));
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let escrow = NullEscrow::new();
        escrow.fail_next(2);
        assert!(escrow.ping().await.is_err());
        assert!(escrow.ping().await.is_err());
        assert!(escrow.ping().await.is_ok());
        escrow.set_available(false);
        assert!(escrow.ping().await.is_err());
    }
}
