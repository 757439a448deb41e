//! In-process processor double for tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;

pub struct MockProcessor {
    charge_count: AtomicUsize,
    refund_count: AtomicUsize,
    transfer_count: AtomicUsize,
    /// Recorded requests for verification
    charges: Mutex<Vec<ChargeRequest>>,
    refunds: Mutex<Vec<RefundRequest>>,
    /// Configured behavior
    transfers: Mutex<HashMap<String, TransferView>>,
    balances: Mutex<HashMap<Currency, BalanceSnapshot>>,
    fail_charges: Mutex<bool>,
    fail_refunds: Mutex<bool>,
}

impl Default for MockProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProcessor {
    pub fn new() -> Self {
        Self {
            charge_count: AtomicUsize::new(0),
            refund_count: AtomicUsize::new(0),
            transfer_count: AtomicUsize::new(0),
            charges: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
            transfers: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            fail_charges: Mutex::new(false),
            fail_refunds: Mutex::new(false),
        }
    }

    pub fn set_fail_charges(&self, fail: bool) {
        *self.fail_charges.lock().unwrap() = fail;
    }

    pub fn set_fail_refunds(&self, fail: bool) {
        *self.fail_refunds.lock().unwrap() = fail;
    }

    pub fn set_transfer(&self, view: TransferView) {
        self.transfers.lock().unwrap().insert(view.id.clone(), view);
    }

    pub fn set_balance(&self, snapshot: BalanceSnapshot) {
        self.balances
            .lock()
            .unwrap()
            .insert(snapshot.currency, snapshot);
    }

    pub fn charge_calls(&self) -> usize {
        self.charge_count.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_count.load(Ordering::SeqCst)
    }

    pub fn transfer_calls(&self) -> usize {
        self.transfer_count.load(Ordering::SeqCst)
    }

    pub fn last_charge(&self) -> Option<ChargeRequest> {
        self.charges.lock().unwrap().last().cloned()
    }

    pub fn last_refund(&self) -> Option<RefundRequest> {
        self.refunds.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_charge(
        &self,
        req: &ChargeRequest,
    ) -> Result<PaymentIntentView, ProcessorError> {
        let n = self.charge_count.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_charges.lock().unwrap() {
            return Err(ProcessorError::Timeout);
        }
        self.charges.lock().unwrap().push(req.clone());
        Ok(PaymentIntentView {
            id: format!("pi_mock_{}", n),
            status: "requires_payment_method".to_string(),
            amount_cents: req.amount_cents,
            client_secret: Some(format!("pi_mock_{}_secret", n)),
        })
    }

    async fn retrieve_transfer(&self, transfer_id: &str) -> Result<TransferView, ProcessorError> {
        self.transfer_count.fetch_add(1, Ordering::SeqCst);
        self.transfers
            .lock()
            .unwrap()
            .get(transfer_id)
            .cloned()
            .ok_or_else(|| ProcessorError::Api {
                status: 404,
                message: format!("No such transfer: {}", transfer_id),
            })
    }

    async fn create_refund(&self, req: &RefundRequest) -> Result<RefundView, ProcessorError> {
        let n = self.refund_count.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_refunds.lock().unwrap() {
            return Err(ProcessorError::Api {
                status: 402,
                message: "refund declined".to_string(),
            });
        }
        self.refunds.lock().unwrap().push(req.clone());
        Ok(RefundView {
            id: format!("re_mock_{}", n),
            status: "succeeded".to_string(),
            amount_cents: req.amount_cents.unwrap_or_default(),
        })
    }

    async fn retrieve_balance(
        &self,
        currency: Currency,
    ) -> Result<BalanceSnapshot, ProcessorError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&currency)
            .copied()
            .unwrap_or(BalanceSnapshot {
                currency,
                available_cents: 0,
                pending_cents: 0,
            }))
    }
}
