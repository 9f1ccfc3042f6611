use std::sync::Arc;

use crate::payment::PaymentLifecycleService;
use crate::saga::InlineSagaRunner;

/// Gateway shared state
#[derive(Clone)]
pub struct AppState {
    pub payments: Arc<PaymentLifecycleService>,
    /// Saga runner, for refund progress lookups
    pub sagas: Arc<InlineSagaRunner>,
}

impl AppState {
    pub fn new(payments: Arc<PaymentLifecycleService>, sagas: Arc<InlineSagaRunner>) -> Self {
        Self { payments, sagas }
    }
}
