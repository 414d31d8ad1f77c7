//! Application state

use std::sync::Arc;

use recurbill_billing::BillingService;

use crate::auth::JwtManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub jwt_manager: JwtManager,
}

impl AppState {
    pub fn new(billing: Arc<BillingService>, jwt_manager: JwtManager) -> Self {
        Self {
            billing,
            jwt_manager,
        }
    }
}
