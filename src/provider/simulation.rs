// Simulation backend: no external calls, settlement always succeeds
// synchronously. Substituted automatically whenever the configured provider
// has no usable credentials.

use rand::distributions::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::provider::{IntentHandle, PaymentResult, SettleStatus};

#[derive(Clone, Default)]
pub struct SimulationGateway;

impl SimulationGateway {
    pub fn create_intent(&self, amount_cents: i64) -> IntentHandle {
        info!(amount_cents, "simulated payment intent");
        IntentHandle {
            provider: "simulation",
            client_secret: None,
            payment_id: Some(synthetic_id()),
        }
    }

    pub fn settle(&self, amount_cents: i64) -> PaymentResult {
        let payment_id = synthetic_id();
        info!(amount_cents, payment_id = %payment_id, "simulated settlement");
        PaymentResult {
            status: SettleStatus::Succeeded,
            payment_id,
            order_id: None,
        }
    }
}

fn synthetic_id() -> String {
    let mut rng = SmallRng::from_entropy();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("sim_{}", suffix)
}
