pub mod controller;
pub mod guardrail;
pub mod plan;

pub use controller::RolloutController;
pub use guardrail::{GuardrailSignals, RolloutGuardrail};
pub use plan::{RolloutPlan, RolloutState};
