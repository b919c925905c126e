//! Background work: the fulfillment queue worker, refund coordination and
//! the timer-driven sweeps.

pub mod fulfillment;
pub mod order_expiry;
pub mod refund_coordinator;
pub mod retry_scheduler;
pub mod sla_watchdog;
