//! Order orchestration services: catalog, ledger, idempotency and webhook
//! handling.

pub mod catalog;
pub mod idempotency;
pub mod order_ledger;
pub mod webhook_processor;


pub use catalog::Catalog;
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, StoredResponse};
pub use order_ledger::{LedgerError, NewOrder, OrderLedger};
pub use webhook_processor::{WebhookProcessor, WebhookResult};
