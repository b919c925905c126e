//! Publisher fulfillment: dispatcher, job queue, retry policy and the
//! publisher clients.

pub mod dispatcher;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod types;

pub use dispatcher::FulfillmentDispatcher;
pub use publisher::{PublisherClient, PublisherError, PublisherRegistry};
pub use queue::{FulfillmentQueue, FulfillmentReceiver, FulfillmentWorker, FulfillmentWorkerConfig};
pub use retry::RetryPolicy;
pub use types::*;
