//! Payment provider integration and the gateway adapter used by the
//! order flow.

pub mod error;
pub mod factory;
pub mod gateway;
pub mod provider;
pub mod providers;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use gateway::{GatewayError, PaymentGateway};
pub use provider::PaymentProvider;
