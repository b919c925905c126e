pub mod hosted_checkout;
pub mod mock;

pub use hosted_checkout::{HostedCheckoutConfig, HostedCheckoutProvider};
pub use mock::MockPaymentProvider;
