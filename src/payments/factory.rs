use std::sync::Arc;

use crate::config::{PaymentConfig, ProviderKind};
use crate::payments::error::PaymentResult;
use crate::payments::provider::PaymentProvider;
use crate::payments::providers::{HostedCheckoutProvider, MockPaymentProvider};

pub struct PaymentProviderFactory;

impl PaymentProviderFactory {
    /// Builds the provider selected by `PAYMENT_PROVIDER`. The hosted
    /// provider reads its credentials from the environment.
    pub fn from_config(config: &PaymentConfig) -> PaymentResult<Arc<dyn PaymentProvider>> {
        match config.provider {
            ProviderKind::Mock => Ok(Self::mock(config)),
            ProviderKind::Hosted => Ok(Arc::new(HostedCheckoutProvider::from_env()?)),
        }
    }

    pub fn mock(config: &PaymentConfig) -> Arc<dyn PaymentProvider> {
        Arc::new(MockPaymentProvider::new(config.checkout_base_url.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_is_the_default() {
        let provider = PaymentProviderFactory::from_config(&PaymentConfig::default()).unwrap();
        assert_eq!(provider.name(), "MOCK");
        assert_eq!(provider.supported_methods().len(), 3);
    }
}
