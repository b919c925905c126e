//! Redis key layout.
//!
//! Every key carries a layout version so a change to the stored record
//! format starts from an empty keyspace.

const LAYOUT_VERSION: &str = "v1";
const IDEMPOTENCY_NAMESPACE: &str = "idem";

/// Redis key holding the record for an idempotency key such as
/// `webhook:evt_123` or `order:<client key>`.
pub fn idempotency_record(key: &str) -> String {
    format!("topup:{}:{}:{}", LAYOUT_VERSION, IDEMPOTENCY_NAMESPACE, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_are_versioned_and_namespaced() {
        assert_eq!(
            idempotency_record("webhook:evt1"),
            "topup:v1:idem:webhook:evt1"
        );
        assert_ne!(
            idempotency_record("order:abc"),
            idempotency_record("payment:ord_1:abc")
        );
    }
}
