//! Metadata aggregation

use serde_json::Value;

use super::visitor::Session;

/// Aggregated compilation metadata, keyed by provider-declared keys
pub type Metadata = serde_json::Map<String, Value>;

/// Merge the contribution of every metadata provider.
///
/// Providers are asked in registration order. When two providers emit the
/// same key the later one wins.
pub fn aggregate(sessions: &[Session]) -> Metadata {
    let mut metadata = Metadata::new();
    for session in sessions.iter().filter(|s| s.capabilities.provide_metadata) {
        let Some(contribution) = session.hooks.provide_metadata() else {
            continue;
        };
        if metadata.contains_key(&contribution.key) {
            tracing::warn!(
                key = %contribution.key,
                provider = %session.name,
                "metadata key already provided, overriding"
            );
        }
        metadata.insert(contribution.key, contribution.value);
    }
    metadata
}
