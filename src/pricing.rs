use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::ModelPricing;

/// Read-mostly `(model, provider)` -> pricing map. Populated at startup,
/// refreshed on miss by the ledger; readers never block writers for longer
/// than a map clone of one entry.
#[derive(Debug, Default)]
pub struct PricingCache {
    entries: RwLock<HashMap<String, ModelPricing>>,
}

fn cache_key(model: &str, provider: &str) -> String {
    format!("{model}:{provider}")
}

impl PricingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model: &str, provider: &str) -> Option<ModelPricing> {
        self.entries.read().get(&cache_key(model, provider)).cloned()
    }

    pub fn insert(&self, pricing: ModelPricing) {
        let key = cache_key(&pricing.model, &pricing.provider);
        self.entries.write().insert(key, pricing);
    }

    pub fn load(&self, rows: impl IntoIterator<Item = ModelPricing>) -> usize {
        let mut entries = self.entries.write();
        let mut count = 0;
        for pricing in rows {
            let key = cache_key(&pricing.model, &pricing.provider);
            entries.insert(key, pricing);
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing(model: &str, provider: &str, input: i64) -> ModelPricing {
        ModelPricing {
            model: model.to_string(),
            provider: provider.to_string(),
            input_cost_per_million_tokens: input,
            output_cost_per_million_tokens: input * 5,
        }
    }

    #[test]
    fn lookup_is_keyed_by_model_and_provider() {
        let cache = PricingCache::new();
        assert_eq!(cache.load([pricing("helix-1", "acme", 3), pricing("helix-1", "other", 7)]), 2);

        assert_eq!(
            cache
                .get("helix-1", "acme")
                .map(|p| p.input_cost_per_million_tokens),
            Some(3)
        );
        assert_eq!(
            cache
                .get("helix-1", "other")
                .map(|p| p.input_cost_per_million_tokens),
            Some(7)
        );
        assert_eq!(cache.get("helix-2", "acme"), None);
    }

    #[test]
    fn insert_refreshes_existing_entries() {
        let cache = PricingCache::new();
        cache.insert(pricing("helix-1", "acme", 3));
        cache.insert(pricing("helix-1", "acme", 4));
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache
                .get("helix-1", "acme")
                .map(|p| p.input_cost_per_million_tokens),
            Some(4)
        );
    }
}
