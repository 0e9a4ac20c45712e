use std::collections::HashMap;

use core_types::{Asset, PriceOracle};
use parking_lot::RwLock;

/// Price table in reference units per smallest unit of each asset.
#[derive(Debug, Default)]
pub struct StaticPriceOracle {
    prices: RwLock<HashMap<Asset, f64>>,
}

impl StaticPriceOracle {
    pub fn new(prices: HashMap<Asset, f64>) -> Self {
        Self {
            prices: RwLock::new(prices),
        }
    }

    /// Returns `true` when the stored price changed.
    pub fn set_price(&self, asset: &str, price: f64) -> bool {
        let previous = self.prices.write().insert(asset.to_string(), price);
        previous != Some(price)
    }

    pub fn prices(&self) -> HashMap<Asset, f64> {
        self.prices.read().clone()
    }
}

impl PriceOracle for StaticPriceOracle {
    fn to_reference(&self, asset: &str, amount: f64) -> Option<f64> {
        let price = *self.prices.read().get(asset)?;
        price.is_finite().then_some(amount * price)
    }
}
