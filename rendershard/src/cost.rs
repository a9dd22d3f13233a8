//! Cost estimation for function invocations.
//!
//! Prices are per GB-second of memory, per GB-second of ephemeral disk above
//! the free allowance and per invocation. The result is an estimate only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use shard_protocol::CostsInfo;

/// Largest ephemeral disk a function can be given.
pub const MAX_EPHEMERAL_STORAGE_IN_MB: u32 = 10_240;
/// Ephemeral disk included in the memory price.
pub const FREE_EPHEMERAL_STORAGE_IN_MB: u32 = 512;

pub const CURRENCY: &str = "USD";
pub const DISCLAIMER: &str =
    "Estimated cost only. Does not include charges for other cloud services.";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionPrice {
    pub gb_second: f64,
    pub storage_gb_second: f64,
    pub invocation: f64,
}

impl Default for RegionPrice {
    fn default() -> Self {
        Self {
            gb_second: 0.000_013_333_4,
            storage_gb_second: 0.000_000_030_9,
            invocation: 0.000_000_2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    pub regions: HashMap<String, RegionPrice>,
    /// Used for regions missing from `regions`.
    pub fallback: RegionPrice,
}

impl Default for PriceTable {
    fn default() -> Self {
        let base = RegionPrice::default();
        let regions = HashMap::from([
            ("us-east-1".to_string(), base),
            ("us-west-2".to_string(), base),
            (
                "eu-central-1".to_string(),
                RegionPrice {
                    gb_second: 0.000_013_333_4,
                    storage_gb_second: 0.000_000_036_8,
                    invocation: 0.000_000_2,
                },
            ),
            (
                "ap-northeast-1".to_string(),
                RegionPrice {
                    gb_second: 0.000_013_333_4,
                    storage_gb_second: 0.000_000_037,
                    invocation: 0.000_000_2,
                },
            ),
        ]);
        Self {
            regions,
            fallback: base,
        }
    }
}

impl PriceTable {
    pub fn for_region(&self, region: &str) -> RegionPrice {
        self.regions.get(region).copied().unwrap_or(self.fallback)
    }
}

/// Inputs to a price estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostInput<'a> {
    /// Billed duration summed over all invocations.
    pub duration_ms: i64,
    pub memory_size_in_mb: u32,
    pub region: &'a str,
    pub invocations: u32,
    /// Ephemeral disk size. `None` assumes the maximum.
    pub disk_size_in_mb: Option<u32>,
}

/// Estimated price in the table's currency, rounded to five decimals.
pub fn estimate_price(table: &PriceTable, input: &CostInput<'_>) -> f64 {
    let price = table.for_region(input.region);
    let seconds = input.duration_ms.max(0) as f64 / 1000.0;
    let disk = input
        .disk_size_in_mb
        .unwrap_or(MAX_EPHEMERAL_STORAGE_IN_MB)
        .saturating_sub(FREE_EPHEMERAL_STORAGE_IN_MB);

    let memory_cost = price.gb_second * (input.memory_size_in_mb as f64 / 1024.0) * seconds;
    let disk_cost = price.storage_gb_second * (disk as f64 / 1024.0) * seconds;
    let invocation_cost = price.invocation * input.invocations as f64;

    round5(memory_cost + disk_cost + invocation_cost)
}

fn round5(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}

pub fn display_cost(price: f64) -> String {
    if price < 0.001 {
        "<$0.001".to_string()
    } else {
        format!("${:.3}", price)
    }
}

pub fn format_costs_info(price: f64) -> CostsInfo {
    CostsInfo {
        accrued_so_far: price,
        display_cost: display_cost(price),
        currency: CURRENCY.to_string(),
        disclaimer: DISCLAIMER.to_string(),
    }
}

/// Cost estimate before anything was invoked.
pub fn zero_costs() -> CostsInfo {
    format_costs_info(0.0)
}
