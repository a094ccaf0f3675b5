//! Pool Weighers
//!
//! Weighers rank the pools that survived filtering. Raw weights from each
//! weigher are normalized to `[0, 1]` across the candidate set, scaled by
//! the weigher's multiplier and summed; the highest total wins.

use super::host_manager::PoolState;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};

/// Ranks pools by one property
pub trait PoolWeigher: Send + Sync {
    fn name(&self) -> &'static str;

    fn weigh(&self, pool: &PoolState) -> f64;
}

/// Free capacity; virtual free capacity on thin pools
pub struct CapacityWeigher;

impl PoolWeigher for CapacityWeigher {
    fn name(&self) -> &'static str {
        "CapacityWeigher"
    }

    fn weigh(&self, pool: &PoolState) -> f64 {
        pool.weighable_free_gb()
    }
}

/// Allocated capacity; with a negative multiplier the emptiest pool wins
pub struct AllocatedCapacityWeigher;

impl PoolWeigher for AllocatedCapacityWeigher {
    fn name(&self) -> &'static str {
        "AllocatedCapacityWeigher"
    }

    fn weigh(&self, pool: &PoolState) -> f64 {
        (pool.allocated_capacity_gb + pool.pending_gb) as f64
    }
}

/// A weigher with its multiplier
pub struct WeigherEntry {
    pub weigher: Box<dyn PoolWeigher>,
    pub multiplier: f64,
}

/// Build a weigher from its configured name
pub fn weigher_by_name(name: &str, config: &SchedulerConfig) -> Result<WeigherEntry> {
    let entry = match name {
        "CapacityWeigher" => WeigherEntry {
            weigher: Box::new(CapacityWeigher),
            multiplier: config.capacity_weight_multiplier,
        },
        "AllocatedCapacityWeigher" => WeigherEntry {
            weigher: Box::new(AllocatedCapacityWeigher),
            multiplier: config.allocated_capacity_weight_multiplier,
        },
        other => {
            return Err(Error::Configuration(format!(
                "unknown scheduler weigher '{}'",
                other
            )))
        }
    };
    Ok(entry)
}

/// Scale weights to `[0, 1]`; all zero when every weight is equal
pub fn normalize(weights: &[f64]) -> Vec<f64> {
    let min = weights.iter().copied().fold(f64::INFINITY, f64::min);
    let max = weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if weights.is_empty() || range == 0.0 {
        return vec![0.0; weights.len()];
    }
    weights.iter().map(|w| (w - min) / range).collect()
}

/// A pool with its combined weight
#[derive(Debug, Clone)]
pub struct WeighedPool {
    pub pool: PoolState,
    pub weight: f64,
}

/// Weigh pools and sort them best first; ties keep input order
pub fn weigh_pools(pools: Vec<PoolState>, weighers: &[WeigherEntry]) -> Vec<WeighedPool> {
    let mut totals = vec![0.0; pools.len()];
    for entry in weighers {
        let raw: Vec<f64> = pools.iter().map(|p| entry.weigher.weigh(p)).collect();
        for (total, weight) in totals.iter_mut().zip(normalize(&raw)) {
            *total += entry.multiplier * weight;
        }
    }

    let mut weighed: Vec<WeighedPool> = pools
        .into_iter()
        .zip(totals)
        .map(|(pool, weight)| WeighedPool { pool, weight })
        .collect();
    weighed.sort_by(|a, b| b.weight.total_cmp(&a.weight));
    weighed
}
