//! Partition selection from a routing key.
//!
//! Strategies are stateless and looked up by name at startup through a
//! [`StrategyRegistry`]. An identifier that cannot be resolved never stops the
//! process: it degrades to [`FixedPartition`] with an error log.
use std::collections::HashMap;
use std::fmt::Debug;
use std::num::NonZeroU32;
use std::sync::Arc;

use murmur2::{murmur2, KAFKA_SEED};
use thiserror::Error;
use tracing::{error, info};

pub const STRATEGY_FALLBACK: &str = "relay_partition_strategy_fallback_total";

/// Partition used when the configured strategy is unavailable.
pub const FALLBACK_PARTITION: u32 = 1;

pub trait PartitionStrategy: Debug + Send + Sync {
    /// Maps a routing key to a partition index. Implementations must be pure.
    fn select(&self, partition_count: NonZeroU32, key: i64) -> u32;
}

/// `key mod partition_count`, truncating toward zero.
///
/// Negative keys use the magnitude of the remainder, so `-7` and `7` share a
/// partition and the result always stays in `[0, partition_count)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModuloStrategy;

impl PartitionStrategy for ModuloStrategy {
    fn select(&self, partition_count: NonZeroU32, key: i64) -> u32 {
        let remainder = (key % i64::from(partition_count.get())).unsigned_abs();
        u32::try_from(remainder).unwrap_or_default()
    }
}

/// Same placement as the Kafka default partitioner would give a record keyed
/// with the decimal text of the routing key.
#[derive(Debug, Default, Clone, Copy)]
pub struct Murmur2Strategy;

impl PartitionStrategy for Murmur2Strategy {
    fn select(&self, partition_count: NonZeroU32, key: i64) -> u32 {
        let hash = murmur2(key.to_string().as_bytes(), KAFKA_SEED);
        (hash & 0x7fff_ffff) % partition_count.get()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedPartition(pub u32);

impl PartitionStrategy for FixedPartition {
    fn select(&self, _partition_count: NonZeroU32, _key: i64) -> u32 {
        self.0
    }
}

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("no partition strategy registered as '{0}'")]
    Unknown(String),
    #[error("partition strategy '{name}' could not be created: {reason}")]
    Instantiation { name: String, reason: String },
}

type StrategyFactory =
    Box<dyn Fn() -> Result<Arc<dyn PartitionStrategy>, StrategyError> + Send + Sync>;

/// Strategy factories keyed by lowercase identifier.
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("modulo", || shared(ModuloStrategy));
        registry.register("murmur2", || shared(Murmur2Strategy));
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Arc<dyn PartitionStrategy>, StrategyError> + Send + Sync + 'static,
    {
        self.factories.insert(normalize(name), Box::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn try_resolve(&self, name: &str) -> Result<Arc<dyn PartitionStrategy>, StrategyError> {
        let factory = self
            .factories
            .get(&normalize(name))
            .ok_or_else(|| StrategyError::Unknown(name.to_owned()))?;
        factory()
    }

    /// Resolves `name`, substituting [`FixedPartition`] if that fails.
    pub fn resolve(&self, name: &str) -> Arc<dyn PartitionStrategy> {
        match self.try_resolve(name) {
            Ok(strategy) => {
                info!(strategy = name, "resolved partition strategy");
                strategy
            }
            Err(e) => {
                error!(
                    available = ?self.names(),
                    "{e}, falling back to fixed partition {FALLBACK_PARTITION}"
                );
                metrics::counter!(STRATEGY_FALLBACK).increment(1);
                Arc::new(FixedPartition(FALLBACK_PARTITION))
            }
        }
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Wraps a strategy for use as a registry factory result.
pub fn shared<S>(strategy: S) -> Result<Arc<dyn PartitionStrategy>, StrategyError>
where
    S: PartitionStrategy + 'static,
{
    Ok(Arc::new(strategy))
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).expect("non-zero partition count")
    }

    #[test]
    fn modulo_matches_remainder() {
        let strategy = ModuloStrategy;
        for partitions in 1..=17u32 {
            for key in 0..200i64 {
                let selected = strategy.select(count(partitions), key);
                assert_eq!(i64::from(selected), key % i64::from(partitions));
                assert!(selected < partitions);
            }
        }
        assert_eq!(strategy.select(count(7), i64::MAX), (i64::MAX % 7) as u32);
    }

    #[test]
    fn modulo_negative_keys_use_magnitude() {
        let strategy = ModuloStrategy;
        assert_eq!(strategy.select(count(5), -7), 2);
        assert_eq!(strategy.select(count(5), 7), 2);
        assert_eq!(
            strategy.select(count(5), i64::MIN),
            (i64::MIN % 5).unsigned_abs() as u32
        );
    }

    #[test]
    fn murmur2_is_stable_and_in_range() {
        let strategy = Murmur2Strategy;
        for key in -50..50i64 {
            let first = strategy.select(count(12), key);
            assert_eq!(first, strategy.select(count(12), key));
            assert!(first < 12);
        }
    }

    #[test]
    fn single_partition_always_zero() {
        assert_eq!(ModuloStrategy.select(count(1), 987_654), 0);
        assert_eq!(Murmur2Strategy.select(count(1), 987_654), 0);
    }

    #[test]
    fn resolves_builtins_case_insensitively() {
        let registry = StrategyRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["modulo", "murmur2"]);

        let strategy = registry
            .try_resolve("  Modulo ")
            .expect("modulo is registered");
        assert_eq!(strategy.select(count(4), 10), 2);
    }

    #[test]
    fn unknown_strategy_falls_back_to_fixed_partition() {
        let registry = StrategyRegistry::with_builtins();
        assert!(matches!(
            registry.try_resolve("round-robin"),
            Err(StrategyError::Unknown(_))
        ));

        let strategy = registry.resolve("round-robin");
        assert_eq!(strategy.select(count(8), 3), FALLBACK_PARTITION);
        assert_eq!(strategy.select(count(8), 4), FALLBACK_PARTITION);
    }

    #[test]
    fn failing_factory_falls_back() {
        let mut registry = StrategyRegistry::empty();
        registry.register("broken", || {
            Err(StrategyError::Instantiation {
                name: "broken".to_string(),
                reason: "missing lookup table".to_string(),
            })
        });

        let strategy = registry.resolve("broken");
        assert_eq!(strategy.select(count(3), 0), FALLBACK_PARTITION);
    }

    #[test]
    fn custom_strategies_plug_in() {
        #[derive(Debug)]
        struct LastPartition;

        impl PartitionStrategy for LastPartition {
            fn select(&self, partition_count: NonZeroU32, _key: i64) -> u32 {
                partition_count.get() - 1
            }
        }

        let mut registry = StrategyRegistry::with_builtins();
        registry.register("last", || shared(LastPartition));
        assert_eq!(registry.resolve("last").select(count(6), 1), 5);
    }
}
