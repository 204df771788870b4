//! Shuffle: partitioners, aggregators and the block engine.

pub mod aggregator;
pub mod engine;
pub mod partitioner;

pub use aggregator::{
    Aggregator, CombineAggregator, GroupByKeyAggregator, ReduceAggregator, ReduceFn,
    combine_combiners_by_key, combine_values_by_key,
};
pub use engine::{MapOutput, ShuffleEngine, ShuffleId, ShuffleStats, bucket_by_key, bucket_round_robin};
pub use partitioner::{HashPartitioner, Partitioner, RangePartitioner, RoundRobinPartitioner};
