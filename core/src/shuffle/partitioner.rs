//! Defines partitioners for distributing data in a shuffle.

use std::fmt::Debug;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::value::Value;

/// Maps a key to a target partition in `[0, num_partitions)`.
pub trait Partitioner: Send + Sync + Debug {
    fn num_partitions(&self) -> usize;

    fn partition(&self, key: &Value) -> usize;
}

/// Seeded hash of any hashable value, stable within a process.
pub(crate) fn seeded_hash<T: Hash + ?Sized>(value: &T, seed: u64) -> u64 {
    let mut s = DefaultHasher::new();
    seed.hash(&mut s);
    value.hash(&mut s);
    s.finish()
}

/// A partitioner that uses the hash of the key to distribute data.
#[derive(Clone, Debug)]
pub struct HashPartitioner {
    num_partitions: usize,
    seed: u64,
}

impl HashPartitioner {
    pub fn new(num_partitions: usize) -> Self {
        Self::with_seed(num_partitions, 0)
    }

    pub fn with_seed(num_partitions: usize, seed: u64) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
            seed,
        }
    }
}

impl Partitioner for HashPartitioner {
    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn partition(&self, key: &Value) -> usize {
        (seeded_hash(key, self.seed) % self.num_partitions as u64) as usize
    }
}

/// A range partitioner that distributes keys based on sorted ranges.
///
/// Partition `i` holds keys in `(bounds[i - 1], bounds[i]]`. For a
/// descending partitioner the partition order is reversed, so reading
/// partitions in index order always follows the requested sort direction.
#[derive(Clone, Debug)]
pub struct RangePartitioner {
    num_partitions: usize,
    range_bounds: Vec<Value>,
    ascending: bool,
}

impl RangePartitioner {
    /// Create a range partitioner by sampling the given keys.
    pub fn from_sample(num_partitions: usize, mut sample: Vec<Value>, ascending: bool) -> Self {
        let num_partitions = num_partitions.max(1);
        sample.sort();
        sample.dedup();

        let mut range_bounds: Vec<Value> = Vec::new();
        if !sample.is_empty() {
            for i in 1..num_partitions {
                let index = (i * sample.len() / num_partitions).min(sample.len() - 1);
                let candidate = &sample[index];
                if range_bounds.last().is_none_or(|last| last < candidate) {
                    range_bounds.push(candidate.clone());
                }
            }
        }

        Self {
            num_partitions,
            range_bounds,
            ascending,
        }
    }

    pub fn bounds(&self) -> &[Value] {
        &self.range_bounds
    }
}

impl Partitioner for RangePartitioner {
    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn partition(&self, key: &Value) -> usize {
        let index = self.range_bounds.partition_point(|bound| bound < key);
        if self.ascending {
            index
        } else {
            self.num_partitions - 1 - index
        }
    }
}

/// Deals records to targets in turn, starting from a per-source offset.
#[derive(Debug)]
pub struct RoundRobinPartitioner {
    num_partitions: usize,
    next: usize,
}

impl RoundRobinPartitioner {
    /// The starting target is derived from the source partition index.
    pub fn for_source(num_partitions: usize, source_index: usize) -> Self {
        let num_partitions = num_partitions.max(1);
        Self {
            num_partitions,
            next: (seeded_hash(&source_index, 0) % num_partitions as u64) as usize,
        }
    }

    pub fn next_partition(&mut self) -> usize {
        let target = self.next;
        self.next = (self.next + 1) % self.num_partitions;
        target
    }
}
