//! Defines the Aggregator trait for combining values in shuffle operations.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::Value;

/// Aggregator trait for combining values for a key.
/// Used in operations like `reduceByKey` and `combineByKey`.
pub trait Aggregator: Send + Sync {
    /// Create a combiner from the first value for a key.
    fn create_combiner(&self, v: Value) -> Value;

    /// Merge a new value into an existing combiner.
    fn merge_value(&self, c: Value, v: Value) -> Value;

    /// Merge two combiners.
    fn merge_combiners(&self, c1: Value, c2: Value) -> Value;
}

pub type ReduceFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// Aggregator for reduceByKey where the combiner is the value itself.
#[derive(Clone)]
pub struct ReduceAggregator {
    reduce_func: ReduceFn,
}

impl ReduceAggregator {
    pub fn new(reduce_func: ReduceFn) -> Self {
        Self { reduce_func }
    }
}

impl Aggregator for ReduceAggregator {
    fn create_combiner(&self, v: Value) -> Value {
        v
    }

    fn merge_value(&self, c: Value, v: Value) -> Value {
        (self.reduce_func)(c, v)
    }

    fn merge_combiners(&self, c1: Value, c2: Value) -> Value {
        (self.reduce_func)(c1, c2)
    }
}

/// Collects every value of a key into a [`Value::List`].
#[derive(Clone, Debug, Default)]
pub struct GroupByKeyAggregator;

impl Aggregator for GroupByKeyAggregator {
    fn create_combiner(&self, v: Value) -> Value {
        Value::List(vec![v])
    }

    fn merge_value(&self, c: Value, v: Value) -> Value {
        match c {
            Value::List(mut items) => {
                items.push(v);
                Value::List(items)
            }
            other => Value::List(vec![other, v]),
        }
    }

    fn merge_combiners(&self, c1: Value, c2: Value) -> Value {
        match (c1, c2) {
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Value::List(a)
            }
            (a, b) => Value::List(vec![a, b]),
        }
    }
}

/// A generic aggregator for combine_by_key operations.
#[derive(Clone)]
pub struct CombineAggregator {
    create_combiner: Arc<dyn Fn(Value) -> Value + Send + Sync>,
    merge_value: ReduceFn,
    merge_combiners: ReduceFn,
}

impl CombineAggregator {
    pub fn new(
        create_combiner: Arc<dyn Fn(Value) -> Value + Send + Sync>,
        merge_value: ReduceFn,
        merge_combiners: ReduceFn,
    ) -> Self {
        Self {
            create_combiner,
            merge_value,
            merge_combiners,
        }
    }
}

impl Aggregator for CombineAggregator {
    fn create_combiner(&self, v: Value) -> Value {
        (self.create_combiner)(v)
    }

    fn merge_value(&self, c: Value, v: Value) -> Value {
        (self.merge_value)(c, v)
    }

    fn merge_combiners(&self, c1: Value, c2: Value) -> Value {
        (self.merge_combiners)(c1, c2)
    }
}

/// Per-key combining table. Keys come out in first-seen order.
struct CombineTable {
    index: HashMap<Value, usize>,
    entries: Vec<(Value, Value)>,
}

impl CombineTable {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }

    fn upsert(
        &mut self,
        key: Value,
        item: Value,
        insert: impl FnOnce(Value) -> Value,
        update: impl FnOnce(Value, Value) -> Value,
    ) {
        match self.index.get(&key) {
            Some(&slot) => {
                let entry = &mut self.entries[slot].1;
                let existing = std::mem::replace(entry, Value::Null);
                *entry = update(existing, item);
            }
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, insert(item)));
            }
        }
    }
}

/// Map-side combine: fold raw `(key, value)` pairs into `(key, combiner)`.
pub fn combine_values_by_key(
    aggregator: &dyn Aggregator,
    pairs: impl IntoIterator<Item = (Value, Value)>,
) -> Vec<(Value, Value)> {
    let mut table = CombineTable::new();
    for (k, v) in pairs {
        table.upsert(
            k,
            v,
            |v| aggregator.create_combiner(v),
            |c, v| aggregator.merge_value(c, v),
        );
    }
    table.entries
}

/// Reduce-side merge of partial `(key, combiner)` pairs.
pub fn combine_combiners_by_key(
    aggregator: &dyn Aggregator,
    pairs: impl IntoIterator<Item = (Value, Value)>,
) -> Vec<(Value, Value)> {
    let mut table = CombineTable::new();
    for (k, c) in pairs {
        table.upsert(k, c, |c| c, |a, b| aggregator.merge_combiners(a, b));
    }
    table.entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum() -> ReduceAggregator {
        ReduceAggregator::new(Arc::new(|a: Value, b: Value| {
            Value::Int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0))
        }))
    }

    fn pairs(items: &[(&str, i64)]) -> Vec<(Value, Value)> {
        items
            .iter()
            .map(|(k, v)| (Value::from(*k), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_map_side_combine_sums_per_key_in_first_seen_order() {
        let combined = combine_values_by_key(
            &sum(),
            pairs(&[("test2", 1), ("test3", 1), ("test2", 1), ("test2", 1)]),
        );
        assert_eq!(combined, pairs(&[("test2", 3), ("test3", 1)]));
    }

    #[test]
    fn test_reduce_side_merges_partials() {
        let merged = combine_combiners_by_key(&sum(), pairs(&[("a", 2), ("b", 5), ("a", 3)]));
        assert_eq!(merged, pairs(&[("a", 5), ("b", 5)]));
    }

    #[test]
    fn test_group_by_key_aggregator() {
        let agg = GroupByKeyAggregator;
        let left = combine_values_by_key(&agg, pairs(&[("k", 1), ("k", 2)]));
        let right = combine_values_by_key(&agg, pairs(&[("k", 3)]));
        let merged = combine_combiners_by_key(&agg, left.into_iter().chain(right));
        assert_eq!(
            merged,
            vec![(Value::from("k"), Value::from(vec![1, 2, 3]))]
        );
    }

    #[test]
    fn test_combine_aggregator_average() {
        // combiner is (sum, count)
        let agg = CombineAggregator::new(
            Arc::new(|v: Value| Value::pair(v, 1)),
            Arc::new(|c: Value, v: Value| {
                let (s, n) = c.into_pair().unwrap_or((Value::Int(0), Value::Int(0)));
                Value::pair(
                    s.as_int().unwrap_or(0) + v.as_int().unwrap_or(0),
                    n.as_int().unwrap_or(0) + 1,
                )
            }),
            Arc::new(|a: Value, b: Value| {
                let (s1, n1) = a.into_pair().unwrap_or((Value::Int(0), Value::Int(0)));
                let (s2, n2) = b.into_pair().unwrap_or((Value::Int(0), Value::Int(0)));
                Value::pair(
                    s1.as_int().unwrap_or(0) + s2.as_int().unwrap_or(0),
                    n1.as_int().unwrap_or(0) + n2.as_int().unwrap_or(0),
                )
            }),
        );
        let combined = combine_values_by_key(&agg, pairs(&[("x", 4), ("x", 6)]));
        assert_eq!(combined, vec![(Value::from("x"), Value::pair(10, 2))]);
    }
}
