//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use ember_core::{EmberContext, EngineConfig, Value};

/// The sample text the word count tests run over.
pub const SAMPLE_TEXT: &str = "test1 test2 test3\ntest2 test4 test5\ntest6 test2 test7\n";

/// Initialise log output once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("ember_core=debug")
        .try_init();
}

/// Configuration used by most tests: a small pool and a few partitions.
pub fn test_config(name: &str) -> EngineConfig {
    EngineConfig::new(name)
        .with_num_workers(4)
        .with_default_partition_count(4)
}

pub async fn create_test_context(name: &str) -> Arc<EmberContext> {
    create_test_context_with(test_config(name)).await
}

pub async fn create_test_context_with(config: EngineConfig) -> Arc<EmberContext> {
    init_tracing();
    EmberContext::new(config)
        .await
        .expect("failed to create test context")
}

/// Integer records `0..n`
pub fn int_data(n: i64) -> Vec<Value> {
    (0..n).map(Value::from).collect()
}

pub fn add_ints(a: Value, b: Value) -> Value {
    Value::Int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0))
}

/// Assert two collections hold the same records, ignoring order.
pub fn assert_same_elements(mut actual: Vec<Value>, mut expected: Vec<Value>) {
    actual.sort();
    expected.sort();
    assert_eq!(actual, expected);
}

/// Partition sizes of a dataset, via `glom`.
pub async fn partition_sizes(rdd: &ember_core::Rdd) -> Vec<usize> {
    rdd.glom()
        .collect()
        .await
        .expect("glom failed")
        .iter()
        .map(|p| p.as_list().map_or(0, |items| items.len()))
        .collect()
}
