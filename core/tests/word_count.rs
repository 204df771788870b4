//! End-to-end word count: read text, count, sort, save.

mod common;

use common::{SAMPLE_TEXT, add_ints, assert_same_elements, create_test_context, create_test_context_with, test_config};
use ember_core::{Rdd, Value};
use tempfile::TempDir;

fn word_counts(lines: &Rdd) -> Rdd {
    lines
        .flat_map(|line| {
            line.as_str()
                .unwrap_or_default()
                .split(' ')
                .map(Value::from)
                .collect::<Vec<_>>()
        })
        .filter(|word| !word.as_str().unwrap_or_default().ends_with('1'))
        .map(|word| Value::pair(word, 1))
        .reduce_by_key(add_ints)
}

fn expected_counts() -> Vec<Value> {
    vec![
        Value::pair("test2", 3),
        Value::pair("test3", 1),
        Value::pair("test4", 1),
        Value::pair("test5", 1),
        Value::pair("test6", 1),
        Value::pair("test7", 1),
    ]
}

#[tokio::test]
async fn test_word_count_from_text_file() {
    let ctx = create_test_context("word-count").await;
    ctx.storage()
        .put("FileStore/data.txt", SAMPLE_TEXT.as_bytes())
        .await
        .unwrap();

    let lines = ctx.text_file("dbfs:/FileStore/data.txt");
    assert_eq!(lines.num_partitions(), 2);
    assert_eq!(lines.count().await.unwrap(), 3);

    let counts = word_counts(&lines).collect().await.unwrap();
    assert_same_elements(counts, expected_counts());
}

#[tokio::test]
async fn test_sorted_by_count_descending() {
    let ctx = create_test_context("word-count-sorted").await;
    let lines = ctx.parallelize_with_partitions(SAMPLE_TEXT.lines().collect::<Vec<_>>(), 3);

    let sorted = word_counts(&lines).map(Value::swap).sort_by_key(false);
    let expected = vec![
        Value::pair(3, "test2"),
        Value::pair(1, "test7"),
        Value::pair(1, "test6"),
        Value::pair(1, "test5"),
        Value::pair(1, "test4"),
        Value::pair(1, "test3"),
    ];
    assert_eq!(sorted.collect().await.unwrap(), expected);
    assert_eq!(sorted.take(2).await.unwrap(), expected[..2].to_vec());
    assert_eq!(sorted.first().await.unwrap(), Some(Value::pair(3, "test2")));
}

#[tokio::test]
async fn test_save_as_text_file_writes_parts_and_marker() {
    let dir = TempDir::new().unwrap();
    let ctx = create_test_context_with(test_config("word-count-save").with_storage_root(dir.path())).await;
    std::fs::create_dir_all(dir.path().join("FileStore")).unwrap();
    std::fs::write(dir.path().join("FileStore/data.txt"), SAMPLE_TEXT).unwrap();

    let lines = ctx.text_file_with_partitions("dbfs:/FileStore/data.txt", 2);
    let sorted = word_counts(&lines)
        .map(Value::swap)
        .sort_by_key_with_partitions(false, 2);
    sorted
        .save_as_text_file("dbfs:/FileStore/output")
        .await
        .unwrap();

    let out = dir.path().join("FileStore/output");
    assert!(out.join("_SUCCESS").exists());
    let mut text = String::new();
    for part in 0..2 {
        text.push_str(&std::fs::read_to_string(out.join(format!("part-{:05}", part))).unwrap());
    }
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], "(3, 'test2')");
    assert_eq!(lines[5], "(1, 'test3')");

    // the output directory must not already exist
    assert!(sorted.save_as_text_file("dbfs:/FileStore/output").await.is_err());
}

#[tokio::test]
async fn test_missing_input_fails_at_action_time() {
    let ctx = create_test_context("word-count-missing").await;
    let lines = ctx.text_file("dbfs:/FileStore/nothing.txt");
    let counts = word_counts(&lines);
    assert!(counts.collect().await.is_err());
}
