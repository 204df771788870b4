//! Text input and output.

use ember_common::normalize_uri;

use crate::value::Value;

/// Marker object written once every part file of an output is stored.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// Split text into exactly `num_partitions` runs of consecutive lines.
///
/// Partition `i` holds lines `[i * len / n, (i + 1) * len / n)`, so sizes
/// differ by at most one and reading the partitions in order yields the
/// file's lines in order.
pub fn split_lines(text: &str, num_partitions: usize) -> Vec<Vec<Value>> {
    let lines: Vec<&str> = text.lines().collect();
    let n = num_partitions.max(1);
    let len = lines.len();
    (0..n)
        .map(|i| {
            lines[i * len / n..(i + 1) * len / n]
                .iter()
                .map(|line| Value::from(*line))
                .collect()
        })
        .collect()
}

/// One line per record, each terminated by a newline.
pub fn render_lines(records: &[Value]) -> String {
    let mut text = String::new();
    for record in records {
        match record {
            Value::Str(s) => text.push_str(s),
            other => text.push_str(&other.to_string()),
        }
        text.push('\n');
    }
    text
}

/// Storage key of a text input.
pub fn input_key(path: &str) -> String {
    normalize_uri(path)
}

/// Storage key of the `index`th part file under an output directory.
pub fn part_key(dir: &str, index: usize) -> String {
    format!("{}/part-{:05}", normalize_uri(dir), index)
}

pub fn success_key(dir: &str) -> String {
    format!("{}/{}", normalize_uri(dir), SUCCESS_MARKER)
}

/// Prefix under which every object of an output directory lives.
pub fn output_prefix(dir: &str) -> String {
    format!("{}/", normalize_uri(dir))
}
