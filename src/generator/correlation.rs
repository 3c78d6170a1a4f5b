//! Correlation tests backing dynamic splitting and joining.

use crate::models::{ModelType, Row};

/// Partitions the buffer's columns into classes of mutually correlated series.
///
/// Classes are grown greedily from the lowest unclassified column: a column joins the seed's
/// class when every buffered pair is within `error_bound` according to `model`. Returns a
/// single class when every column correlates with the first one.
pub(crate) fn correlation_classes(
    buffer: &[Row],
    model: &dyn ModelType,
    error_bound: f32,
) -> Vec<Vec<usize>> {
    let columns = buffer.first().map_or(0, |row| row.len());
    let mut remaining: Vec<usize> = (0..columns).collect();
    let mut classes = Vec::new();

    while let Some(&seed) = remaining.first() {
        let class: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&j| j == seed || columns_correlated(buffer, model, error_bound, seed, j))
            .collect();
        remaining.retain(|j| !class.contains(j));
        classes.push(class);
    }
    classes
}

fn columns_correlated(
    buffer: &[Row],
    model: &dyn ModelType,
    error_bound: f32,
    i: usize,
    j: usize,
) -> bool {
    let mut a = buffer.iter().map(|row| row[i].value);
    let mut b = buffer.iter().map(|row| row[j].value);
    model.within_error_bound(error_bound, &mut a, &mut b)
}

/// True if two buffers end at the same timestamp and their first columns agree, compared
/// from the newest row backwards.
pub(crate) fn tails_correlated(
    a: &[Row],
    b: &[Row],
    model: &dyn ModelType,
    error_bound: f32,
) -> bool {
    let (last_a, last_b) = match (a.last(), b.last()) {
        (Some(x), Some(y)) if !x.is_empty() && !y.is_empty() => (x, y),
        _ => return false,
    };
    if last_a[0].timestamp != last_b[0].timestamp {
        return false;
    }
    let mut a = a.iter().rev().map(|row| row[0].value);
    let mut b = b.iter().rev().map(|row| row[0].value);
    model.within_error_bound(error_bound, &mut a, &mut b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Uncompressed;
    use crate::types::ValueDataPoint;

    fn buffer(columns: &[&[f32]]) -> Vec<Row> {
        let rows = columns[0].len();
        (0..rows)
            .map(|r| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(c, values)| {
                        ValueDataPoint::new(c as i32 + 1, (r as i64 + 1) * 100, values[r], 100)
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn correlated_columns_share_a_class() {
        let model = Uncompressed::new(1, 0.0);
        let buffer = buffer(&[&[1.0, 2.0], &[5.0, 5.0], &[1.0, 2.0], &[5.0, 5.0]]);
        let classes = correlation_classes(&buffer, &model, 0.0);
        assert_eq!(classes, vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn fully_correlated_buffer_yields_one_class() {
        let model = Uncompressed::new(1, 5.0);
        let buffer = buffer(&[&[100.0, 200.0], &[104.0, 195.0]]);
        assert_eq!(correlation_classes(&buffer, &model, 10.0).len(), 1);
        assert_eq!(correlation_classes(&buffer, &model, 1.0).len(), 2);
    }

    #[test]
    fn tails_must_end_together() {
        let model = Uncompressed::new(1, 0.0);
        let long = buffer(&[&[9.0, 1.0, 1.0]]);
        let short = buffer(&[&[1.0, 1.0]]);
        // Rows end at 300 and 200.
        assert!(!tails_correlated(&long, &short, &model, 0.0));
        assert!(tails_correlated(&long, &long[1..], &model, 0.0));
        assert!(!tails_correlated(&long, &[], &model, 0.0));
    }
}
