use crate::error::{Error, Result};
use crate::structs::WorkRange;

/// Split `total` items into `workers` contiguous ranges.
///
/// Every worker gets `total / workers` items and the last one also takes the remainder, so the
/// ranges never overlap and cover `[0, total)` exactly. With fewer items than workers, the first
/// ranges are empty.
pub fn partition(total: usize, workers: usize) -> Result<Vec<WorkRange>> {
    if workers == 0 {
        return Err(Error::Config("worker count must be at least 1".into()));
    }
    let chunk = total / workers;
    Ok((0..workers)
        .map(|i| {
            let start = i * chunk;
            let count = if i == workers - 1 {
                total - start
            } else {
                chunk
            };
            WorkRange { start, count }
        })
        .collect())
}

/// Split a file of fixed-size records into byte ranges made of whole records.
///
/// Trailing bytes that do not form a whole record belong to no range.
pub fn partition_records_as_bytes(
    file_len: u64,
    record_len: usize,
    workers: usize,
) -> Result<Vec<WorkRange>> {
    if record_len == 0 {
        return Err(Error::Config("record length must be positive".into()));
    }
    let records = (file_len / record_len as u64) as usize;
    Ok(partition(records, workers)?
        .into_iter()
        .map(|r| r.scaled(record_len))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_exact_cover(ranges: &[WorkRange], total: usize) {
        let mut next = 0;
        for r in ranges {
            assert_eq!(r.start, next, "ranges must be contiguous and ordered");
            next = r.end();
        }
        assert_eq!(next, total);
    }

    #[test]
    fn remainder_goes_to_last_worker() {
        let ranges = partition(10, 3).unwrap();
        assert_eq!(
            ranges,
            vec![
                WorkRange { start: 0, count: 3 },
                WorkRange { start: 3, count: 3 },
                WorkRange { start: 6, count: 4 },
            ]
        );
    }

    #[test]
    fn exact_cover_for_many_shapes() {
        for total in 0..50 {
            for workers in 1..12 {
                let ranges = partition(total, workers).unwrap();
                assert_eq!(ranges.len(), workers);
                check_exact_cover(&ranges, total);
            }
        }
    }

    #[test]
    fn fewer_items_than_workers() {
        let ranges = partition(2, 4).unwrap();
        assert!(ranges[..3].iter().all(WorkRange::is_empty));
        assert_eq!(ranges[3], WorkRange { start: 0, count: 2 });
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(partition(5, 0).is_err());
    }

    #[test]
    fn byte_ranges_hold_whole_records() {
        let ranges = partition_records_as_bytes(16 * 7 + 5, 16, 2).unwrap();
        assert_eq!(
            ranges,
            vec![
                WorkRange { start: 0, count: 48 },
                WorkRange { start: 48, count: 64 },
            ]
        );
    }
}
