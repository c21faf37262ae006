use crate::error::{Error, Result};
use crate::structs::*;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Decode back-to-back tuple records.
///
/// Returns the tuples and the number of trailing bytes that do not form a whole record.
pub fn parse(bytes: &[u8]) -> (Vec<FlowTuple>, usize) {
    let chunks = bytes.chunks_exact(TUPLE_RECORD_LEN);
    let trailing = chunks.remainder().len();
    let tuples = chunks
        .map(|c| {
            // chunks_exact only yields full records
            let mut record = [0u8; TUPLE_RECORD_LEN];
            record.copy_from_slice(c);
            FlowTuple::from_record(&record)
        })
        .collect();
    (tuples, trailing)
}

/// Load a whole dataset in memory. It is then shared read-only by all the workers.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<FlowTuple>> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
    let (tuples, trailing) = parse(&bytes);
    if tuples.is_empty() {
        return Err(Error::Format {
            path: path.to_path_buf(),
            reason: format!(
                "{} bytes do not contain a single {}-byte record",
                bytes.len(),
                TUPLE_RECORD_LEN
            ),
        });
    }
    if trailing > 0 {
        log::warn!(
            "{}: {trailing} trailing bytes discarded",
            path.display()
        );
    }
    log::info!("{} tuples loaded from {}", tuples.len(), path.display());
    Ok(tuples)
}

/// Write tuples in the dataset format
pub fn write_dataset(path: impl AsRef<Path>, tuples: &[FlowTuple]) -> Result<()> {
    let path = path.as_ref();
    let file = fs::File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for t in tuples {
        writer
            .write_all(&t.to_record())
            .map_err(|e| Error::io(path, e))?;
    }
    writer.flush().map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample() -> Vec<FlowTuple> {
        vec![
            FlowTuple::new(Ipv4Addr::from(1), Ipv4Addr::from(2), 10, 20, 6),
            FlowTuple::new(Ipv4Addr::from(3), Ipv4Addr::from(4), 30, 40, 17),
            FlowTuple::new(Ipv4Addr::from(5), Ipv4Addr::from(6), 50, 60, 6),
        ]
    }

    #[test]
    fn parse_reports_trailing_bytes() {
        let mut bytes: Vec<u8> = sample().iter().flat_map(|t| t.to_record()).collect();
        bytes.extend_from_slice(&[0xff; 5]);
        let (tuples, trailing) = parse(&bytes);
        assert_eq!(tuples, sample());
        assert_eq!(trailing, 5);
    }

    #[test]
    fn load_written_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.dat");
        write_dataset(&path, &sample()).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 39);
        assert_eq!(load(&path).unwrap(), sample());
    }

    #[test]
    fn load_rejects_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.dat");
        fs::write(&path, [1, 2, 3]).unwrap();
        assert!(matches!(load(&path), Err(Error::Format { .. })));
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(dir.path().join("nope.dat")),
            Err(Error::Io { .. })
        ));
    }
}
