use assert_cmd::prelude::*;
use flowrig::dataset::write_dataset;
use flowrig::structs::FlowTuple;
use pcap_file::pcap::PcapReader;
use rand_core::{RngCore, SeedableRng};
use std::fs::{self, File};
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn sample_dataset(path: &Path) {
    let tuples = vec![
        FlowTuple::new(Ipv4Addr::from(1), Ipv4Addr::from(2), 10, 20, 6),
        FlowTuple::new(Ipv4Addr::from(3), Ipv4Addr::from(4), 30, 40, 17),
        FlowTuple::new(Ipv4Addr::from(7), Ipv4Addr::from(8), 0, 0, 1),
        FlowTuple::new(Ipv4Addr::from(5), Ipv4Addr::from(6), 50, 60, 6),
    ];
    write_dataset(path, &tuples).unwrap();
}

fn random_capture(path: &Path, records: usize) {
    let mut rng = rand_pcg::Pcg32::seed_from_u64(0);
    let mut bytes = vec![0u8; records * 16];
    rng.fill_bytes(&mut bytes);
    fs::write(path, bytes).unwrap();
}

fn table_sum(path: &Path) -> u64 {
    let bytes = fs::read(path).unwrap();
    assert_eq!(bytes.len(), 4096 * 4);
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as u64)
        .sum()
}

#[test]
fn convert_dataset() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let dataset = dir.path().join("flows.dat");
    sample_dataset(&dataset);

    let mut cmd = Command::cargo_bin("flowrig")?;
    cmd.arg("convert").arg("-d").arg(&dataset).arg("-l").arg("64");
    cmd.assert().success();

    // the ICMP flow is dropped
    let mut reader = PcapReader::new(File::open(dir.path().join("flows.dat.pcap"))?)?;
    let mut protos = vec![];
    while let Some(packet) = reader.next_packet() {
        let packet = packet?;
        assert_eq!(packet.data.len(), 64);
        assert_eq!(packet.orig_len, 64);
        protos.push(packet.data[23]);
    }
    assert_eq!(protos, vec![6, 17, 6]);
    Ok(())
}

#[test]
fn convert_rejects_short_frames() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let dataset = dir.path().join("flows.dat");
    sample_dataset(&dataset);

    let mut cmd = Command::cargo_bin("flowrig")?;
    cmd.arg("convert").arg("-d").arg(&dataset).arg("-l").arg("40");
    cmd.assert().failure().code(1);

    let mut cmd = Command::cargo_bin("flowrig")?;
    cmd.arg("convert").arg("-d").arg(dir.path().join("missing.dat"));
    cmd.assert().failure().code(1);
    Ok(())
}

#[test]
fn replay_converted_capture() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let dataset = dir.path().join("flows.dat");
    let capture = dir.path().join("flows.pcap");
    let profile = dir.path().join("profile.toml");
    let report = dir.path().join("report.json");
    sample_dataset(&dataset);
    fs::write(
        &profile,
        "[engine]\npin_threads = false\n\n[lifecycle]\nsilence_timeout = \"200ms\"\n",
    )?;

    let mut cmd = Command::cargo_bin("flowrig")?;
    cmd.arg("convert")
        .arg("-d")
        .arg(&dataset)
        .arg("-l")
        .arg("128")
        .arg("-o")
        .arg(&capture)
        .arg("--keep-other-protocols");
    cmd.assert().success();

    let mut cmd = Command::cargo_bin("flowrig")?;
    cmd.arg("--config")
        .arg(&profile)
        .arg("receive")
        .arg("--pcap")
        .arg(&capture)
        .arg("-m")
        .arg("latency")
        .arg("--report")
        .arg(&report);
    cmd.assert().success();

    let report: serde_json::Value = serde_json::from_reader(File::open(&report)?)?;
    assert_eq!(report["summary"]["packets"], 4);
    assert_eq!(report["summary"]["bytes"], 4 * 128);
    assert_eq!(report["summary"]["malformed"], 0);
    Ok(())
}

#[test]
fn count_single_seed() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("capture.bin");
    let table = dir.path().join("table.bin");
    random_capture(&input, 1000);

    let mut cmd = Command::cargo_bin("flowrig")?;
    cmd.arg("count")
        .arg("-i")
        .arg(&input)
        .arg("-s")
        .arg("7")
        .arg("-o")
        .arg(&table)
        .arg("-j")
        .arg("3");
    cmd.assert().success();
    assert_eq!(table_sum(&table), 1000);

    // same seed, same table
    let again = dir.path().join("again.bin");
    let mut cmd = Command::cargo_bin("flowrig")?;
    cmd.arg("count")
        .arg("-i")
        .arg(&input)
        .arg("-s")
        .arg("7")
        .arg("-o")
        .arg(&again);
    cmd.assert().success();
    assert_eq!(fs::read(&table)?, fs::read(&again)?);
    Ok(())
}

#[test]
fn count_seed_range() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("capture.bin");
    let out_dir = dir.path().join("tables");
    random_capture(&input, 200);

    let mut cmd = Command::cargo_bin("flowrig")?;
    cmd.arg("count")
        .arg("-i")
        .arg(&input)
        .arg("-d")
        .arg(&out_dir)
        .arg("--start-seed")
        .arg("3")
        .arg("--end-seed")
        .arg("6");
    cmd.assert().success();
    for seed in 3..6 {
        assert_eq!(table_sum(&out_dir.join(format!("{seed}.bin"))), 200);
    }
    assert!(!out_dir.join("6.bin").exists());
    assert_ne!(
        fs::read(out_dir.join("3.bin"))?,
        fs::read(out_dir.join("4.bin"))?
    );
    Ok(())
}

#[test]
fn zero_workers_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let dataset = dir.path().join("flows.dat");
    let input = dir.path().join("capture.bin");
    let table = dir.path().join("table.bin");
    sample_dataset(&dataset);
    random_capture(&input, 10);

    let mut send = Command::cargo_bin("flowrig")?;
    send.arg("send").arg("-i").arg("lo").arg("-d").arg(&dataset);
    let mut receive = Command::cargo_bin("flowrig")?;
    receive.arg("receive").arg("-i").arg("lo");
    let mut count = Command::cargo_bin("flowrig")?;
    count.arg("count").arg("-i").arg(&input).arg("-s").arg("1").arg("-o").arg(&table);
    let mut batch = Command::cargo_bin("flowrig")?;
    batch.arg("count").arg("-i").arg(&input).arg("-d").arg(dir.path().join("tables"));

    for mut cmd in [send, receive, count, batch] {
        let output = cmd.arg("-j").arg("0").output()?;
        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("worker count must be at least 1"), "{stderr}");
    }
    assert!(!table.exists());
    assert!(!dir.path().join("tables").exists());
    Ok(())
}
