use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

fn run_ultrafsk(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ultrafsk"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute ultrafsk")
}

fn text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string() + &String::from_utf8_lossy(&output.stdout)
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

#[test]
fn test_encode_then_decode_to_file() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("message.txt");
    let encoded = dir.path().join("message.wav");
    let decoded = dir.path().join("decoded.bin");
    fs::write(&input, "status:ok\n").unwrap();

    let output = run_ultrafsk(&["encode", path_str(&input), path_str(&encoded), "--amplitude", "0.3"]);
    assert!(output.status.success(), "encode failed: {}", text(&output));
    assert!(encoded.exists(), "Output file was not created");

    let size = fs::metadata(&encoded).unwrap().len();
    assert!(size > 200_000, "File too small: {} bytes", size);

    let output = run_ultrafsk(&["decode", path_str(&encoded), path_str(&decoded)]);
    assert!(output.status.success(), "decode failed: {}", text(&output));
    assert_eq!(fs::read(&decoded).unwrap(), b"status:ok\n");
}

#[test]
fn test_encrypted_round_trip_with_generated_key() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("secret.txt");
    let encoded = dir.path().join("secret.wav");
    fs::write(&input, "k1").unwrap();

    let output = run_ultrafsk(&["keygen"]);
    assert!(output.status.success());
    let key = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert_eq!(key.len(), 24, "128-bit key in base64");

    let output = run_ultrafsk(&["encode", path_str(&input), path_str(&encoded), "--key", &key]);
    assert!(output.status.success(), "encode failed: {}", text(&output));

    let output = run_ultrafsk(&["decode", path_str(&encoded), "--key", &key]);
    assert!(output.status.success(), "decode failed: {}", text(&output));
    assert_eq!(output.stdout, b"k1");

    let output = run_ultrafsk(&["decode", path_str(&encoded)]);
    assert!(!output.status.success());
    assert!(text(&output).contains("decryption failed"), "got: {}", text(&output));
}

#[test]
fn test_decode_json_output() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("json.txt");
    let encoded = dir.path().join("json.wav");
    fs::write(&input, "hello").unwrap();

    let output = run_ultrafsk(&[
        "encode",
        path_str(&input),
        path_str(&encoded),
        "--error-correction",
        "advanced",
    ]);
    assert!(output.status.success(), "encode failed: {}", text(&output));

    let output = run_ultrafsk(&["decode", path_str(&encoded), "--json"]);
    assert!(output.status.success(), "decode failed: {}", text(&output));
    let results: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    let first = &results[0];
    assert_eq!(first["message"], serde_json::json!(b"hello".to_vec()));
    assert_eq!(first["metadata"]["errorCorrectionLevel"], "advanced");
    assert!(first["confidence"].as_f64().unwrap() > 0.5);
}

#[test]
fn test_host_too_short_is_rejected() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("long.txt");
    let host = dir.path().join("host.wav");
    let encoded = dir.path().join("out.wav");
    fs::write(&input, "this message does not fit").unwrap();

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&host, spec).unwrap();
    for _ in 0..44_100 {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();

    let output = run_ultrafsk(&[
        "encode",
        path_str(&input),
        path_str(&encoded),
        "--host",
        path_str(&host),
    ]);
    assert!(!output.status.success());
    assert!(text(&output).contains("capacity exceeded"), "got: {}", text(&output));
    assert!(!encoded.exists());
}

#[test]
fn test_validate_reports_issues() {
    let dir = tempdir().unwrap();
    let good = dir.path().join("good.json");
    let bad = dir.path().join("bad.json");
    fs::write(&good, r#"{"amplitude": 0.2, "errorCorrectionLevel": "basic", "redundancyFactor": 5}"#).unwrap();
    fs::write(&bad, r#"{"amplitude": 3.0, "toneCount": 3}"#).unwrap();

    let output = run_ultrafsk(&["validate", path_str(&good)]);
    assert!(output.status.success(), "got: {}", text(&output));

    let output = run_ultrafsk(&["validate", path_str(&bad)]);
    assert!(!output.status.success());
    let report = text(&output);
    assert!(report.contains("amplitude"), "got: {}", report);
    assert!(report.contains("toneCount"), "got: {}", report);

    let output = run_ultrafsk(&["validate", path_str(&good), "--sample-rate", "22050"]);
    assert!(!output.status.success());
    assert!(text(&output).contains("sampleRate"));
}

#[test]
fn test_obfuscated_round_trip_with_192_bit_key() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("padded.txt");
    let encoded = dir.path().join("padded.wav");
    fs::write(&input, "k1").unwrap();

    let output = run_ultrafsk(&["keygen", "--bits", "192"]);
    assert!(output.status.success(), "keygen failed: {}", text(&output));
    let key = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert_eq!(key.len(), 32, "192-bit key in base64");

    let output = run_ultrafsk(&[
        "encode",
        path_str(&input),
        path_str(&encoded),
        "--key",
        &key,
        "--obfuscate",
    ]);
    assert!(output.status.success(), "encode failed: {}", text(&output));

    let output = run_ultrafsk(&["decode", path_str(&encoded), "--key", &key]);
    assert!(output.status.success(), "decode failed: {}", text(&output));
    assert_eq!(output.stdout, b"k1");
}

#[test]
fn test_analyze_reports_signal() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("analyze.txt");
    let encoded = dir.path().join("analyze.wav");
    fs::write(&input, "status:ok\n").unwrap();

    let output = run_ultrafsk(&["encode", path_str(&input), path_str(&encoded), "--amplitude", "0.3"]);
    assert!(output.status.success(), "encode failed: {}", text(&output));

    let output = run_ultrafsk(&["analyze", path_str(&encoded)]);
    assert!(output.status.success(), "analyze failed: {}", text(&output));
    let report = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(report.contains("Sample rate:     44100 Hz"), "got: {}", report);
    assert!(report.contains("Carrier found:   yes"), "got: {}", report);
    assert!(report.contains("\"status:ok\\n\""), "got: {}", report);

    let output = run_ultrafsk(&["analyze", path_str(&encoded), "--json"]);
    assert!(output.status.success(), "analyze failed: {}", text(&output));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(report["hasSignal"], true);
    assert_eq!(report["decoded"], true);
    assert_eq!(report["channels"], 1);
    assert!(report["signalStrength"].as_f64().unwrap() > 0.0);
}

#[test]
fn test_analyze_silence_has_no_signal() {
    let dir = tempdir().unwrap();
    let host = dir.path().join("silence.wav");
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 48_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&host, spec).unwrap();
    for _ in 0..2 * 48_000 {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();

    let output = run_ultrafsk(&["analyze", path_str(&host), "--json"]);
    assert!(output.status.success(), "analyze failed: {}", text(&output));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(report["hasSignal"], false);
    assert_eq!(report["decoded"], false);
    assert_eq!(report["sampleRate"], 48_000);
    assert_eq!(report["channels"], 2);
    assert!((report["durationSecs"].as_f64().unwrap() - 1.0).abs() < 1e-3);
}
