use ultrafsk_core::{decode, encode, AudioBuffer, DecodingSettings, EncodingSettings};

const SAMPLE_RATE: u32 = 44_100;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn carrier_at(offset_ms: f32, host_secs: f32, message: &[u8]) -> AudioBuffer {
    let settings = EncodingSettings {
        amplitude: 0.3,
        embed_offset_ms: offset_ms,
        ..Default::default()
    };
    let host = AudioBuffer::silence(host_secs, SAMPLE_RATE, 1);
    encode(message, &host, &settings)
        .expect("Failed to encode")
        .audio
}

/// Linear-interpolation resampling by `ratio`, simulating a clock mismatch
/// between the playing and recording devices.
fn resample(audio: &AudioBuffer, ratio: f64) -> AudioBuffer {
    let input = audio.samples();
    let len = (input.len() as f64 / ratio) as usize;
    let output = (0..len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = position as usize;
            let frac = (position - index as f64) as f32;
            let a = input[index.min(input.len() - 1)];
            let b = input[(index + 1).min(input.len() - 1)];
            a + (b - a) * frac
        })
        .collect();
    AudioBuffer::mono(output, audio.sample_rate())
}

#[test]
fn test_detects_carrier_at_various_offsets() {
    init_logging();
    for offset_ms in [0.0, 13.0, 250.0, 1_337.0] {
        let audio = carrier_at(offset_ms, 4.5, b"sync");
        let results = decode(&audio, &DecodingSettings::default()).expect("Failed to decode");
        assert_eq!(results.len(), 1, "offset {offset_ms} ms");

        let result = &results[0];
        assert_eq!(result.message_str(), Some("sync"), "offset {offset_ms} ms");
        let expected = offset_ms / 1000.0;
        let error = (result.detected_region.start_time - expected).abs();
        assert!(
            error < 32.0 / SAMPLE_RATE as f32,
            "offset {offset_ms} ms detected at {} s",
            result.detected_region.start_time
        );
    }
}

#[test]
fn test_survives_clock_drift() {
    init_logging();
    let audio = carrier_at(100.0, 3.5, b"status:ok\n");
    for ratio in [1.0002, 0.9998] {
        let drifted = resample(&audio, ratio);
        let results = decode(&drifted, &DecodingSettings::default()).expect("Failed to decode");
        assert_eq!(results.len(), 1, "ratio {ratio}");
        assert_eq!(results[0].message_str(), Some("status:ok\n"), "ratio {ratio}");
    }
}

#[test]
fn test_truncated_carrier_reports_failure() {
    let audio = carrier_at(0.0, 3.0, b"status:ok\n");
    // Keep the preamble and the first half of the data symbols.
    let keep = 30 * 2205;
    let truncated = AudioBuffer::mono(audio.samples()[..keep].to_vec(), SAMPLE_RATE);

    let results = decode(&truncated, &DecodingSettings::default()).expect("Failed to decode");
    assert_eq!(results.len(), 1);
    assert!(results[0].message.is_none());
    assert!(results[0].failure.is_some());
}
