mod error;
mod wav;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use ultrafsk_core::{
    validate, AudioBuffer, CipherKey, DecodingSettings, Decoder, DetectionSensitivity,
    EncodingSettings, Encoder, ErrorCorrectionLevel, ValidationIssue,
};

use crate::error::CliError;
use crate::wav::{read_wav, write_wav, WavFormat};

/// Silence appended after the carrier when no host file is given.
const GENERATED_HOST_TAIL_SECS: f32 = 0.25;

#[derive(Parser)]
#[command(name = "ultrafsk")]
#[command(about = "Hide short messages in audio as near-ultrasonic FSK tones")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed a binary file into a WAV file
    Encode {
        /// Input binary file
        #[arg(value_name = "INPUT.BIN")]
        input: PathBuf,

        /// Output WAV file
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,

        /// Host WAV file; silence is generated when omitted
        #[arg(long, value_name = "HOST.WAV")]
        host: Option<PathBuf>,

        /// Sample rate of the generated host
        #[arg(long, default_value_t = 44_100)]
        sample_rate: u32,

        #[command(flatten)]
        options: EncodeOptions,
    },

    /// Extract messages from a WAV file
    Decode {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Write the first recovered message here instead of stdout
        #[arg(value_name = "OUTPUT.BIN")]
        output: Option<PathBuf>,

        /// Print every region result as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        options: DecodeOptions,
    },

    /// Report signal strength and format of a WAV file and try to decode it
    Analyze {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        options: DecodeOptions,
    },

    /// Check a settings file without encoding or decoding
    Validate {
        /// JSON settings file
        #[arg(value_name = "SETTINGS.JSON")]
        settings: PathBuf,

        /// Which settings the file holds
        #[arg(long, value_enum, default_value_t = SettingsKind::Encoding)]
        kind: SettingsKind,

        /// Also check constraints that depend on this sample rate
        #[arg(long)]
        sample_rate: Option<u32>,
    },

    /// Print a random base64 key
    Keygen {
        /// Key size in bits: 128, 192 or 256
        #[arg(long, default_value_t = 128)]
        bits: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SettingsKind {
    Encoding,
    Decoding,
}

#[derive(Clone, Copy, ValueEnum)]
enum EcArg {
    None,
    Basic,
    Advanced,
}

impl From<EcArg> for ErrorCorrectionLevel {
    fn from(arg: EcArg) -> Self {
        match arg {
            EcArg::None => ErrorCorrectionLevel::None,
            EcArg::Basic => ErrorCorrectionLevel::Basic,
            EcArg::Advanced => ErrorCorrectionLevel::Advanced,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SensitivityArg {
    Low,
    Medium,
    High,
}

impl From<SensitivityArg> for DetectionSensitivity {
    fn from(arg: SensitivityArg) -> Self {
        match arg {
            SensitivityArg::Low => DetectionSensitivity::Low,
            SensitivityArg::Medium => DetectionSensitivity::Medium,
            SensitivityArg::High => DetectionSensitivity::High,
        }
    }
}

#[derive(Args)]
struct EncodeOptions {
    /// JSON encoding settings; flags below override it
    #[arg(long, value_name = "SETTINGS.JSON")]
    settings: Option<PathBuf>,

    /// Carrier amplitude relative to full scale
    #[arg(long)]
    amplitude: Option<f32>,

    #[arg(long, value_enum)]
    error_correction: Option<EcArg>,

    /// Copies per bit for basic error correction (3, 5 or 7)
    #[arg(long)]
    redundancy: Option<u8>,

    /// DEFLATE level, 0 to disable
    #[arg(long)]
    compress: Option<u32>,

    /// Where the carrier starts in the host, in milliseconds
    #[arg(long)]
    offset_ms: Option<f32>,

    /// Base64 AES key (16, 24 or 32 bytes); enables encryption
    #[arg(long)]
    key: Option<String>,

    /// Prefix the encrypted payload with random padding
    #[arg(long, requires = "key")]
    obfuscate: bool,

    /// Write 32-bit float samples instead of the host's format
    #[arg(long)]
    float: bool,
}

#[derive(Args)]
struct DecodeOptions {
    /// JSON decoding settings; flags below override it
    #[arg(long, value_name = "SETTINGS.JSON")]
    settings: Option<PathBuf>,

    #[arg(long, value_enum)]
    sensitivity: Option<SensitivityArg>,

    /// Minimum preamble correlation for a region to count
    #[arg(long)]
    min_strength: Option<f32>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Base64 AES key used for encrypted frames
    #[arg(long)]
    key: Option<String>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ultrafsk=info,ultrafsk_core=warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Encode {
            input,
            output,
            host,
            sample_rate,
            options,
        } => encode_command(&input, &output, host.as_deref(), sample_rate, options),
        Commands::Decode {
            input,
            output,
            json,
            options,
        } => decode_command(&input, output.as_deref(), json, options),
        Commands::Analyze {
            input,
            json,
            options,
        } => analyze_command(&input, json, options),
        Commands::Validate {
            settings,
            kind,
            sample_rate,
        } => validate_command(&settings, kind, sample_rate),
        Commands::Keygen { bits } => keygen_command(bits),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_settings<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T, CliError> {
    match path {
        Some(path) => Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        None => Ok(T::default()),
    }
}

fn parse_key(encoded: &str) -> Result<CipherKey, CliError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(CipherKey::new(bytes)?)
}

fn encoding_settings(options: &EncodeOptions) -> Result<EncodingSettings, CliError> {
    let mut settings: EncodingSettings = load_settings(options.settings.as_deref())?;
    if let Some(amplitude) = options.amplitude {
        settings.amplitude = amplitude;
    }
    if let Some(level) = options.error_correction {
        settings.error_correction_level = level.into();
    }
    if let Some(redundancy) = options.redundancy {
        settings.redundancy_factor = redundancy;
    }
    if let Some(level) = options.compress {
        settings.compression_level = level;
    }
    if let Some(offset) = options.offset_ms {
        settings.embed_offset_ms = offset;
    }
    if let Some(key) = &options.key {
        settings.encryption_key = Some(parse_key(key)?);
        settings.encryption_enabled = true;
    }
    if options.obfuscate {
        settings.obfuscate = true;
    }
    Ok(settings)
}

fn decoding_settings(options: &DecodeOptions) -> Result<DecodingSettings, CliError> {
    let mut settings: DecodingSettings = load_settings(options.settings.as_deref())?;
    if let Some(sensitivity) = options.sensitivity {
        settings.detection_sensitivity = sensitivity.into();
    }
    if let Some(strength) = options.min_strength {
        settings.min_signal_strength = strength;
    }
    if let Some(retries) = options.max_retries {
        settings.max_retries = retries;
    }
    if let Some(key) = &options.key {
        settings.decryption_key = Some(parse_key(key)?);
    }
    Ok(settings)
}

fn encode_command(
    input_path: &Path,
    output_path: &Path,
    host_path: Option<&Path>,
    sample_rate: u32,
    options: EncodeOptions,
) -> Result<(), CliError> {
    let data = std::fs::read(input_path)?;
    info!("read {} bytes from {}", data.len(), input_path.display());

    let encoder = Encoder::new(encoding_settings(&options)?)?;
    let (host, format) = match host_path {
        Some(path) => read_wav(path)?,
        None => {
            let duration =
                encoder.required_duration(data.len(), sample_rate) + GENERATED_HOST_TAIL_SECS;
            debug!("generating {duration:.2} s of silence at {sample_rate} Hz");
            (
                AudioBuffer::silence(duration, sample_rate, 1),
                WavFormat::default(),
            )
        }
    };
    let format = if options.float { WavFormat::Float } else { format };

    let embedded = encoder.encode(&data, &host)?;
    for warning in &embedded.warnings {
        warn!("{warning}");
    }
    info!(
        "embedded {} symbols from {:.3} s to {:.3} s",
        embedded.symbol_count, embedded.start_time, embedded.end_time
    );

    let clamped = write_wav(output_path, &embedded.audio, format)?;
    if clamped > 0 {
        warn!("{clamped} samples clamped to full scale in {}", output_path.display());
    }
    println!(
        "Encoded {} bytes into {}",
        data.len(),
        output_path.display()
    );
    Ok(())
}

fn decode_command(
    input_path: &Path,
    output_path: Option<&Path>,
    json: bool,
    options: DecodeOptions,
) -> Result<(), CliError> {
    let (audio, _) = read_wav(input_path)?;
    let decoder = Decoder::new(decoding_settings(&options)?)?;
    let results = decoder.decode(&audio)?;
    info!("{} region(s) found in {}", results.len(), input_path.display());

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for (i, result) in results.iter().enumerate() {
            let region = &result.detected_region;
            match &result.failure {
                None => eprintln!(
                    "region {i}: {:.3}-{:.3} s, confidence {:.2}, {} errors corrected",
                    region.start_time, region.end_time, result.confidence, result.errors_corrected
                ),
                Some(failure) => eprintln!(
                    "region {i}: {:.3}-{:.3} s, {failure}",
                    region.start_time, region.end_time
                ),
            }
            for warning in &result.warnings {
                warn!("region {i}: {warning}");
            }
        }
    }

    let message = results
        .iter()
        .find_map(|r| r.message.as_ref())
        .ok_or(CliError::NoMessage)?;
    match output_path {
        Some(path) => {
            std::fs::write(path, message)?;
            if !json {
                println!("Decoded {} bytes into {}", message.len(), path.display());
            }
        }
        None if !json => {
            use std::io::Write;
            std::io::stdout().write_all(message)?;
        }
        None => {}
    }
    Ok(())
}

fn analyze_command(input_path: &Path, json: bool, options: DecodeOptions) -> Result<(), CliError> {
    let (audio, _) = read_wav(input_path)?;
    let decoder = Decoder::new(decoding_settings(&options)?)?;
    let report = decoder.analyze(&audio)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (low, high) = report.frequency_range;
    println!("File:            {}", input_path.display());
    println!("Duration:        {:.3} s", report.duration_secs);
    println!("Sample rate:     {} Hz", report.sample_rate);
    println!("Channels:        {}", report.channels);
    println!("Tone range:      {low:.0}-{high:.0} Hz");
    println!("Signal strength: {:.6}", report.signal_strength);
    println!("Carrier found:   {}", if report.has_signal { "yes" } else { "no" });
    for (i, result) in report.results.iter().enumerate() {
        let region = &result.detected_region;
        let outcome = match (&result.message, &result.failure) {
            (Some(message), _) => match result.message_str() {
                Some(text) => format!("{text:?}"),
                None => format!("{} bytes", message.len()),
            },
            (None, Some(failure)) => failure.to_string(),
            (None, None) => "no message".to_string(),
        };
        println!(
            "Region {i}:        {:.3}-{:.3} s, confidence {:.2}, {outcome}",
            region.start_time, region.end_time, result.confidence
        );
    }
    Ok(())
}

fn print_issues(issues: &[ValidationIssue]) {
    for issue in issues {
        println!("{issue}");
    }
}

fn validate_command(
    path: &Path,
    kind: SettingsKind,
    sample_rate: Option<u32>,
) -> Result<(), CliError> {
    let issues = match kind {
        SettingsKind::Encoding => {
            let settings: EncodingSettings = load_settings(Some(path))?;
            match sample_rate {
                Some(rate) => settings.validate_for(rate),
                None => validate(&settings),
            }
        }
        SettingsKind::Decoding => {
            let settings: DecodingSettings = load_settings(Some(path))?;
            match sample_rate {
                Some(rate) => settings.validate_for(rate),
                None => validate(&settings),
            }
        }
    };

    if issues.is_empty() {
        println!("Settings are valid");
        Ok(())
    } else {
        print_issues(&issues);
        Err(CliError::InvalidSettings(issues.len()))
    }
}

fn keygen_command(bits: usize) -> Result<(), CliError> {
    let key = CipherKey::generate(bits / 8)?;
    println!("{}", STANDARD.encode(key.as_bytes()));
    Ok(())
}
