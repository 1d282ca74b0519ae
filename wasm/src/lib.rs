use wasm_bindgen::prelude::*;
use ultrafsk_core::{
    validate, AudioBuffer, CipherKey, DecodingSettings, Decoder, EncodingSettings, Encoder,
    SignalMonitor,
};

fn to_js(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

fn parse_settings<T: serde::de::DeserializeOwned + Default>(json: Option<String>) -> Result<T, JsValue> {
    match json {
        Some(json) if !json.trim().is_empty() => serde_json::from_str(&json).map_err(to_js),
        _ => Ok(T::default()),
    }
}

fn parse_key(key: Option<Vec<u8>>) -> Result<Option<CipherKey>, JsValue> {
    key.map(CipherKey::new).transpose().map_err(to_js)
}

#[wasm_bindgen]
pub struct WasmEncoder {
    inner: Encoder,
}

#[wasm_bindgen]
impl WasmEncoder {
    /// Takes encoding settings as JSON (defaults when empty) and an optional raw
    /// AES key, which enables encryption.
    #[wasm_bindgen(constructor)]
    pub fn new(settings_json: Option<String>, key: Option<Vec<u8>>) -> Result<WasmEncoder, JsValue> {
        let mut settings: EncodingSettings = parse_settings(settings_json)?;
        if let Some(key) = parse_key(key)? {
            settings.encryption_key = Some(key);
            settings.encryption_enabled = true;
        }
        Encoder::new(settings)
            .map(|encoder| WasmEncoder { inner: encoder })
            .map_err(to_js)
    }

    /// Embed data into mono host samples.
    /// Takes a Uint8Array and a Float32Array and returns the mixed Float32Array
    #[wasm_bindgen]
    pub fn encode(&self, data: &[u8], host: &[f32], sample_rate: u32) -> Result<Vec<f32>, JsValue> {
        let host = AudioBuffer::mono(host.to_vec(), sample_rate);
        self.inner
            .encode(data, &host)
            .map(|embedded| embedded.audio.into_samples())
            .map_err(to_js)
    }

    /// Seconds of host audio needed for `len` payload bytes.
    #[wasm_bindgen(js_name = requiredDuration)]
    pub fn required_duration(&self, len: usize, sample_rate: u32) -> f32 {
        self.inner.required_duration(len, sample_rate)
    }
}

#[wasm_bindgen]
pub struct WasmDecoder {
    inner: Decoder,
}

#[wasm_bindgen]
impl WasmDecoder {
    #[wasm_bindgen(constructor)]
    pub fn new(settings_json: Option<String>, key: Option<Vec<u8>>) -> Result<WasmDecoder, JsValue> {
        let mut settings: DecodingSettings = parse_settings(settings_json)?;
        settings.decryption_key = parse_key(key)?;
        Decoder::new(settings)
            .map(|decoder| WasmDecoder { inner: decoder })
            .map_err(to_js)
    }

    /// Decode mono samples. Returns the region results as a JSON array
    #[wasm_bindgen]
    pub fn decode(&self, samples: &[f32], sample_rate: u32) -> Result<String, JsValue> {
        let audio = AudioBuffer::mono(samples.to_vec(), sample_rate);
        let results = self.inner.decode(&audio).map_err(to_js)?;
        serde_json::to_string(&results).map_err(to_js)
    }

    #[wasm_bindgen(js_name = signalStrength)]
    pub fn signal_strength(&self, samples: &[f32], sample_rate: u32) -> Result<f32, JsValue> {
        let audio = AudioBuffer::mono(samples.to_vec(), sample_rate);
        self.inner.signal_strength(&audio).map_err(to_js)
    }

    /// Signal strength, format and decode results as one JSON object
    #[wasm_bindgen]
    pub fn analyze(&self, samples: &[f32], sample_rate: u32) -> Result<String, JsValue> {
        let audio = AudioBuffer::mono(samples.to_vec(), sample_rate);
        let report = self.inner.analyze(&audio).map_err(to_js)?;
        serde_json::to_string(&report).map_err(to_js)
    }
}

/// Carrier-band level meter for microphone chunks.
#[wasm_bindgen]
pub struct WasmSignalMonitor {
    inner: SignalMonitor,
}

#[wasm_bindgen]
impl WasmSignalMonitor {
    #[wasm_bindgen(constructor)]
    pub fn new(settings_json: Option<String>, sample_rate: u32) -> Result<WasmSignalMonitor, JsValue> {
        let settings: DecodingSettings = parse_settings(settings_json)?;
        let issues = settings.validate_for(sample_rate);
        if !issues.is_empty() {
            return Err(JsValue::from_str(&serde_json::to_string(&issues).map_err(to_js)?));
        }
        Ok(WasmSignalMonitor {
            inner: SignalMonitor::new(&settings, sample_rate),
        })
    }

    /// Push a chunk and get the level of each window it completed
    #[wasm_bindgen]
    pub fn push(&mut self, chunk: &[f32]) -> Result<Vec<f32>, JsValue> {
        self.inner.push(chunk).map_err(to_js)
    }

    #[wasm_bindgen]
    pub fn strength(&self) -> f32 {
        self.inner.strength()
    }
}

/// Validate encoding (`decoding == false`) or decoding settings JSON and return
/// the issues as a JSON array.
#[wasm_bindgen(js_name = validateSettings)]
pub fn validate_settings(settings_json: &str, decoding: bool) -> Result<String, JsValue> {
    let issues = if decoding {
        validate(&parse_settings::<DecodingSettings>(Some(settings_json.to_string()))?)
    } else {
        validate(&parse_settings::<EncodingSettings>(Some(settings_json.to_string()))?)
    };
    serde_json::to_string(&issues).map_err(to_js)
}

/// Random raw key of 16, 24 or 32 bytes.
#[wasm_bindgen(js_name = generateKey)]
pub fn generate_key(len: usize) -> Result<Vec<u8>, JsValue> {
    CipherKey::generate(len)
        .map(|key| key.as_bytes().to_vec())
        .map_err(to_js)
}
