//! # Whisper Speech Recognition
//!
//! Loads a Whisper model with Candle and exposes it as per-session recognizers.
//!
//! ## Model Loading Process:
//! 1. Download model files from HuggingFace if not cached locally
//! 2. Load configuration, tokenizer and safetensors weights
//! 3. Compute the mel filter bank and the token suppression mask
//! 4. Resolve the prompt tokens (start of transcript, language, task, no timestamps)
//!
//! ## Sharing:
//! Weight tensors are reference counted, so cloning a `SpeechModel` is cheap. Tokenizer,
//! filters and prompt are read-only and shared behind one `Arc`. Every connection's
//! `WhisperRecognizer` owns its own clone (with its own decoder cache), so sessions decode
//! in parallel without any lock between them.

use crate::config::{EndpointConfig, SpeechConfig};
use crate::error::RecognitionError;
use crate::speech::endpoint::{Endpointer, Utterance};
use crate::speech::{Recognizer, RecognizerFactory};
use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Sample rate of the PCM Whisper consumes.
pub const SAMPLE_RATE: u32 = m::SAMPLE_RATE as u32;

/// Probability of the no-speech token above which an utterance is treated as noise.
const NO_SPEECH_THRESHOLD: f32 = 0.6;

/// Available Whisper model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// Get the HuggingFace model repository name.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Where inference runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    /// CUDA when available, CPU otherwise
    Auto,
    Cpu,
    /// CUDA device 0; falls back to CPU with a warning
    Cuda,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            _ => Err(anyhow!("Unknown device preference: {}", s)),
        }
    }
}

impl DevicePreference {
    pub fn device(self) -> Device {
        match self {
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Auto => Device::cuda_if_available(0).unwrap_or(Device::Cpu),
            DevicePreference::Cuda => Device::new_cuda(0).unwrap_or_else(|e| {
                tracing::warn!("CUDA not available ({}), using CPU for inference", e);
                Device::Cpu
            }),
        }
    }
}

/// Read-only parts of a loaded model.
struct ModelAssets {
    config: Config,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    suppress: Tensor,
    prompt: Vec<u32>,
    eot_token: u32,
    no_speech_token: Option<u32>,
    device: Device,
}

/// A loaded Whisper model; clones share the weights.
#[derive(Clone)]
pub struct SpeechModel {
    assets: Arc<ModelAssets>,
    whisper: m::model::Whisper,
    size: ModelSize,
}

impl SpeechModel {
    /// Download (or reuse the cached copy of) the configured model and load it.
    ///
    /// ## Environment:
    /// - `HF_TOKEN`: optional HuggingFace token
    /// - `HF_HUB_CACHE` / `HF_HOME`: cache location
    pub async fn load(config: &SpeechConfig) -> Result<Self> {
        let size = config.model_size()?;
        let device = config.device_preference()?.device();
        tracing::info!("Loading Whisper {} model on {:?}...", size, device);
        let start_time = std::time::Instant::now();

        let (config_file, tokenizer_file, weights_file) = fetch_model_files(size).await?;

        let model_config: Config = serde_json::from_reader(std::fs::File::open(config_file)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], m::DTYPE, &device)? };
        let whisper = m::model::Whisper::load(&vb, model_config.clone())?;

        let language_token = format!("<|{}|>", config.language.to_lowercase());
        let prompt = vec![
            token_id(&tokenizer, m::SOT_TOKEN)?,
            token_id(&tokenizer, &language_token)?,
            token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
        ];
        let eot_token = token_id(&tokenizer, m::EOT_TOKEN)?;
        let no_speech_token = m::NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| tokenizer.token_to_id(token));

        let suppress: Vec<f32> = (0..model_config.vocab_size as u32)
            .map(|id| {
                if model_config.suppress_tokens.contains(&id) {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress = Tensor::new(suppress.as_slice(), &device)?;
        let mel_filters = mel_filter_bank(model_config.num_mel_bins, m::N_FFT, SAMPLE_RATE);

        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            assets: Arc::new(ModelAssets {
                config: model_config,
                tokenizer,
                mel_filters,
                suppress,
                prompt,
                eot_token,
                no_speech_token,
                device,
            }),
            whisper,
            size,
        })
    }

    pub fn size(&self) -> ModelSize {
        self.size
    }

    /// Greedy transcription of one utterance (at most 30s of 16kHz mono samples).
    pub fn transcribe(&mut self, samples: &[f32]) -> Result<String, RecognitionError> {
        let assets = &*self.assets;
        let model = &mut self.whisper;
        let n_mels = assets.config.num_mel_bins;

        let mel = m::audio::pcm_to_mel(&assets.config, samples, &assets.mel_filters);
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &assets.device)?
            .narrow(2, 0, frames.min(m::N_FRAMES))?;

        let features = model.encoder.forward(&mel, true)?;

        let mut tokens = assets.prompt.clone();
        let mut text_tokens = Vec::new();
        for i in 0..assets.config.max_target_positions / 2 {
            let input = Tensor::new(tokens.as_slice(), &assets.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&input, &features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;

            if i == 0 {
                if let Some(no_speech) = assets.no_speech_token {
                    let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
                    let no_speech_prob = probs.i(no_speech as usize)?.to_scalar::<f32>()?;
                    if no_speech_prob > NO_SPEECH_THRESHOLD {
                        tracing::debug!("Utterance skipped, no-speech probability {:.2}", no_speech_prob);
                        return Ok(String::new());
                    }
                }
            }

            let next = logits
                .broadcast_add(&assets.suppress)?
                .argmax(D::Minus1)?
                .to_scalar::<u32>()?;
            if next == assets.eot_token {
                break;
            }
            tokens.push(next);
            text_tokens.push(next);
        }

        let text = assets
            .tokenizer
            .decode(&text_tokens, true)
            .map_err(|e| RecognitionError::Engine(format!("tokenizer decode error: {e}")))?;
        Ok(text.trim().to_string())
    }
}

async fn fetch_model_files(size: ModelSize) -> Result<(PathBuf, PathBuf, PathBuf)> {
    use hf_hub::api::tokio::ApiBuilder;

    let mut builder = ApiBuilder::new().with_progress(false);
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
        builder = builder.with_cache_dir(cache_dir.into());
    } else if let Ok(hf_home) = std::env::var("HF_HOME") {
        builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
    }
    let api = builder.build()?;

    let repo = api.model(size.repo_name().to_string());
    let fetch = |name: &'static str| {
        let repo = &repo;
        async move {
            repo.get(name)
                .await
                .map_err(|e| anyhow!("Failed to download {} from {}: {}", name, size.repo_name(), e))
        }
    };

    Ok((
        fetch("config.json").await?,
        fetch("tokenizer.json").await?,
        fetch("model.safetensors").await?,
    ))
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("Tokenizer has no id for {}", token))
}

/// Slaney-style mel filter bank, `n_mels` rows of `n_fft / 2 + 1` weights.
fn mel_filter_bank(n_mels: usize, n_fft: usize, sample_rate: u32) -> Vec<f32> {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let log_step = 6.4f64.ln() / 27.0;

    let hz_to_mel = |hz: f64| {
        if hz >= MIN_LOG_HZ {
            min_log_mel + (hz / MIN_LOG_HZ).ln() / log_step
        } else {
            hz / F_SP
        }
    };
    let mel_to_hz = |mel: f64| {
        if mel >= min_log_mel {
            MIN_LOG_HZ * (log_step * (mel - min_log_mel)).exp()
        } else {
            mel * F_SP
        }
    };

    let n_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;
    let max_mel = hz_to_mel(nyquist);
    let edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_bins];
    for mel in 0..n_mels {
        let (lower, center, upper) = (edges[mel], edges[mel + 1], edges[mel + 2]);
        let norm = 2.0 / (upper - lower);
        for bin in 0..n_bins {
            let freq = bin as f64 * sample_rate as f64 / n_fft as f64;
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[mel * n_bins + bin] = (weight * norm) as f32;
        }
    }
    filters
}

/// Little-endian 16-bit PCM reader that keeps an odd trailing byte for the next input.
#[derive(Debug, Default)]
struct PcmReader {
    carry: Option<u8>,
}

impl PcmReader {
    fn read(&mut self, pcm: &[u8]) -> Vec<f32> {
        let mut bytes = Vec::with_capacity(pcm.len() + 1);
        bytes.extend(self.carry.take());
        bytes.extend_from_slice(pcm);
        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }

        let mut cursor = Cursor::new(bytes.as_slice());
        let mut samples = Vec::with_capacity(bytes.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(f32::from(sample) / 32768.0);
        }
        samples
    }
}

/// Transcribe every utterance the endpointer closes on `samples`; non-empty texts are joined.
fn transcribe_closed<F>(
    endpointer: &mut Endpointer,
    samples: &[f32],
    mut transcribe: F,
) -> Result<Option<String>, RecognitionError>
where
    F: FnMut(&Utterance) -> Result<String, RecognitionError>,
{
    let mut texts = Vec::new();
    for utterance in endpointer.push(samples) {
        let text = transcribe(&utterance)?;
        if !text.is_empty() {
            texts.push(text);
        }
    }
    Ok((!texts.is_empty()).then(|| texts.join(" ")))
}

/// Recognizer bound to one connection.
pub struct WhisperRecognizer {
    model: SpeechModel,
    endpointer: Endpointer,
    pcm: PcmReader,
}

impl Recognizer for WhisperRecognizer {
    fn accept_waveform(&mut self, pcm: &[u8]) -> Result<Option<String>, RecognitionError> {
        let samples = self.pcm.read(pcm);
        let model = &mut self.model;

        transcribe_closed(&mut self.endpointer, &samples, |utterance| {
            let start = std::time::Instant::now();
            let text = model.transcribe(&utterance.samples)?;
            tracing::debug!(
                "Transcribed {:.2}s utterance ({:?}) in {}ms: '{}'",
                utterance.samples.len() as f64 / SAMPLE_RATE as f64,
                utterance.reason,
                start.elapsed().as_millis(),
                text
            );
            Ok(text)
        })
    }
}

/// Hands every new connection its own recognizer and model clone.
pub struct WhisperRecognizerFactory {
    model: SpeechModel,
    endpointing: EndpointConfig,
}

impl WhisperRecognizerFactory {
    pub fn new(model: SpeechModel, endpointing: EndpointConfig) -> Self {
        Self { model, endpointing }
    }
}

impl RecognizerFactory for WhisperRecognizerFactory {
    fn create(&self) -> Result<Box<dyn Recognizer>, RecognitionError> {
        Ok(Box::new(WhisperRecognizer {
            model: self.model.clone(),
            endpointer: Endpointer::new(&self.endpointing, SAMPLE_RATE),
            pcm: PcmReader::default(),
        }))
    }
}
