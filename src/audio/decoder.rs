//! # Audio Normalization
//!
//! Turns one accumulated buffer of client audio into the PCM layout the recognizer
//! expects: 16-bit signed little-endian, mono, at the configured sample rate.
//!
//! ## Pipeline:
//! 1. **Probe and decode** with symphonia (WAV, MP3, FLAC, OGG, AAC, ALAC)
//! 2. **WAV fallback** with the `wav` crate when symphonia rejects the buffer
//! 3. **Downmix** every frame to a single channel by averaging
//! 4. **Resample** with rubato when the source rate differs from the target
//! 5. **Quantize** to i16 and serialize little-endian
//!
//! Buffers that match none of the known containers (for example headerless PCM)
//! produce a `DecodeError`; the session decides whether to fall back to the raw bytes.

use crate::error::DecodeError;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Cursor;

const RESAMPLE_CHUNK: usize = 1024;

/// Conversion of an opaque audio buffer to recognizer PCM.
pub trait AudioDecode: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<Vec<u8>, DecodeError>;
}

/// Container-aware decoder producing mono 16-bit PCM at `target_sample_rate`.
#[derive(Debug, Clone)]
pub struct AudioDecoder {
    target_sample_rate: u32,
}

impl AudioDecoder {
    pub fn new(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }
}

impl AudioDecode for AudioDecoder {
    fn decode(&self, raw: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }

        let (samples, sample_rate) = match decode_with_symphonia(raw) {
            Ok(decoded) => decoded,
            Err(symphonia_err) => decode_wav(raw).map_err(|wav_err| {
                DecodeError::Unsupported(format!("{symphonia_err}; WAV fallback: {wav_err}"))
            })?,
        };

        if sample_rate == 0 {
            return Err(DecodeError::MissingSampleRate);
        }
        if samples.is_empty() {
            return Err(DecodeError::NoSamples);
        }

        let mono = resample(&samples, sample_rate, self.target_sample_rate)?;
        tracing::trace!(
            "Decoded {} bytes into {} samples ({}Hz -> {}Hz)",
            raw.len(),
            mono.len(),
            sample_rate,
            self.target_sample_rate
        );
        Ok(to_pcm16(&mono))
    }
}

fn decode_with_symphonia(raw: &[u8]) -> Result<(Vec<f32>, u32), String> {
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;
    use symphonia::default::{get_codecs, get_probe};

    let source = MediaSourceStream::new(Box::new(Cursor::new(raw.to_vec())), Default::default());
    let probed = get_probe()
        .format(
            &Hint::new(),
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| format!("probe failed: {e}"))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| "no default audio track".to_string())?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| format!("no decoder for track: {e}"))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            // End of stream is reported as an I/O error.
            Err(SymphoniaError::IoError(_)) => break,
            Err(err) => return Err(format!("reading packets: {err}")),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(SymphoniaError::IoError(_)) => break,
            Err(err) => return Err(format!("decoding packet: {err}")),
        };

        if sample_rate == 0 {
            sample_rate = decoded.spec().rate;
        }
        let channels = decoded.spec().channels.count().max(1);
        append_downmixed(decoded, channels, &mut samples);
    }

    Ok((samples, sample_rate))
}

fn append_downmixed(
    decoded: symphonia::core::audio::AudioBufferRef<'_>,
    channels: usize,
    out: &mut Vec<f32>,
) {
    use symphonia::core::audio::SampleBuffer;

    let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
    buffer.copy_interleaved_ref(decoded);
    downmix_into(buffer.samples(), channels, out);
}

fn decode_wav(raw: &[u8]) -> Result<(Vec<f32>, u32), String> {
    let mut cursor = Cursor::new(raw);
    let (header, data) = wav::read(&mut cursor).map_err(|e| format!("invalid WAV: {e}"))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| (f32::from(s) - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples
            .into_iter()
            .map(|s| f32::from(s) / 32768.0)
            .collect(),
        wav::BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    let mut mono = Vec::with_capacity(interleaved.len());
    downmix_into(&interleaved, usize::from(header.channel_count.max(1)), &mut mono);
    Ok((mono, header.sampling_rate))
}

fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    for frame in interleaved.chunks(channels) {
        let sum: f32 = frame.iter().sum();
        out.push(sum / frame.len() as f32);
    }
}

/// Resample mono audio, returning exactly `len * to / from` samples.
fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>, DecodeError> {
    use rubato::{FftFixedIn, Resampler};

    if from == to {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| DecodeError::Resample(format!("resampler init failed: {e}")))?;
    let resample_err = |e: rubato::ResampleError| DecodeError::Resample(e.to_string());

    let expected = (samples.len() as u64 * u64::from(to) / u64::from(from)) as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut position = 0;
    while position + resampler.input_frames_next() <= samples.len() {
        let frames = resampler.input_frames_next();
        let chunk = resampler
            .process(&[&samples[position..position + frames]], None)
            .map_err(resample_err)?;
        output.extend_from_slice(&chunk[0]);
        position += frames;
    }
    if position < samples.len() {
        let chunk = resampler
            .process_partial(Some(&[&samples[position..]]), None)
            .map_err(resample_err)?;
        output.extend_from_slice(&chunk[0]);
    }
    // Flush the filter delay with silence.
    while output.len() < expected + delay {
        let chunk = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(resample_err)?;
        if chunk[0].is_empty() {
            break;
        }
        output.extend_from_slice(&chunk[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

fn to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = if sample.is_finite() { sample.clamp(-1.0, 1.0) } else { 0.0 };
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>((clamped * i16::MAX as f32) as i16);
    }
    bytes
}
