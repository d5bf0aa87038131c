//! # Utterance Endpointing
//!
//! Energy-based detection of utterance boundaries inside the PCM stream of one session.
//! The recognizer only runs the model when an utterance closes, which is what makes it
//! return text for some inputs and nothing for others.
//!
//! ## State Machine:
//! - **Idle**: frames are analyzed; `open_voiced_frames` consecutive voiced frames open
//!   an utterance (those frames become its onset)
//! - **In speech**: every frame is appended; the utterance closes after
//!   `close_silence_ms` of trailing silence or when it reaches `max_utterance_ms`
//!
//! Input is consumed in fixed frames of `frame_ms`; a partial trailing frame is carried
//! over to the next call, so chunk boundaries never affect the result.

use crate::config::EndpointConfig;

/// Why an utterance was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Silence,
    MaxLength,
}

/// One closed utterance, mono f32 samples at the endpointer's sample rate.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<f32>,
    pub reason: CloseReason,
}

pub struct Endpointer {
    frame_len: usize,
    frame_ms: u32,
    energy_threshold: f32,
    open_voiced_frames: usize,
    close_silence_ms: u32,
    max_utterance_len: usize,

    /// Samples that did not fill a whole frame yet
    pending: Vec<f32>,
    /// Consecutive voiced frames seen while idle
    onset: Vec<f32>,
    voiced_run: usize,
    /// Open utterance, if any
    current: Option<Vec<f32>>,
    silence_ms: u32,
}

impl Endpointer {
    pub fn new(config: &EndpointConfig, sample_rate: u32) -> Self {
        let frame_len = ((sample_rate as u64 * config.frame_ms as u64) / 1000).max(1) as usize;
        let max_utterance_len = (sample_rate as u64 * config.max_utterance_ms as u64 / 1000) as usize;

        Self {
            frame_len,
            frame_ms: config.frame_ms,
            energy_threshold: config.energy_threshold,
            open_voiced_frames: config.open_voiced_frames.max(1),
            close_silence_ms: config.close_silence_ms,
            max_utterance_len: max_utterance_len.max(frame_len),
            pending: Vec::with_capacity(frame_len),
            onset: Vec::new(),
            voiced_run: 0,
            current: None,
            silence_ms: 0,
        }
    }

    /// Feed samples; returns every utterance that closed during this call.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Utterance> {
        let mut closed = Vec::new();
        self.pending.extend_from_slice(samples);

        let whole = self.pending.len() / self.frame_len * self.frame_len;
        let frames: Vec<f32> = self.pending.drain(..whole).collect();
        for frame in frames.chunks(self.frame_len) {
            if let Some(utterance) = self.push_frame(frame) {
                closed.push(utterance);
            }
        }

        closed
    }

    #[cfg(test)]
    pub fn in_speech(&self) -> bool {
        self.current.is_some()
    }

    fn push_frame(&mut self, frame: &[f32]) -> Option<Utterance> {
        let voiced = rms(frame) >= self.energy_threshold;

        let Some(current) = self.current.as_mut() else {
            if voiced {
                self.onset.extend_from_slice(frame);
                self.voiced_run += 1;
                if self.voiced_run >= self.open_voiced_frames {
                    tracing::trace!("Utterance opened after {} voiced frames", self.voiced_run);
                    self.current = Some(std::mem::take(&mut self.onset));
                    self.voiced_run = 0;
                    self.silence_ms = 0;
                }
            } else {
                self.onset.clear();
                self.voiced_run = 0;
            }
            return None;
        };

        current.extend_from_slice(frame);
        if voiced {
            self.silence_ms = 0;
        } else {
            self.silence_ms += self.frame_ms;
        }

        let reason = if self.silence_ms >= self.close_silence_ms {
            CloseReason::Silence
        } else if current.len() >= self.max_utterance_len {
            CloseReason::MaxLength
        } else {
            return None;
        };

        self.silence_ms = 0;
        self.current.take().map(|samples| Utterance { samples, reason })
    }
}

fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let energy: f32 = frame.iter().map(|s| s * s).sum();
    (energy / frame.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16000;

    fn config() -> EndpointConfig {
        EndpointConfig {
            frame_ms: 30,
            energy_threshold: 0.015,
            open_voiced_frames: 3,
            close_silence_ms: 600,
            max_utterance_ms: 15_000,
        }
    }

    fn tone(ms: u32) -> Vec<f32> {
        let len = (RATE * ms / 1000) as usize;
        (0..len).map(|i| (i as f32 * 0.1).sin() * 0.3).collect()
    }

    fn silence(ms: u32) -> Vec<f32> {
        vec![0.0; (RATE * ms / 1000) as usize]
    }

    #[test]
    fn test_silence_never_opens_an_utterance() {
        let mut endpointer = Endpointer::new(&config(), RATE);
        assert!(endpointer.push(&silence(5000)).is_empty());
        assert!(!endpointer.in_speech());
    }

    #[test]
    fn test_speech_followed_by_silence_closes() {
        let mut endpointer = Endpointer::new(&config(), RATE);
        assert!(endpointer.push(&tone(900)).is_empty());
        assert!(endpointer.in_speech());

        let closed = endpointer.push(&silence(900));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, CloseReason::Silence);
        assert!(closed[0].samples.len() >= tone(900).len());
        assert!(!endpointer.in_speech());
    }

    #[test]
    fn test_short_click_does_not_open() {
        let mut endpointer = Endpointer::new(&config(), RATE);
        let mut input = tone(60);
        input.extend(silence(1000));
        assert!(endpointer.push(&input).is_empty());
        assert!(!endpointer.in_speech());
    }

    #[test]
    fn test_long_speech_is_cut_at_max_length() {
        let mut cfg = config();
        cfg.max_utterance_ms = 1200;
        let mut endpointer = Endpointer::new(&cfg, RATE);

        let closed = endpointer.push(&tone(3000));
        assert!(!closed.is_empty());
        assert_eq!(closed[0].reason, CloseReason::MaxLength);
        assert!(closed[0].samples.len() <= (RATE * 1200 / 1000) as usize + 480);
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let mut input = tone(900);
        input.extend(silence(900));

        let mut whole = Endpointer::new(&config(), RATE);
        let expected = whole.push(&input);

        let mut chunked = Endpointer::new(&config(), RATE);
        let mut closed = Vec::new();
        for piece in input.chunks(333) {
            closed.extend(chunked.push(piece));
        }

        assert_eq!(closed.len(), expected.len());
        assert_eq!(closed[0].samples, expected[0].samples);
    }
}
