//! Helpers for 16-bit little-endian mono PCM.

use crate::error::VoiceError;
use base64::Engine;
use std::time::Duration;

/// Bytes per sample of s16le audio.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Exotel only accepts outgoing media payloads in multiples of this size.
pub const EXOTEL_CHUNK_ALIGN: usize = 320;

/// Level reported for digital silence.
pub const SILENCE_DBFS: f32 = -100.0;

pub fn encode_base64(pcm: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm)
}

pub fn decode_base64(payload: &str) -> Result<Vec<u8>, VoiceError> {
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| VoiceError::Codec(format!("invalid base64 audio payload: {}", e)))
}

fn samples(pcm: &[u8]) -> impl Iterator<Item = i16> + '_ {
    pcm.chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
}

/// Resamples mono s16le audio with linear interpolation.
pub fn resample(pcm: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return pcm.to_vec();
    }

    let input: Vec<i16> = samples(pcm).collect();
    if input.is_empty() {
        return Vec::new();
    }

    let out_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = input.len() - 1;

    let mut out = Vec::with_capacity(out_len * BYTES_PER_SAMPLE);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = (pos.floor() as usize).min(last);
        let next = (idx + 1).min(last);
        let frac = pos - idx as f64;
        let value = input[idx] as f64 + (input[next] as f64 - input[idx] as f64) * frac;
        let sample = value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Root-mean-square level of the buffer relative to full scale.
pub fn rms_dbfs(pcm: &[u8]) -> f32 {
    let mut sum = 0f64;
    let mut count = 0usize;
    for s in samples(pcm) {
        let v = s as f64 / i16::MAX as f64;
        sum += v * v;
        count += 1;
    }
    if count == 0 || sum == 0.0 {
        return SILENCE_DBFS;
    }
    let rms = (sum / count as f64).sqrt();
    (20.0 * rms.log10()).max(SILENCE_DBFS as f64) as f32
}

pub fn duration_of(len_bytes: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let samples = len_bytes / BYTES_PER_SAMPLE;
    Duration::from_secs_f64(samples as f64 / sample_rate as f64)
}

/// Number of bytes covering `duration` at `sample_rate`, rounded down to
/// whole samples and never zero.
pub fn bytes_for(duration: Duration, sample_rate: u32) -> usize {
    let samples = (duration.as_secs_f64() * sample_rate as f64) as usize;
    samples.max(1) * BYTES_PER_SAMPLE
}

/// Pads with silence up to the next multiple of `align` bytes.
pub fn pad_to_multiple(mut pcm: Vec<u8>, align: usize) -> Vec<u8> {
    if align == 0 {
        return pcm;
    }
    let rem = pcm.len() % align;
    if rem != 0 {
        pcm.resize(pcm.len() + (align - rem), 0);
    }
    pcm
}
