use anyhow::Result;
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

// Define standard sample rates for clarity and consistency
pub const OPENAI_REALTIME_API_PCM16_SAMPLE_RATE: f64 = 24000.0;
pub const RESAMPLER_CHUNK_SIZE: usize = 512;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Interprets little-endian byte pairs as i16 samples. A trailing odd byte is ignored.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Encodes a slice of f32 samples into a base64 string (converting to i16 PCM first).
pub fn encode_f32_to_base64_i16(pcm32: &[f32]) -> String {
    let pcm16: Vec<u8> = pcm32
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16)
}

/// Resamples a PCM16 byte stream that arrives in arbitrarily sized frames.
///
/// The underlying resampler consumes fixed-size chunks, so samples that do
/// not fill a chunk are held until the next frame, as is a dangling byte
/// when a frame splits a sample in half.
pub struct Pcm16Resampler {
    resampler: FastFixedIn<f32>,
    ratio: f64,
    pending: Vec<f32>,
    carry: Option<u8>,
}

impl Pcm16Resampler {
    pub fn new(in_sampling_rate: f64, out_sampling_rate: f64, chunk_size: usize) -> Result<Self> {
        Ok(Self {
            resampler: create_resampler(in_sampling_rate, out_sampling_rate, chunk_size)?,
            ratio: out_sampling_rate / in_sampling_rate,
            pending: Vec::with_capacity(chunk_size * 2),
            carry: None,
        })
    }

    /// Feeds one frame and returns the resampled output for every complete chunk.
    pub fn process(&mut self, frame: &[u8]) -> Result<Vec<f32>> {
        let mut bytes = Vec::with_capacity(frame.len() + 1);
        if let Some(b) = self.carry.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(frame);
        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }
        self.pending
            .extend(convert_i16_to_f32(&pcm16_from_le_bytes(&bytes)));

        let mut out = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let resampled = self.resampler.process(&[chunk], None)?;
            out.extend_from_slice(&resampled[0]);
        }
        Ok(out)
    }

    /// Resamples the samples still waiting for a full chunk, padded with
    /// silence. Output past the length of the real samples is cut off.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        self.carry = None;
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let expected = (self.pending.len() as f64 * self.ratio).ceil() as usize;
        let input = [std::mem::take(&mut self.pending)];
        let resampled = self.resampler.process_partial(Some(&input[..]), None)?;
        let mut out = resampled.into_iter().next().unwrap_or_default();
        out.truncate(expected);
        Ok(out)
    }

    /// Samples waiting for a full chunk.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}
