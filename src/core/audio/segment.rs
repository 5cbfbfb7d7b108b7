//! Synthesized audio segments and payload decoding.

use std::io::Cursor;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::errors::{VocalsError, VocalsResult};

/// One unit of synthesized speech produced by the service.
///
/// Segments are ordered by `sentence_number` within a session, but the
/// queue keeps arrival order and never re-sorts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSegment {
    /// Text the audio was synthesized from
    #[serde(default)]
    pub text: String,
    /// Base64-encoded payload in `format`
    #[serde(alias = "audioData")]
    pub audio_data: String,
    #[serde(alias = "sampleRate")]
    pub sample_rate: u32,
    /// Unique within a stream session
    #[serde(alias = "segmentId")]
    pub segment_id: String,
    #[serde(default, alias = "sentenceNumber")]
    pub sentence_number: u32,
    /// Service-side synthesis latency
    #[serde(default, alias = "generationTimeMs")]
    pub generation_time_ms: f64,
    /// Payload encoding: `wav`, `pcm_f32le` or `pcm_s16le`
    #[serde(default = "default_segment_format")]
    pub format: String,
    #[serde(default, alias = "durationSeconds")]
    pub duration_seconds: f64,
}

fn default_segment_format() -> String {
    "wav".to_string()
}

/// PCM samples ready for an output device.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedAudio {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    /// Playback length derived from the sample count.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as f64 / self.channels as f64;
        Duration::from_secs_f64(frames / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl AudioSegment {
    /// Decode the base64 payload into f32 samples.
    pub fn decode(&self) -> VocalsResult<DecodedAudio> {
        let bytes = BASE64.decode(self.audio_data.trim()).map_err(|e| {
            VocalsError::Decode(format!(
                "Segment {} has an invalid base64 payload: {e}",
                self.segment_id
            ))
        })?;

        match self.format.to_ascii_lowercase().as_str() {
            "wav" => decode_wav(&bytes),
            "pcm_f32le" => Ok(DecodedAudio {
                samples: decode_f32le(&bytes)?,
                sample_rate: self.sample_rate,
                channels: 1,
            }),
            "pcm_s16le" => Ok(DecodedAudio {
                samples: decode_s16le(&bytes)?,
                sample_rate: self.sample_rate,
                channels: 1,
            }),
            other => Err(VocalsError::Decode(format!(
                "Unsupported segment format '{other}'"
            ))),
        }
    }
}

fn decode_wav(bytes: &[u8]) -> VocalsResult<DecodedAudio> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| VocalsError::Decode(format!("Invalid WAV payload: {e}")))?;
    let spec = reader.spec();

    let samples: Result<Vec<f32>, hound::Error> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect(),
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect()
        }
    };

    Ok(DecodedAudio {
        samples: samples.map_err(|e| VocalsError::Decode(format!("Invalid WAV samples: {e}")))?,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

fn decode_f32le(bytes: &[u8]) -> VocalsResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(VocalsError::Decode(format!(
            "pcm_f32le payload length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn decode_s16le(bytes: &[u8]) -> VocalsResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VocalsError::Decode(format!(
            "pcm_s16le payload length {} is odd",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect())
}
