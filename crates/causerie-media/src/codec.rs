//! G.711 μ-law (PCMU) and the 48 kHz ↔ 8 kHz rate change around it.

use crate::audio::AUDIO_SAMPLE_RATE;

/// PCMU clock rate.
pub const PCMU_SAMPLE_RATE: u32 = 8_000;

const RATE_FACTOR: usize = (AUDIO_SAMPLE_RATE / PCMU_SAMPLE_RATE) as usize;
const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = i32::from(sample);
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = i32::from((byte >> 4) & 0x07);
    let mantissa = i32::from(byte & 0x0F);
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if byte & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

fn to_f32(sample: i16) -> f32 {
    f32::from(sample) / f32::from(i16::MAX)
}

/// Encode a 48 kHz frame as 8 kHz PCMU, averaging each group of samples.
pub fn encode_frame(frame: &[f32]) -> Vec<u8> {
    frame
        .chunks(RATE_FACTOR)
        .map(|chunk| {
            let mean = chunk.iter().sum::<f32>() / chunk.len() as f32;
            linear_to_ulaw(to_i16(mean))
        })
        .collect()
}

/// Decode an 8 kHz PCMU payload into a 48 kHz frame.
pub fn decode_payload(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .flat_map(|&byte| std::iter::repeat(to_f32(ulaw_to_linear(byte))).take(RATE_FACTOR))
        .collect()
}
