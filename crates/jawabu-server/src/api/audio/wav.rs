//! Minimal 16-bit PCM WAV handling for the trim endpoint.

#[derive(Debug, Clone, Copy)]
pub struct WavFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

pub struct WavAudio {
    pub format: WavFormat,
    pub samples: Vec<i16>,
}

/// Parse a RIFF/WAVE container holding 16-bit PCM.
pub fn parse_wav(bytes: &[u8]) -> Result<WavAudio, String> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err("Not a RIFF/WAVE container".into());
    }
    let mut format: Option<WavFormat> = None;
    let mut data: Option<&[u8]> = None;
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap()) as usize;
        let body_start = offset + 8;
        let body_end = (body_start + size).min(bytes.len());
        match id {
            b"fmt " if size >= 16 => {
                let fmt = &bytes[body_start..body_end];
                let audio_format = u16::from_le_bytes([fmt[0], fmt[1]]);
                if audio_format != 1 {
                    return Err(format!("Unsupported WAV encoding: {audio_format}"));
                }
                format = Some(WavFormat {
                    channels: u16::from_le_bytes([fmt[2], fmt[3]]),
                    sample_rate: u32::from_le_bytes(fmt[4..8].try_into().unwrap()),
                    bits_per_sample: u16::from_le_bytes([fmt[14], fmt[15]]),
                });
            }
            b"data" => data = Some(&bytes[body_start..body_end]),
            _ => {}
        }
        // Chunks are word-aligned.
        offset = body_start + size + (size % 2);
    }
    let format = format.ok_or("Missing fmt chunk")?;
    if format.bits_per_sample != 16 {
        return Err(format!(
            "Unsupported sample width: {} bits",
            format.bits_per_sample
        ));
    }
    let data = data.ok_or("Missing data chunk")?;
    let samples = data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(WavAudio { format, samples })
}

/// Serialize samples back into a canonical 44-byte-header WAV file.
pub fn write_wav(format: WavFormat, samples: &[i16]) -> Vec<u8> {
    let data_len = samples.len() * 2;
    let byte_rate = format.sample_rate * u32::from(format.channels) * 2;
    let block_align = format.channels * 2;

    let mut out = Vec::with_capacity(44 + data_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&format.channels.to_le_bytes());
    out.extend_from_slice(&format.sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data_len as u32).to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Drop leading and trailing samples whose amplitude stays under
/// `threshold` (a fraction of the track's peak).
pub fn trim_silence(samples: &[i16], threshold: f32) -> &[i16] {
    let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    if peak == 0 {
        return &[];
    }
    let floor = (f32::from(peak) * threshold) as u16;
    let first = samples.iter().position(|s| s.unsigned_abs() > floor);
    let last = samples.iter().rposition(|s| s.unsigned_abs() > floor);
    match (first, last) {
        (Some(first), Some(last)) => &samples[first..=last],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: WavFormat = WavFormat {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
    };

    fn tone_with_silence() -> Vec<i16> {
        let mut samples = vec![0i16; 100];
        samples.extend(std::iter::repeat(12_000).take(50));
        samples.extend(std::iter::repeat(0).take(100));
        samples
    }

    #[test]
    fn wav_round_trips() {
        let samples = tone_with_silence();
        let bytes = write_wav(FORMAT, &samples);
        let parsed = parse_wav(&bytes).unwrap();
        assert_eq!(parsed.format.sample_rate, 16_000);
        assert_eq!(parsed.samples, samples);
    }

    #[test]
    fn trim_removes_edge_silence_only() {
        let samples = tone_with_silence();
        let trimmed = trim_silence(&samples, 0.05);
        assert_eq!(trimmed.len(), 50);
        assert!(trimmed.iter().all(|s| *s == 12_000));
    }

    #[test]
    fn all_silence_trims_to_nothing() {
        assert!(trim_silence(&[0i16; 64], 0.05).is_empty());
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(parse_wav(b"definitely not audio").is_err());
    }
}
