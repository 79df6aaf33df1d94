//! Utterance trimming.
//!
//! A completed utterance arrives as a standalone WAV capture that includes
//! lead-in silence and the confirmation tail. `trim_wav` cuts the speech
//! window out and rebuilds the container so the result is again a valid
//! standalone file.
//!
//! The stream format is fixed (mono, 16-bit PCM), so window positions are
//! pure sample arithmetic on the header's rate — no decoding beyond the
//! container itself. Callers treat failure as recoverable: the detector falls
//! back to delivering the untrimmed capture.

use std::io::Cursor;
use std::time::Duration;

use crate::error::{Result, VivavoceError};

/// Cut `duration` seconds starting at `start_offset` out of a WAV buffer.
///
/// # Errors
/// - [`VivavoceError::Container`] when the buffer is not a mono s16 PCM WAV.
/// - [`VivavoceError::TrimWindow`] when the window is empty or extends past
///   the end of the source.
pub fn trim_wav(wav: &[u8], start_offset: Duration, duration: Duration) -> Result<Vec<u8>> {
    let mut reader = hound::WavReader::new(Cursor::new(wav))
        .map_err(|e| VivavoceError::Container(e.to_string()))?;
    let spec = reader.spec();

    if spec.channels != 1
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(VivavoceError::Container(format!(
            "expected mono s16 PCM, got {} channel(s) at {} bit",
            spec.channels, spec.bits_per_sample
        )));
    }

    let rate = spec.sample_rate as f64;
    let total_samples = u64::from(reader.duration());
    let start_sample = (start_offset.as_secs_f64() * rate).round() as u64;
    let take_samples = (duration.as_secs_f64() * rate).round() as u64;

    if take_samples == 0 || start_sample.saturating_add(take_samples) > total_samples {
        return Err(VivavoceError::TrimWindow {
            start_secs: start_offset.as_secs_f64(),
            duration_secs: duration.as_secs_f64(),
            available_secs: total_samples as f64 / rate,
        });
    }

    reader.seek(start_sample as u32)?;

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)
        .map_err(|e| VivavoceError::Container(e.to_string()))?;
    for sample in reader.samples::<i16>().take(take_samples as usize) {
        let sample = sample.map_err(|e| VivavoceError::Container(e.to_string()))?;
        writer
            .write_sample(sample)
            .map_err(|e| VivavoceError::Container(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| VivavoceError::Container(e.to_string()))?;

    Ok(cursor.into_inner())
}
