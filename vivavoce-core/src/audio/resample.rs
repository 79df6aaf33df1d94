//! Sample-rate conversion from the device capture rate to the engine rate.
//!
//! Microphones commonly run at 44.1 or 48 kHz; the engine records, meters,
//! and trims at a fixed 16 kHz. `RateAdapter` bridges the two on the detector
//! loop thread, where allocation is allowed. When the rates already match it
//! is a plain passthrough and no rubato session exists at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::{Result, VivavoceError};

/// Converts mono f32 audio from a source rate to a target rate.
pub struct RateAdapter {
    /// `None` in passthrough mode (source rate == target rate).
    inner: Option<FastFixedIn<f32>>,
    /// Input samples rubato expects per conversion call.
    block: usize,
    /// Carry-over for partial input blocks between polls.
    pending: Vec<f32>,
    /// Pre-allocated rubato output buffer, `[1][output_frames_max]`.
    out: Vec<Vec<f32>>,
}

impl RateAdapter {
    /// Create an adapter converting `source_rate` → `target_rate`.
    ///
    /// The conversion block is 50 ms of source audio, matching the detector's
    /// sampling cadence so one poll usually yields one converted block.
    ///
    /// # Errors
    /// Returns [`VivavoceError::CaptureDevice`] if rubato rejects the ratio.
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        let block = (source_rate as usize / 20).max(1);

        if source_rate == target_rate {
            return Ok(Self {
                inner: None,
                block,
                pending: Vec::new(),
                out: Vec::new(),
            });
        }

        let ratio = target_rate as f64 / source_rate as f64;
        let inner = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio, never adjusted at runtime
            PolynomialDegree::Cubic,
            block,
            1, // mono
        )
        .map_err(|e| VivavoceError::CaptureDevice(format!("resampler init: {e}")))?;

        let out = vec![vec![0f32; inner.output_frames_max()]; 1];
        tracing::info!(source_rate, target_rate, block, "rate conversion enabled");

        Ok(Self {
            inner: Some(inner),
            block,
            pending: Vec::new(),
            out,
        })
    }

    /// Feed source-rate samples, returning whatever target-rate audio is
    /// ready. Input shorter than one conversion block is held until the next
    /// call; in passthrough mode input is returned unchanged.
    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut inner) = self.inner else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut converted = Vec::new();

        while self.pending.len() >= self.block {
            let input = &self.pending[..self.block];
            match inner.process_into_buffer(&[input], &mut self.out, None) {
                Ok((_consumed, produced)) => {
                    converted.extend_from_slice(&self.out[0][..produced]);
                }
                Err(e) => {
                    tracing::error!("rate conversion failed on a block: {e}");
                }
            }
            self.pending.drain(..self.block);
        }

        converted
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_returns_input_unchanged() {
        let mut adapter = RateAdapter::new(16_000, 16_000).unwrap();
        assert!(adapter.is_passthrough());
        let samples: Vec<f32> = (0..320).map(|i| i as f32 * 0.002).collect();
        assert_eq!(adapter.push(&samples), samples);
    }

    #[test]
    fn downsamples_48k_to_16k_at_one_third_length() {
        let mut adapter = RateAdapter::new(48_000, 16_000).unwrap();
        assert!(!adapter.is_passthrough());
        // One full 50 ms block: 2400 samples in → ~800 out.
        let out = adapter.push(&vec![0.0f32; 2_400]);
        assert!(
            (out.len() as isize - 800).unsigned_abs() <= 16,
            "out.len()={} expected≈800",
            out.len()
        );
    }

    #[test]
    fn partial_block_is_held_until_complete() {
        let mut adapter = RateAdapter::new(48_000, 16_000).unwrap();
        assert!(adapter.push(&vec![0.0f32; 1_000]).is_empty());
        assert!(adapter.push(&vec![0.0f32; 1_000]).is_empty());
        // 3000 accumulated ≥ one 2400-sample block.
        assert!(!adapter.push(&vec![0.0f32; 1_000]).is_empty());
    }

    #[test]
    fn upsampling_low_rate_devices_works() {
        let mut adapter = RateAdapter::new(8_000, 16_000).unwrap();
        // One 50 ms block at 8 kHz: 400 in → ~800 out.
        let out = adapter.push(&vec![0.25f32; 400]);
        assert!(
            (out.len() as isize - 800).unsigned_abs() <= 16,
            "out.len()={} expected≈800",
            out.len()
        );
    }
}
