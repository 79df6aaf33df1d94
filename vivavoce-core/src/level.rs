//! Instantaneous audio-level sampling.
//!
//! Microphone metering reports power in dBFS, typically −60..0. Everything
//! downstream (calibration, the analyzer, the detector thresholds) works on a
//! normalized 0..1 scale, so the affine map lives here and nowhere else.

/// Metering floor in dBFS. Readings at or below this normalize to 0.0.
pub const DB_FLOOR: f32 = -60.0;

/// Convert a raw dBFS power reading into a normalized level in [0.0, 1.0].
///
/// `0 dB → 1.0`, `−60 dB → 0.0`, linear in between; inputs outside the range
/// saturate.
pub fn normalized_level(power_db: f32) -> f32 {
    ((power_db - DB_FLOOR) / -DB_FLOOR).clamp(0.0, 1.0)
}

/// Root-mean-square level of a sample block, in dBFS.
///
/// Returns [`DB_FLOOR`] for an empty block; the RMS is floored at `1e-6`
/// before the log so digital silence maps to the metering floor rather
/// than −inf.
pub fn rms_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return DB_FLOOR;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let rms = energy.sqrt().max(1e-6);
    20.0 * rms.log10()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn normalized_level_saturates_at_both_ends() {
        assert_eq!(normalized_level(0.0), 1.0);
        assert_eq!(normalized_level(12.0), 1.0);
        assert_eq!(normalized_level(-60.0), 0.0);
        assert_eq!(normalized_level(-300.0), 0.0);
    }

    #[test]
    fn normalized_level_is_linear_in_between() {
        assert_abs_diff_eq!(normalized_level(-30.0), 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(normalized_level(-45.0), 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(normalized_level(-6.0), 0.9, epsilon = 1e-6);
    }

    #[test]
    fn normalized_level_stays_in_unit_interval() {
        for db in (-120..=60).map(|d| d as f32) {
            let level = normalized_level(db);
            assert!((0.0..=1.0).contains(&level), "db={db} level={level}");
        }
    }

    #[test]
    fn rms_db_empty_returns_floor() {
        assert_eq!(rms_db(&[]), DB_FLOOR);
    }

    #[test]
    fn rms_db_matches_known_amplitude() {
        let samples = vec![0.5_f32; 64];
        let expected = 20.0 * 0.5_f32.log10();
        assert_abs_diff_eq!(rms_db(&samples), expected, epsilon = 0.01);
    }

    #[test]
    fn rms_db_of_digital_silence_is_floored() {
        let samples = vec![0.0_f32; 256];
        assert!(rms_db(&samples) <= DB_FLOOR);
    }

    #[test]
    fn full_scale_square_wave_normalizes_to_one() {
        let samples: Vec<f32> = (0..256)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        assert_abs_diff_eq!(normalized_level(rms_db(&samples)), 1.0, epsilon = 1e-4);
    }
}
