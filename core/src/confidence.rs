use serde::Serialize;

use crate::{
    CONFIDENCE_CORRECTION_WEIGHT, CONFIDENCE_INTEGRITY_WEIGHT, CONFIDENCE_PREAMBLE_WEIGHT,
    CONFIDENCE_SNR_WEIGHT, SNR_FULL_SCALE_DB,
};

/// The individual terms of a confidence score, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceBreakdown {
    pub preamble: f32,
    pub snr: f32,
    pub correction: f32,
    pub integrity: f32,
}

pub struct ConfidenceScorer;

impl ConfidenceScorer {
    /// Weighted combination of preamble correlation, mean symbol SNR, the share
    /// of code units left untouched by error correction, and integrity.
    pub fn score(
        preamble_correlation: f32,
        mean_snr_db: f32,
        corrected_fraction: f32,
        integrity_passed: bool,
    ) -> (f32, ConfidenceBreakdown) {
        let breakdown = ConfidenceBreakdown {
            preamble: preamble_correlation.clamp(0.0, 1.0),
            snr: (mean_snr_db / SNR_FULL_SCALE_DB).clamp(0.0, 1.0),
            correction: (1.0 - corrected_fraction).clamp(0.0, 1.0),
            integrity: if integrity_passed { 1.0 } else { 0.0 },
        };
        let confidence = CONFIDENCE_PREAMBLE_WEIGHT * breakdown.preamble
            + CONFIDENCE_SNR_WEIGHT * breakdown.snr
            + CONFIDENCE_CORRECTION_WEIGHT * breakdown.correction
            + CONFIDENCE_INTEGRITY_WEIGHT * breakdown.integrity;
        (confidence.clamp(0.0, 1.0), breakdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_signal_scores_one() {
        let (confidence, breakdown) = ConfidenceScorer::score(1.0, 60.0, 0.0, true);
        assert!((confidence - 1.0).abs() < 1e-6);
        assert_eq!(breakdown.snr, 1.0);
    }

    #[test]
    fn test_terms_are_monotonic() {
        let (clean, _) = ConfidenceScorer::score(0.9, 25.0, 0.0, true);
        let (noisier, _) = ConfidenceScorer::score(0.9, 10.0, 0.0, true);
        let (corrected, _) = ConfidenceScorer::score(0.9, 25.0, 0.2, true);
        let (failed, _) = ConfidenceScorer::score(0.9, 25.0, 0.0, false);
        assert!(noisier < clean);
        assert!(corrected < clean);
        assert!((clean - failed - CONFIDENCE_INTEGRITY_WEIGHT).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_range_inputs_are_clamped() {
        let (confidence, breakdown) = ConfidenceScorer::score(-0.5, -10.0, 2.0, false);
        assert_eq!(confidence, 0.0);
        assert_eq!(breakdown.preamble, 0.0);
        assert_eq!(breakdown.correction, 0.0);
    }
}
