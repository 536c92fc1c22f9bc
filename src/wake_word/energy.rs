//! Energy-based keyword engine for development hosts without a vendor engine.
//!
//! Fires on sustained loud speech. It does not recognise a phrase, so it is
//! only suitable for exercising the pipeline end to end.

use tracing::{debug, trace};

use super::{EngineConfig, KeywordDetection, KeywordEngine, KeywordEngineProvider};
use crate::error::{ensure_unit_interval, ActivationError};

pub const DEFAULT_FRAME_LENGTH: usize = 512;

const BASE_ENERGY_THRESHOLD: f32 = 3_000.0;
const MIN_ENERGY_FRAMES: usize = 3;

#[derive(Debug, Clone)]
pub struct EnergyKeywordEngine {
    threshold: f32,
    high_energy_frames: usize,
    frames_processed: u64,
}

impl EnergyKeywordEngine {
    /// Higher sensitivity lowers the energy threshold.
    pub fn new(sensitivity: f32) -> Self {
        let sensitivity = sensitivity.clamp(0.0, 1.0);
        Self {
            threshold: BASE_ENERGY_THRESHOLD * (1.5 - sensitivity),
            high_energy_frames: 0,
            frames_processed: 0,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl KeywordEngine for EnergyKeywordEngine {
    fn frame_length(&self) -> usize {
        DEFAULT_FRAME_LENGTH
    }

    fn process(&mut self, frame: &[i16]) -> Option<KeywordDetection> {
        self.frames_processed += 1;
        if self.frames_processed % 100 == 0 {
            trace!(frames = self.frames_processed, "energy engine progress");
        }

        let energy = rms_energy(frame);
        if energy > self.threshold {
            self.high_energy_frames += 1;
        } else {
            self.high_energy_frames = 0;
        }

        if self.high_energy_frames < MIN_ENERGY_FRAMES {
            return None;
        }

        self.high_energy_frames = 0;
        let confidence = (energy / (self.threshold * 2.0)).clamp(0.0, 1.0);
        debug!(energy, confidence, "energy engine matched sustained speech");
        Some(KeywordDetection {
            keyword_index: 0,
            confidence,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EnergyEngineProvider;

impl KeywordEngineProvider for EnergyEngineProvider {
    fn name(&self) -> &'static str {
        "energy"
    }

    fn create(&self, config: &EngineConfig) -> Result<Box<dyn KeywordEngine>, ActivationError> {
        let sensitivity = ensure_unit_interval("sensitivity", config.sensitivity)?;
        Ok(Box::new(EnergyKeywordEngine::new(sensitivity)))
    }
}

fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s).powi(2)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_never_matches() {
        let mut engine = EnergyKeywordEngine::new(0.5);
        let frame = vec![0i16; DEFAULT_FRAME_LENGTH];

        assert!((0..10).all(|_| engine.process(&frame).is_none()));
    }

    #[test]
    fn sustained_energy_matches_after_three_frames() {
        let mut engine = EnergyKeywordEngine::new(0.5);
        let loud = vec![8_000i16; DEFAULT_FRAME_LENGTH];

        assert!(engine.process(&loud).is_none());
        assert!(engine.process(&loud).is_none());
        let detection = engine.process(&loud).expect("third loud frame should match");

        assert_eq!(detection.keyword_index, 0);
        assert!(detection.confidence > 0.0 && detection.confidence <= 1.0);
        assert!(engine.process(&loud).is_none());
    }

    #[test]
    fn quiet_frame_resets_the_run() {
        let mut engine = EnergyKeywordEngine::new(0.5);
        let loud = vec![8_000i16; DEFAULT_FRAME_LENGTH];
        let quiet = vec![10i16; DEFAULT_FRAME_LENGTH];

        engine.process(&loud);
        engine.process(&loud);
        engine.process(&quiet);

        assert!(engine.process(&loud).is_none());
    }

    #[test]
    fn higher_sensitivity_lowers_threshold() {
        assert!(EnergyKeywordEngine::new(0.9).threshold() < EnergyKeywordEngine::new(0.1).threshold());
    }

    #[test]
    fn provider_rejects_out_of_range_sensitivity() {
        let result = EnergyEngineProvider.create(&EngineConfig {
            access_key: "key".to_string(),
            sensitivity: 1.5,
        });

        assert!(matches!(result, Err(ActivationError::InvalidRange { .. })));
    }
}
