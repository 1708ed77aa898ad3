//! Adaptive quality control.
//!
//! [`SampleWindow`] turns the frame loop's counters into one
//! [`PerformanceSample`] per second; [`QualityController`] turns samples
//! into bounded, rate-limited [`Adjustment`]s for the encoder.

pub mod controller;
pub mod sample;

pub use controller::{
    AdjustReason, Adjustment, MAX_THROTTLE, QualityConfig, QualityController, QualityState,
    gpu_throttle_delay,
};
pub use sample::{DEFAULT_SAMPLE_WINDOW, PerformanceSample, SampleWindow};
