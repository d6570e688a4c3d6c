/// Combiner module - color combiner key decoding
///
/// This module turns the packed combiner fingerprint emitted by the display
/// list interpreter into the feature descriptor backends synthesize shaders
/// from.

pub mod combiner_key;
pub mod features;

pub use combiner_key::{
    ColorCombinerKey, CombinerInput, ShaderOptions, CHANNEL_ALPHA, CHANNEL_COLOR, NUM_CHANNELS,
    NUM_CYCLES, NUM_SLOTS,
};
pub use features::{extract, FeatureDescriptor};

#[cfg(test)]
#[path = "combiner_key_tests.rs"]
mod combiner_key_tests;

#[cfg(test)]
#[path = "features_tests.rs"]
mod features_tests;
