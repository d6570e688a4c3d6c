//! Feature extraction
//!
//! Decodes a [`ColorCombinerKey`] into the fixed-shape [`FeatureDescriptor`]
//! that drives shader synthesis and vertex layout. Pure and total: every key
//! produces a descriptor, and the same key always produces the same one.

use super::combiner_key::{
    ColorCombinerKey, CombinerInput, ShaderOptions, CHANNEL_ALPHA, CHANNEL_COLOR, NUM_CHANNELS,
    NUM_CYCLES, NUM_SLOTS,
};

/// Everything a backend needs to know about a combiner to build its shader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeatureDescriptor {
    /// Decoded combiner matrix `c[cycle][channel][slot]`
    pub c: [[[CombinerInput; NUM_SLOTS]; NUM_CHANNELS]; NUM_CYCLES],

    pub opt_alpha: bool,
    pub opt_fog: bool,
    pub opt_texture_edge: bool,
    pub opt_noise: bool,
    pub opt_2cyc: bool,
    pub opt_alpha_threshold: bool,
    pub opt_invisible: bool,
    pub opt_grayscale: bool,

    /// Texture units sampled by the combiner
    pub used_textures: [bool; 2],

    /// Clamp flags per unit and axis (S, T), only set for used units
    pub clamp: [[bool; 2]; 2],

    /// Highest shade input referenced (0..=7)
    pub num_inputs: u8,

    /// `c == 0`: the stage is just `d`
    pub do_single: [[bool; NUM_CHANNELS]; NUM_CYCLES],

    /// `b == 0 && d == 0`: the stage is `a * c`
    pub do_multiply: [[bool; NUM_CHANNELS]; NUM_CYCLES],

    /// `b == d`: the stage is `mix(b, a, c)`
    pub do_mix: [[bool; NUM_CHANNELS]; NUM_CYCLES],

    /// Color and alpha inputs are identical for a cycle
    pub color_alpha_same: [bool; NUM_CYCLES],
}

impl FeatureDescriptor {
    /// Number of combiner cycles actually evaluated
    pub fn cycles(&self) -> usize {
        if self.opt_2cyc { 2 } else { 1 }
    }

    pub fn uses_texture(&self, unit: usize) -> bool {
        self.used_textures.get(unit).copied().unwrap_or(false)
    }
}

/// Decode a combiner key into its feature descriptor
pub fn extract(key: ColorCombinerKey) -> FeatureDescriptor {
    let mut c = [[[CombinerInput::Zero; NUM_SLOTS]; NUM_CHANNELS]; NUM_CYCLES];
    for (cycle, channels) in c.iter_mut().enumerate() {
        for (channel, slots) in channels.iter_mut().enumerate() {
            for (slot, input) in slots.iter_mut().enumerate() {
                *input = key.input(cycle, channel, slot);
            }
        }
    }

    let options = key.options();

    let mut num_inputs = 0u8;
    let mut used_textures = [false; 2];
    for input in c.iter().flatten().flatten() {
        if let Some(index) = input.input_index() {
            num_inputs = num_inputs.max(index);
        }
        if let Some(unit) = input.texture_unit() {
            used_textures[unit] = true;
        }
    }

    let mut clamp = [[false; 2]; 2];
    for (unit, axes) in clamp.iter_mut().enumerate() {
        for (axis, flag) in axes.iter_mut().enumerate() {
            *flag = used_textures[unit] && options.contains(ShaderOptions::clamp(unit, axis));
        }
    }

    let mut do_single = [[false; NUM_CHANNELS]; NUM_CYCLES];
    let mut do_multiply = [[false; NUM_CHANNELS]; NUM_CYCLES];
    let mut do_mix = [[false; NUM_CHANNELS]; NUM_CYCLES];
    let mut color_alpha_same = [false; NUM_CYCLES];
    for cycle in 0..NUM_CYCLES {
        for channel in 0..NUM_CHANNELS {
            let [_, b, cc, d] = c[cycle][channel];
            do_single[cycle][channel] = cc == CombinerInput::Zero;
            do_multiply[cycle][channel] = b == CombinerInput::Zero && d == CombinerInput::Zero;
            do_mix[cycle][channel] = b == d;
        }
        color_alpha_same[cycle] = c[cycle][CHANNEL_COLOR] == c[cycle][CHANNEL_ALPHA];
    }

    FeatureDescriptor {
        c,
        opt_alpha: options.contains(ShaderOptions::ALPHA),
        opt_fog: options.contains(ShaderOptions::FOG),
        opt_texture_edge: options.contains(ShaderOptions::TEXTURE_EDGE),
        opt_noise: options.contains(ShaderOptions::NOISE),
        opt_2cyc: options.contains(ShaderOptions::TWO_CYCLE),
        opt_alpha_threshold: options.contains(ShaderOptions::ALPHA_THRESHOLD),
        opt_invisible: options.contains(ShaderOptions::INVISIBLE),
        opt_grayscale: options.contains(ShaderOptions::GRAYSCALE),
        used_textures,
        clamp,
        num_inputs,
        do_single,
        do_multiply,
        do_mix,
        color_alpha_same,
    }
}
