//! Color combiner key
//!
//! A combiner key is the 96-bit fingerprint of the RDP color-combiner state:
//! `id0` packs the combiner inputs, `id1` the shader option flags. Two draws
//! with identical key bits always share one compiled shader program.

use std::fmt;

/// Number of combiner cycles encoded in a key
pub const NUM_CYCLES: usize = 2;

/// Color and alpha channel
pub const NUM_CHANNELS: usize = 2;

/// Inputs (a, b, c, d) per cycle and channel
pub const NUM_SLOTS: usize = 4;

/// Channel index of the color (RGB) combiner
pub const CHANNEL_COLOR: usize = 0;

/// Channel index of the alpha combiner
pub const CHANNEL_ALPHA: usize = 1;

/// One 4-bit combiner input selector
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CombinerInput {
    Zero = 0,
    Input1 = 1,
    Input2 = 2,
    Input3 = 3,
    Input4 = 4,
    Input5 = 5,
    Input6 = 6,
    Input7 = 7,
    Texel0 = 8,
    Texel0Alpha = 9,
    Texel1 = 10,
    Texel1Alpha = 11,
    One = 12,
    Combined = 13,
    Noise = 14,
}

impl CombinerInput {
    /// Decode a nibble; unknown values decode as `Zero`
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble & 0xF {
            1 => CombinerInput::Input1,
            2 => CombinerInput::Input2,
            3 => CombinerInput::Input3,
            4 => CombinerInput::Input4,
            5 => CombinerInput::Input5,
            6 => CombinerInput::Input6,
            7 => CombinerInput::Input7,
            8 => CombinerInput::Texel0,
            9 => CombinerInput::Texel0Alpha,
            10 => CombinerInput::Texel1,
            11 => CombinerInput::Texel1Alpha,
            12 => CombinerInput::One,
            13 => CombinerInput::Combined,
            14 => CombinerInput::Noise,
            _ => CombinerInput::Zero,
        }
    }

    pub fn nibble(self) -> u8 {
        self as u8
    }

    /// Shade input number (1..=7), if this selects a per-vertex input
    pub fn input_index(self) -> Option<u8> {
        match self.nibble() {
            n @ 1..=7 => Some(n),
            _ => None,
        }
    }

    /// Texture unit sampled by this input, if any
    pub fn texture_unit(self) -> Option<usize> {
        match self {
            CombinerInput::Texel0 | CombinerInput::Texel0Alpha => Some(0),
            CombinerInput::Texel1 | CombinerInput::Texel1Alpha => Some(1),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Option flags carried in `ColorCombinerKey::id1`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderOptions: u32 {
        const ALPHA = 1 << 0;
        const FOG = 1 << 1;
        const TEXTURE_EDGE = 1 << 2;
        const NOISE = 1 << 3;
        const TWO_CYCLE = 1 << 4;
        const ALPHA_THRESHOLD = 1 << 5;
        const INVISIBLE = 1 << 6;
        const GRAYSCALE = 1 << 7;
        const TEXEL0_CLAMP_S = 1 << 8;
        const TEXEL0_CLAMP_T = 1 << 9;
        const TEXEL1_CLAMP_S = 1 << 10;
        const TEXEL1_CLAMP_T = 1 << 11;
    }
}

impl ShaderOptions {
    /// Clamp flag for a texture unit (0/1) and axis (0 = S, 1 = T)
    pub fn clamp(unit: usize, axis: usize) -> Self {
        Self::from_bits_retain(1 << (8 + unit * 2 + axis))
    }
}

/// Opaque combiner fingerprint, the shader cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ColorCombinerKey {
    pub id0: u64,
    pub id1: u32,
}

impl ColorCombinerKey {
    pub const fn new(id0: u64, id1: u32) -> Self {
        Self { id0, id1 }
    }

    /// Pack a combiner matrix and option flags
    pub fn from_parts(
        inputs: &[[[CombinerInput; NUM_SLOTS]; NUM_CHANNELS]; NUM_CYCLES],
        options: ShaderOptions,
    ) -> Self {
        let mut id0 = 0u64;
        for (cycle, channels) in inputs.iter().enumerate() {
            for (channel, slots) in channels.iter().enumerate() {
                for (slot, input) in slots.iter().enumerate() {
                    id0 |= (input.nibble() as u64) << Self::shift(cycle, channel, slot);
                }
            }
        }
        Self { id0, id1: options.bits() }
    }

    /// Combiner input at (cycle, channel, slot)
    pub fn input(&self, cycle: usize, channel: usize, slot: usize) -> CombinerInput {
        CombinerInput::from_nibble(((self.id0 >> Self::shift(cycle, channel, slot)) & 0xF) as u8)
    }

    /// Option flags, unknown bits retained
    pub fn options(&self) -> ShaderOptions {
        ShaderOptions::from_bits_retain(self.id1)
    }

    fn shift(cycle: usize, channel: usize, slot: usize) -> u32 {
        (cycle * 32 + channel * 16 + slot * 4) as u32
    }
}

impl fmt::Display for ColorCombinerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}:{:08x}", self.id0, self.id1)
    }
}
