//! Unit tests for combiner_key.rs

use crate::combiner::{ColorCombinerKey, CombinerInput, ShaderOptions};
use CombinerInput::*;

// ============================================================================
// COMBINER INPUT TESTS
// ============================================================================

#[test]
fn test_from_nibble_known_values() {
    assert_eq!(CombinerInput::from_nibble(0), Zero);
    assert_eq!(CombinerInput::from_nibble(3), Input3);
    assert_eq!(CombinerInput::from_nibble(8), Texel0);
    assert_eq!(CombinerInput::from_nibble(11), Texel1Alpha);
    assert_eq!(CombinerInput::from_nibble(14), Noise);
}

#[test]
fn test_from_nibble_unknown_is_zero() {
    assert_eq!(CombinerInput::from_nibble(15), Zero);
}

#[test]
fn test_input_index_and_texture_unit() {
    assert_eq!(Input1.input_index(), Some(1));
    assert_eq!(Input7.input_index(), Some(7));
    assert_eq!(Zero.input_index(), None);
    assert_eq!(Texel0.input_index(), None);

    assert_eq!(Texel0Alpha.texture_unit(), Some(0));
    assert_eq!(Texel1.texture_unit(), Some(1));
    assert_eq!(Combined.texture_unit(), None);
}

// ============================================================================
// KEY PACKING TESTS
// ============================================================================

#[test]
fn test_nibble_layout() {
    // cycle 1, alpha channel, slot d -> bit 32 + 16 + 12 = 60
    let key = ColorCombinerKey::new(0xDu64 << 60, 0);
    assert_eq!(key.input(1, 1, 3), Combined);
    assert_eq!(key.input(0, 0, 0), Zero);

    let key = ColorCombinerKey::new(0x8, 0);
    assert_eq!(key.input(0, 0, 0), Texel0);
}

#[test]
fn test_from_parts_matches_manual_packing() {
    let mut inputs = [[[Zero; 4]; 2]; 2];
    inputs[0][0] = [Texel0, Zero, Input1, Zero];
    inputs[0][1] = [Zero, Zero, Zero, Texel0Alpha];
    let key = ColorCombinerKey::from_parts(&inputs, ShaderOptions::ALPHA | ShaderOptions::FOG);

    let expected_id0 = 0x8u64 | (0x1 << 8) | (0x9 << 28);
    assert_eq!(key.id0, expected_id0);
    assert_eq!(key.id1, 0b11);

    for cycle in 0..2 {
        for channel in 0..2 {
            for slot in 0..4 {
                assert_eq!(key.input(cycle, channel, slot), inputs[cycle][channel][slot]);
            }
        }
    }
}

#[test]
fn test_options_retain_unknown_bits() {
    let key = ColorCombinerKey::new(0, (1 << 31) | 1);
    let options = key.options();
    assert!(options.contains(ShaderOptions::ALPHA));
    assert_eq!(options.bits(), (1 << 31) | 1);
}

#[test]
fn test_clamp_flag_positions() {
    assert_eq!(ShaderOptions::clamp(0, 0), ShaderOptions::TEXEL0_CLAMP_S);
    assert_eq!(ShaderOptions::clamp(0, 1), ShaderOptions::TEXEL0_CLAMP_T);
    assert_eq!(ShaderOptions::clamp(1, 0), ShaderOptions::TEXEL1_CLAMP_S);
    assert_eq!(ShaderOptions::clamp(1, 1), ShaderOptions::TEXEL1_CLAMP_T);
}

#[test]
fn test_display_is_hex_pair() {
    let key = ColorCombinerKey::new(0x1234, 0x5);
    assert_eq!(key.to_string(), "0000000000001234:00000005");
}

#[test]
fn test_identical_bits_are_equal_keys() {
    use std::collections::HashSet;
    let mut set = HashSet::new();
    set.insert(ColorCombinerKey::new(42, 7));
    set.insert(ColorCombinerKey::new(42, 7));
    set.insert(ColorCombinerKey::new(42, 6));
    assert_eq!(set.len(), 2);
}
