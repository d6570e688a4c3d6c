//! Unit tests for features.rs

use crate::combiner::{extract, ColorCombinerKey, CombinerInput, ShaderOptions};
use CombinerInput::*;

// ============================================================================
// TEST HELPERS
// ============================================================================

/// Single-cycle key with the same inputs for color and alpha
fn one_cycle(color: [CombinerInput; 4], alpha: [CombinerInput; 4], options: ShaderOptions) -> ColorCombinerKey {
    let mut inputs = [[[Zero; 4]; 2]; 2];
    inputs[0][0] = color;
    inputs[0][1] = alpha;
    ColorCombinerKey::from_parts(&inputs, options)
}

// ============================================================================
// DETERMINISM
// ============================================================================

#[test]
fn test_extract_is_deterministic() {
    let keys = [
        ColorCombinerKey::new(0, 0),
        ColorCombinerKey::new(u64::MAX, u32::MAX),
        ColorCombinerKey::new(0x0123_4567_89AB_CDEF, 0x0FFF),
        one_cycle([Texel0, Zero, Input1, Zero], [Zero, Zero, Zero, Texel0Alpha], ShaderOptions::ALPHA),
    ];
    for key in keys {
        assert_eq!(extract(key), extract(key));
    }
}

// ============================================================================
// INPUTS AND TEXTURES
// ============================================================================

#[test]
fn test_empty_key_has_no_inputs_or_textures() {
    let features = extract(ColorCombinerKey::new(0, 0));
    assert_eq!(features.num_inputs, 0);
    assert_eq!(features.used_textures, [false, false]);
    assert!(!features.opt_alpha);
    assert_eq!(features.cycles(), 1);
}

#[test]
fn test_num_inputs_is_highest_index() {
    let key = one_cycle([Input1, Input4, Input2, Zero], [Zero, Zero, Zero, Input3], ShaderOptions::empty());
    assert_eq!(extract(key).num_inputs, 4);
}

#[test]
fn test_second_cycle_contributes_even_in_one_cycle_mode() {
    let mut inputs = [[[Zero; 4]; 2]; 2];
    inputs[1][0] = [Texel1, Zero, Input6, Zero];
    let features = extract(ColorCombinerKey::from_parts(&inputs, ShaderOptions::empty()));
    assert_eq!(features.used_textures, [false, true]);
    assert_eq!(features.num_inputs, 6);
    assert!(!features.opt_2cyc);
}

#[test]
fn test_used_textures_from_alpha_variants() {
    let key = one_cycle([Zero; 4], [Texel0Alpha, Zero, Texel1Alpha, Zero], ShaderOptions::empty());
    assert_eq!(extract(key).used_textures, [true, true]);
}

// ============================================================================
// OPTIONS AND CLAMP
// ============================================================================

#[test]
fn test_option_flags_decode() {
    let options = ShaderOptions::ALPHA
        | ShaderOptions::FOG
        | ShaderOptions::TEXTURE_EDGE
        | ShaderOptions::NOISE
        | ShaderOptions::TWO_CYCLE
        | ShaderOptions::ALPHA_THRESHOLD
        | ShaderOptions::INVISIBLE
        | ShaderOptions::GRAYSCALE;
    let features = extract(ColorCombinerKey::new(0, options.bits()));
    assert!(features.opt_alpha);
    assert!(features.opt_fog);
    assert!(features.opt_texture_edge);
    assert!(features.opt_noise);
    assert!(features.opt_2cyc);
    assert!(features.opt_alpha_threshold);
    assert!(features.opt_invisible);
    assert!(features.opt_grayscale);
    assert_eq!(features.cycles(), 2);
}

#[test]
fn test_clamp_masked_by_used_textures() {
    let options = ShaderOptions::TEXEL0_CLAMP_S
        | ShaderOptions::TEXEL0_CLAMP_T
        | ShaderOptions::TEXEL1_CLAMP_S;
    let key = one_cycle([Texel0, Zero, Input1, Zero], [Zero; 4], options);
    let features = extract(key);
    assert_eq!(features.clamp, [[true, true], [false, false]]);
}

#[test]
fn test_unknown_option_bits_are_ignored() {
    let plain = extract(ColorCombinerKey::new(0x8, 0));
    let noisy = extract(ColorCombinerKey::new(0x8, 1 << 20));
    assert_eq!(plain, noisy);
}

// ============================================================================
// FORMULA SHAPE
// ============================================================================

#[test]
fn test_formula_shape_flags() {
    // color: (TEXEL0 - 0) * SHADE + 0 -> multiply
    // alpha: (0 - 0) * 0 + TEXEL0_ALPHA -> single only
    let key = one_cycle([Texel0, Zero, Input1, Zero], [Zero, Zero, Zero, Texel0Alpha], ShaderOptions::empty());
    let features = extract(key);

    assert!(!features.do_single[0][0]);
    assert!(features.do_multiply[0][0]);
    assert!(features.do_mix[0][0]);

    assert!(features.do_single[0][1]);
    assert!(!features.do_multiply[0][1]);
    assert!(!features.do_mix[0][1]);

    assert!(!features.color_alpha_same[0]);
}

#[test]
fn test_mix_when_b_equals_d() {
    let key = one_cycle([Texel0, Input2, Input1, Input2], [Zero; 4], ShaderOptions::empty());
    let features = extract(key);
    assert!(features.do_mix[0][0]);
    assert!(!features.do_multiply[0][0]);
    assert!(!features.do_single[0][0]);
}

#[test]
fn test_color_alpha_same() {
    let inputs = [Texel0, Zero, Input1, Zero];
    let features = extract(one_cycle(inputs, inputs, ShaderOptions::empty()));
    assert!(features.color_alpha_same[0]);
}

#[test]
fn test_decoded_matrix_matches_key() {
    let key = ColorCombinerKey::new(0x0123_4567_89AB_CDEF, 0);
    let features = extract(key);
    for cycle in 0..2 {
        for channel in 0..2 {
            for slot in 0..4 {
                assert_eq!(features.c[cycle][channel][slot], key.input(cycle, channel, slot));
            }
        }
    }
}
