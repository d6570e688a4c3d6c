/// GLSL synthesis for combiner programs
///
/// Both stages are generated from a `FeatureDescriptor` and the matching
/// `VertexLayout`:
///
/// - vertex: one `in` per attribute, position feeding `gl_Position` and every
///   other attribute copied to an `out` at the same location
/// - fragment: the same locations as `in`, two texture units as separate
///   `texture2D` + `sampler` bindings (set 0, bindings 0..3), the combiner
///   formula per cycle, then the option passes
///
/// Per-frame values (noise, filtering mode per unit) come from a push
/// constant block shared by every program.

use bytemuck::{Pod, Zeroable};
use fast3d_gfx::fast3d::combiner::{
    CombinerInput, FeatureDescriptor, CHANNEL_ALPHA, CHANNEL_COLOR, NUM_SLOTS,
};
use fast3d_gfx::fast3d::shader::{AttributeSemantic, VertexLayout};

/// `texture_filtering` value selecting the in-shader three-point filter
pub const FILTER_THREE_POINT: i32 = 1;

/// Push constants visible to the fragment stage
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct FrameConstants {
    pub frame_count: i32,
    pub noise_scale: f32,
    pub texture_filtering: [i32; 2],
}

pub const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<FrameConstants>() as u32;

/// Generated source of both stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSources {
    pub vertex: String,
    pub fragment: String,
}

pub fn generate(features: &FeatureDescriptor, layout: &VertexLayout) -> ShaderSources {
    ShaderSources {
        vertex: vertex_source(layout),
        fragment: fragment_source(features, layout),
    }
}

// ============================================================================
// Vertex stage
// ============================================================================

/// `in`/`out` declarations, one line each, in location order
pub fn vertex_declarations(layout: &VertexLayout) -> String {
    let mut out = String::new();
    for attribute in layout.attributes() {
        out.push_str(&format!(
            "layout(location = {}) in {} {};\n",
            attribute.location,
            attribute.glsl_type(),
            attribute.input_name()
        ));
        if attribute.semantic.has_varying() {
            out.push_str(&format!(
                "layout(location = {}) out {} {};\n",
                attribute.location,
                attribute.glsl_type(),
                attribute.varying_name()
            ));
        }
    }
    out
}

pub fn vertex_source(layout: &VertexLayout) -> String {
    let mut src = String::from("#version 450\n\n");
    src.push_str(&vertex_declarations(layout));
    src.push_str("\nvoid main() {\n");
    for attribute in layout.varyings() {
        src.push_str(&format!("    {} = {};\n", attribute.varying_name(), attribute.input_name()));
    }
    if let Some(position) = layout.find(AttributeSemantic::Position) {
        src.push_str(&format!("    gl_Position = {};\n", position.input_name()));
    }
    src.push_str("}\n");
    src
}

// ============================================================================
// Fragment stage
// ============================================================================

/// How a combiner operand is being evaluated
#[derive(Clone, Copy)]
struct Operand {
    /// Result is a vec4 (color and alpha combined)
    with_alpha: bool,
    /// Result is the alpha float only
    only_alpha: bool,
    /// Shade inputs are vec4
    inputs_have_alpha: bool,
    first_cycle: bool,
}

impl Operand {
    fn splat(&self, value: &str) -> String {
        if self.only_alpha {
            value.to_string()
        } else if self.with_alpha {
            format!("vec4({0}, {0}, {0}, {0})", value)
        } else {
            format!("vec3({0}, {0}, {0})", value)
        }
    }

    /// Select the part of a vec4 expression this operand needs
    fn channel_of(&self, vec4_expr: &str) -> String {
        if self.only_alpha {
            format!("{}.a", vec4_expr)
        } else if self.with_alpha {
            vec4_expr.to_string()
        } else {
            format!("{}.rgb", vec4_expr)
        }
    }

    fn item(&self, input: CombinerInput) -> String {
        // The second cycle sees the texture units swapped
        let (tex_a, tex_b) = if self.first_cycle { ("texVal0", "texVal1") } else { ("texVal1", "texVal0") };
        match input {
            CombinerInput::Zero => self.splat("0.0"),
            CombinerInput::One => self.splat("1.0"),
            CombinerInput::Texel0 => self.channel_of(tex_a),
            CombinerInput::Texel1 => self.channel_of(tex_b),
            CombinerInput::Texel0Alpha => self.splat(&format!("{}.a", tex_a)),
            CombinerInput::Texel1Alpha => self.splat(&format!("{}.a", tex_b)),
            CombinerInput::Combined => {
                if self.only_alpha {
                    "texel.a".to_string()
                } else if self.with_alpha || !self.inputs_have_alpha {
                    "texel".to_string()
                } else {
                    "texel.rgb".to_string()
                }
            }
            CombinerInput::Noise => self.splat("noiseValue"),
            other => {
                // Input1..Input7, only these are left
                let name = format!("vInput{}", other.input_index().unwrap_or(1) - 1);
                if self.only_alpha {
                    format!("{}.a", name)
                } else if self.with_alpha || !self.inputs_have_alpha {
                    name
                } else {
                    format!("{}.rgb", name)
                }
            }
        }
    }
}

/// `(a - b) * c + d` with the single/multiply/mix shortcuts
fn formula(
    slots: &[CombinerInput; NUM_SLOTS],
    do_single: bool,
    do_multiply: bool,
    do_mix: bool,
    operand: Operand,
) -> String {
    let [a, b, c, d] = (*slots).map(|input| operand.item(input));
    if do_single {
        d
    } else if do_multiply {
        format!("{} * {}", a, c)
    } else if do_mix {
        format!("mix({}, {}, {})", b, a, c)
    } else {
        format!("({} - {}) * {} + {}", a, b, c, d)
    }
}

fn uses_noise(features: &FeatureDescriptor) -> bool {
    let in_combiner = features.c[..features.cycles()]
        .iter()
        .flatten()
        .flatten()
        .any(|input| *input == CombinerInput::Noise);
    in_combiner || (features.opt_alpha && features.opt_noise)
}

fn texture_sampler_function(unit: usize) -> String {
    let tex = format!("sampler2D(uTex{0}, uSampler{0})", unit);
    format!(
        "vec4 sampleTex{unit}(vec2 uv, vec2 texSize) {{\n\
         \x20   if (pc.texture_filtering{unit} == {three_point}) {{\n\
         \x20       vec2 offset = fract(uv * texSize - vec2(0.5));\n\
         \x20       offset -= vec2(step(1.0, offset.x + offset.y));\n\
         \x20       vec4 c0 = texture({tex}, uv - offset / texSize);\n\
         \x20       vec4 c1 = texture({tex}, uv - vec2(offset.x - sign(offset.x), offset.y) / texSize);\n\
         \x20       vec4 c2 = texture({tex}, uv - vec2(offset.x, offset.y - sign(offset.y)) / texSize);\n\
         \x20       return c0 + abs(offset.x) * (c1 - c0) + abs(offset.y) * (c2 - c0);\n\
         \x20   }}\n\
         \x20   return texture({tex}, uv);\n\
         }}\n\n",
        unit = unit,
        three_point = FILTER_THREE_POINT,
        tex = tex,
    )
}

pub fn fragment_source(features: &FeatureDescriptor, layout: &VertexLayout) -> String {
    let alpha = features.opt_alpha;
    let texel_type = if alpha { "vec4" } else { "vec3" };
    let rgb = if alpha { "texel.rgb" } else { "texel" };

    let mut src = String::from("#version 450\n\n");

    for attribute in layout.varyings() {
        src.push_str(&format!(
            "layout(location = {}) in {} {};\n",
            attribute.location,
            attribute.glsl_type(),
            attribute.varying_name()
        ));
    }
    src.push_str("\nlayout(location = 0) out vec4 outColor;\n\n");

    for unit in 0..2 {
        src.push_str(&format!(
            "layout(set = 0, binding = {}) uniform texture2D uTex{};\n",
            unit * 2,
            unit
        ));
        src.push_str(&format!(
            "layout(set = 0, binding = {}) uniform sampler uSampler{};\n",
            unit * 2 + 1,
            unit
        ));
    }

    src.push_str(
        "\nlayout(push_constant) uniform FrameConstants {\n\
         \x20   int frame_count;\n\
         \x20   float noise_scale;\n\
         \x20   int texture_filtering0;\n\
         \x20   int texture_filtering1;\n\
         } pc;\n\n",
    );

    src.push_str(
        "float random(vec3 value) {\n\
         \x20   float r = dot(sin(value), vec3(12.9898, 78.233, 37.719));\n\
         \x20   return fract(sin(r) * 143758.5453);\n\
         }\n\n",
    );
    src.push_str(
        "vec3 wrapColor(vec3 x, float low, float high) {\n\
         \x20   return mod(x - vec3(low), vec3(high - low)) + vec3(low);\n\
         }\n\n",
    );
    src.push_str(
        "float wrapAlpha(float x, float low, float high) {\n\
         \x20   return mod(x - low, high - low) + low;\n\
         }\n\n",
    );

    for unit in 0..2 {
        if features.uses_texture(unit) {
            src.push_str(&texture_sampler_function(unit));
        }
    }

    src.push_str("void main() {\n");

    // Texture fetches, with the clamp axes applied to the coordinates
    for unit in 0..2 {
        if !features.uses_texture(unit) {
            src.push_str(&format!("    vec4 texVal{} = vec4(0.0, 0.0, 0.0, 0.0);\n", unit));
            continue;
        }
        src.push_str(&format!(
            "    vec2 texSize{0} = vec2(textureSize(sampler2D(uTex{0}, uSampler{0}), 0));\n",
            unit
        ));
        src.push_str(&format!("    vec2 texCoord{0} = vTexCoord{0};\n", unit));
        if features.clamp[unit][0] {
            src.push_str(&format!(
                "    texCoord{0}.x = clamp(texCoord{0}.x, 0.5 / texSize{0}.x, vTexClampS{0});\n",
                unit
            ));
        }
        if features.clamp[unit][1] {
            src.push_str(&format!(
                "    texCoord{0}.y = clamp(texCoord{0}.y, 0.5 / texSize{0}.y, vTexClampT{0});\n",
                unit
            ));
        }
        src.push_str(&format!(
            "    vec4 texVal{0} = sampleTex{0}(texCoord{0}, texSize{0});\n",
            unit
        ));
    }

    if uses_noise(features) {
        src.push_str(
            "    float noiseValue = random(vec3(floor(gl_FragCoord.xy * pc.noise_scale), float(pc.frame_count)));\n",
        );
    }

    src.push_str(&format!("    {} texel = {}(0.0);\n", texel_type, texel_type));

    for cycle in 0..features.cycles() {
        let first_cycle = cycle == 0;
        let c = &features.c[cycle];
        let color = |with_alpha: bool, only_alpha: bool, channel: usize| {
            formula(
                &c[channel],
                features.do_single[cycle][channel],
                features.do_multiply[cycle][channel],
                features.do_mix[cycle][channel],
                Operand { with_alpha, only_alpha, inputs_have_alpha: alpha, first_cycle },
            )
        };

        let expr = if alpha && !features.color_alpha_same[cycle] {
            format!(
                "vec4({}, {})",
                color(false, false, CHANNEL_COLOR),
                color(true, true, CHANNEL_ALPHA)
            )
        } else {
            color(alpha, false, CHANNEL_COLOR)
        };
        src.push_str(&format!("    texel = {};\n", expr));

        if first_cycle && features.cycles() > 1 {
            src.push_str(&format!("    {0} = wrapColor({0}, -1.01, 1.01);\n", rgb));
            if alpha {
                src.push_str("    texel.a = wrapAlpha(texel.a, -0.51, 1.51);\n");
            }
        }
    }

    if features.opt_texture_edge && alpha {
        src.push_str("    if (texel.a > 0.19) texel.a = 1.0; else discard;\n");
    }

    src.push_str(&format!("    {0} = clamp(wrapColor({0}, -0.51, 1.51), vec3(0.0), vec3(1.0));\n", rgb));
    if alpha {
        src.push_str("    texel.a = clamp(wrapAlpha(texel.a, -0.51, 1.51), 0.0, 1.0);\n");
    }

    if features.opt_fog {
        src.push_str(&format!("    {0} = mix({0}, vFog.rgb, vFog.a);\n", rgb));
    }

    if features.opt_grayscale {
        src.push_str("    float intensity = (texel.r + texel.g + texel.b) / 3.0;\n");
        src.push_str(&format!(
            "    {0} = mix({0}, vGrayscaleColor.rgb * intensity, vGrayscaleColor.a);\n",
            rgb
        ));
    }

    if alpha {
        if features.opt_noise {
            src.push_str("    texel.a *= floor(clamp(noiseValue + texel.a, 0.0, 1.0));\n");
        }
        if features.opt_alpha_threshold {
            src.push_str("    if (texel.a < 8.0 / 256.0) discard;\n");
        }
        if features.opt_invisible {
            src.push_str("    texel.a = 0.0;\n");
        }
        src.push_str("    outColor = texel;\n");
    } else {
        src.push_str("    outColor = vec4(texel, 1.0);\n");
    }

    src.push_str("}\n");
    src
}

#[cfg(test)]
#[path = "vulkan_shader_source_tests.rs"]
mod tests;
