use std::{env, fs, path::PathBuf};

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());

    // Unit cube from gl_VertexIndex, no vertex buffers. One draw covers
    // every eye: gl_ViewIndex picks the eye's view-projection.
    //   set 0, binding 0: world + viewProjection[EYE_COUNT]
    //   constant_id 0: eye count, from the pipeline's specialization info
    let vs_src = r#"
#version 450
#extension GL_EXT_multiview : require

layout(constant_id = 0) const int EYE_COUNT = 2;

layout(set = 0, binding = 0) uniform Scene {
    mat4 world;
    mat4 viewProjection[EYE_COUNT];
} scene;

layout(location = 0) out vec3 vColor;

const vec3 CORNERS[8] = vec3[](
    vec3(-0.5, -0.5, -0.5), vec3( 0.5, -0.5, -0.5),
    vec3( 0.5,  0.5, -0.5), vec3(-0.5,  0.5, -0.5),
    vec3(-0.5, -0.5,  0.5), vec3( 0.5, -0.5,  0.5),
    vec3( 0.5,  0.5,  0.5), vec3(-0.5,  0.5,  0.5)
);

const int INDICES[36] = int[](
    0, 2, 1,  0, 3, 2,
    4, 5, 6,  4, 6, 7,
    0, 4, 7,  0, 7, 3,
    1, 2, 6,  1, 6, 5,
    0, 1, 5,  0, 5, 4,
    3, 7, 6,  3, 6, 2
);

void main() {
    vec3 p = CORNERS[INDICES[gl_VertexIndex]];
    vColor = p + 0.5;
    gl_Position = scene.viewProjection[gl_ViewIndex] * scene.world * vec4(p, 1.0);
}
"#;

    //   set 0, binding 1: time
    let fs_src = r#"
#version 450
layout(set = 0, binding = 1) uniform Animation { float time; } anim;

layout(location = 0) in vec3 vColor;
layout(location = 0) out vec4 outColor;

void main() {
    float pulse = 0.75 + 0.25 * sin(anim.time);
    outColor = vec4(vColor * pulse, 1.0);
}
"#;

    let comp = shaderc::Compiler::new().unwrap();
    let mut opts = shaderc::CompileOptions::new().unwrap();

    // Multiview is core in 1.1, which the context requires anyway.
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_1 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let vs_spv = comp
        .compile_into_spirv(
            vs_src,
            shaderc::ShaderKind::Vertex,
            "scene.vert",
            "main",
            Some(&opts),
        )
        .unwrap();

    let fs_spv = comp
        .compile_into_spirv(
            fs_src,
            shaderc::ShaderKind::Fragment,
            "scene.frag",
            "main",
            Some(&opts),
        )
        .unwrap();

    fs::write(out.join("scene.vert.spv"), vs_spv.as_binary_u8()).unwrap();
    fs::write(out.join("scene.frag.spv"), fs_spv.as_binary_u8()).unwrap();

    println!("cargo:rerun-if-changed=build.rs");
}
