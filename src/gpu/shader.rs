/// Property copy kernel source
///
/// Generates the WGSL scatter/gather kernel for a given property count and
/// workgroup size. Arrayed bindings (inputs, outputs) are flattened to
/// consecutive binding numbers since WGSL storage buffers cannot be indexed
/// as a binding array without extra device features.

use std::fmt::Write;
use super::driver::{DescriptorBinding, DescriptorType, ShaderStage};

/// Header buffer: counts, signed sizes, index offsets, indices
pub const HEADER_BINDING: u32 = 0;
/// One input buffer per property
pub const INPUT_BINDING: u32 = 1;
/// One output buffer per property
pub const OUTPUT_BINDING: u32 = 2;

pub const ENTRY_POINT: &str = "main";

/// Layout of the copy kernel's single descriptor set
pub fn copy_layout_bindings(property_count: u32) -> [DescriptorBinding; 3] {
    [HEADER_BINDING, INPUT_BINDING, OUTPUT_BINDING].map(|binding| DescriptorBinding {
        binding,
        ty: DescriptorType::StorageBuffer,
        count: if binding == HEADER_BINDING { 1 } else { property_count },
        stage: ShaderStage::Compute,
    })
}

/// Flat binding number of `element` within arrayed `binding`
pub fn flattened_binding(binding: u32, element: u32, property_count: u32) -> u32 {
    match binding {
        HEADER_BINDING => 0,
        INPUT_BINDING => 1 + element,
        _ => 1 + property_count + element,
    }
}

/// Copy kernel specialized for one property count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyShader {
    pub property_count: u32,
    pub workgroup_size: u32,
    pub source: String,
}

impl CopyShader {
    pub fn new(property_count: u32, workgroup_size: u32) -> Self {
        Self {
            property_count,
            workgroup_size,
            source: generate_wgsl(property_count, workgroup_size),
        }
    }

    pub fn entry_point(&self) -> &'static str {
        ENTRY_POINT
    }
}

// `fmt::Write` into a String cannot fail
fn generate_wgsl(property_count: u32, workgroup_size: u32) -> String {
    let mut src = String::new();

    let _ = writeln!(src, "const PROPERTY_COUNT: u32 = {}u;", property_count);
    src.push_str("\nstruct Words {\n    data: array<u32>,\n};\n\n");

    let _ = writeln!(
        src,
        "@group(0) @binding({}) var<storage, read_write> header: Words;",
        flattened_binding(HEADER_BINDING, 0, property_count)
    );
    for p in 0..property_count {
        let _ = writeln!(
            src,
            "@group(0) @binding({}) var<storage, read_write> in_{}: Words;",
            flattened_binding(INPUT_BINDING, p, property_count),
            p
        );
    }
    for p in 0..property_count {
        let _ = writeln!(
            src,
            "@group(0) @binding({}) var<storage, read_write> out_{}: Words;",
            flattened_binding(OUTPUT_BINDING, p, property_count),
            p
        );
    }

    src.push_str("\nfn load_word(prop: u32, i: u32) -> u32 {\n    switch prop {\n");
    for p in 0..property_count {
        let _ = writeln!(src, "        case {}u: {{ return in_{}.data[i]; }}", p, p);
    }
    src.push_str("        default: { return 0u; }\n    }\n}\n");

    src.push_str("\nfn store_word(prop: u32, i: u32, value: u32) {\n    switch prop {\n");
    for p in 0..property_count {
        let _ = writeln!(src, "        case {}u: {{ out_{}.data[i] = value; }}", p, p);
    }
    src.push_str("        default: {}\n    }\n}\n");

    let _ = writeln!(src, "\n@compute @workgroup_size({}, 1, 1)", workgroup_size);
    src.push_str(COPY_MAIN);
    src
}

const COPY_MAIN: &str = r#"fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
) {
    let prop = wid.y;

    let flag = bitcast<i32>(header.data[PROPERTY_COUNT + prop]);
    let download = flag < 0;
    let dwords = u32(abs(flag));

    let index = gid.x / dwords;
    if (index >= header.data[prop]) {
        return;
    }

    let index_offset = header.data[2u * PROPERTY_COUNT + prop];
    // same as indices[index] * dwords + gid.x % dwords
    let redir = (header.data[3u * PROPERTY_COUNT + index_offset + index] - index) * dwords + gid.x;

    var in_index = gid.x;
    var out_index = redir;
    if (download) {
        in_index = redir;
        out_index = gid.x;
    }
    store_word(prop, out_index, load_word(prop, in_index));
}
"#;
