//! Validates every technique's WGSL with naga.
//!
//! The wgpu backend compiles these at runtime; catching a broken shader
//! here keeps the failure out of `Pipeline::initialize`.

use gpups::effect::{TechniqueDef, TECHNIQUES};

fn validate(def: &TechniqueDef) -> Result<naga::Module, String> {
    let module = naga::front::wgsl::parse_str(&def.wgsl())
        .map_err(|e| format!("{}: WGSL parse error: {:?}", def.name, e))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator
        .validate(&module)
        .map_err(|e| format!("{}: WGSL validation error: {:?}", def.name, e))?;

    Ok(module)
}

#[test]
fn test_every_technique_validates() {
    for def in TECHNIQUES.iter() {
        if let Err(e) = validate(def) {
            panic!("{}", e);
        }
    }
}

#[test]
fn test_every_technique_has_both_stages() {
    for def in TECHNIQUES.iter() {
        let module = validate(def).unwrap();
        let stages: Vec<_> = module
            .entry_points
            .iter()
            .map(|ep| (ep.name.as_str(), ep.stage))
            .collect();
        assert!(
            stages.contains(&("vs_main", naga::ShaderStage::Vertex)),
            "{} has no vertex entry point",
            def.name
        );
        assert!(
            stages.contains(&("fs_main", naga::ShaderStage::Fragment)),
            "{} has no fragment entry point",
            def.name
        );
    }
}

#[test]
fn test_texture_bindings_follow_declaration_order() {
    for def in TECHNIQUES.iter() {
        let module = validate(def).unwrap();
        for (i, slot) in def.textures.iter().enumerate() {
            let binding = module
                .global_variables
                .iter()
                .find(|(_, var)| var.name.as_deref() == Some(slot.name))
                .and_then(|(_, var)| var.binding.as_ref())
                .unwrap_or_else(|| panic!("{} does not declare {}", def.name, slot.name));
            assert_eq!(binding.group, 0);
            assert_eq!(binding.binding, i as u32 + 1, "{}::{}", def.name, slot.name);
        }
    }
}

#[test]
fn test_uniform_block_size_matches_slots() {
    for def in TECHNIQUES.iter().filter(|d| !d.uniforms.is_empty()) {
        let module = validate(def).unwrap();
        let params = module
            .global_variables
            .iter()
            .find(|(_, var)| var.name.as_deref() == Some("params"))
            .map(|(_, var)| var.ty)
            .unwrap_or_else(|| panic!("{} has no params block", def.name));
        let size = module.types[params].inner.size(module.to_ctx());
        assert_eq!(size as usize, def.uniform_slots() * 16, "{}", def.name);
    }
}
