mod common;

use std::sync::Arc;

use common::{chain, f32_vec, Probe};
use fusejit::{GraphBuilder, JitError, LinkRequirements, ModuleAssembler, SupportBlock};

fn shared_block() -> SupportBlock {
    SupportBlock::new("test.shared", "static int shared_helper(int x) { return x + 1; }")
        .defines("shared_helper")
}

#[test]
fn applications_are_named_by_position() -> anyhow::Result<()> {
    let graph = chain("names", &[Probe::new("copy").arc(), Probe::new("copy-2").arc()]);
    let module = ModuleAssembler::new().assemble(&graph)?;
    let names: Vec<&str> = module
        .applications
        .iter()
        .map(|app| app.name.as_str())
        .collect();
    assert_eq!(names, vec!["n0_copy", "n1_copy_2"]);
    assert!(module.source.contains("/* n0_copy */"));
    assert!(module.source.contains("/* n1_copy_2 */"));
    Ok(())
}

#[test]
fn assembly_is_deterministic() -> anyhow::Result<()> {
    let kinds = [Probe::new("a").with_app_block().arc(), Probe::new("b").arc()];
    let first = ModuleAssembler::new().assemble(&chain("first", &kinds))?;
    let second = ModuleAssembler::new().assemble(&chain("second", &kinds))?;
    assert_eq!(first.source, second.source);
    assert!(!first.source.contains("first"));
    Ok(())
}

#[test]
fn shared_kind_block_is_emitted_once() -> anyhow::Result<()> {
    let graph = chain(
        "shared",
        &[
            Probe::new("left").block(shared_block()).arc(),
            Probe::new("right").block(shared_block()).arc(),
        ],
    );
    let module = ModuleAssembler::new().assemble(&graph)?;
    assert_eq!(module.source.matches("static int shared_helper").count(), 1);
    assert_eq!(module.source.matches("/* test.shared */").count(), 1);
    Ok(())
}

#[test]
fn inconsistent_kind_block_is_rejected() {
    let other = SupportBlock::new("test.shared", "static int shared_helper(int x) { return x; }")
        .defines("shared_helper");
    let graph = chain(
        "inconsistent",
        &[
            Probe::new("left").block(shared_block()).arc(),
            Probe::new("right").block(other).arc(),
        ],
    );
    let err = ModuleAssembler::new().assemble(&graph).unwrap_err();
    assert!(matches!(err, JitError::Assembly { .. }), "{err}");
    assert!(err.to_string().contains("test.shared"));
}

#[test]
fn duplicate_global_symbol_is_rejected() {
    let clash = SupportBlock::new("test.other", "static int shared_helper(void) { return 0; }")
        .defines("shared_helper");
    let graph = chain(
        "clash",
        &[
            Probe::new("left").block(shared_block()).arc(),
            Probe::new("right").block(clash).arc(),
        ],
    );
    let err = ModuleAssembler::new().assemble(&graph).unwrap_err();
    assert!(err.to_string().contains("duplicate symbol 'shared_helper'"), "{err}");
}

#[test]
fn reserved_runtime_symbols_cannot_be_redefined() {
    let block = SupportBlock::new("test.numel", "static int x;").defines("fusejit_numel");
    let graph = chain("reserved", &[Probe::new("p").block(block).arc()]);
    let err = ModuleAssembler::new().assemble(&graph).unwrap_err();
    assert!(err.to_string().contains("fusejit_numel"), "{err}");
}

#[test]
fn support_blocks_follow_dependencies() -> anyhow::Result<()> {
    let base = SupportBlock::new("test.base", "static int base_value(void) { return 1; }")
        .defines("base_value");
    let derived = SupportBlock::new(
        "test.derived",
        "static int derived_value(void) { return base_value() + 1; }",
    )
    .defines("derived_value")
    .after("test.base");
    // `derived` is contributed first but must be emitted after `base`.
    let graph = chain(
        "deps",
        &[
            Probe::new("first").block(derived).arc(),
            Probe::new("second").block(base).arc(),
        ],
    );
    let module = ModuleAssembler::new().assemble(&graph)?;
    let base_at = module.source.find("base_value(void) { return 1; }");
    let derived_at = module.source.find("derived_value(void)");
    assert!(base_at.is_some() && derived_at.is_some());
    assert!(base_at < derived_at);
    Ok(())
}

#[test]
fn missing_dependency_and_cycles_are_rejected() {
    let orphan = SupportBlock::new("test.orphan", "/* orphan */").after("test.nowhere");
    let graph = chain("missing", &[Probe::new("p").block(orphan).arc()]);
    let err = ModuleAssembler::new().assemble(&graph).unwrap_err();
    assert!(err.to_string().contains("test.nowhere"), "{err}");

    let a = SupportBlock::new("test.a", "/* a */").after("test.b");
    let b = SupportBlock::new("test.b", "/* b */").after("test.a");
    let graph = chain("cycle", &[Probe::new("p").block(a).block(b).arc()]);
    let err = ModuleAssembler::new().assemble(&graph).unwrap_err();
    assert!(err.to_string().contains("cycle"), "{err}");
}

#[test]
fn contributor_errors_carry_kind_and_application() {
    let graph = chain(
        "reject",
        &[Probe::new("ok").arc(), Probe::new("picky").rejecting("rank 3 unsupported").arc()],
    );
    let err = ModuleAssembler::new().assemble(&graph).unwrap_err();
    match err {
        JitError::Contributor {
            kind,
            application,
            message,
        } => {
            assert_eq!(kind, "picky");
            assert_eq!(application, "n1_picky");
            assert_eq!(message, "rank 3 unsupported");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn extent_count_must_match_declared_rank() {
    let graph = chain("extents", &[Probe::new("bad").extents(Vec::new()).arc()]);
    let err = ModuleAssembler::new().assemble(&graph).unwrap_err();
    assert!(matches!(err, JitError::Contributor { .. }), "{err}");
}

#[test]
fn application_support_is_scoped_per_application() -> anyhow::Result<()> {
    let kind = Probe::new("helper").with_app_block().arc();
    let graph = chain("scoped", &[Arc::clone(&kind), kind]);
    let module = ModuleAssembler::new().assemble(&graph)?;
    assert!(module.source.contains("static int n0_helper_helper(void)"));
    assert!(module.source.contains("static int n1_helper_helper(void)"));
    Ok(())
}

#[test]
fn intermediates_use_temporary_slots() -> anyhow::Result<()> {
    let graph = chain("temps", &[Probe::new("a").arc(), Probe::new("b").arc()]);
    let module = ModuleAssembler::new().assemble(&graph)?;
    assert!(module.source.contains("fusejit_buffer* fusejit_temps[1] = {0};"));
    assert!(module.source.contains("const fusejit_buffer* in0 = fusejit_temps[0];"));
    assert!(module.source.contains("&outputs[0]"));
    assert!(module.source.contains("rt->release(rt->ctx, fusejit_temps[index]);"));
    Ok(())
}

#[test]
fn link_requirements_and_init_are_aggregated() -> anyhow::Result<()> {
    let first = LinkRequirements::new()
        .header("math.h")
        .library("m")
        .init("counter = 0;");
    let second = LinkRequirements::new().header("math.h").library("dl");
    let graph = chain(
        "link",
        &[
            Probe::new("a").link(first).non_reentrant().arc(),
            Probe::new("b").link(second).arc(),
        ],
    );
    let module = ModuleAssembler::new().assemble(&graph)?;
    assert_eq!(module.link.headers, vec!["math.h"]);
    assert_eq!(module.link.libraries, vec!["m", "dl"]);
    assert!(module.has_init);
    assert!(!module.reentrant);
    assert_eq!(module.source.matches("#include <math.h>").count(), 1);
    assert!(module.source.contains("fusejit_init(const fusejit_runtime* rt)"));
    Ok(())
}

#[test]
fn header_lists_the_structural_manifest() -> anyhow::Result<()> {
    let graph = chain(
        "manifest",
        &[Probe::new("scaled").params("factor=2").version(Some(vec![3, 1])).arc()],
    );
    let module = ModuleAssembler::new().assemble(&graph)?;
    assert!(module.source.starts_with("/* fusejit generated module"));
    assert!(module.source.contains("n0_scaled: scaled(factor=2) v3.1"));
    assert!(module.source.contains("inputs: [v0:f32/r1]"));
    Ok(())
}

#[test]
fn graph_outputs_cannot_forward_inputs() {
    let mut builder = GraphBuilder::new("forward");
    let input = builder.add_input(f32_vec());
    let err = builder.finish(vec![input]).unwrap_err();
    assert!(matches!(err, JitError::Graph { .. }));
}
