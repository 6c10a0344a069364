mod common;

use common::{chain, Probe};
use fusejit::{derive_key, CacheKey, ModuleAssembler, ToolchainIdentity};

fn toolchain() -> ToolchainIdentity {
    ToolchainIdentity {
        compiler: "cc".to_string(),
        version: "cc (test) 1.0".to_string(),
        flags: vec!["-O2".to_string()],
    }
}

fn key_for(kinds: &[std::sync::Arc<dyn fusejit::OpKind>], name: &str) -> anyhow::Result<CacheKey> {
    let module = ModuleAssembler::new().assemble(&chain(name, kinds))?;
    Ok(derive_key(&module, &toolchain())?)
}

#[test]
fn structurally_identical_graphs_share_a_key() -> anyhow::Result<()> {
    let first = key_for(&[Probe::new("copy").arc()], "first")?;
    let second = key_for(&[Probe::new("copy").arc()], "second")?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn identical_source_implies_identical_key() -> anyhow::Result<()> {
    let assembler = ModuleAssembler::new();
    let kinds = [Probe::new("copy").params("x=1").arc()];
    let left = assembler.assemble(&chain("left", &kinds))?;
    let right = assembler.assemble(&chain("right", &kinds))?;
    assert_eq!(left.source, right.source);
    assert_eq!(derive_key(&left, &toolchain())?, derive_key(&right, &toolchain())?);
    Ok(())
}

#[test]
fn version_params_and_structure_change_the_key() -> anyhow::Result<()> {
    let base = key_for(&[Probe::new("copy").arc()], "g")?;
    let bumped = key_for(&[Probe::new("copy").version(Some(vec![1, 1])).arc()], "g")?;
    let params = key_for(&[Probe::new("copy").params("mode=fast").arc()], "g")?;
    let longer = key_for(&[Probe::new("copy").arc(), Probe::new("copy").arc()], "g")?;
    let renamed = key_for(&[Probe::new("clone").arc()], "g")?;
    for other in [bumped, params, longer, renamed] {
        assert_ne!(base, other);
    }
    Ok(())
}

#[test]
fn toolchain_identity_is_part_of_the_key() -> anyhow::Result<()> {
    let module = ModuleAssembler::new().assemble(&chain("g", &[Probe::new("copy").arc()]))?;
    let mut other = toolchain();
    other.flags = vec!["-O3".to_string()];
    assert_ne!(derive_key(&module, &toolchain())?, derive_key(&module, &other)?);
    Ok(())
}

#[test]
fn unversioned_kinds_hash_the_full_source() -> anyhow::Result<()> {
    let unversioned = Probe::new("copy").version(None);
    let module = ModuleAssembler::new().assemble(&chain("g", &[unversioned.clone().arc()]))?;
    assert!(!module.is_versioned());
    assert_eq!(module.unversioned_kinds(), vec!["copy"]);

    let mut edited = module.clone();
    edited.source.push_str("/* edited */\n");
    assert_ne!(derive_key(&module, &toolchain())?, derive_key(&edited, &toolchain())?);

    let empty = Probe::new("copy").version(Some(Vec::new()));
    let versioned = key_for(&[Probe::new("copy").arc()], "g")?;
    assert_ne!(key_for(&[empty.arc()], "g")?, versioned);
    assert_eq!(key_for(&[unversioned.arc()], "other")?, derive_key(&module, &toolchain())?);
    Ok(())
}

#[test]
fn versioned_keys_ignore_source_text() -> anyhow::Result<()> {
    let module = ModuleAssembler::new().assemble(&chain("g", &[Probe::new("copy").arc()]))?;
    let mut edited = module.clone();
    edited.source.push_str("/* edited */\n");
    assert_eq!(derive_key(&module, &toolchain())?, derive_key(&edited, &toolchain())?);
    Ok(())
}

#[test]
fn keys_print_and_parse_as_hex() -> anyhow::Result<()> {
    let key = key_for(&[Probe::new("copy").arc()], "g")?;
    let hex = key.to_string();
    assert_eq!(hex.len(), 64);
    assert_eq!(key.shard(), hex[..2]);
    assert_eq!(CacheKey::from_hex(&hex)?, key);
    assert!(CacheKey::from_hex("zz").is_err());
    Ok(())
}
