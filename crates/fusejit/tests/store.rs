use std::fs;

use fusejit::{
    ArtifactRecord, ArtifactStore, CacheKey, DiskStore, JitError, MemoryStore, ENTRY_SYMBOL,
};

fn key(byte: u8) -> CacheKey {
    CacheKey::from_bytes([byte; 32])
}

fn record(key: &CacheKey) -> ArtifactRecord {
    ArtifactRecord::new(key, ENTRY_SYMBOL, false, true, vec![0x7f, b'E', b'L', b'F'])
}

#[test]
fn disk_store_round_trips_records() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = DiskStore::new(dir.path());
    let key = key(0xab);
    assert!(!store.exists(&key));
    assert_eq!(store.read(&key)?, None);

    let bytes = record(&key).encode()?;
    store.write(&key, &bytes)?;
    assert!(store.exists(&key));
    let path = store.path_for(&key);
    assert_eq!(path, dir.path().join("ab").join(format!("{key}.artifact")));

    let loaded = ArtifactRecord::decode(&key, &store.read(&key)?.expect("stored"))?;
    assert_eq!(loaded, record(&key));
    Ok(())
}

#[test]
fn disk_store_overwrites_atomically_and_leaves_no_temp_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = DiskStore::new(dir.path());
    let key = key(0x01);
    store.write(&key, b"first")?;
    store.write(&key, b"second")?;
    assert_eq!(store.read(&key)?.as_deref(), Some(&b"second"[..]));

    let entries: Vec<_> = fs::read_dir(dir.path().join(key.shard()))?
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(entries.len(), 1);
    Ok(())
}

#[test]
fn remove_reports_whether_an_entry_existed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let stores: Vec<Box<dyn ArtifactStore>> =
        vec![Box::new(DiskStore::new(dir.path())), Box::new(MemoryStore::new())];
    for store in stores {
        store.write(&key(2), b"bytes")?;
        assert!(store.remove(&key(2))?);
        assert!(!store.remove(&key(2))?);
        assert!(!store.exists(&key(2)));
    }
    Ok(())
}

#[test]
fn corrupt_records_are_reported_as_corruption() -> anyhow::Result<()> {
    let key = key(3);
    let garbage = ArtifactRecord::decode(&key, b"not a record").unwrap_err();
    assert!(matches!(garbage, JitError::CacheCorruption { .. }), "{garbage}");

    let foreign = record(&CacheKey::from_bytes([4; 32])).encode()?;
    let err = ArtifactRecord::decode(&key, &foreign).unwrap_err();
    assert!(err.to_string().contains("belongs to key"), "{err}");

    let mut stale = record(&key);
    stale.format += 1;
    let err = ArtifactRecord::decode(&key, &stale.encode()?).unwrap_err();
    assert!(err.to_string().contains("artifact format"), "{err}");

    let mut truncated = record(&key).encode()?;
    truncated.truncate(truncated.len() / 2);
    assert!(ArtifactRecord::decode(&key, &truncated).is_err());
    Ok(())
}
