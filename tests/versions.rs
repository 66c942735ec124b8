//! Storage and application version handling across reopen

use cluster_store::{
    Container, ContainerBuilder, IoState, OpenMode, RecordIo, StoreConfig, StoreError,
    VersionContainer,
};

fn v(main: u16) -> VersionContainer {
    VersionContainer::new(main)
}

/// V2 container holding one stream written under V1 and one under V2
fn mixed_image() -> Vec<u8> {
    let mut store = ContainerBuilder::new()
        .cluster_capacity(32)
        .storage_version(2)
        .create()
        .unwrap();

    let engine = store.engine_mut();
    engine.open("old", OpenMode::write(), &v(1)).unwrap();
    engine.put_str("written by v1").unwrap();
    engine.put_count(3).unwrap();
    engine.close().unwrap();

    engine.open("new", OpenMode::write(), &v(2)).unwrap();
    engine.put_str("written by v2").unwrap();
    engine.put_count(70_000).unwrap();
    engine.close().unwrap();

    store.into_bytes().unwrap()
}

#[test]
fn test_streams_keep_their_layout_after_reopen() {
    let mut store = Container::from_bytes(mixed_image(), StoreConfig::default()).unwrap();
    assert_eq!(store.engine().storage_version(), 2);

    let old = store.engine().find("old").unwrap();
    let new = store.engine().find("new").unwrap();
    assert_eq!(store.engine().stream_versions(old).unwrap().main(), 1);
    assert_eq!(store.engine().stream_versions(new).unwrap().main(), 2);

    // u16 counts under v1, u32 under v2
    assert_eq!(store.len_of("old").unwrap(), 2 + 13 + 2);
    assert_eq!(store.len_of("new").unwrap(), 4 + 13 + 4);

    let engine = store.engine_mut();
    engine.open("old", OpenMode::read(), &v(2)).unwrap();
    assert_eq!(engine.get_str().unwrap(), "written by v1");
    assert_eq!(engine.get_count().unwrap(), 3);
    engine.close().unwrap();

    engine.open("new", OpenMode::read(), &v(2)).unwrap();
    assert_eq!(engine.get_str().unwrap(), "written by v2");
    assert_eq!(engine.get_count().unwrap(), 70_000);
    engine.close().unwrap();
}

#[test]
fn test_older_reader_rejects_newer_stream() {
    let mut store = Container::from_bytes(mixed_image(), StoreConfig::read_only()).unwrap();
    let engine = store.engine_mut();

    engine.open("old", OpenMode::read(), &v(1)).unwrap();
    engine.close().unwrap();
    assert!(engine.good());

    assert!(matches!(
        engine.open("new", OpenMode::read(), &v(1)),
        Err(StoreError::StreamVersion { .. })
    ));
    assert!(engine.state().contains(IoState::VER_VIOLATION));
}

#[test]
fn test_count_overflow_under_narrow_layout() {
    let mut store = Container::in_memory(StoreConfig::default()).unwrap();
    let engine = store.engine_mut();
    engine.open("narrow", OpenMode::write(), &v(1)).unwrap();
    assert!(matches!(
        engine.put_count(70_000),
        Err(StoreError::Underflow64To32 { .. })
    ));
    assert!(engine.state().contains(IoState::UNDERFLOW_64_TO_32));
    engine.close().unwrap();
}

#[test]
fn test_unknown_main_version() {
    let mut store = Container::in_memory(StoreConfig::default()).unwrap();
    store.write("s", b"data").unwrap();

    let engine = store.engine_mut();
    assert!(matches!(
        engine.open("s", OpenMode::read(), &v(4)),
        Err(StoreError::UnsupportedStorageVersion { found: 4, .. })
    ));
    assert!(engine.state().contains(IoState::VER_VIOLATION));
    assert!(store.set_versions(v(4)).is_err());
}

#[test]
fn test_set_storage_version_persists() {
    let mut store = Container::in_memory(StoreConfig::default()).unwrap();
    store.write("s", b"kept across the downgrade").unwrap();
    store.engine_mut().set_storage_version(1).unwrap();
    store.engine_mut().set_format_version(12).unwrap();
    let image = store.into_bytes().unwrap();

    let mut store = Container::from_bytes(image, StoreConfig::default()).unwrap();
    assert_eq!(store.engine().storage_version(), 1);
    assert_eq!(store.engine().format_version(), 12);

    // Streams written under v3 still need a v3 reader
    store.set_versions(v(3)).unwrap();
    assert_eq!(store.read("s").unwrap(), b"kept across the downgrade");
}

#[test]
fn test_app_versions_roundtrip() {
    let mut store = ContainerBuilder::new()
        .versions(VersionContainer::current().with_app(5).with_app(1))
        .create()
        .unwrap();
    store.write("doc", b"payload").unwrap();
    let image = store.into_bytes().unwrap();

    let mut store = Container::from_bytes(image, StoreConfig::default()).unwrap();
    let id = store.engine().find("doc").unwrap();
    let written = store.engine().stream_versions(id).unwrap().clone();
    assert_eq!(written.as_slice(), &[3, 5, 1]);

    // Fewer app versions than the writer used is not enough
    store
        .set_versions(VersionContainer::current().with_app(5))
        .unwrap();
    assert!(store.read("doc").is_err());

    store
        .set_versions(VersionContainer::current().with_app(6).with_app(1))
        .unwrap();
    assert_eq!(store.read("doc").unwrap(), b"payload");
}

#[test]
fn test_rewrite_records_new_versions() {
    let mut store = Container::in_memory(StoreConfig::default()).unwrap();
    store.set_versions(v(1)).unwrap();
    store.write("s", b"first").unwrap();

    store.set_versions(v(3)).unwrap();
    // Appending keeps the layout the stream was started with
    store.append("s", b" second").unwrap();
    let id = store.engine().find("s").unwrap();
    assert_eq!(store.engine().stream_versions(id).unwrap().main(), 1);

    // Truncating rewrites take the writer's versions
    store.write("s", b"third").unwrap();
    let id = store.engine().find("s").unwrap();
    assert_eq!(store.engine().stream_versions(id).unwrap().main(), 3);
}

#[test]
fn test_version_list_fits_one_count_byte() {
    let full = (0..254u16).fold(VersionContainer::current(), |v, app| v.with_app(app));
    assert_eq!(full.as_slice().len(), 255);

    let mut store = ContainerBuilder::new().cluster_capacity(32).create().unwrap();
    store.set_versions(full.clone()).unwrap();
    store.write("s", b"many versions").unwrap();

    let over = full.clone().with_app(0);
    assert!(matches!(
        store.set_versions(over.clone()),
        Err(StoreError::BadData(_))
    ));
    assert!(matches!(
        store.engine_mut().open("t", OpenMode::write(), &over),
        Err(StoreError::BadData(_))
    ));
    assert!(store.engine().state().contains(IoState::BAD_DATA));
    assert!(store.engine().find("t").is_none());

    let image = store.into_bytes().unwrap();
    let mut store = Container::from_bytes(image, StoreConfig::default()).unwrap();
    let id = store.engine().find("s").unwrap();
    assert_eq!(store.engine().stream_versions(id).unwrap(), &full);
    store.set_versions(full).unwrap();
    assert_eq!(store.read("s").unwrap(), b"many versions");
}
