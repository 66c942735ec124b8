//! Round-trip, cluster boundary and seek properties of the buffering engine

use cluster_store::{
    MemoryMedium, OpenMode, PooledBuffer, SeqBuffer, StoreConfig, VersionContainer, SEEK_END,
};
use proptest::prelude::*;

fn engine(cap: u16) -> SeqBuffer<MemoryMedium> {
    SeqBuffer::create(
        MemoryMedium::new(),
        StoreConfig {
            cluster_capacity: cap,
            ..StoreConfig::default()
        },
    )
    .unwrap()
}

fn write_chunked(buf: &mut SeqBuffer<MemoryMedium>, name: &str, data: &[u8], chunk: usize) {
    buf.open(name, OpenMode::write(), &VersionContainer::current())
        .unwrap();
    for part in data.chunks(chunk) {
        assert_eq!(buf.put_block(part).unwrap(), part.len());
    }
    buf.close().unwrap();
}

fn read_chunked(buf: &mut SeqBuffer<MemoryMedium>, name: &str, chunk: usize) -> Vec<u8> {
    buf.open(name, OpenMode::read(), &VersionContainer::current())
        .unwrap();
    let mut out = Vec::new();
    let mut part = vec![0u8; chunk];
    loop {
        let n = buf.get_block(&mut part).unwrap();
        out.extend_from_slice(&part[..n]);
        if n < chunk {
            break;
        }
    }
    buf.close().unwrap();
    out
}

#[test]
fn test_cluster_boundary_exactness() {
    let cap = 32u16;
    for len in [1usize, 31, 32, 33, 63, 64, 65, 96] {
        let mut buf = engine(cap);
        let data = vec![0x5a; len];
        write_chunked(&mut buf, "s", &data, 7);

        let id = buf.find("s").unwrap();
        let space = buf.file_space(id).unwrap().clone();
        let clusters = len.div_ceil(cap as usize);
        assert_eq!(space.len(), clusters, "len {}", len);

        let last_used = len - (clusters - 1) * cap as usize;
        assert_eq!(space.last_used() as usize, last_used, "len {}", len);

        // Every cluster but the last is full, the last holds exactly the tail
        for (pos, &index) in space.indices().iter().enumerate() {
            let used = buf.table().get(index).unwrap().used as usize;
            let expected = if pos + 1 == clusters { last_used } else { cap as usize };
            assert_eq!(used, expected, "len {} cluster {}", len, pos);
        }
        assert_eq!(buf.stream_size(id).unwrap(), len as u64);
    }
}

#[test]
fn test_empty_stream() {
    let mut buf = engine(16);
    write_chunked(&mut buf, "empty", &[], 1);
    let id = buf.find("empty").unwrap();
    assert!(buf.file_space(id).unwrap().is_empty());
    assert_eq!(read_chunked(&mut buf, "empty", 8), Vec::<u8>::new());
    assert!(buf.eof());
}

#[test]
fn test_interleaved_streams_keep_their_bytes() {
    let mut buf = engine(16);
    for round in 0..5u8 {
        for name in ["a", "b", "c"] {
            buf.open(
                name,
                OpenMode::OUT | OpenMode::OPEN_ALWAYS,
                &VersionContainer::current(),
            )
            .unwrap();
            buf.lseek(SEEK_END).unwrap();
            buf.put_block(&[round; 11]).unwrap();
            buf.close().unwrap();
        }
    }

    let expected: Vec<u8> = (0..5u8).flat_map(|r| [r; 11]).collect();
    for name in ["a", "b", "c"] {
        assert_eq!(read_chunked(&mut buf, name, 13), expected);
    }
    buf.check_integrity().unwrap();
}

#[test]
fn test_pooled_engine_reads_what_seq_engine_wrote() {
    let mut seq = engine(24);
    let data: Vec<u8> = (0..=255u8).collect();
    write_chunked(&mut seq, "bytes", &data, 100);
    let image = seq.finish().unwrap().into_bytes();

    let mut pooled =
        PooledBuffer::open_container(MemoryMedium::from_bytes(image), StoreConfig::default())
            .unwrap();
    pooled
        .open("bytes", OpenMode::read(), &VersionContainer::current())
        .unwrap();
    let mut out = vec![0u8; 256];
    assert_eq!(pooled.get_block(&mut out).unwrap(), 256);
    assert_eq!(out, data);
}

proptest! {
    #[test]
    fn prop_roundtrip_any_chunking(
        data in prop::collection::vec(any::<u8>(), 0..600),
        cap in 16u16..80,
        write_chunk in 1usize..100,
        read_chunk in 1usize..100,
    ) {
        let mut buf = engine(cap);
        write_chunked(&mut buf, "s", &data, write_chunk);
        let id = buf.find("s").unwrap();

        prop_assert_eq!(buf.stream_size(id).unwrap(), data.len() as u64);
        prop_assert_eq!(
            buf.file_space(id).unwrap().len(),
            data.len().div_ceil(cap as usize)
        );
        prop_assert_eq!(read_chunked(&mut buf, "s", read_chunk), data);
        prop_assert!(buf.good());
    }

    #[test]
    fn prop_byte_and_block_paths_agree(
        data in prop::collection::vec(any::<u8>(), 0..200),
        cap in 16u16..40,
    ) {
        let mut buf = engine(cap);
        buf.open("s", OpenMode::write(), &VersionContainer::current()).unwrap();
        for &b in &data {
            buf.put_byte(b).unwrap();
        }
        buf.close().unwrap();

        buf.open("s", OpenMode::read(), &VersionContainer::current()).unwrap();
        let mut out = Vec::new();
        while let Some(b) = buf.get_byte().unwrap() {
            out.push(b);
        }
        prop_assert_eq!(out, data);
        prop_assert!(buf.eof());
    }

    #[test]
    fn prop_seek_is_idempotent(
        data in prop::collection::vec(any::<u8>(), 1..400),
        cap in 16u16..40,
        positions in prop::collection::vec(any::<prop::sample::Index>(), 1..20),
    ) {
        let mut buf = engine(cap);
        write_chunked(&mut buf, "s", &data, 64);
        buf.open("s", OpenMode::read(), &VersionContainer::current()).unwrap();

        for index in positions {
            let pos = index.index(data.len() + 1) as u64;
            prop_assert_eq!(buf.lseek(pos).unwrap(), pos);
            prop_assert_eq!(buf.lseek(pos).unwrap(), pos);
            prop_assert_eq!(buf.tell().unwrap(), pos);

            let mut rest = vec![0u8; data.len() - pos as usize];
            prop_assert_eq!(buf.get_block(&mut rest).unwrap(), rest.len());
            prop_assert_eq!(&rest[..], &data[pos as usize..]);
        }
    }

    #[test]
    fn prop_overwrite_in_place(
        data in prop::collection::vec(any::<u8>(), 1..300),
        patch in prop::collection::vec(any::<u8>(), 1..80),
        at in any::<prop::sample::Index>(),
    ) {
        let mut buf = engine(16);
        write_chunked(&mut buf, "s", &data, 50);
        let at = at.index(data.len() + 1);

        buf.open("s", OpenMode::OUT | OpenMode::OPEN_EXISTING, &VersionContainer::current())
            .unwrap();
        buf.lseek(at as u64).unwrap();
        buf.put_block(&patch).unwrap();
        buf.close().unwrap();

        let mut expected = data.clone();
        let end = at + patch.len();
        if end > expected.len() {
            expected.resize(end, 0);
        }
        expected[at..end].copy_from_slice(&patch);
        prop_assert_eq!(read_chunked(&mut buf, "s", 33), expected);
    }
}
