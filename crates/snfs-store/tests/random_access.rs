//! Random-access behaviour of encrypted files against the physical layout.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use proptest::prelude::*;
use snfs_core::SnfsError;
use snfs_crypto::generate_master_key;
use snfs_store::{BlockLayout, EncryptedFileStore, HEADER_LEN};

fn setup(block_size: u32, cache_blocks: usize) -> (tempfile::TempDir, EncryptedFileStore, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let store = EncryptedFileStore::new(&generate_master_key(), block_size, cache_blocks).unwrap();
    let path = dir.path().join("note.txt");
    store.create(&path).unwrap();
    (dir, store, path)
}

fn flip_byte(path: &Path, at: u64) {
    let mut f = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut b = [0u8; 1];
    f.seek(SeekFrom::Start(at)).unwrap();
    std::io::Read::read_exact(&mut f, &mut b).unwrap();
    f.seek(SeekFrom::Start(at)).unwrap();
    f.write_all(&[b[0] ^ 0x40]).unwrap();
}

#[test]
fn overwrite_across_block_boundary() {
    let (_dir, store, path) = setup(4096, 16);
    let mut file = store.open(&path).unwrap();

    file.write(0, &[b'X'; 6000]).unwrap();
    file.write(4090, &[b'Y'; 10]).unwrap();
    file.flush().unwrap();
    drop(file);

    let mut file = store.open(&path).unwrap();
    assert_eq!(file.logical_len(), 6000);
    let data = file.read(0, 10_000).unwrap();
    assert_eq!(data.len(), 6000);
    assert!(data[..4090].iter().all(|&b| b == b'X'));
    assert!(data[4090..4100].iter().all(|&b| b == b'Y'));
    assert!(data[4100..].iter().all(|&b| b == b'X'));
}

#[test]
fn ciphertext_does_not_contain_plaintext() {
    let (_dir, store, path) = setup(512, 16);
    store.write(&path, 0, b"the quick brown fox jumps over the lazy dog").unwrap();

    let raw = std::fs::read(&path).unwrap();
    assert!(!raw.windows(9).any(|w| w == b"quick bro"));
}

#[test]
fn growth_reads_zero_in_gap() {
    let (_dir, store, path) = setup(512, 16);
    let mut file = store.open(&path).unwrap();

    file.write(0, b"head").unwrap();
    file.write(3000, b"tail").unwrap();
    assert_eq!(file.logical_len(), 3004);

    let gap = file.read(4, 2996).unwrap();
    assert_eq!(gap.len(), 2996);
    assert!(gap.iter().all(|&b| b == 0));
    assert_eq!(file.read(3000, 4).unwrap(), b"tail");

    // same answer once persisted
    file.flush().unwrap();
    drop(file);
    let mut file = store.open(&path).unwrap();
    let all = file.read(0, 4000).unwrap();
    assert_eq!(&all[..4], b"head");
    assert!(all[4..3000].iter().all(|&b| b == 0));
    assert_eq!(&all[3000..], b"tail");
}

#[test]
fn flush_materialises_gap_blocks() {
    let (_dir, store, path) = setup(512, 16);
    store.write(&path, 0, b"abc").unwrap();
    store.write(&path, 2000, b"xyz").unwrap();

    let layout = BlockLayout::new(512);
    let physical = std::fs::metadata(&path).unwrap().len();
    assert_eq!(physical, layout.physical_len(2003));
    assert_eq!(store.read(&path, 0, 3).unwrap(), b"abc");
}

#[test]
fn logical_growth_stays_implicit_until_written() {
    let (_dir, store, path) = setup(512, 16);
    store.write(&path, 0, b"abc").unwrap();
    store.truncate(&path, 10_000).unwrap();

    let physical = std::fs::metadata(&path).unwrap().len();
    assert_eq!(physical, BlockLayout::new(512).physical_len(3));

    let data = store.read(&path, 0, 20_000).unwrap();
    assert_eq!(data.len(), 10_000);
    assert_eq!(&data[..3], b"abc");
    assert!(data[3..].iter().all(|&b| b == 0));
}

#[test]
fn shrink_preserves_prefix() {
    let (_dir, store, path) = setup(512, 16);
    let content: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    store.write(&path, 0, &content).unwrap();

    store.truncate(&path, 700).unwrap();
    assert_eq!(store.read_header(&path).unwrap().logical_length, 700);
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        BlockLayout::new(512).physical_len(700)
    );

    let data = store.read(&path, 0, 5000).unwrap();
    assert_eq!(data, &content[..700]);
    assert!(store.read(&path, 700, 10).unwrap().is_empty());

    // growing again exposes zeros, not the old bytes
    store.truncate(&path, 900).unwrap();
    let data = store.read(&path, 0, 5000).unwrap();
    assert_eq!(&data[..700], &content[..700]);
    assert!(data[700..].iter().all(|&b| b == 0));
}

fn write_raw(path: &Path, at: u64, bytes: &[u8]) {
    let mut f = OpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(at)).unwrap();
    f.write_all(bytes).unwrap();
}

/// Leave `path` as a shrink to `len` that stopped after the header was written.
fn commit_shrink_header_only(store: &EncryptedFileStore, path: &Path, len: u64) {
    let mut header = store.read_header(path).unwrap();
    header.logical_length = len;
    write_raw(path, 0, &header.encode(store.codec()).unwrap());
}

#[test]
fn interrupted_shrink_after_header_is_completed_on_open() {
    let (_dir, store, path) = setup(512, 16);
    let content: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    store.write(&path, 0, &content).unwrap();
    commit_shrink_header_only(&store, &path, 700);

    let mut file = store.open(&path).unwrap();
    assert_eq!(file.logical_len(), 700);
    assert_eq!(file.read(0, 5000).unwrap(), &content[..700]);
    drop(file);
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        BlockLayout::new(512).physical_len(700)
    );

    // the cut-off bytes never come back
    store.write(&path, 1800, b"end").unwrap();
    let data = store.read(&path, 0, 5000).unwrap();
    assert_eq!(&data[..700], &content[..700]);
    assert!(data[700..1800].iter().all(|&b| b == 0));
    assert_eq!(&data[1800..], b"end");
}

#[test]
fn interrupted_shrink_after_tail_rewrite_is_completed_on_open() {
    let (_dir, store, path) = setup(512, 16);
    let content: Vec<u8> = (0..2000u32).map(|i| (i % 241) as u8).collect();
    store.write(&path, 0, &content).unwrap();
    commit_shrink_header_only(&store, &path, 700);

    let header = store.read_header(&path).unwrap();
    let tail = store.codec().encode(&content[512..700], &header.stream_id, 1).unwrap();
    write_raw(&path, BlockLayout::new(512).block_offset(1), &tail);

    assert_eq!(store.read(&path, 0, 5000).unwrap(), &content[..700]);
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        BlockLayout::new(512).physical_len(700)
    );
}

#[test]
fn interrupted_reset_is_completed_on_open() {
    let (_dir, store, path) = setup(512, 16);
    store.write(&path, 0, &[7u8; 1500]).unwrap();
    commit_shrink_header_only(&store, &path, 0);

    assert!(store.read(&path, 0, 100).unwrap().is_empty());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_LEN as u64);
}

#[test]
fn truncate_to_zero_rotates_stream_id() {
    let (_dir, store, path) = setup(512, 16);
    store.write(&path, 0, b"first version").unwrap();
    let before = store.read_header(&path).unwrap().stream_id;

    store.truncate(&path, 0).unwrap();
    let header = store.read_header(&path).unwrap();
    assert_ne!(header.stream_id, before);
    assert_eq!(header.logical_length, 0);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_LEN as u64);

    store.write(&path, 0, b"second").unwrap();
    assert_eq!(store.read(&path, 0, 100).unwrap(), b"second");
}

#[test]
fn tampered_block_fails_only_that_block() {
    let (_dir, store, path) = setup(512, 16);
    store.write(&path, 0, &[7u8; 2048]).unwrap();

    let layout = BlockLayout::new(512);
    flip_byte(&path, layout.block_offset(2) + 100);

    let mut file = store.open(&path).unwrap();
    assert_eq!(file.read(0, 1024).unwrap(), vec![7u8; 1024]);
    assert_eq!(file.read(1536, 512).unwrap(), vec![7u8; 512]);
    assert!(matches!(
        file.read(1000, 600),
        Err(SnfsError::CorruptedBlock { index: 2 })
    ));
}

#[test]
fn partial_write_into_corrupted_block_changes_nothing() {
    let (_dir, store, path) = setup(512, 16);
    store.write(&path, 0, &[1u8; 1024]).unwrap();
    flip_byte(&path, BlockLayout::new(512).block_offset(1) + 3);
    let before = std::fs::read(&path).unwrap();

    let mut file = store.open(&path).unwrap();
    assert!(matches!(
        file.write(600, b"zz"),
        Err(SnfsError::CorruptedBlock { index: 1 })
    ));
    assert!(!file.is_dirty());
    drop(file);
    assert_eq!(std::fs::read(&path).unwrap(), before);

    // a write covering the whole damaged block replaces it
    let mut file = store.open(&path).unwrap();
    file.write(512, &[2u8; 512]).unwrap();
    file.flush().unwrap();
    assert_eq!(file.read(512, 512).unwrap(), vec![2u8; 512]);
}

#[test]
fn swapped_blocks_are_detected() {
    let (_dir, store, path) = setup(512, 16);
    store.write(&path, 0, &[0xAAu8; 1024]).unwrap();

    let layout = BlockLayout::new(512);
    let mut raw = std::fs::read(&path).unwrap();
    let a = layout.block_offset(0) as usize;
    let b = layout.block_offset(1) as usize;
    let stride = layout.stride() as usize;
    let block0 = raw[a..a + stride].to_vec();
    raw.copy_within(b..b + stride, a);
    raw[b..b + stride].copy_from_slice(&block0);
    std::fs::write(&path, raw).unwrap();

    let mut file = store.open(&path).unwrap();
    assert!(matches!(file.read(0, 10), Err(SnfsError::CorruptedBlock { index: 0 })));
}

#[test]
fn tampered_header_is_detected() {
    let (_dir, store, path) = setup(512, 16);
    store.write(&path, 0, b"hello").unwrap();
    flip_byte(&path, 30);

    assert!(matches!(store.open(&path), Err(SnfsError::CorruptedHeader)));
}

#[test]
fn truncated_physical_file_is_detected() {
    let (_dir, store, path) = setup(512, 16);
    store.write(&path, 0, &[5u8; 1000]).unwrap();

    let f = OpenOptions::new().write(true).open(&path).unwrap();
    f.set_len(HEADER_LEN as u64 + 8).unwrap();
    drop(f);
    assert!(matches!(store.open(&path), Err(SnfsError::CorruptedHeader)));
}

#[test]
fn small_cache_evicts_and_keeps_data() {
    let (_dir, store, path) = setup(512, 2);
    let mut file = store.open(&path).unwrap();

    let content: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 256) as u8).collect();
    file.write(0, &content).unwrap();
    assert!(file.cached_blocks() <= 2);

    assert_eq!(file.read(0, 5000).unwrap(), content);
    file.flush().unwrap();
    drop(file);
    assert_eq!(store.read(&path, 0, 5000).unwrap(), content);
}

#[test]
fn drop_flushes_dirty_state() {
    let (_dir, store, path) = setup(512, 16);
    {
        let mut file = store.open(&path).unwrap();
        file.write(0, b"persisted on drop").unwrap();
    }
    assert_eq!(store.read(&path, 0, 100).unwrap(), b"persisted on drop");
}

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u64, data: Vec<u8> },
    Truncate(u64),
    Flush,
    Reopen,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u64..3000, proptest::collection::vec(any::<u8>(), 1..700))
            .prop_map(|(offset, data)| Op::Write { offset, data }),
        1 => (0u64..3500).prop_map(Op::Truncate),
        1 => Just(Op::Flush),
        1 => Just(Op::Reopen),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn behaves_like_a_byte_vector(ops in proptest::collection::vec(op_strategy(), 1..24)) {
        let (_dir, store, path) = setup(512, 3);
        let mut model: Vec<u8> = Vec::new();
        let mut file = store.open(&path).unwrap();

        for op in ops {
            match op {
                Op::Write { offset, data } => {
                    let end = offset as usize + data.len();
                    if model.len() < end {
                        model.resize(end, 0);
                    }
                    model[offset as usize..end].copy_from_slice(&data);
                    prop_assert_eq!(file.write(offset, &data).unwrap(), data.len());
                }
                Op::Truncate(len) => {
                    model.resize(len as usize, 0);
                    file.truncate(len).unwrap();
                }
                Op::Flush => file.flush().unwrap(),
                Op::Reopen => {
                    file.flush().unwrap();
                    drop(file);
                    file = store.open(&path).unwrap();
                }
            }
            prop_assert_eq!(file.logical_len(), model.len() as u64);
        }

        prop_assert_eq!(file.read(0, model.len() + 100).unwrap(), model.clone());
        file.flush().unwrap();
        drop(file);
        prop_assert_eq!(store.read(&path, 0, model.len() + 100).unwrap(), model);
    }
}
