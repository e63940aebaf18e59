use snfs_core::StreamId;
use snfs_crypto::{generate_master_key, BlockCodec};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [512, 4096, 65536])]
fn bench_encode_block(bencher: divan::Bencher, size: usize) {
    let codec = BlockCodec::new(&generate_master_key()).unwrap();
    let stream_id = StreamId::from_bytes([0xAB; 16]);
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            codec
                .encode(divan::black_box(&data), divan::black_box(&stream_id), 0)
                .unwrap()
        });
}

#[divan::bench(args = [512, 4096, 65536])]
fn bench_decode_block(bencher: divan::Bencher, size: usize) {
    let codec = BlockCodec::new(&generate_master_key()).unwrap();
    let stream_id = StreamId::from_bytes([0xAB; 16]);
    let data = make_data(size);
    let encoded = codec.encode(&data, &stream_id, 0).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            codec
                .decode(divan::black_box(&encoded), divan::black_box(&stream_id), 0)
                .unwrap()
        });
}

fn main() {
    divan::main();
}
