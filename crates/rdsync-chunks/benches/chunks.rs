use std::sync::Arc;

use rdsync_chunks::{
    chunk_data, hash_bytes, ChunkSizes, MemorySignatureRepository, NeedListGenerator,
    NeedListOptions, Signature, SignatureRepository,
};

fn make_data(size: usize) -> Vec<u8> {
    // Semi-realistic data: repeating pattern with some entropy
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576, 10485760])]
fn fastcdc_chunk(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| chunk_data(divan::black_box(&data), ChunkSizes::default()));
}

#[divan::bench(args = [1024, 65536, 1048576, 10485760])]
fn blake3_hash(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| hash_bytes(divan::black_box(&data)));
}

#[divan::bench(args = [65536, 1048576, 10485760])]
fn signature_encode(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| Signature::compute(divan::black_box(&data), ChunkSizes::default()).to_bytes());
}

#[divan::bench(args = [65536, 1048576, 10485760])]
fn need_list(bencher: divan::Bencher, size: usize) {
    let seed = make_data(size);
    let mut source = b"Coconut is Stupid".to_vec();
    source.extend_from_slice(&seed);

    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let repo = Arc::new(MemorySignatureRepository::new());
    let (seed_info, source_info) = rt.block_on(async {
        let a = repo
            .store("seed", Signature::compute(&seed, ChunkSizes::default()).to_bytes())
            .await
            .expect("store seed");
        let b = repo
            .store("source", Signature::compute(&source, ChunkSizes::default()).to_bytes())
            .await
            .expect("store source");
        (a, b)
    });
    let generator = NeedListGenerator::new(repo.clone(), repo, NeedListOptions::default());

    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            rt.block_on(generator.create_need_list(&seed_info, &source_info))
                .expect("need list")
        });
}

fn main() {
    divan::main();
}
