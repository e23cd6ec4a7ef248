use criterion::{criterion_group, criterion_main, Criterion};
use flate2::write::GzEncoder;
use flate2::Compression;
use pallet_schema::DigestAlgorithm;
use pallet_store::{digest_bytes, extract_archive};
use std::fs;

fn archive_payload() -> Vec<u8> {
    (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect()
}

fn bench_digest(c: &mut Criterion) {
    let data = archive_payload();
    c.bench_function("digest_sha256_4mib", |b| {
        b.iter(|| digest_bytes(DigestAlgorithm::Sha256, &data));
    });
    c.bench_function("digest_blake3_4mib", |b| {
        b.iter(|| digest_bytes(DigestAlgorithm::Blake3, &data));
    });
}

fn bench_extract(c: &mut Criterion) {
    let src = tempfile::tempdir().unwrap();
    let top = src.path().join("tool-1.0");
    fs::create_dir_all(top.join("share")).unwrap();
    for i in 0..100 {
        fs::write(top.join("share").join(format!("file_{i:03}")), format!("content {i}")).unwrap();
    }
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder.append_dir_all("tool-1.0", &top).unwrap();
    let archive = builder.into_inner().unwrap().finish().unwrap();

    c.bench_function("extract_tar_gz_100files", |b| {
        b.iter_with_setup(
            || tempfile::tempdir().unwrap(),
            |out| {
                extract_archive(&archive, "tool-1.0.tar.gz", out.path()).unwrap();
            },
        );
    });
}

criterion_group!(benches, bench_digest, bench_extract);
criterion_main!(benches);
