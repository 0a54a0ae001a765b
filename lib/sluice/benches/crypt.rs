use criterion::{criterion_group, criterion_main, Criterion};
use sluice::crypt::Cipher;

fn bench_encode(c: &mut Criterion) {
    c.bench_function("encode_4096", |b| {
        let mut cipher = Cipher::new();
        let mut buf = [0xa5u8; 4096];
        b.iter(|| cipher.encode(&mut buf));
    });

    c.bench_function("roundtrip_4096", |b| {
        let mut enc = Cipher::new();
        let mut dec = Cipher::new();
        let mut buf = [0xa5u8; 4096];
        b.iter(|| {
            enc.encode(&mut buf);
            dec.decode(&mut buf);
        });
    });
}

criterion_group!(benches, bench_encode);
criterion_main!(benches);
