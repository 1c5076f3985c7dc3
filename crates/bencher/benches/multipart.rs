use std::hint::black_box;

use bencher::{TestBody, TestCase};
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use micro_bodyparser::multipart::{MultipartDecoder, MultipartEvent, MultipartLimits};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

const BOUNDARY: &str = "----BencherBoundary7MA4YWxkTrZu0gW";

fn create_test_cases() -> Vec<TestCase> {
    let fields = (0..32).fold(TestBody::builder(BOUNDARY), |builder, i| builder.field(&format!("user[{i}]"), "value"));

    vec![
        TestCase::small("fields_only", fields.build()),
        TestCase::small(
            "small_file",
            TestBody::builder(BOUNDARY).field("name", "virk").file("avatar", "a.png", 4 * 1024).build(),
        ),
        TestCase::large("large_file", TestBody::builder(BOUNDARY).file("video", "v.mp4", 4 * 1024 * 1024).build()),
        TestCase::large(
            "many_files",
            (0..64)
                .fold(TestBody::builder(BOUNDARY), |builder, i| builder.file("docs[]", &format!("{i}.txt"), 16 * 1024))
                .build(),
        ),
    ]
}

/// Decodes the whole body, feeding the decoder `chunk_size` bytes at a time.
fn decode_all(body: &[u8], chunk_size: usize) -> usize {
    let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits::default());
    let mut buf = BytesMut::with_capacity(chunk_size * 2);
    let mut events = 0;

    for chunk in body.chunks(chunk_size) {
        buf.extend_from_slice(chunk);
        while let Some(event) = decoder.decode(&mut buf).expect("bench body should be valid multipart") {
            if let MultipartEvent::PartData(data) = event {
                black_box(data);
            }
            events += 1;
        }
    }
    while decoder.decode_eof(&mut buf).expect("bench body should be complete").is_some() {
        events += 1;
    }
    events
}

fn benchmark_multipart_decoder(criterion: &mut Criterion) {
    let test_cases = create_test_cases();
    let mut group = criterion.benchmark_group("multipart_decoder");

    for case in test_cases {
        group.throughput(Throughput::Bytes(case.body().len() as u64));
        for chunk_size in [1024, 64 * 1024] {
            let id = BenchmarkId::new(case.name(), chunk_size);
            group.bench_with_input(id, &case, |b, case| {
                b.iter_batched(
                    || case.body().content(),
                    |body| black_box(decode_all(body, chunk_size)),
                    BatchSize::SmallInput,
                );
            });
        }
    }

    group.finish();
}

criterion_group!(multipart, benchmark_multipart_decoder);
criterion_main!(multipart);
