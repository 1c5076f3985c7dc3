use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use micro_bodyparser::FormFields;

fn create_keys(count: usize) -> Vec<(String, String)> {
    (0..count)
        .map(|i| match i % 4 {
            0 => (format!("user[{i}][email]"), format!("user{i}@example.com")),
            1 => ("tags[]".to_string(), format!("tag{i}")),
            2 => (format!("items[{i}]"), i.to_string()),
            _ => (format!("profile.settings.key{i}"), "on".to_string()),
        })
        .collect()
}

fn benchmark_form_fields(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("form_fields");

    for count in [16, 256] {
        let keys = create_keys(count);
        group.bench_with_input(BenchmarkId::new("add", count), &keys, |b, keys| {
            b.iter(|| {
                let mut fields = FormFields::new();
                for (key, value) in keys {
                    fields.add_text(key, value.clone(), true);
                }
                black_box(fields.to_json())
            });
        });
    }

    group.finish();
}

criterion_group!(form, benchmark_form_fields);
criterion_main!(form);
