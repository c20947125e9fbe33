use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nametag_core::scoring::{extract_entities, score_pass, SequenceRecord};

fn corpus(n: usize) -> Vec<SequenceRecord> {
    let gold = ["B-PER", "I-PER", "O", "B-LOC", "O", "B-ORG", "I-ORG", "I-ORG", "O", "O"];
    let predicted = ["B-PER", "I-PER", "O", "I-LOC", "O", "B-ORG", "I-ORG", "O", "O", "B-MISC"];
    (0..n)
        .map(|i| {
            SequenceRecord::new(
                (0..gold.len()).map(|j| format!("tok{i}_{j}")).collect(),
                gold.iter().map(|s| s.to_string()).collect(),
                predicted.iter().map(|s| s.to_string()).collect(),
            )
        })
        .collect()
}

fn bench_scoring(c: &mut Criterion) {
    let records = corpus(1000);

    c.bench_function("extract_entities_single", |b| {
        b.iter(|| extract_entities(black_box(&records[0].predicted), records[0].length));
    });

    c.bench_function("score_pass_1000", |b| {
        b.iter(|| score_pass(black_box(&records)).finalize());
    });
}

criterion_group!(benches, bench_scoring);
criterion_main!(benches);
