use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use clap::Parser;
use nametag_trainer::context::{BEST_MODEL_FILE, DEV_RESULT_FILE, TEST_RESULT_FILE};
use nametag_trainer::{run_training, Checkpoint, TrainArgs};

const TRAIN: &str = "\
-DOCSTART- O

John B-PER
Smith I-PER
lives O
in O
Paris B-LOC

Mary B-PER
visited O
Berlin B-LOC

Acme B-ORG
hired O
John B-PER

Paris B-LOC
is O
big O
";

const DEV: &str = "\
Mary B-PER
lives O
in O
Berlin B-LOC

Acme B-ORG
is O
big O
";

const TEST: &str = "\
John B-PER
visited O
Paris B-LOC
";

fn write_input(dir: &Path) {
    fs::write(dir.join("train.tsv"), TRAIN).unwrap();
    fs::write(dir.join("dev.tsv"), DEV).unwrap();
    fs::write(dir.join("test.tsv"), TEST).unwrap();

    let mut tokens = vec!["<pad>", "<unk>"];
    tokens.extend([
        "John", "Smith", "lives", "in", "Paris", "Mary", "visited", "Berlin", "Acme", "hired",
        "is", "big",
    ]);
    let token_vocab: String = tokens
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{t}\t{i}\n"))
        .collect();
    fs::write(dir.join("token.vocab.tsv"), token_vocab).unwrap();

    let mut chars: Vec<String> = vec!["<pad>".into(), "<unk>".into()];
    for c in TRAIN.chars().filter(|c| c.is_alphabetic()) {
        if !chars.contains(&c.to_string()) {
            chars.push(c.to_string());
        }
    }
    fs::write(dir.join("char.vocab.tsv"), chars.join("\n")).unwrap();

    fs::write(
        dir.join("label.vocab.tsv"),
        "O\t0\nB-PER\t1\nI-PER\t2\nB-LOC\t3\nI-LOC\t4\nB-ORG\t5\nI-ORG\t6\n",
    )
    .unwrap();
}

fn args(input: &Path, output: &Path, extra: &[&str]) -> TrainArgs {
    let mut all = vec!["-m", "2", "--lr", "0.01"];
    all.extend_from_slice(extra);
    args_with(input, output, &all)
}

/// Like `args`, but epochs and learning rate come from `extra`.
fn args_with(input: &Path, output: &Path, extra: &[&str]) -> TrainArgs {
    let input = input.to_string_lossy().into_owned();
    let output = output.to_string_lossy().into_owned();
    let mut argv = vec![
        "train",
        "-i",
        input.as_str(),
        "-o",
        output.as_str(),
        "-b",
        "2",
        "--char-dim",
        "4",
        "--word-dim",
        "6",
        "--char-filters",
        "[[2,3],[3,3]]",
        "--char-feat-dim",
        "5",
        "--lstm-size",
        "4",
    ];
    argv.extend_from_slice(extra);
    TrainArgs::try_parse_from(argv).unwrap()
}

fn run_dir(output: &Path) -> PathBuf {
    let mut dirs: Vec<PathBuf> = fs::read_dir(output)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(dirs.len(), 1, "expected exactly one run directory");
    dirs.remove(0)
}

#[test]
fn test_tiny_corpus_run() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_input(input.path());

    // Seeded and without dropout, so the run is deterministic. Every dev
    // entity occurs in training and each of the 40 steps is evaluated.
    let pinned = [
        "-m",
        "20",
        "--lr",
        "0.05",
        "--eval-step",
        "1",
        "--lstm-dropout",
        "0",
        "--feat-dropout",
        "0",
    ];
    let best = run_training(&args_with(input.path(), output.path(), &pinned)).unwrap();
    assert!(best.dev.f > 0.0 && best.dev.f <= 100.0);
    assert!((0.0..=100.0).contains(&best.test.f));

    let run = run_dir(output.path());
    let name = run.file_name().unwrap().to_string_lossy().into_owned();
    // YYYYmmdd_HHMMSS
    assert_eq!(name.len(), 15);
    assert_eq!(name.as_bytes()[8], b'_');

    let checkpoint = Checkpoint::load(run.join(BEST_MODEL_FILE), &Device::Cpu).unwrap();
    assert_eq!(checkpoint.scores, best);
    assert_eq!(checkpoint.hyperparameters.batch_size, 2);
    assert_eq!(checkpoint.hyperparameters.char_filters, vec![(2, 3), (3, 3)]);
    assert_eq!(checkpoint.hyperparameters.dropout.lstm, 0.0);
    assert_eq!(checkpoint.vocabularies.label.get("B-ORG"), Some(5));
    assert_eq!(checkpoint.counters.token.get("John"), 2);
    assert!(checkpoint.state.global_step >= 1 && checkpoint.state.global_step <= 40);
    assert!(checkpoint.model_params.contains_key("word_embed.weight"));
    assert!(checkpoint.model_params.contains_key("crf.transitions"));

    let dev = fs::read_to_string(run.join(DEV_RESULT_FILE)).unwrap();
    let blocks: Vec<&str> = dev.split_terminator("\n\n").collect();
    assert_eq!(blocks.len(), 2);
    let first: Vec<&str> = blocks[0].lines().collect();
    assert_eq!(first.len(), 4);
    assert!(first[0].starts_with("Mary B-PER "));
    assert!(first.iter().all(|l| l.split(' ').count() == 3));

    let test = fs::read_to_string(run.join(TEST_RESULT_FILE)).unwrap();
    assert_eq!(test.lines().filter(|l| !l.is_empty()).count(), 3);

    assert!(fs::read_dir(&run).unwrap().all(|e| {
        let name = e.unwrap().file_name().to_string_lossy().into_owned();
        !name.ends_with(".tmp") && !name.ends_with(".bak")
    }));
}

#[test]
fn test_highway_with_pretrained_embeddings() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_input(input.path());
    let embed = input.path().join("vectors.txt");
    fs::write(
        &embed,
        "3 6\njohn 0.1 0.2 0.3 0.4 0.5 0.6\nparis 0.6 0.5 0.4 0.3 0.2 0.1\nberlin 1 1 1 1 1 1\n",
    )
    .unwrap();
    let embed = embed.to_string_lossy().into_owned();

    let best = run_training(&args(
        input.path(),
        output.path(),
        &["--char-type", "hw", "-e", embed.as_str(), "--eval-step", "1"],
    ))
    .unwrap();
    assert!(best.dev.f <= 100.0);
    run_dir(output.path());
}

#[test]
fn test_embedding_dimension_mismatch_fails() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_input(input.path());
    let embed = input.path().join("vectors.txt");
    fs::write(&embed, "john 0.1 0.2\n").unwrap();
    let embed = embed.to_string_lossy().into_owned();

    let result = run_training(&args(input.path(), output.path(), &["-e", embed.as_str()]));
    assert!(result.is_err());
    assert_eq!(fs::read_dir(output.path()).unwrap().count(), 0);
}

#[test]
fn test_missing_vocabulary_fails_before_output() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_input(input.path());
    fs::remove_file(input.path().join("label.vocab.tsv")).unwrap();

    assert!(run_training(&args(input.path(), output.path(), &[])).is_err());
    assert_eq!(fs::read_dir(output.path()).unwrap().count(), 0);
}

#[test]
fn test_missing_corpus_fails_before_output() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_input(input.path());
    fs::remove_file(input.path().join("test.tsv")).unwrap();

    assert!(run_training(&args(input.path(), output.path(), &[])).is_err());
    assert_eq!(fs::read_dir(output.path()).unwrap().count(), 0);
}
