use std::fs;

use clap::Parser;
use gpt_generate::args::Args;
use gpt_generate::tokenizer::{build_tokenizer, Gpt2BpeTokenizer};
use gpt_generate::Tokenizer;

const VOCAB: &str = r#"{"h": 0, "e": 1, "l": 2, "o": 3, "Ġ": 4, "w": 5, "r": 6, "d": 7,
    "he": 8, "ll": 9, "<|endoftext|>": 10}"#;
const MERGES: &str = "#version: 0.2\nh e\nl l\n";

#[test]
fn bpe_roundtrip_with_tiny_vocab() {
    let dir = tempfile::tempdir().unwrap();
    let vocab = dir.path().join("vocab.json");
    let merges = dir.path().join("merges.txt");
    fs::write(&vocab, VOCAB).unwrap();
    fs::write(&merges, MERGES).unwrap();

    let tokenizer = Gpt2BpeTokenizer::from_files(&vocab, &merges).unwrap();
    assert_eq!(tokenizer.eod(), 10);
    assert_eq!(tokenizer.vocab_size(), 11);

    let ids = tokenizer.tokenize("hello world").unwrap();
    assert_eq!(ids, vec![8, 9, 3, 4, 5, 3, 6, 2, 7]);
    assert_eq!(tokenizer.detokenize(&ids).unwrap(), "hello world");
}

#[test]
fn build_from_command_line() {
    let dir = tempfile::tempdir().unwrap();
    let vocab = dir.path().join("vocab.json");
    let merges = dir.path().join("merges.txt");
    fs::write(&vocab, VOCAB).unwrap();
    fs::write(&merges, MERGES).unwrap();

    let args = Args::parse_from([
        "generate_samples_gpt",
        "--tokenizer-type",
        "GPT2BPETokenizer",
        "--vocab-file",
        vocab.to_str().unwrap(),
        "--merge-file",
        merges.to_str().unwrap(),
    ]);
    let tokenizer = build_tokenizer(&args.tokenizer).unwrap();
    assert_eq!(tokenizer.tokenize("hell").unwrap(), vec![8, 9]);
}

#[test]
fn vocabulary_without_eod_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let vocab = dir.path().join("vocab.json");
    let merges = dir.path().join("merges.txt");
    fs::write(&vocab, r#"{"a": 0, "b": 1}"#).unwrap();
    fs::write(&merges, "#version: 0.2\n").unwrap();
    assert!(Gpt2BpeTokenizer::from_files(&vocab, &merges).is_err());
}
