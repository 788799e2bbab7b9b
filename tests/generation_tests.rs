mod common;

use std::fs;
use std::io::Cursor;

use common::{pipeline, small_config, CharTokenizer, CountingModel, EOD, VOCAB};
use gpt_generate::generation::{Completion, GenerationSettings, Generator, Sample, TokenStream};
use gpt_generate::sampling::{Sampler, SamplingParams};

fn greedy() -> Sampler {
    Sampler::new(SamplingParams { greedy: true, ..SamplingParams::default() }, VOCAB, 0)
}

fn settings(seq_length: usize, out_seq_length: usize, recompute: bool) -> GenerationSettings {
    GenerationSettings { seq_length, out_seq_length, recompute, log_interval: 1 }
}

#[test]
fn stream_waits_for_longer_contexts() {
    let model = CountingModel::new(10);
    for recompute in [false, true] {
        let mut sampler = greedy();
        let stream = TokenStream::new(
            &model,
            &mut sampler,
            vec![vec![5], vec![5, 6, 7]],
            EOD,
            &settings(16, 4, recompute),
        )
        .unwrap();
        assert_eq!(stream.maxlen(), 5);

        let steps: Vec<_> = stream.map(Result::unwrap).collect();
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[0].tokens[1], vec![5, 6]);
        assert_eq!(steps[0].tokens[0], vec![5, 6]);

        let last = steps.last().unwrap();
        assert_eq!(last.finished, vec![true, true]);
        assert_eq!(last.lengths, vec![5, 5]);
        assert_eq!(last.sequence(0), &[5, 6, 7, 8, 9]);
        assert_eq!(last.sequence(1), &[5, 6, 7, 8, 9]);
    }
}

#[test]
fn stream_stops_at_length_limit() {
    let model = CountingModel::new(100);
    let mut sampler = greedy();
    let last = TokenStream::new(&model, &mut sampler, vec![vec![5]], EOD, &settings(16, 4, false))
        .unwrap()
        .run_to_end()
        .unwrap()
        .unwrap();
    assert_eq!(last.finished, vec![false]);
    assert_eq!(last.lengths, vec![6]);
    assert_eq!(last.sequence(0), &[5, 6, 7, 8, 9, 10]);

    // the sequence length caps decoding before out_seq_length does
    let mut sampler = greedy();
    let settings = settings(4, 100, false);
    let stream = TokenStream::new(&model, &mut sampler, vec![vec![5]], EOD, &settings).unwrap();
    assert_eq!(stream.maxlen(), 3);
    assert_eq!(stream.count(), 3);
}

#[test]
fn stream_rejects_bad_contexts() {
    let model = CountingModel::new(10);
    let mut sampler = greedy();
    let settings = settings(16, 4, false);
    assert!(TokenStream::new(&model, &mut sampler, vec![], EOD, &settings).is_err());
    assert!(TokenStream::new(&model, &mut sampler, vec![vec![]], EOD, &settings).is_err());
}

#[test]
fn complete_rejects_long_and_empty_prompts() {
    let model = CountingModel::new(b'h' as usize);
    let mut generator = Generator::new(&model, &CharTokenizer, greedy(), settings(16, 10, false));
    assert_eq!(generator.complete("abc").unwrap(), Completion::Generated("defg".to_string()));
    assert_eq!(generator.complete("").unwrap(), Completion::Empty);
    assert_eq!(
        generator.complete("abcdefghij").unwrap(),
        Completion::TooLong { context_length: 10 }
    );
}

#[test]
fn file_mode_writes_context_and_generated_text() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("prompts.txt");
    fs::write(&input, "abc\n\n   \npqr\nstop\nxyz\n").unwrap();

    let model = CountingModel::new(b'h' as usize);
    let mut generator = Generator::new(&model, &CharTokenizer, greedy(), settings(64, 3, false));
    let output = generator.generate_samples_input_from_file(&input, None).unwrap();
    assert_eq!(output, dir.path().join("prompts.txt.out"));

    let written = fs::read_to_string(&output).unwrap();
    assert_eq!(written, "\nContext:abc\n\nGenerated:defg\n\nContext:pqr\n\nGenerated:stuv\n");
}

#[test]
fn file_mode_honours_explicit_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("prompts.txt");
    let output = dir.path().join("samples.txt");
    fs::write(&input, "abc").unwrap();

    let model = CountingModel::new(b'h' as usize);
    let mut generator = Generator::new(&model, &CharTokenizer, greedy(), settings(64, 10, true));
    let path = generator.generate_samples_input_from_file(&input, Some(&output)).unwrap();
    assert_eq!(path, output);
    assert_eq!(fs::read_to_string(&output).unwrap(), "\nContext:abc\n\nGenerated:defg\n");
}

#[test]
fn interactive_session() {
    let model = CountingModel::new(b'h' as usize);
    let mut generator = Generator::new(&model, &CharTokenizer, greedy(), settings(16, 10, false));
    let input = Cursor::new("abc\n\n\nabcdefghij\nstop\nnever\n");
    let mut output = Vec::new();
    generator.generate_samples_interactive(input, &mut output).unwrap();

    let text = String::from_utf8(output).unwrap();
    assert!(text.starts_with("\nContext prompt (stop to exit) >>> "));
    assert!(text.contains("\nContext: abc\n"));
    assert!(text.contains("\nGenerated: defg\n"));
    assert!(text.contains("Press Enter to continue >>>"));
    assert!(text.contains("Prompt should not be empty!"));
    assert!(text.contains("Context length 10"));
    assert!(!text.contains("never"));
}

#[test]
fn interactive_session_ends_with_input() {
    let model = CountingModel::new(b'h' as usize);
    let mut generator = Generator::new(&model, &CharTokenizer, greedy(), settings(16, 10, false));
    let mut output = Vec::new();
    generator.generate_samples_interactive(Cursor::new(""), &mut output).unwrap();
    assert_eq!(String::from_utf8(output).unwrap(), "\nContext prompt (stop to exit) >>> ");
}

#[test]
fn unconditional_samples_are_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let genfile = dir.path().join("samples.jsonl");

    let model = CountingModel::new(6);
    let mut generator = Generator::new(&model, &CharTokenizer, greedy(), settings(32, 20, false));
    let written = generator.generate_and_write_samples_unconditional(&genfile, 3, 2).unwrap();
    assert_eq!(written, 3);

    let lines: Vec<Sample> = fs::read_to_string(&genfile)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    for sample in lines {
        assert_eq!(sample.text, "\u{1}\u{2}\u{3}\u{4}\u{5}");
        assert_eq!(sample.length, 5);
        assert!(sample.finished);
    }
}

#[test]
fn sampling_from_the_network_is_reproducible() {
    let model = pipeline(&small_config(), 2, 1, 3);
    let params = SamplingParams { top_k: 8, top_p: 0.9, temperature: 0.8, greedy: false };
    let run = || {
        let sampler = Sampler::new(params, VOCAB, 77);
        let mut generator = Generator::new(&model, &CharTokenizer, sampler, settings(32, 8, false));
        generator.generate_samples_unconditional(4, 2).map(Result::unwrap).collect::<Vec<_>>()
    };
    let first = run();
    assert_eq!(first.len(), 4);
    assert_eq!(first, run());
    for sample in &first {
        // positions 1..=9 can be sampled
        assert!(sample.length <= 9);
        assert_eq!(sample.finished, sample.length < 9);
    }
}
