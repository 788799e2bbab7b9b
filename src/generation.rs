//! Autoregressive sampling and the three generation modes: prompts from a
//! file, interactive prompts, and unconditional samples.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::args::TextGenerationArgs;
use crate::error::{GenerateError, Result};
use crate::kv_cache::KvCache;
use crate::model::LanguageModel;
use crate::sampling::Sampler;
use crate::tokenizer::Tokenizer;

/// Length limits and decoding strategy of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationSettings {
    pub seq_length: usize,
    pub out_seq_length: usize,
    /// Recompute attention over the whole prefix every step instead of
    /// reusing cached keys/values.
    pub recompute: bool,
    /// Report timing every this many unconditional samples.
    pub log_interval: usize,
}

impl GenerationSettings {
    pub fn new(seq_length: usize, text: &TextGenerationArgs, log_interval: usize) -> Self {
        Self {
            seq_length,
            out_seq_length: text.out_seq_length,
            recompute: text.recompute,
            log_interval,
        }
    }
}

/// State of the batch after one decoding step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamStep {
    /// Per sequence, the tokens up to and including the current position.
    pub tokens: Vec<Vec<usize>>,
    /// Per sequence, number of valid tokens: the position of the first
    /// generated end-of-document token, or everything decoded so far.
    pub lengths: Vec<usize>,
    /// Sequences that produced an end-of-document token.
    pub finished: Vec<bool>,
}

impl StreamStep {
    /// Valid tokens of sequence `b`, end-of-document excluded.
    pub fn sequence(&self, b: usize) -> &[usize] {
        let end = self.lengths[b].min(self.tokens[b].len());
        &self.tokens[b][..end]
    }
}

/// Step-by-step decoding of a batch of contexts.
///
/// Decoding starts at the shortest context. A sequence whose context is
/// longer keeps its own context tokens until decoding reaches its end.
/// Iteration stops once every sequence produced end-of-document or the
/// position reaches `min(seq_length - 1, shortest context + out_seq_length)`.
pub struct TokenStream<'a> {
    model: &'a dyn LanguageModel,
    sampler: &'a mut Sampler,
    eod: usize,
    recompute: bool,
    tokens: Vec<Vec<usize>>,
    context_lengths: Vec<usize>,
    caches: Vec<KvCache>,
    lengths: Vec<usize>,
    is_done: Vec<bool>,
    context_length: usize,
    maxlen: usize,
    counter: usize,
    stopped: bool,
}

impl<'a> TokenStream<'a> {
    pub fn new(
        model: &'a dyn LanguageModel,
        sampler: &'a mut Sampler,
        contexts: Vec<Vec<usize>>,
        eod: usize,
        settings: &GenerationSettings,
    ) -> Result<Self> {
        let seq_length = settings.seq_length;
        if contexts.is_empty() {
            return Err(GenerateError::InvalidArgument("no contexts to decode".to_string()));
        }
        if let Some(bad) = contexts.iter().find(|c| c.is_empty() || c.len() > seq_length) {
            return Err(GenerateError::InvalidArgument(format!(
                "context length {} outside 1..={seq_length}",
                bad.len()
            )));
        }

        let context_lengths: Vec<usize> = contexts.iter().map(Vec::len).collect();
        let context_length = context_lengths.iter().copied().min().unwrap_or(1);
        let maxlen = (seq_length - 1).min(context_length + settings.out_seq_length);

        let tokens = contexts
            .into_iter()
            .map(|mut c| {
                c.resize(seq_length, eod);
                c
            })
            .collect::<Vec<_>>();
        let caches = if settings.recompute {
            Vec::new()
        } else {
            tokens.iter().map(|_| model.new_cache()).collect()
        };
        let batch = tokens.len();

        Ok(Self {
            model,
            sampler,
            eod,
            recompute: settings.recompute,
            tokens,
            context_lengths,
            caches,
            lengths: vec![maxlen + 1; batch],
            is_done: vec![false; batch],
            context_length,
            maxlen,
            counter: 0,
            stopped: false,
        })
    }

    pub fn maxlen(&self) -> usize {
        self.maxlen
    }

    /// Logits predicting position `pos` of sequence `b`.
    fn next_logits(&mut self, b: usize, pos: usize) -> Result<Array1<f32>> {
        let tokens = &self.tokens[b];
        if self.recompute {
            let logits = self.model.forward(&tokens[..pos], None)?;
            return Ok(logits.row(pos - 1).to_owned());
        }
        let feed = if self.counter == 0 { &tokens[..pos] } else { &tokens[pos - 1..pos] };
        let logits = self.model.forward(feed, Some(&mut self.caches[b]))?;
        Ok(logits.row(logits.nrows() - 1).to_owned())
    }

    fn step(&mut self) -> Result<StreamStep> {
        let pos = self.context_length;
        for b in 0..self.tokens.len() {
            if self.is_done[b] {
                continue;
            }
            let started = self.context_lengths[b] <= pos;
            if !started && self.recompute {
                continue;
            }
            // unstarted sequences still run so their cache covers the context
            let logits = self.next_logits(b, pos)?;
            if !started {
                continue;
            }
            let prev = self.sampler.sample(logits.view());
            self.tokens[b][pos] = prev;
            if prev == self.eod {
                self.lengths[b] = pos;
                self.is_done[b] = true;
            }
        }

        let step = StreamStep {
            tokens: self.tokens.iter().map(|t| t[..=pos].to_vec()).collect(),
            lengths: self.lengths.iter().map(|&l| l.min(pos + 1)).collect(),
            finished: self.is_done.clone(),
        };
        tracing::debug!(
            position = pos,
            done = self.is_done.iter().filter(|&&d| d).count(),
            "decoding step"
        );
        self.context_length += 1;
        self.counter += 1;
        if self.is_done.iter().all(|&d| d) {
            self.stopped = true;
        }
        Ok(step)
    }

    /// Drain the stream and return the final step, if any step ran.
    pub fn run_to_end(self) -> Result<Option<StreamStep>> {
        let mut last = None;
        for step in self {
            last = Some(step?);
        }
        Ok(last)
    }
}

impl Iterator for TokenStream<'_> {
    type Item = Result<StreamStep>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped || self.context_length > self.maxlen {
            return None;
        }
        let step = self.step();
        if step.is_err() {
            self.stopped = true;
        }
        Some(step)
    }
}

/// Outcome of conditioning on one prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Text generated after the prompt.
    Generated(String),
    /// Prompt takes half of the sequence length or more.
    TooLong { context_length: usize },
    /// Prompt has no tokens.
    Empty,
}

/// One line of the unconditional output file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub text: String,
    /// Number of generated tokens.
    pub length: usize,
    /// Generation ended with end-of-document rather than the length limit.
    pub finished: bool,
}

/// Everything needed to turn prompts into text.
pub struct Generator<'a> {
    model: &'a dyn LanguageModel,
    tokenizer: &'a dyn Tokenizer,
    sampler: Sampler,
    settings: GenerationSettings,
}

impl<'a> Generator<'a> {
    pub fn new(
        model: &'a dyn LanguageModel,
        tokenizer: &'a dyn Tokenizer,
        sampler: Sampler,
        settings: GenerationSettings,
    ) -> Self {
        Self { model, tokenizer, sampler, settings }
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn token_stream(&mut self, contexts: Vec<Vec<usize>>) -> Result<TokenStream<'_>> {
        TokenStream::new(
            self.model,
            &mut self.sampler,
            contexts,
            self.tokenizer.eod(),
            &self.settings,
        )
    }

    /// Generate a continuation of `prompt`.
    pub fn complete(&mut self, prompt: &str) -> Result<Completion> {
        let context = self.tokenizer.tokenize(prompt)?;
        if context.is_empty() {
            return Ok(Completion::Empty);
        }
        if context.len() >= self.settings.seq_length / 2 {
            return Ok(Completion::TooLong { context_length: context.len() });
        }

        let context_len = context.len();
        let Some(last) = self.token_stream(vec![context])?.run_to_end()? else {
            return Ok(Completion::Generated(String::new()));
        };
        let sequence = last.sequence(0);
        let generated = &sequence[context_len.min(sequence.len())..];
        Ok(Completion::Generated(self.tokenizer.detokenize(generated)?))
    }

    /// Condition on every line of `input` and write the results to
    /// `output`, or `<input>.out` when not given. Empty lines are skipped and
    /// a line reading `stop` ends the run. Returns the output path.
    pub fn generate_samples_input_from_file(
        &mut self,
        input: &Path,
        output: Option<&Path>,
    ) -> Result<PathBuf> {
        let output = match output {
            Some(path) => path.to_path_buf(),
            None => {
                let path = PathBuf::from(format!("{}.out", input.display()));
                tracing::info!(
                    "`sample-output-file` not specified, setting it to {}",
                    path.display()
                );
                path
            }
        };

        let prompts = fs::read_to_string(input)?;
        let mut out = BufWriter::new(File::create(&output)?);
        let mut count = 0;

        for line in prompts.lines() {
            let raw = line.trim_end();
            if raw.trim().is_empty() {
                continue;
            }
            if raw.trim() == "stop" {
                break;
            }
            match self.complete(raw)? {
                Completion::Generated(text) => {
                    write!(out, "\nContext:{raw}\n\nGenerated:{text}\n")?;
                    count += 1;
                }
                Completion::TooLong { context_length } => {
                    tracing::warn!(
                        context_length,
                        "please give smaller context (half of the sequence length), skipping prompt"
                    );
                }
                Completion::Empty => tracing::warn!("prompt produced no tokens, skipping"),
            }
        }
        out.flush()?;
        tracing::info!(prompts = count, path = %output.display(), "wrote conditional samples");
        Ok(output)
    }

    /// Read prompts from `input` until `stop` or end of input, writing each
    /// continuation to `output`.
    pub fn generate_samples_interactive<R: BufRead, W: Write>(
        &mut self,
        mut input: R,
        mut output: W,
    ) -> Result<()> {
        loop {
            write!(output, "\nContext prompt (stop to exit) >>> ")?;
            output.flush()?;
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            let raw = line.trim_end_matches(['\r', '\n']);
            if raw == "stop" {
                break;
            }
            if raw.is_empty() {
                writeln!(output, "Prompt should not be empty!")?;
                continue;
            }

            match self.complete(raw)? {
                Completion::Generated(text) => {
                    writeln!(output, "\nContext: {raw}")?;
                    writeln!(output, "\nGenerated: {text}")?;
                }
                Completion::TooLong { context_length } => {
                    writeln!(
                        output,
                        "\nContext length {context_length}\n\
                         Please give smaller context (half of the sequence length)!"
                    )?;
                    continue;
                }
                Completion::Empty => {
                    writeln!(output, "Prompt should not be empty!")?;
                    continue;
                }
            }

            write!(output, "\nPress Enter to continue >>>")?;
            output.flush()?;
            if input.read_line(&mut String::new())? == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Unconditional samples, each decoded from a lone end-of-document
    /// token, `micro_batch_size` at a time.
    pub fn generate_samples_unconditional(
        &mut self,
        num_samples: usize,
        micro_batch_size: usize,
    ) -> UnconditionalSamples<'_, 'a> {
        UnconditionalSamples {
            generator: self,
            remaining: num_samples,
            micro_batch_size: micro_batch_size.max(1),
            pending: VecDeque::new(),
            produced: 0,
            timer: Instant::now(),
            failed: false,
        }
    }

    /// Write `num_samples` unconditional samples to `genfile` as JSON lines.
    pub fn generate_and_write_samples_unconditional(
        &mut self,
        genfile: &Path,
        num_samples: usize,
        micro_batch_size: usize,
    ) -> Result<usize> {
        let mut out = BufWriter::new(File::create(genfile)?);
        let mut written = 0;
        for sample in self.generate_samples_unconditional(num_samples, micro_batch_size) {
            serde_json::to_writer(&mut out, &sample?)?;
            out.write_all(b"\n")?;
            written += 1;
        }
        out.flush()?;
        tracing::info!(samples = written, path = %genfile.display(), "wrote unconditional samples");
        Ok(written)
    }

    fn unconditional_batch(&mut self, batch: usize) -> Result<Vec<Sample>> {
        let eod = self.tokenizer.eod();
        let Some(last) = self.token_stream(vec![vec![eod]; batch])?.run_to_end()? else {
            return Ok(Vec::new());
        };
        (0..batch)
            .map(|b| {
                let generated = last.sequence(b).get(1..).unwrap_or(&[]);
                Ok(Sample {
                    text: self.tokenizer.detokenize(generated)?,
                    length: generated.len(),
                    finished: last.finished[b],
                })
            })
            .collect()
    }
}

/// Iterator over unconditional samples; see
/// [`Generator::generate_samples_unconditional`].
pub struct UnconditionalSamples<'g, 'a> {
    generator: &'g mut Generator<'a>,
    remaining: usize,
    micro_batch_size: usize,
    pending: VecDeque<Sample>,
    produced: usize,
    timer: Instant,
    failed: bool,
}

impl Iterator for UnconditionalSamples<'_, '_> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        if self.pending.is_empty() {
            let batch = self.micro_batch_size.min(self.remaining);
            match self.generator.unconditional_batch(batch) {
                Ok(samples) if samples.is_empty() => return None,
                Ok(samples) => self.pending.extend(samples),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        let sample = self.pending.pop_front()?;
        self.remaining -= 1;
        self.produced += 1;
        let interval = self.generator.settings.log_interval.max(1);
        if self.produced % interval == 0 {
            let batches = interval.div_ceil(self.micro_batch_size);
            tracing::info!(
                samples = self.produced,
                "Avg s/batch: {:.4}",
                self.timer.elapsed().as_secs_f64() / batches as f64
            );
            self.timer = Instant::now();
        }
        Some(Ok(sample))
    }
}
