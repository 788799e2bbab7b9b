//! Tokenizers used for text generation.

use std::path::Path;

use tokenizers::decoders::byte_level::ByteLevel as ByteLevelDecoder;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;

use crate::args::{TokenizerArgs, TokenizerType};
use crate::error::{GenerateError, Result};

/// End-of-document token of the GPT-2 vocabulary.
pub const EOD_TOKEN: &str = "<|endoftext|>";

/// Text <-> token id conversion as seen by the generation loop.
pub trait Tokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<usize>>;

    fn detokenize(&self, ids: &[usize]) -> Result<String>;

    /// Id separating documents; generation starts from and stops at it.
    fn eod(&self) -> usize;

    /// Vocabulary size before padding.
    fn vocab_size(&self) -> usize;
}

/// Byte-level BPE tokenizer with the GPT-2 vocabulary layout.
pub struct Gpt2BpeTokenizer {
    inner: tokenizers::Tokenizer,
    eod_id: usize,
}

impl Gpt2BpeTokenizer {
    /// Build from `vocab.json` and `merges.txt`.
    pub fn from_files(vocab: impl AsRef<Path>, merges: impl AsRef<Path>) -> Result<Self> {
        let vocab = path_str(vocab.as_ref())?;
        let merges = path_str(merges.as_ref())?;
        let bpe = BPE::from_file(vocab, merges)
            .build()
            .map_err(|e| GenerateError::Tokenizer(e.to_string()))?;

        let mut inner = tokenizers::Tokenizer::new(bpe);
        inner.with_pre_tokenizer(Some(ByteLevel::default().add_prefix_space(false)));
        inner.with_decoder(Some(ByteLevelDecoder::default()));
        Self::from_inner(inner)
    }

    /// Build from a serialized tokenizer JSON.
    pub fn from_tokenizer_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(|e| GenerateError::Tokenizer(e.to_string()))?;
        Self::from_inner(inner)
    }

    fn from_inner(inner: tokenizers::Tokenizer) -> Result<Self> {
        let eod_id = inner
            .token_to_id(EOD_TOKEN)
            .ok_or_else(|| GenerateError::Tokenizer(format!("vocabulary has no {EOD_TOKEN}")))?
            as usize;
        tracing::info!(
            vocab_size = inner.get_vocab_size(true),
            eod = eod_id,
            "GPT-2 BPE tokenizer loaded"
        );
        Ok(Self { inner, eod_id })
    }
}

impl Tokenizer for Gpt2BpeTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<usize>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| GenerateError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| id as usize).collect())
    }

    fn detokenize(&self, ids: &[usize]) -> Result<String> {
        let ids: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
        self.inner
            .decode(&ids, false)
            .map_err(|e| GenerateError::Tokenizer(e.to_string()))
    }

    fn eod(&self) -> usize {
        self.eod_id
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| GenerateError::InvalidArgument(format!("non UTF-8 path {path:?}")))
}

/// Build the tokenizer selected on the command line.
pub fn build_tokenizer(args: &TokenizerArgs) -> Result<Box<dyn Tokenizer>> {
    tracing::info!(tokenizer_type = ?args.tokenizer_type, "building tokenizer");
    match args.tokenizer_type {
        TokenizerType::Gpt2BpeTokenizer => {
            if let Some(file) = &args.tokenizer_file {
                return Ok(Box::new(Gpt2BpeTokenizer::from_tokenizer_file(file)?));
            }
            match (&args.vocab_file, &args.merge_file) {
                (Some(vocab), Some(merges)) => {
                    Ok(Box::new(Gpt2BpeTokenizer::from_files(vocab, merges)?))
                }
                _ => Err(GenerateError::InvalidArgument(
                    "GPT2BPETokenizer needs --vocab-file and --merge-file, or --tokenizer-file"
                        .to_string(),
                )),
            }
        }
    }
}

/// Pad the vocabulary so every tensor parallel rank holds an equal,
/// aligned slice of the embedding table.
pub fn vocab_size_with_padding(orig_vocab_size: usize, divisible_by: usize, tp: usize) -> usize {
    let multiple = divisible_by.max(1) * tp.max(1);
    let after = orig_vocab_size.div_ceil(multiple) * multiple;
    tracing::info!(
        "padded vocab (size: {}) with {} dummy tokens (new size: {})",
        orig_vocab_size,
        after - orig_vocab_size,
        after
    );
    after
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_rounds_up_to_multiple() {
        assert_eq!(vocab_size_with_padding(50257, 128, 1), 50304);
        assert_eq!(vocab_size_with_padding(50257, 128, 2), 50432);
        assert_eq!(vocab_size_with_padding(256, 128, 2), 256);
        assert_eq!(vocab_size_with_padding(10, 1, 1), 10);
    }

    #[test]
    fn test_build_requires_vocab_files() {
        let args = TokenizerArgs {
            tokenizer_type: TokenizerType::Gpt2BpeTokenizer,
            vocab_file: None,
            merge_file: None,
            tokenizer_file: None,
        };
        assert!(build_tokenizer(&args).is_err());
    }
}
