//! Analyzer trait and the built-in analyzers.
//!
//! # Examples
//!
//! ```
//! use xiphos::analysis::analyzer::{Analyzer, StandardAnalyzer};
//!
//! let analyzer = StandardAnalyzer::new();
//! let tokens: Vec<_> = analyzer.analyze("Hello, World!").unwrap().collect();
//!
//! assert_eq!(tokens[0].text, "hello");
//! assert_eq!(tokens[1].text, "world");
//! ```

use unicode_segmentation::UnicodeSegmentation;

use crate::analysis::token::{Token, TokenStream};
use crate::error::Result;

/// Trait for analyzers that convert text into processed tokens.
pub trait Analyzer: Send + Sync + std::fmt::Debug {
    /// Analyze the given text and return a stream of tokens.
    fn analyze(&self, text: &str) -> Result<TokenStream>;

    /// Get the name of this analyzer (for debugging and configuration).
    fn name(&self) -> &'static str;
}

/// Splits on Unicode word boundaries (UAX #29) and lowercases every word.
#[derive(Clone, Debug, Default)]
pub struct StandardAnalyzer {
    max_token_length: Option<usize>,
}

impl StandardAnalyzer {
    /// Create a new standard analyzer.
    pub fn new() -> Self {
        StandardAnalyzer::default()
    }

    /// Drop words longer than `max` bytes. They still consume a position.
    pub fn with_max_token_length(mut self, max: usize) -> Self {
        self.max_token_length = Some(max);
        self
    }
}

impl Analyzer for StandardAnalyzer {
    fn analyze(&self, text: &str) -> Result<TokenStream> {
        let max = self.max_token_length;
        let tokens: Vec<Token> = text
            .unicode_word_indices()
            .enumerate()
            .filter(|(_, (_, word))| max.is_none_or(|max| word.len() <= max))
            .map(|(position, (start, word))| {
                Token::with_offsets(
                    word.to_lowercase(),
                    position as u32,
                    start,
                    start + word.len(),
                )
            })
            .collect();

        Ok(Box::new(tokens.into_iter()))
    }

    fn name(&self) -> &'static str {
        "standard"
    }
}

/// Emits the whole input as a single token.
#[derive(Clone, Debug, Default)]
pub struct KeywordAnalyzer;

impl KeywordAnalyzer {
    /// Create a new keyword analyzer.
    pub fn new() -> Self {
        KeywordAnalyzer
    }
}

impl Analyzer for KeywordAnalyzer {
    fn analyze(&self, text: &str) -> Result<TokenStream> {
        let token = Token::with_offsets(text, 0, 0, text.len());
        Ok(Box::new(std::iter::once(token)))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}
