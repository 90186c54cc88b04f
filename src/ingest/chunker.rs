//! Splits a structured document into embedding-sized chunks
//!
//! The walk accumulates element text under a token budget with a sliding
//! overlap. Three shapes get special handling: code fences are atomic up to
//! a byte cap and split on internal blank lines above it (fence markers and
//! language tag preserved on every part), headings bind forward so they
//! never end a chunk, and oversized tables split row-wise with the header
//! row repeated.

use super::parser::{DocumentElement, StructuredDocument};
use super::tokenizer::TokenEstimator;
use crate::error::ParseError;

/// Chunking parameters
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub hard_char_cap: usize,
    pub max_code_fence_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            overlap_tokens: 50,
            hard_char_cap: 4000,
            max_code_fence_size: 6000,
        }
    }
}

/// One emitted chunk
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub order: i64,
    pub text: String,
    pub token_count: usize,
    pub character_count: usize,
}

enum Segment {
    /// Regular text that may share a chunk with neighbours
    Text(String),
    /// A heading that must bind to the content after it
    Heading(String),
    /// Emitted as its own chunk even when it exceeds the token budget
    Atomic(String),
}

/// Document chunker; cheap to construct per ingestion
pub struct DocumentChunker {
    config: ChunkerConfig,
    tokens: TokenEstimator,
}

impl DocumentChunker {
    pub fn new(config: ChunkerConfig, tokens: TokenEstimator) -> Self {
        Self { config, tokens }
    }

    /// Chunk a parsed document. Returns [`ParseError::EmptyDocument`] when
    /// no text remains after walking the elements.
    pub fn chunk(&self, document: &StructuredDocument) -> Result<Vec<Chunk>, ParseError> {
        let segments = self.segment(document);

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current = String::new();
        let mut pending_headings: Vec<String> = Vec::new();

        for segment in segments {
            match segment {
                Segment::Heading(text) => {
                    pending_headings.push(text);
                }
                Segment::Atomic(text) => {
                    if !current.trim().is_empty() {
                        self.push_chunk(&mut chunks, &current);
                    }
                    current.clear();

                    let mut atomic = std::mem::take(&mut pending_headings).join("\n\n");
                    if !atomic.is_empty() {
                        atomic.push_str("\n\n");
                    }
                    atomic.push_str(&text);
                    self.push_chunk(&mut chunks, &atomic);
                }
                Segment::Text(text) => {
                    let mut addition = std::mem::take(&mut pending_headings).join("\n\n");
                    if !addition.is_empty() {
                        addition.push_str("\n\n");
                    }
                    addition.push_str(&text);

                    let candidate = join_blocks(&current, &addition);
                    let over_tokens = self.tokens.count(&candidate) > self.config.max_tokens;
                    let over_chars = candidate.chars().count() > self.config.hard_char_cap;

                    if (over_tokens || over_chars) && !current.trim().is_empty() {
                        self.push_chunk(&mut chunks, &current);
                        let tail = self.tail(&current);
                        current = join_blocks(&tail, &addition);
                    } else {
                        current = candidate;
                    }
                }
            }
        }

        // Trailing headings have no following content; keep them with the
        // last window rather than dropping them.
        if !pending_headings.is_empty() {
            let trailer = pending_headings.join("\n\n");
            current = join_blocks(&current, &trailer);
        }
        if !current.trim().is_empty() {
            self.push_chunk(&mut chunks, &current);
        }

        if chunks.is_empty() {
            return Err(ParseError::EmptyDocument);
        }
        Ok(chunks)
    }

    fn push_chunk(&self, chunks: &mut Vec<Chunk>, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        chunks.push(Chunk {
            order: chunks.len() as i64,
            text: text.to_string(),
            token_count: self.tokens.count(text),
            character_count: text.chars().count(),
        });
    }

    /// The last `overlap_tokens` worth of the previous chunk.
    fn tail(&self, text: &str) -> String {
        if self.config.overlap_tokens == 0 {
            return String::new();
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        let mut start = words.len();
        while start > 0 {
            let candidate = words[start - 1..].join(" ");
            if self.tokens.count(&candidate) > self.config.overlap_tokens {
                break;
            }
            start -= 1;
        }
        words[start..].join(" ")
    }

    fn segment(&self, document: &StructuredDocument) -> Vec<Segment> {
        let mut segments = Vec::new();

        for element in &document.elements {
            match element {
                DocumentElement::Heading { level, text } => {
                    let depth = (*level).clamp(1, 6) as usize;
                    segments.push(Segment::Heading(format!("{} {}", "#".repeat(depth), text)));
                }
                DocumentElement::Paragraph(text) => {
                    for piece in self.split_text(text) {
                        segments.push(Segment::Text(piece));
                    }
                }
                DocumentElement::Quote(text) => {
                    let quoted = text
                        .lines()
                        .map(|line| format!("> {line}"))
                        .collect::<Vec<_>>()
                        .join("\n");
                    segments.push(Segment::Text(quoted));
                }
                DocumentElement::List { ordered, items } => {
                    let rendered = items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| {
                            if *ordered {
                                format!("{}. {item}", i + 1)
                            } else {
                                format!("- {item}")
                            }
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    for piece in self.split_text(&rendered) {
                        segments.push(Segment::Text(piece));
                    }
                }
                DocumentElement::Table { rows } => {
                    self.segment_table(rows, &mut segments);
                }
                DocumentElement::CodeBlock { language, text } => {
                    self.segment_code_fence(language, text, &mut segments);
                }
            }
        }

        segments
    }

    /// Break a long text block on sentence and word boundaries so that every
    /// piece fits the token budget on its own.
    fn split_text(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        if self.tokens.count(text) <= self.config.max_tokens
            && text.chars().count() <= self.config.hard_char_cap
        {
            return vec![text.to_string()];
        }

        let mut pieces = Vec::new();
        let mut current = String::new();
        for word in text.split_whitespace() {
            let candidate = if current.is_empty() {
                word.to_string()
            } else {
                format!("{current} {word}")
            };
            if self.tokens.count(&candidate) > self.config.max_tokens
                || candidate.chars().count() > self.config.hard_char_cap
            {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                }
                current = word.to_string();
            } else {
                current = candidate;
            }
        }
        if !current.is_empty() {
            pieces.push(current);
        }
        pieces
    }

    /// Tables travel whole when they fit; otherwise row-wise with the header
    /// row repeated on every part.
    fn segment_table(&self, rows: &[Vec<String>], segments: &mut Vec<Segment>) {
        if rows.is_empty() {
            return;
        }

        let render_row = |row: &Vec<String>| format!("| {} |", row.join(" | "));
        let whole = rows.iter().map(render_row).collect::<Vec<_>>().join("\n");

        if self.tokens.count(&whole) <= self.config.max_tokens
            && whole.chars().count() <= self.config.hard_char_cap
        {
            segments.push(Segment::Text(whole));
            return;
        }

        let header = render_row(&rows[0]);
        let mut part_rows: Vec<String> = vec![header.clone()];
        for row in &rows[1..] {
            let rendered = render_row(row);
            let candidate = format!("{}\n{rendered}", part_rows.join("\n"));
            if (self.tokens.count(&candidate) > self.config.max_tokens
                || candidate.chars().count() > self.config.hard_char_cap)
                && part_rows.len() > 1
            {
                segments.push(Segment::Text(part_rows.join("\n")));
                part_rows = vec![header.clone(), rendered];
            } else {
                part_rows.push(rendered);
            }
        }
        if part_rows.len() > 1 {
            segments.push(Segment::Text(part_rows.join("\n")));
        }
    }

    /// Fences at or under the byte cap stay atomic. Above it the body splits
    /// on blank lines and every part keeps the fence markers and language.
    fn segment_code_fence(&self, language: &str, text: &str, segments: &mut Vec<Segment>) {
        let body = text.trim_end_matches('\n');

        if body.len() <= self.config.max_code_fence_size {
            segments.push(Segment::Atomic(render_fence(language, body)));
            return;
        }

        let mut parts: Vec<String> = Vec::new();
        let mut current = String::new();
        for block in body.split("\n\n") {
            let candidate = if current.is_empty() {
                block.to_string()
            } else {
                format!("{current}\n\n{block}")
            };
            if candidate.len() > self.config.max_code_fence_size && !current.is_empty() {
                parts.push(std::mem::take(&mut current));
                current = block.to_string();
            } else {
                current = candidate;
            }
        }
        if !current.is_empty() {
            parts.push(current);
        }

        for part in parts {
            segments.push(Segment::Atomic(render_fence(language, &part)));
        }
    }
}

fn render_fence(language: &str, body: &str) -> String {
    format!("```{language}\n{body}\n```")
}

fn join_blocks(a: &str, b: &str) -> String {
    if a.trim().is_empty() {
        b.to_string()
    } else if b.trim().is_empty() {
        a.to_string()
    } else {
        format!("{a}\n\n{b}")
    }
}
