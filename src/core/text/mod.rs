//! Text normalization and chunking for document ingestion.

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// A contiguous slice of the normalized document. `start_char`/`end_char` are
/// byte offsets into the normalized text; chunks overlap by design.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub max_chunk_size: usize,
    pub overlap: usize,
    /// Paragraph-aware packing when true; plain character windows otherwise.
    pub preserve_headers: bool,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        ChunkOptions {
            max_chunk_size: 1000,
            overlap: 200,
            preserve_headers: true,
        }
    }
}

/// Deterministic text cleanup: NFC, typographic folds, newline and
/// whitespace collapsing, trim. Idempotent.
pub fn normalize(input: &str) -> String {
    let mut folded = String::with_capacity(input.len());
    let mut chars = input.nfc().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2039}' | '\u{203A}' => folded.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' => folded.push('"'),
            '\u{2026}' => folded.push_str("..."),
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}' => {
                folded.push('-')
            }
            '\u{00A0}' | '\u{2007}' | '\u{202F}' | '\u{2009}' => folded.push(' '),
            '\u{00AD}' => {}
            '\u{2022}' | '\u{25E6}' | '\u{2219}' | '\u{25AA}' | '\u{00B7}' => folded.push('-'),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                folded.push('\n');
            }
            other => folded.push(other),
        }
    }
    collapse_whitespace(&folded)
}

/// Collapse space runs to one space, swallow spaces adjacent to newlines,
/// cap newline runs at two, and trim both ends.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    let mut newline_run = 0usize;
    for c in text.chars() {
        match c {
            ' ' | '\t' | '\u{000B}' | '\u{000C}' => pending_space = true,
            '\n' => {
                newline_run += 1;
                pending_space = false;
            }
            other => {
                if newline_run > 0 {
                    if !out.is_empty() {
                        out.push_str(if newline_run >= 2 { "\n\n" } else { "\n" });
                    }
                    newline_run = 0;
                } else if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(other);
            }
        }
    }
    out
}

/// Split normalized text into overlapping chunks.
pub fn chunk_text(text: &str, opts: &ChunkOptions) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }
    if opts.preserve_headers {
        chunk_paragraphs(text, opts)
    } else {
        chunk_characters(text, opts)
    }
}

/// Byte spans of paragraphs, split on the normalized blank-line separator.
fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut offset = 0usize;
    for part in text.split("\n\n") {
        if !part.is_empty() {
            spans.push((offset, offset + part.len()));
        }
        offset += part.len() + 2;
    }
    spans
}

fn chunk_paragraphs(text: &str, opts: &ChunkOptions) -> Vec<Chunk> {
    let spans = paragraph_spans(text);
    if spans.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    // `first` is the first paragraph of the current chunk (possibly an
    // overlap carry-over); `next_new` is the first paragraph not yet covered.
    let mut first = 0usize;
    let mut next_new = 0usize;
    loop {
        let start = spans[first].0;
        let mut last = next_new;
        while last + 1 < spans.len() && spans[last + 1].1 - start <= opts.max_chunk_size {
            last += 1;
        }
        let end = spans[last].1;
        chunks.push(Chunk {
            index: chunks.len(),
            start_char: start,
            end_char: end,
            text: text[start..end].to_string(),
        });
        if last + 1 >= spans.len() {
            break;
        }
        next_new = last + 1;
        // Prepend as many trailing paragraphs as fit inside the overlap
        // budget, always keeping the new start strictly past the old one.
        let mut carry = next_new;
        while carry > first + 1 && end - spans[carry - 1].0 <= opts.overlap {
            carry -= 1;
        }
        first = carry;
    }
    chunks
}

fn chunk_characters(text: &str, opts: &ChunkOptions) -> Vec<Chunk> {
    let total = text.len();
    let max = opts.max_chunk_size.max(1);
    let stride = max.saturating_sub(opts.overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let hard_end = floor_char_boundary(text, (start + max).min(total));
        let mut end = hard_end;
        if hard_end < total {
            // Prefer cutting just past a sentence end inside the final 20%
            // of the window.
            let scan_from = floor_char_boundary(text, start + max - max / 5);
            if let Some(pos) = text[scan_from..hard_end].rfind(['.', '?', '!']) {
                end = scan_from + pos + 1;
            }
        }
        chunks.push(Chunk {
            index: chunks.len(),
            start_char: start,
            end_char: end,
            text: text[start..end].to_string(),
        });
        if end >= total {
            break;
        }
        start = floor_char_boundary(text, start + stride).min(end);
    }
    chunks
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
