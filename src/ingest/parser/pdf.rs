//! PDF parser: text extraction plus heuristic heading reconstruction
//!
//! `pdf-extract` yields plain text without font metrics, so the heading
//! hierarchy is inferred from line shape: short, unpunctuated, title-cased
//! lines become headings. A document that yields no heading at all gets the
//! synthetic root heading "Untitled".

use super::{DocumentElement, DocumentParser, StructuredDocument};
use crate::error::ParseError;
use regex::Regex;
use std::sync::OnceLock;

/// Longest line still considered a heading candidate
const MAX_HEADING_LEN: usize = 80;
/// Most words a heading candidate may contain
const MAX_HEADING_WORDS: usize = 10;

pub struct PdfParser;

impl DocumentParser for PdfParser {
    fn parse(&self, bytes: &[u8]) -> Result<StructuredDocument, ParseError> {
        let text = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ParseError::CorruptInput(e.to_string()))?;

        Ok(structure_text(&text))
    }
}

fn structure_text(text: &str) -> StructuredDocument {
    let mut elements = Vec::new();
    let mut paragraph = String::new();
    let mut saw_heading = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush_paragraph(&mut paragraph, &mut elements);
            continue;
        }

        if looks_like_heading(line) {
            flush_paragraph(&mut paragraph, &mut elements);
            saw_heading = true;
            elements.push(DocumentElement::Heading {
                level: heading_level(line),
                text: line.to_string(),
            });
        } else {
            if !paragraph.is_empty() {
                paragraph.push(' ');
            }
            paragraph.push_str(line);
        }
    }
    flush_paragraph(&mut paragraph, &mut elements);

    if !saw_heading && !elements.is_empty() {
        elements.insert(
            0,
            DocumentElement::Heading {
                level: 1,
                text: "Untitled".to_string(),
            },
        );
    }

    StructuredDocument { elements }
}

fn flush_paragraph(paragraph: &mut String, elements: &mut Vec<DocumentElement>) {
    let text = paragraph.trim().to_string();
    if !text.is_empty() {
        elements.push(DocumentElement::Paragraph(text));
    }
    paragraph.clear();
}

fn looks_like_heading(line: &str) -> bool {
    if line.len() > MAX_HEADING_LEN {
        return false;
    }
    if line.ends_with(['.', ',', ';', ':']) {
        return false;
    }

    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() || words.len() > MAX_HEADING_WORDS {
        return false;
    }

    // All caps, numbered sections, or predominantly capitalized words
    let all_caps = line
        .chars()
        .filter(|c| c.is_alphabetic())
        .all(|c| c.is_uppercase())
        && line.chars().any(|c| c.is_alphabetic());
    let numbered = section_number().is_match(words[0]) && words.len() > 1;
    let capitalized = words
        .iter()
        .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
        .count();

    all_caps || numbered || capitalized * 3 >= words.len() * 2
}

/// Matches section numbers like `1`, `2.3`, `2.3.1.`
fn section_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(\.\d+)*\.?$").expect("valid section-number pattern"))
}

/// Numbered sections nest by their dotted depth; everything else is level 1.
fn heading_level(line: &str) -> u8 {
    let first = line.split_whitespace().next().unwrap_or_default();
    if section_number().is_match(first) {
        let depth = first.trim_end_matches('.').split('.').count() as u8;
        depth.clamp(1, 6)
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heading_heuristics() {
        assert!(looks_like_heading("INTRODUCTION"));
        assert!(looks_like_heading("1.2 Retrieval Pipeline"));
        assert!(looks_like_heading("Background And Motivation"));
        assert!(!looks_like_heading(
            "this is an ordinary sentence that keeps going and clearly is not a title at all"
        ));
        assert!(!looks_like_heading("It ends with a period."));
    }

    #[test]
    fn test_numbered_heading_levels() {
        assert_eq!(heading_level("1 Overview"), 1);
        assert_eq!(heading_level("2.3 Details"), 2);
        assert_eq!(heading_level("2.3.1 More"), 3);
        assert_eq!(heading_level("Overview"), 1);
    }

    #[test]
    fn test_untitled_root_when_no_heading_inferred() {
        let doc = structure_text("just some flowing prose, lowercase and plain.\nmore of it here.");
        assert_eq!(
            doc.elements[0],
            DocumentElement::Heading { level: 1, text: "Untitled".into() }
        );
        assert!(matches!(doc.elements[1], DocumentElement::Paragraph(_)));
    }

    #[test]
    fn test_paragraphs_merge_across_wrapped_lines() {
        let doc = structure_text("INTRODUCTION\nfirst wrapped\nline of prose.\n\nsecond block.");
        assert_eq!(
            doc.elements[1],
            DocumentElement::Paragraph("first wrapped line of prose.".into())
        );
        assert_eq!(doc.elements[2], DocumentElement::Paragraph("second block.".into()));
    }

    #[test]
    fn test_invalid_pdf_is_corrupt_input() {
        assert!(matches!(
            PdfParser.parse(b"not a pdf"),
            Err(ParseError::CorruptInput(_))
        ));
    }
}
