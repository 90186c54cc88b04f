//! Format-specific document parsers producing a common structured model
//!
//! A parser consumes raw bytes and returns a [`StructuredDocument`] or a
//! [`ParseError`] value; parsers never panic on malformed input.

mod docx;
mod markdown;
mod pdf;
mod text;

use crate::error::ParseError;
use serde::{Deserialize, Serialize};

pub use docx::DocxParser;
pub use markdown::MarkdownParser;
pub use pdf::PdfParser;
pub use text::TextParser;

/// Hard cap applied before any parsing work
pub const MAX_DOCUMENT_BYTES: u64 = 50 * 1024 * 1024;

/// Supported source formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Pdf,
    Docx,
    Markdown,
    Text,
}

impl FileType {
    /// Resolve a format from a file name's extension.
    pub fn from_file_name(name: &str) -> Result<Self, ParseError> {
        let extension = name
            .rsplit('.')
            .next()
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            "md" | "markdown" => Ok(Self::Markdown),
            "txt" | "text" => Ok(Self::Text),
            other => Err(ParseError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Markdown => "md",
            Self::Text => "txt",
        }
    }
}

/// One block-level element of a parsed document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DocumentElement {
    Heading { level: u8, text: String },
    Paragraph(String),
    List { ordered: bool, items: Vec<String> },
    Table { rows: Vec<Vec<String>> },
    CodeBlock { language: String, text: String },
    Quote(String),
}

impl DocumentElement {
    /// Flattened text of the element, used by the chunker and tests.
    pub fn text(&self) -> String {
        match self {
            Self::Heading { text, .. } => text.clone(),
            Self::Paragraph(text) | Self::Quote(text) => text.clone(),
            Self::List { items, .. } => items.join("\n"),
            Self::Table { rows } => rows
                .iter()
                .map(|row| row.join(" | "))
                .collect::<Vec<_>>()
                .join("\n"),
            Self::CodeBlock { text, .. } => text.clone(),
        }
    }
}

/// Ordered sequence of elements produced by a parser
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredDocument {
    pub elements: Vec<DocumentElement>,
}

impl StructuredDocument {
    /// True when nothing textual survived parsing.
    pub fn is_empty(&self) -> bool {
        self.elements
            .iter()
            .all(|e| e.text().trim().is_empty())
    }

    pub fn plain_text(&self) -> String {
        self.elements
            .iter()
            .map(|e| e.text())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// A format-specific parser
pub trait DocumentParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<StructuredDocument, ParseError>;
}

/// Resolve the parser for a format.
pub fn parser_for(file_type: FileType) -> Box<dyn DocumentParser> {
    match file_type {
        FileType::Pdf => Box::new(PdfParser),
        FileType::Docx => Box::new(DocxParser),
        FileType::Markdown => Box::new(MarkdownParser),
        FileType::Text => Box::new(TextParser),
    }
}

/// Parse raw bytes named `file_name`, enforcing the size cap and the
/// non-empty contract.
pub fn parse_document(file_name: &str, bytes: &[u8]) -> Result<StructuredDocument, ParseError> {
    let file_type = FileType::from_file_name(file_name)?;

    if bytes.len() as u64 > MAX_DOCUMENT_BYTES {
        return Err(ParseError::TooLarge {
            size: bytes.len() as u64,
            limit: MAX_DOCUMENT_BYTES,
        });
    }

    let document = parser_for(file_type).parse(bytes)?;
    if document.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_resolution() {
        assert_eq!(FileType::from_file_name("a.PDF").unwrap(), FileType::Pdf);
        assert_eq!(FileType::from_file_name("notes.md").unwrap(), FileType::Markdown);
        assert_eq!(FileType::from_file_name("b.docx").unwrap(), FileType::Docx);
        assert_eq!(FileType::from_file_name("c.txt").unwrap(), FileType::Text);
        assert!(matches!(
            FileType::from_file_name("d.xlsx"),
            Err(ParseError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_size_cap() {
        let big = vec![b' '; (MAX_DOCUMENT_BYTES + 1) as usize];
        assert!(matches!(
            parse_document("big.txt", &big),
            Err(ParseError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_document_is_an_error_value() {
        assert!(matches!(parse_document("empty.txt", b"  \n \n"), Err(ParseError::Empty)));
    }
}
