//! Plain-text parser: one paragraph per blank-line-separated block

use super::{DocumentElement, DocumentParser, StructuredDocument};
use crate::error::ParseError;

pub struct TextParser;

impl DocumentParser for TextParser {
    fn parse(&self, bytes: &[u8]) -> Result<StructuredDocument, ParseError> {
        let text = String::from_utf8_lossy(bytes);

        let elements = text
            .split("\n\n")
            .map(str::trim)
            .filter(|block| !block.is_empty())
            .map(|block| DocumentElement::Paragraph(block.to_string()))
            .collect();

        Ok(StructuredDocument { elements })
    }
}
