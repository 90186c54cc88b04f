//! Markdown parser preserving structure and code fences verbatim

use super::{DocumentElement, DocumentParser, StructuredDocument};
use crate::error::ParseError;
use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag, TagEnd};

pub struct MarkdownParser;

impl DocumentParser for MarkdownParser {
    fn parse(&self, bytes: &[u8]) -> Result<StructuredDocument, ParseError> {
        let text = String::from_utf8_lossy(bytes);

        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);

        let mut builder = Builder::default();
        for event in Parser::new_ext(&text, options) {
            builder.handle(event);
        }

        Ok(StructuredDocument {
            elements: builder.elements,
        })
    }
}

#[derive(Default)]
struct Builder {
    elements: Vec<DocumentElement>,
    buffer: String,
    heading: Option<u8>,
    code: Option<(String, String)>,
    list: Option<(bool, Vec<String>)>,
    item: String,
    in_item: bool,
    table: Option<Vec<Vec<String>>>,
    row: Vec<String>,
    cell: String,
    in_cell: bool,
    quote_depth: usize,
    quote: String,
}

impl Builder {
    fn handle(&mut self, event: Event<'_>) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                self.heading = Some(heading_level(level));
                self.buffer.clear();
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some(level) = self.heading.take() {
                    let text = std::mem::take(&mut self.buffer).trim().to_string();
                    if !text.is_empty() {
                        self.elements.push(DocumentElement::Heading { level, text });
                    }
                }
            }
            Event::Start(Tag::CodeBlock(kind)) => {
                let language = match kind {
                    CodeBlockKind::Fenced(lang) => lang.to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                self.code = Some((language, String::new()));
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((language, text)) = self.code.take() {
                    self.elements.push(DocumentElement::CodeBlock { language, text });
                }
            }
            Event::Start(Tag::List(start)) => {
                self.flush_paragraph();
                self.list = Some((start.is_some(), Vec::new()));
            }
            Event::End(TagEnd::List(_)) => {
                if let Some((ordered, items)) = self.list.take() {
                    if !items.is_empty() {
                        self.elements.push(DocumentElement::List { ordered, items });
                    }
                }
            }
            Event::Start(Tag::Item) => {
                self.in_item = true;
                self.item.clear();
            }
            Event::End(TagEnd::Item) => {
                self.in_item = false;
                let item = std::mem::take(&mut self.item).trim().to_string();
                if let Some((_, items)) = self.list.as_mut() {
                    if !item.is_empty() {
                        items.push(item);
                    }
                }
            }
            Event::Start(Tag::Table(_)) => {
                self.flush_paragraph();
                self.table = Some(Vec::new());
            }
            Event::End(TagEnd::Table) => {
                if let Some(rows) = self.table.take() {
                    if !rows.is_empty() {
                        self.elements.push(DocumentElement::Table { rows });
                    }
                }
            }
            Event::Start(Tag::TableHead) | Event::Start(Tag::TableRow) => {
                self.row.clear();
            }
            Event::End(TagEnd::TableHead) | Event::End(TagEnd::TableRow) => {
                if let Some(rows) = self.table.as_mut() {
                    rows.push(std::mem::take(&mut self.row));
                }
            }
            Event::Start(Tag::TableCell) => {
                self.in_cell = true;
                self.cell.clear();
            }
            Event::End(TagEnd::TableCell) => {
                self.in_cell = false;
                self.row.push(std::mem::take(&mut self.cell).trim().to_string());
            }
            Event::Start(Tag::BlockQuote(_)) => {
                self.flush_paragraph();
                self.quote_depth += 1;
            }
            Event::End(TagEnd::BlockQuote(_)) => {
                self.quote_depth = self.quote_depth.saturating_sub(1);
                if self.quote_depth == 0 {
                    let quote = std::mem::take(&mut self.quote).trim().to_string();
                    if !quote.is_empty() {
                        self.elements.push(DocumentElement::Quote(quote));
                    }
                }
            }
            Event::End(TagEnd::Paragraph) => {
                if self.quote_depth > 0 {
                    self.quote.push_str(self.buffer.trim());
                    self.quote.push('\n');
                    self.buffer.clear();
                } else if !self.in_item {
                    self.flush_paragraph();
                }
            }
            Event::Text(text) => self.push_text(&text),
            Event::Code(code) => self.push_text(&format!("`{code}`")),
            Event::SoftBreak | Event::HardBreak => self.push_text("\n"),
            _ => {}
        }
    }

    fn push_text(&mut self, text: &str) {
        if let Some((_, code)) = self.code.as_mut() {
            code.push_str(text);
        } else if self.in_cell {
            self.cell.push_str(text);
        } else if self.in_item {
            self.item.push_str(text);
        } else {
            self.buffer.push_str(text);
        }
    }

    fn flush_paragraph(&mut self) {
        let text = std::mem::take(&mut self.buffer).trim().to_string();
        if !text.is_empty() {
            self.elements.push(DocumentElement::Paragraph(text));
        }
    }
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}
