//! DOCX parser: walks `word/document.xml` inside the OOXML archive

use super::{DocumentElement, DocumentParser, StructuredDocument};
use crate::error::ParseError;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Read;

/// Decompressed size bound for a single ZIP entry (zip-bomb protection)
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

pub struct DocxParser;

impl DocumentParser for DocxParser {
    fn parse(&self, bytes: &[u8]) -> Result<StructuredDocument, ParseError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| ParseError::CorruptInput(e.to_string()))?;

        let mut doc_xml = Vec::new();
        {
            let entry = archive
                .by_name("word/document.xml")
                .map_err(|_| ParseError::CorruptInput("word/document.xml not found".to_string()))?;
            entry
                .take(MAX_XML_ENTRY_BYTES)
                .read_to_end(&mut doc_xml)
                .map_err(|e| ParseError::CorruptInput(e.to_string()))?;
            if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
                return Err(ParseError::TooLarge {
                    size: doc_xml.len() as u64,
                    limit: MAX_XML_ENTRY_BYTES,
                });
            }
        }

        walk_document_xml(&doc_xml)
    }
}

fn walk_document_xml(xml: &[u8]) -> Result<StructuredDocument, ParseError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut elements = Vec::new();
    let mut buf = Vec::new();

    // Paragraph state
    let mut paragraph = String::new();
    let mut heading_level: Option<u8> = None;
    let mut is_list_item = false;
    let mut in_text = false;

    // Pending list accumulation across consecutive list paragraphs
    let mut list_items: Vec<String> = Vec::new();

    // Table state
    let mut table_rows: Vec<Vec<String>> = Vec::new();
    let mut current_row: Vec<String> = Vec::new();
    let mut current_cell = String::new();
    let mut table_depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    paragraph.clear();
                    heading_level = None;
                    is_list_item = false;
                }
                b"t" => in_text = true,
                // Style and numbering markers may be containers or
                // self-closing; both shapes appear in the wild
                b"pStyle" => {
                    if let Some(style) = attribute_value(&e, b"val") {
                        heading_level = heading_style_level(&style);
                    }
                }
                b"numPr" => is_list_item = true,
                b"tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        flush_list(&mut list_items, &mut elements);
                        table_rows.clear();
                    }
                }
                b"tr" if table_depth == 1 => current_row.clear(),
                b"tc" if table_depth == 1 => current_cell.clear(),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => {
                    if let Some(style) = attribute_value(&e, b"val") {
                        heading_level = heading_style_level(&style);
                    }
                }
                b"numPr" | b"ilvl" => is_list_item = true,
                b"br" => paragraph.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().unwrap_or_default();
                if table_depth > 0 {
                    current_cell.push_str(&text);
                } else {
                    paragraph.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if table_depth == 0 => {
                    let text = paragraph.trim().to_string();
                    if text.is_empty() {
                        // skip
                    } else if let Some(level) = heading_level {
                        flush_list(&mut list_items, &mut elements);
                        elements.push(DocumentElement::Heading { level, text });
                    } else if is_list_item {
                        list_items.push(text);
                    } else {
                        flush_list(&mut list_items, &mut elements);
                        elements.push(DocumentElement::Paragraph(text));
                    }
                    paragraph.clear();
                }
                b"tc" if table_depth == 1 => {
                    current_row.push(current_cell.trim().to_string());
                }
                b"tr" if table_depth == 1 => {
                    table_rows.push(std::mem::take(&mut current_row));
                }
                b"tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 && !table_rows.is_empty() {
                        elements.push(DocumentElement::Table {
                            rows: std::mem::take(&mut table_rows),
                        });
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::CorruptInput(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    flush_list(&mut list_items, &mut elements);
    Ok(StructuredDocument { elements })
}

fn flush_list(items: &mut Vec<String>, elements: &mut Vec<DocumentElement>) {
    if !items.is_empty() {
        elements.push(DocumentElement::List {
            ordered: false,
            items: std::mem::take(items),
        });
    }
}

fn attribute_value(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == name {
            Some(String::from_utf8_lossy(&a.value).into_owned())
        } else {
            None
        }
    })
}

/// Map explicit Word heading styles to levels 1–6.
fn heading_style_level(style: &str) -> Option<u8> {
    let rest = style
        .strip_prefix("Heading")
        .or_else(|| style.strip_prefix("heading"))?;
    match rest.parse::<u8>() {
        Ok(level @ 1..=6) => Some(level),
        _ => None,
    }
}
