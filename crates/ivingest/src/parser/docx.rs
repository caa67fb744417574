use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::ParseError;
use crate::model::FileKind;
use crate::parser::{ParseOptions, Parser, ParserOutput};

const DOCX_CONFIDENCE: f32 = 0.9;

/// Parser for Word documents. Handles the zip/XML container; legacy OLE
/// `.doc` files that are not zip archives are rejected as malformed.
pub struct DocxParser;

impl DocxParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DocxParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for DocxParser {
    fn parse(
        &self,
        blob: &[u8],
        kind: FileKind,
        _options: &ParseOptions,
    ) -> Result<ParserOutput, ParseError> {
        let _span = tracing::info_span!("parser.docx").entered();

        let mut archive = zip::ZipArchive::new(Cursor::new(blob)).map_err(|e| {
            ParseError::Malformed {
                kind,
                message: format!("not a Word zip container: {}", e),
            }
        })?;

        let mut document_xml = archive.by_name("word/document.xml").map_err(|e| {
            ParseError::Malformed {
                kind,
                message: format!("missing word/document.xml: {}", e),
            }
        })?;

        let mut xml_content = String::new();
        document_xml
            .read_to_string(&mut xml_content)
            .map_err(|e| ParseError::Malformed {
                kind,
                message: format!("failed to read document.xml: {}", e),
            })?;

        let text = parse_document_xml(&xml_content, kind)?;
        Ok(ParserOutput::with_text(text, DOCX_CONFIDENCE))
    }

    fn supports(&self, kind: FileKind) -> bool {
        matches!(kind, FileKind::Doc | FileKind::Docx)
    }
}

fn parse_document_xml(xml: &str, kind: FileKind) -> Result<String, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut text = String::new();
    let mut in_text_element = false;
    let mut in_paragraph = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text_element = true,
                b"p" => in_paragraph = true,
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text_element = false,
                b"p" => {
                    if in_paragraph {
                        text.push('\n');
                        in_paragraph = false;
                    }
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text_element {
                    let decoded = e.unescape().unwrap_or_default();
                    text.push_str(&decoded);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ParseError::Malformed {
                    kind,
                    message: format!("XML parsing error: {}", e),
                });
            }
            _ => {}
        }
    }

    Ok(text)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Builds a minimal docx archive containing the given paragraphs.
    pub(crate) fn minimal_docx(paragraphs: &[&str]) -> Vec<u8> {
        let mut body = String::new();
        for p in paragraphs {
            body.push_str(&format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p));
        }
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
<w:body>{}</w:body>
</w:document>"#,
            body
        );

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options: zip::write::SimpleFileOptions = Default::default();
            writer.start_file("word/document.xml", options).unwrap();
            writer.write_all(xml.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_extracts_paragraph_text() {
        let bytes = minimal_docx(&["Inspection Summary", "Inspector: Jane Smith"]);
        let parser = DocxParser::new();
        let output = parser
            .parse(&bytes, FileKind::Docx, &ParseOptions::default())
            .unwrap();

        assert!(output.text.contains("Inspection Summary"));
        assert!(output.text.contains("Inspector: Jane Smith"));
        // Paragraphs become separate lines.
        assert!(output.text.lines().count() >= 2);
    }

    #[test]
    fn test_non_zip_doc_is_permanent() {
        let parser = DocxParser::new();
        let result = parser.parse(
            &[0xD0, 0xCF, 0x11, 0xE0, 0, 0],
            FileKind::Doc,
            &ParseOptions::default(),
        );
        assert!(matches!(result, Err(ParseError::Malformed { .. })));
    }

    #[test]
    fn test_supports_word_kinds() {
        let parser = DocxParser::new();
        assert!(parser.supports(FileKind::Doc));
        assert!(parser.supports(FileKind::Docx));
        assert!(!parser.supports(FileKind::Xlsx));
    }

    #[test]
    fn test_entities_unescaped() {
        let bytes = minimal_docx(&["Smith &amp; Sons Inspections"]);
        let parser = DocxParser::new();
        let output = parser
            .parse(&bytes, FileKind::Docx, &ParseOptions::default())
            .unwrap();
        assert!(output.text.contains("Smith & Sons Inspections"));
    }
}
