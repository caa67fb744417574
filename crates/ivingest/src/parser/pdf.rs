use crate::error::ParseError;
use crate::model::FileKind;
use crate::parser::{PageFragment, ParseOptions, Parser, ParserOutput};

/// Confidence reported for embedded PDF text.
const EMBEDDED_TEXT_CONFIDENCE: f32 = 0.9;

pub struct PdfParser;

impl PdfParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdfParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for PdfParser {
    fn parse(
        &self,
        blob: &[u8],
        _kind: FileKind,
        _options: &ParseOptions,
    ) -> Result<ParserOutput, ParseError> {
        let _span = tracing::info_span!("parser.pdf").entered();

        let doc = lopdf::Document::load_mem(blob).map_err(|e| ParseError::Malformed {
            kind: FileKind::Pdf,
            message: format!("failed to load PDF: {}", e),
        })?;

        let mut text = String::new();
        let mut pages = Vec::new();

        for (page_num, _) in doc.get_pages() {
            if let Ok(page_text) = doc.extract_text(&[page_num]) {
                if !page_text.trim().is_empty() {
                    pages.push(PageFragment {
                        number: page_num,
                        text: page_text.clone(),
                    });
                }
                text.push_str(&page_text);
                text.push('\n');
            }
        }

        Ok(ParserOutput {
            text,
            pages,
            fragments: Default::default(),
            confidence: EMBEDDED_TEXT_CONFIDENCE,
        })
    }

    fn supports(&self, kind: FileKind) -> bool {
        matches!(kind, FileKind::Pdf)
    }
}
