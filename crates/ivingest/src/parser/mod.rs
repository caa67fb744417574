//! Parser capabilities and the registry that selects between them.

pub mod docx;
pub mod image;
pub mod ocr;
pub mod pdf;
pub mod sheet;

use std::collections::HashMap;

use crate::config::OcrConfig;
use crate::error::ParseError;
use crate::model::FileKind;

/// Per-invocation parser options.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub ocr_languages: Vec<String>,
    pub ocr_dpi: u32,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            ocr_languages: vec!["eng".to_string()],
            ocr_dpi: 300,
        }
    }
}

/// A named structured fragment with the parser's confidence in it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub value: serde_json::Value,
    pub confidence: f32,
}

/// Per-page or per-sheet sub-fragment of the extracted text.
#[derive(Debug, Clone, PartialEq)]
pub struct PageFragment {
    /// 1-indexed page or sheet number.
    pub number: u32,
    pub text: String,
}

/// The uniform output of every parser.
#[derive(Debug, Clone, Default)]
pub struct ParserOutput {
    pub text: String,
    pub pages: Vec<PageFragment>,
    pub fragments: HashMap<String, Fragment>,
    /// Parser-reported confidence in [0, 1].
    pub confidence: f32,
}

impl ParserOutput {
    pub fn with_text(text: String, confidence: f32) -> Self {
        Self {
            text,
            confidence,
            ..Default::default()
        }
    }

    /// Merges a fallback output into this one, preferring the
    /// higher-confidence side per field.
    pub fn merge(mut self, other: ParserOutput) -> ParserOutput {
        let other_wins = other.confidence > self.confidence || self.text.trim().is_empty();
        if other_wins && !other.text.trim().is_empty() {
            self.text = other.text;
            self.pages = other.pages;
        } else if self.pages.is_empty() {
            self.pages = other.pages;
        }

        for (name, fragment) in other.fragments {
            match self.fragments.get(&name) {
                Some(existing) if existing.confidence >= fragment.confidence => {}
                _ => {
                    self.fragments.insert(name, fragment);
                }
            }
        }

        self.confidence = self.confidence.max(other.confidence);
        self
    }
}

/// A unit of parsing capability.
///
/// Implementations must not mutate their input and must be safe to call from
/// multiple workers at once.
pub trait Parser: Send + Sync {
    fn parse(
        &self,
        blob: &[u8],
        kind: FileKind,
        options: &ParseOptions,
    ) -> Result<ParserOutput, ParseError>;

    fn supports(&self, kind: FileKind) -> bool;
}

/// Maps a declared kind to a parser, with OCR fallback for image-heavy PDFs.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn Parser>>,
    ocr: Option<ocr::OcrParser>,
    options: ParseOptions,
    min_text_chars: usize,
}

impl ParserRegistry {
    pub fn new(config: &OcrConfig) -> Self {
        let ocr = config
            .enabled
            .then(|| ocr::OcrParser::new(&config.languages, config.dpi));

        // Precedence is registration order; the first parser claiming the
        // kind wins.
        let parsers: Vec<Box<dyn Parser>> = vec![
            Box::new(sheet::SheetParser::new()),
            Box::new(docx::DocxParser::new()),
            Box::new(pdf::PdfParser::new()),
            Box::new(image::ImageParser::new(ocr.clone())),
        ];

        Self {
            parsers,
            ocr,
            options: ParseOptions {
                ocr_languages: config.languages.clone(),
                ocr_dpi: config.dpi,
            },
            min_text_chars: config.min_text_chars,
        }
    }

    /// Registry over caller-supplied parser capabilities, first-match-wins.
    /// Useful for embedding custom parsers and for fault injection in tests.
    pub fn with_parsers(parsers: Vec<Box<dyn Parser>>, min_text_chars: usize) -> Self {
        Self {
            parsers,
            ocr: None,
            options: ParseOptions::default(),
            min_text_chars,
        }
    }

    /// Parses a blob of the declared kind.
    ///
    /// An unrecognized kind fails without invoking any parser. For PDFs whose
    /// embedded text is below the configured threshold, the OCR parser is
    /// chained on the same blob and the outputs merged; PDFs lopdf cannot
    /// load at all go straight to OCR, which renders through poppler and
    /// handles more PDF variants.
    pub fn parse(&self, blob: &[u8], kind: FileKind) -> Result<ParserOutput, ParseError> {
        let parser = self
            .parsers
            .iter()
            .find(|p| p.supports(kind))
            .ok_or_else(|| ParseError::Unsupported(kind.as_str().to_string()))?;

        let output = match parser.parse(blob, kind, &self.options) {
            Ok(output) => output,
            Err(error @ ParseError::Malformed { .. }) if kind == FileKind::Pdf => {
                let Some(ref ocr) = self.ocr else {
                    return Err(error);
                };
                let _span =
                    tracing::info_span!("parser.ocr_fallback", reason = "load_failed").entered();
                log::warn!("PDF text extraction failed ({}), falling back to OCR", error);
                return ocr.ocr_pdf(blob);
            }
            Err(error) => return Err(error),
        };

        if kind == FileKind::Pdf && self.needs_ocr_fallback(&output) {
            if let Some(ref ocr) = self.ocr {
                let _span =
                    tracing::info_span!("parser.ocr_fallback", reason = "text_below_threshold")
                        .entered();
                match ocr.ocr_pdf(blob) {
                    Ok(fallback) => return Ok(output.merge(fallback)),
                    Err(e) => {
                        log::warn!("OCR fallback failed, keeping extracted text: {}", e);
                    }
                }
            }
        }

        Ok(output)
    }

    fn needs_ocr_fallback(&self, output: &ParserOutput) -> bool {
        output.text.trim().chars().count() < self.min_text_chars
    }
}
