use crate::error::ParseError;
use crate::model::FileKind;
use crate::parser::ocr::OcrParser;
use crate::parser::{ParseOptions, Parser, ParserOutput};

const IMAGE_OCR_CONFIDENCE: f32 = 0.6;

/// Parser for standalone image uploads; text comes entirely from OCR.
pub struct ImageParser {
    ocr: Option<OcrParser>,
}

impl ImageParser {
    pub fn new(ocr: Option<OcrParser>) -> Self {
        Self { ocr }
    }
}

impl Parser for ImageParser {
    fn parse(
        &self,
        blob: &[u8],
        kind: FileKind,
        _options: &ParseOptions,
    ) -> Result<ParserOutput, ParseError> {
        let _span = tracing::info_span!("parser.image").entered();

        // Decode first so corrupt uploads fail as permanent errors rather
        // than OCR failures.
        image::load_from_memory(blob).map_err(|e| ParseError::Malformed {
            kind,
            message: format!("failed to decode image: {}", e),
        })?;

        match self.ocr {
            Some(ref ocr) => {
                let text = ocr.ocr_image(blob)?;
                Ok(ParserOutput::with_text(text, IMAGE_OCR_CONFIDENCE))
            }
            None => {
                log::warn!("OCR disabled; image upload produces no text");
                Ok(ParserOutput::with_text(String::new(), 0.0))
            }
        }
    }

    fn supports(&self, kind: FileKind) -> bool {
        kind.is_image()
    }
}
