use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::error::ParseError;
use crate::parser::{PageFragment, ParserOutput};

/// Confidence reported for OCR-derived text.
const OCR_CONFIDENCE: f32 = 0.6;

/// Tesseract-backed OCR engine, shared between the image parser and the PDF
/// fallback path.
#[derive(Clone)]
pub struct OcrParser {
    inner: Arc<OcrParserInner>,
}

struct OcrParserInner {
    languages: String,
    dpi: u32,
}

impl OcrParser {
    pub fn new(languages: &[String], dpi: u32) -> Self {
        let lang_str = if languages.is_empty() {
            "eng".to_string()
        } else {
            languages.join("+")
        };

        Self {
            inner: Arc::new(OcrParserInner {
                languages: lang_str,
                dpi,
            }),
        }
    }

    pub fn dpi(&self) -> u32 {
        self.inner.dpi
    }

    /// Runs OCR over raw image bytes.
    pub fn ocr_image(&self, image_data: &[u8]) -> Result<String, ParseError> {
        let _span = tracing::info_span!("parser.ocr").entered();

        let img = image::load_from_memory(image_data)
            .map_err(|e| ParseError::Ocr(format!("failed to load image: {}", e)))?;

        // Normalize to PNG in memory for leptess.
        let mut png_data = Vec::new();
        let mut cursor = Cursor::new(&mut png_data);
        img.write_to(&mut cursor, image::ImageFormat::Png)
            .map_err(|e| ParseError::Ocr(format!("failed to convert image: {}", e)))?;

        let mut lt = leptess::LepTess::new(None, &self.inner.languages)
            .map_err(|e| ParseError::Ocr(format!("failed to initialize Tesseract: {}", e)))?;

        lt.set_image_from_mem(&png_data)
            .map_err(|e| ParseError::Ocr(format!("failed to set image for OCR: {}", e)))?;

        lt.get_utf8_text()
            .map_err(|e| ParseError::Ocr(format!("OCR failed: {}", e)))
    }

    /// OCRs every page of a PDF.
    ///
    /// Rendering goes through pdftoppm, which handles PDF variants lopdf
    /// cannot load, so this also serves as the parse path for such files.
    pub fn ocr_pdf(&self, pdf_bytes: &[u8]) -> Result<ParserOutput, ParseError> {
        let _span = tracing::info_span!("parser.ocr_pdf").entered();

        let page_images = render_pdf_pages(pdf_bytes, self.inner.dpi)?;
        if page_images.is_empty() {
            return Err(ParseError::Ocr("pdftoppm produced no pages".to_string()));
        }

        let mut text = String::new();
        let mut pages = Vec::new();

        for (index, image_data) in page_images.iter().enumerate() {
            let page_text = self.ocr_image(image_data)?;
            if !page_text.trim().is_empty() {
                pages.push(PageFragment {
                    number: index as u32 + 1,
                    text: page_text.clone(),
                });
            }
            text.push_str(&page_text);
            text.push('\n');
        }

        Ok(ParserOutput {
            text,
            pages,
            fragments: Default::default(),
            confidence: OCR_CONFIDENCE,
        })
    }
}

/// Renders a whole PDF to per-page PNG bytes via one pdftoppm run.
fn render_pdf_pages(pdf_bytes: &[u8], dpi: u32) -> Result<Vec<Vec<u8>>, ParseError> {
    let work_dir = std::env::temp_dir().join(format!("ivingest-ocr-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&work_dir)?;

    let result = render_into(&work_dir, pdf_bytes, dpi);
    let _ = std::fs::remove_dir_all(&work_dir);
    result
}

fn render_into(work_dir: &Path, pdf_bytes: &[u8], dpi: u32) -> Result<Vec<Vec<u8>>, ParseError> {
    let pdf_path = work_dir.join("input.pdf");
    std::fs::write(&pdf_path, pdf_bytes)?;

    let output = Command::new("pdftoppm")
        .args(["-png", "-r", &dpi.to_string()])
        .arg(&pdf_path)
        .arg(work_dir.join("page"))
        .output()
        .map_err(|e| {
            ParseError::Ocr(format!(
                "failed to run pdftoppm: {}. Is poppler-utils installed?",
                e
            ))
        })?;

    if !output.status.success() {
        return Err(ParseError::Ocr(format!(
            "pdftoppm failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    // pdftoppm zero-pads page numbers uniformly within one run, so filename
    // order is page order.
    let mut page_paths: Vec<PathBuf> = std::fs::read_dir(work_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
        .collect();
    page_paths.sort();

    page_paths
        .iter()
        .map(|path| std::fs::read(path).map_err(ParseError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_joining() {
        let ocr = OcrParser::new(&["eng".to_string(), "deu".to_string()], 300);
        assert_eq!(ocr.inner.languages, "eng+deu");
        assert_eq!(ocr.dpi(), 300);
    }

    #[test]
    fn test_default_language() {
        let ocr = OcrParser::new(&[], 300);
        assert_eq!(ocr.inner.languages, "eng");
    }

    #[test]
    fn test_invalid_image_bytes() {
        let ocr = OcrParser::new(&["eng".to_string()], 300);
        let result = ocr.ocr_image(b"not an image");
        match result {
            Err(ParseError::Ocr(msg)) => assert!(msg.contains("failed to load image")),
            other => panic!("expected Ocr error, got {:?}", other),
        }
    }

    #[test]
    fn test_ocr_errors_are_retryable() {
        assert!(ParseError::Ocr("engine hiccup".to_string()).is_retryable());
    }
}
