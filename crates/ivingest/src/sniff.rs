//! Content identification for the identify stage.
//!
//! The declared kind is cross-checked against what the leading bytes of the
//! blob actually look like; a mismatch is a permanent failure.

use crate::model::FileKind;

/// Container formats recognizable from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedFormat {
    Pdf,
    Png,
    Jpeg,
    Tiff,
    Bmp,
    /// PK zip container: docx, xlsx.
    Zip,
    /// OLE compound file: legacy doc, xls.
    Ole,
    /// No binary signature; plausible text (csv).
    Text,
    Unknown,
}

pub fn sniff(bytes: &[u8]) -> SniffedFormat {
    if bytes.starts_with(b"%PDF-") {
        return SniffedFormat::Pdf;
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return SniffedFormat::Png;
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return SniffedFormat::Jpeg;
    }
    if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        return SniffedFormat::Tiff;
    }
    if bytes.starts_with(b"BM") && bytes.len() > 14 {
        return SniffedFormat::Bmp;
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return SniffedFormat::Zip;
    }
    if bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        return SniffedFormat::Ole;
    }
    if looks_like_text(bytes) {
        return SniffedFormat::Text;
    }
    SniffedFormat::Unknown
}

/// Whether the sniffed content is consistent with the declared kind.
pub fn matches_declared(declared: FileKind, bytes: &[u8]) -> bool {
    let sniffed = sniff(bytes);
    match declared {
        FileKind::Pdf => sniffed == SniffedFormat::Pdf,
        FileKind::Png => sniffed == SniffedFormat::Png,
        FileKind::Jpg | FileKind::Jpeg => sniffed == SniffedFormat::Jpeg,
        FileKind::Tiff => sniffed == SniffedFormat::Tiff,
        FileKind::Bmp => sniffed == SniffedFormat::Bmp,
        FileKind::Docx | FileKind::Xlsx => sniffed == SniffedFormat::Zip,
        // Word writes both OLE (legacy) and zip (newer files renamed .doc).
        FileKind::Doc | FileKind::Xls => {
            matches!(sniffed, SniffedFormat::Ole | SniffedFormat::Zip)
        }
        FileKind::Csv => sniffed == SniffedFormat::Text,
    }
}

/// Canonical MIME type for a declared kind, reported on job queries.
pub fn mime_type(kind: FileKind) -> String {
    mime_guess::from_ext(kind.as_str())
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn looks_like_text(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let sample = &bytes[..bytes.len().min(512)];
    // Control bytes other than tab/newline/carriage-return mean binary.
    !sample
        .iter()
        .any(|&b| b < 0x09 || (b > 0x0D && b < 0x20) || b == 0x7F)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_pdf() {
        assert_eq!(sniff(b"%PDF-1.5 rest"), SniffedFormat::Pdf);
        assert!(matches_declared(FileKind::Pdf, b"%PDF-1.5"));
        assert!(!matches_declared(FileKind::Pdf, b"PK\x03\x04"));
    }

    #[test]
    fn test_sniff_images() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert_eq!(sniff(&png), SniffedFormat::Png);
        assert!(matches_declared(FileKind::Png, &png));

        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0];
        assert!(matches_declared(FileKind::Jpg, &jpeg));
        assert!(matches_declared(FileKind::Jpeg, &jpeg));
        assert!(!matches_declared(FileKind::Png, &jpeg));
    }

    #[test]
    fn test_sniff_office_containers() {
        assert!(matches_declared(FileKind::Docx, b"PK\x03\x04rest"));
        assert!(matches_declared(FileKind::Xlsx, b"PK\x03\x04rest"));

        let ole = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1, 0, 0];
        assert!(matches_declared(FileKind::Doc, &ole));
        assert!(matches_declared(FileKind::Xls, &ole));
        // Newer files renamed to .doc still pass.
        assert!(matches_declared(FileKind::Doc, b"PK\x03\x04rest"));
    }

    #[test]
    fn test_sniff_csv() {
        assert!(matches_declared(
            FileKind::Csv,
            b"address,city,state\n123 Main St,Anytown,CA\n"
        ));
        assert!(!matches_declared(FileKind::Csv, &[0x00, 0x01, 0x02]));
        assert!(!matches_declared(FileKind::Csv, b""));
    }

    #[test]
    fn test_unknown_bytes() {
        assert_eq!(sniff(&[0x00, 0x01, 0x02, 0x03]), SniffedFormat::Unknown);
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(mime_type(FileKind::Pdf), "application/pdf");
        assert_eq!(mime_type(FileKind::Jpg), "image/jpeg");
        assert_eq!(mime_type(FileKind::Csv), "text/csv");
        assert_eq!(mime_type(FileKind::Xls), "application/vnd.ms-excel");
    }
}
