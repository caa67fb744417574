use std::io::Cursor;

use calamine::Reader;

use crate::error::ParseError;
use crate::model::FileKind;
use crate::parser::{PageFragment, ParseOptions, Parser, ParserOutput};

const SHEET_CONFIDENCE: f32 = 0.85;

/// Parser for spreadsheet kinds: xls and xlsx via calamine, csv via the csv
/// reader. Cells are joined with ` | ` so the downstream pattern rules see
/// one row per line.
pub struct SheetParser;

impl SheetParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_workbook(&self, blob: &[u8], kind: FileKind) -> Result<ParserOutput, ParseError> {
        let cursor = Cursor::new(blob);
        let mut workbook =
            calamine::open_workbook_auto_from_rs(cursor).map_err(|e| ParseError::Malformed {
                kind,
                message: format!("failed to open workbook: {}", e),
            })?;

        let mut text = String::new();
        let mut pages = Vec::new();
        let mut sheet_number = 0u32;

        for sheet_name in workbook.sheet_names().to_vec() {
            sheet_number += 1;

            if let Ok(range) = workbook.worksheet_range(&sheet_name) {
                let mut sheet_text = format!("Sheet: {}\n", sheet_name);

                for row in range.rows() {
                    let cells: Vec<String> = row.iter().map(cell_to_string).collect();
                    if !cells.iter().all(|c| c.is_empty()) {
                        sheet_text.push_str(&cells.join(" | "));
                        sheet_text.push('\n');
                    }
                }

                text.push_str(&sheet_text);
                text.push('\n');
                pages.push(PageFragment {
                    number: sheet_number,
                    text: sheet_text,
                });
            }
        }

        Ok(ParserOutput {
            text,
            pages,
            fragments: Default::default(),
            confidence: SHEET_CONFIDENCE,
        })
    }

    fn parse_csv(&self, blob: &[u8]) -> Result<ParserOutput, ParseError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(blob);

        let mut text = String::new();

        if let Ok(headers) = reader.headers() {
            text.push_str(&headers.iter().collect::<Vec<_>>().join(" | "));
            text.push('\n');
        }

        for record in reader.records() {
            let record = record.map_err(|e| ParseError::Malformed {
                kind: FileKind::Csv,
                message: format!("CSV parse error: {}", e),
            })?;
            text.push_str(&record.iter().collect::<Vec<_>>().join(" | "));
            text.push('\n');
        }

        Ok(ParserOutput::with_text(text, SHEET_CONFIDENCE))
    }
}

impl Default for SheetParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for SheetParser {
    fn parse(
        &self,
        blob: &[u8],
        kind: FileKind,
        _options: &ParseOptions,
    ) -> Result<ParserOutput, ParseError> {
        let _span = tracing::info_span!("parser.sheet").entered();

        match kind {
            FileKind::Csv => self.parse_csv(blob),
            _ => self.parse_workbook(blob, kind),
        }
    }

    fn supports(&self, kind: FileKind) -> bool {
        kind.is_spreadsheet()
    }
}

fn cell_to_string(cell: &calamine::Data) -> String {
    match cell {
        calamine::Data::Empty => String::new(),
        calamine::Data::String(s) => s.clone(),
        calamine::Data::Float(f) => f.to_string(),
        calamine::Data::Int(i) => i.to_string(),
        calamine::Data::Bool(b) => b.to_string(),
        calamine::Data::DateTime(dt) => dt.to_string(),
        _ => String::new(),
    }
}
