//! Compiled pattern rules for property and inspector fields.
//!
//! Rules are ordered most-specific-first; the first match wins. All matching
//! happens over whitespace-normalized text.

use chrono::NaiveDate;
use regex::Regex;

use crate::model::{InspectorRecord, PropertyRecord, PropertyType};

pub struct PropertyPatterns {
    address: Regex,
    property_type: Regex,
    square_footage: Regex,
    year_built: Regex,
    bedrooms: Regex,
    bathrooms: Regex,
}

impl PropertyPatterns {
    pub fn new() -> Self {
        Self {
            address: Regex::new(
                r"(?im)^.*?address\s*[:\-]?\s*(?P<line1>\d+[^,\n]*?),\s*(?P<city>[A-Za-z][A-Za-z .'\-]*?),\s*(?P<state>[A-Z]{2})[,\s]+(?P<zip>\d{5}(?:-\d{4})?)",
            )
            .expect("address pattern"),
            property_type: Regex::new(r"(?i)\b(residential|commercial|industrial)\b")
                .expect("property type pattern"),
            square_footage: Regex::new(r"(?i)\b([\d,]{3,})\s*(?:sq\.?\s*ft\.?|square\s+feet)")
                .expect("square footage pattern"),
            year_built: Regex::new(r"(?i)(?:year\s+built|built\s+in)\s*[:\-]?\s*((?:19|20)\d{2})")
                .expect("year built pattern"),
            bedrooms: Regex::new(r"(?i)\b(\d{1,2})\s*bed(?:room)?s?\b").expect("bedrooms pattern"),
            bathrooms: Regex::new(r"(?i)\b(\d{1,2}(?:\.\d)?)\s*bath(?:room)?s?\b")
                .expect("bathrooms pattern"),
        }
    }

    pub fn extract(&self, text: &str) -> PropertyRecord {
        let mut record = PropertyRecord::default();

        if let Some(caps) = self.address.captures(text) {
            record.address_line1 = caps.name("line1").map(|m| m.as_str().trim().to_string());
            record.city = caps.name("city").map(|m| m.as_str().trim().to_string());
            record.state = caps.name("state").map(|m| m.as_str().to_string());
            record.zip = caps.name("zip").map(|m| m.as_str().to_string());
        }

        if let Some(caps) = self.property_type.captures(text) {
            record.property_type = match caps[1].to_lowercase().as_str() {
                "residential" => Some(PropertyType::Residential),
                "commercial" => Some(PropertyType::Commercial),
                "industrial" => Some(PropertyType::Industrial),
                _ => None,
            };
        }

        if let Some(caps) = self.square_footage.captures(text) {
            record.square_footage = caps[1].replace(',', "").parse().ok();
        }

        if let Some(caps) = self.year_built.captures(text) {
            record.year_built = caps[1].parse().ok();
        }

        if let Some(caps) = self.bedrooms.captures(text) {
            record.bedrooms = caps[1].parse().ok();
        }

        if let Some(caps) = self.bathrooms.captures(text) {
            record.bathrooms = caps[1].parse().ok();
        }

        record
    }

    /// True when `line` is a property header line already consumed by the
    /// address rule.
    pub fn is_address_line(&self, line: &str) -> bool {
        self.address.is_match(line)
    }
}

impl Default for PropertyPatterns {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InspectorPatterns {
    name: Regex,
    license: Regex,
    company: Regex,
    email: Regex,
    phone: Regex,
    date: Regex,
}

impl InspectorPatterns {
    pub fn new() -> Self {
        Self {
            name: Regex::new(
                r"(?im)^.*?inspector\s*[:\-]?\s*(?P<name>[A-Z][a-zA-Z'\-]+(?:\s+[A-Z][a-zA-Z'\-]+)+)",
            )
            .expect("inspector name pattern"),
            license: Regex::new(
                r"(?i)license\s*(?:#|no\.?|number)?\s*[:\-]?\s*(?P<license>[A-Z]{0,3}\d[A-Z0-9\-]{3,})",
            )
            .expect("license pattern"),
            company: Regex::new(r"(?im)^.*?(?:company|inspection\s+company|firm)\s*[:\-]\s*(?P<company>[^,\n]+)")
                .expect("company pattern"),
            email: Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")
                .expect("email pattern"),
            phone: Regex::new(r"(?:\+1[\s.\-]?)?\(?\d{3}\)?[\s.\-]\d{3}[\s.\-]\d{4}")
                .expect("phone pattern"),
            date: Regex::new(
                r"(?i)(?:inspection\s+date|date\s+of\s+inspection|inspected\s+on)\s*[:\-]?\s*(?P<date>[A-Za-z0-9,/ \-]+)",
            )
            .expect("date pattern"),
        }
    }

    pub fn extract(&self, text: &str) -> InspectorRecord {
        let mut record = InspectorRecord::default();

        if let Some(caps) = self.name.captures(text) {
            record.name = caps.name("name").map(|m| m.as_str().trim().to_string());
        }

        if let Some(caps) = self.license.captures(text) {
            record.license = caps.name("license").map(|m| m.as_str().to_string());
        }

        if let Some(caps) = self.company.captures(text) {
            record.company = caps
                .name("company")
                .map(|m| m.as_str().trim().to_string());
        }

        // Contact prefers email over phone.
        record.contact = self
            .email
            .find(text)
            .or_else(|| self.phone.find(text))
            .map(|m| m.as_str().trim().to_string());

        if let Some(caps) = self.date.captures(text) {
            record.inspection_date = caps
                .name("date")
                .and_then(|m| parse_date(m.as_str().trim()));
        }

        record
    }

    /// True when `line` is an inspector header line.
    pub fn is_inspector_line(&self, line: &str) -> bool {
        self.name.is_match(line)
    }
}

impl Default for InspectorPatterns {
    fn default() -> Self {
        Self::new()
    }
}

/// Tries the date formats inspection reports actually use.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim().trim_end_matches(['.', ',']);
    const FORMATS: &[&str] = &["%m/%d/%Y", "%m-%d-%Y", "%Y-%m-%d", "%B %d, %Y", "%b %d, %Y"];
    for format in FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    None
}
