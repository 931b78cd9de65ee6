//! Ordered pattern tables with a single "first match wins" lookup.
//!
//! Vendor detection (SNMP text, HTML, IPP attributes, certificate subjects) and capability
//! detection (HTML keywords) share [`PatternTable`].

use std::sync::OnceLock;

use regex::Regex;

/// Ordered `(pattern, label)` pairs.
#[derive(Debug)]
pub struct PatternTable {
    entries: Vec<(Regex, &'static str)>,
}

impl PatternTable {
    pub fn new(entries: &[(&str, &'static str)]) -> Result<Self, regex::Error> {
        let entries = entries
            .iter()
            .map(|(pat, label)| Ok((Regex::new(pat)?, *label)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { entries })
    }

    /// Label of the first pattern that matches anywhere in `text`.
    pub fn first_match(&self, text: &str) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, label)| *label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

const VENDOR_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)canon", "Canon"),
    (r"(?i)\bhp|hewlett", "HP"),
    (r"(?i)epson", "Epson"),
    (r"(?i)brother", "Brother"),
    (r"(?i)samsung", "Samsung"),
    (r"(?i)xerox", "Xerox"),
    (r"(?i)lexmark", "Lexmark"),
    (r"(?i)ricoh", "Ricoh"),
    (r"(?i)kyocera", "Kyocera"),
    (r"(?i)konica|minolta", "Konica Minolta"),
    (r"(?i)\bsharp\b", "Sharp"),
    (r"(?i)toshiba", "Toshiba"),
    (r"(?i)panasonic", "Panasonic"),
    (r"(?i)\boki(?:data)?\b", "OKI"),
    (r"(?i)\bdell\b", "Dell"),
    (r"(?i)lenovo", "Lenovo"),
];

const CAPABILITY_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)multifunction|\bmfp\b|all-in-one", "MFP"),
    (r"(?i)scanner|сканер", "Scanner"),
    (r"(?i)\bfax\b", "Fax Machine"),
    (r"(?i)\bcop(?:y|ier)\b|копир", "Copier"),
    (r"(?i)многофункциональн", "Многофункциональное устройство"),
];

pub fn vendors() -> &'static PatternTable {
    static TABLE: OnceLock<PatternTable> = OnceLock::new();
    TABLE.get_or_init(|| PatternTable::new(VENDOR_PATTERNS).expect("vendor patterns are valid"))
}

pub fn capabilities() -> &'static PatternTable {
    static TABLE: OnceLock<PatternTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        PatternTable::new(CAPABILITY_PATTERNS).expect("capability patterns are valid")
    })
}

pub fn match_vendor(text: &str) -> Option<&'static str> {
    vendors().first_match(text)
}

/// Device class label for a block of text, e.g. `MFP` or `Scanner`.
pub fn match_capability(text: &str) -> Option<&'static str> {
    capabilities().first_match(text)
}

struct ModelPatterns {
    prefixed: Regex,
    candidates: [Regex; 2],
}

fn model_patterns() -> &'static ModelPatterns {
    static PATTERNS: OnceLock<ModelPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ModelPatterns {
        prefixed: Regex::new(r"(?i)\b(?:model|type|series)\b[\s:]*([a-z0-9][a-z0-9\-_]*)")
            .expect("model prefix pattern is valid"),
        candidates: [
            Regex::new(r"(?i)\b[a-z]+[\s\-]?[0-9]+[a-z0-9\-_]*").expect("model pattern is valid"),
            Regex::new(r"(?i)\b[0-9]+[a-z]+[0-9a-z\-_]*").expect("model pattern is valid"),
        ],
    })
}

const MODEL_LEN: std::ops::RangeInclusive<usize> = 3..=29;

fn plausible_model(candidate: &str) -> bool {
    MODEL_LEN.contains(&candidate.chars().count()) && match_vendor(candidate).is_none()
}

/// Pull a model designation such as `MF445dw` out of free text.
///
/// An explicit `model:`/`type:`/`series:` prefix wins; otherwise the first letter+digit
/// token of plausible length is used.
pub fn extract_model(text: &str) -> Option<String> {
    let patterns = model_patterns();
    if let Some(m) = patterns
        .prefixed
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .find(|m| plausible_model(m))
    {
        return Some(m.to_string());
    }
    patterns.candidates.iter().find_map(|re| {
        re.find_iter(text)
            .map(|m| m.as_str().trim())
            .find(|m| plausible_model(m))
            .map(str::to_string)
    })
}

/// Vendor and model found in a short description (title, sysDescr, make-and-model).
pub fn vendor_and_model(text: &str) -> (Option<String>, Option<String>) {
    (
        match_vendor(text).map(str::to_string),
        extract_model(text),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_match_is_case_insensitive() {
        for s in ["HP LaserJet", "hp laserjet", "Hewlett-Packard"] {
            assert_eq!(match_vendor(s), Some("HP"), "{s}");
        }
        assert_eq!(match_vendor("KONICA MINOLTA bizhub C300i"), Some("Konica Minolta"));
        assert_eq!(match_vendor("EPSON WF-3820"), Some("Epson"));
    }

    #[test]
    fn short_vendor_tokens_need_a_word_start() {
        assert_eq!(match_vendor("Apache/2.4 (Unix) PHP/8.1"), None);
        assert_eq!(match_vendor("smoking token"), None);
        assert_eq!(match_vendor("OKI C332dn"), Some("OKI"));
    }

    #[test]
    fn first_match_wins_in_table_order() {
        assert_eq!(match_vendor("Canon rebadged by HP"), Some("Canon"));
        assert_eq!(match_capability("Scanner and fax multifunction"), Some("MFP"));
        assert_eq!(match_capability("Network fax"), Some("Fax Machine"));
    }

    #[test]
    fn capability_keywords() {
        assert_eq!(match_capability("Canon MF445dw All-in-One"), Some("MFP"));
        assert_eq!(match_capability("Сетевой сканер"), Some("Scanner"));
        assert_eq!(match_capability("Копировальный аппарат"), Some("Copier"));
        assert_eq!(
            match_capability("Многофункциональное устройство"),
            Some("Многофункциональное устройство")
        );
        assert_eq!(match_capability("Copyright 2024 Example"), None);
        assert_eq!(match_capability("LaserJet printer"), None);
    }

    #[test]
    fn model_from_prefix_or_token() {
        assert_eq!(extract_model("Canon MF445dw All-in-One").as_deref(), Some("MF445dw"));
        assert_eq!(extract_model("Model: XP-5100 rev B").as_deref(), Some("XP-5100"));
        assert_eq!(
            extract_model("HP LaserJet Pro MFP M428fdw").as_deref(),
            Some("M428fdw")
        );
        assert_eq!(
            extract_model("Brother NC-8300w, Firmware Ver.1.02").as_deref(),
            Some("NC-8300w")
        );
        assert_eq!(extract_model("Printer status page"), None);
    }

    #[test]
    fn table_reports_size() {
        assert_eq!(vendors().len(), 16);
        assert!(!capabilities().is_empty());
    }
}
