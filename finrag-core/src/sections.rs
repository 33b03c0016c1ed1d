//! Section detection for 10-K style filings.
//!
//! Two sources of structure are supported:
//! - `Item N.` headings, mapped onto canonical section labels
//! - keyword classification, used when a document has no headings

use crate::types::SectionSpan;
use regex::Regex;
use std::sync::LazyLock;

pub const MDA: &str = "MD&A";
pub const FINANCIAL_STATEMENTS: &str = "Financial Statements";
pub const RISK_FACTORS: &str = "Risk Factors";
pub const BUSINESS_OVERVIEW: &str = "Business Overview";
pub const OTHER: &str = "Other";

static ITEM_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^[ \t]*item[ \t]+(\d{1,2}[a-c]?)[ \t]*[.:\-][ \t]*([^\n]*)$")
        .expect("item heading pattern is valid")
});

/// Ordered keyword table; the first section with a hit wins.
const KEYWORDS: &[(&str, &[&str])] = &[
    (
        MDA,
        &["management discussion", "management's discussion", "md&a", "operating results"],
    ),
    (
        FINANCIAL_STATEMENTS,
        &["consolidated statements", "balance sheet", "income statement", "cash flow"],
    ),
    (RISK_FACTORS, &["risk factors", "risks and uncertainties"]),
    (
        BUSINESS_OVERVIEW,
        &["business overview", "products and services", "market"],
    ),
];

/// Classify a passage by keyword, returning `Other` when nothing matches.
pub fn classify_section(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(section, _)| *section)
        .unwrap_or(OTHER)
}

/// Map a 10-K item number to its canonical section label.
fn section_for_item(item: &str) -> &'static str {
    match item.to_ascii_lowercase().as_str() {
        "1" => BUSINESS_OVERVIEW,
        "1a" => RISK_FACTORS,
        "7" | "7a" => MDA,
        "8" => FINANCIAL_STATEMENTS,
        _ => OTHER,
    }
}

/// Detect `Item N.` headings and return spans covering the whole text.
///
/// Returns an empty vector when the text has no headings. Text before the
/// first heading becomes an `Other` span.
pub fn detect_sections(text: &str) -> Vec<SectionSpan> {
    let headings: Vec<(usize, &str, String)> = ITEM_HEADING
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let item = caps.get(1)?.as_str();
            let title = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
            let subsection = if title.is_empty() {
                format!("Item {}", item.to_ascii_uppercase())
            } else {
                format!("Item {}. {}", item.to_ascii_uppercase(), title)
            };
            Some((whole.start(), section_for_item(item), subsection))
        })
        .collect();

    if headings.is_empty() {
        return Vec::new();
    }

    let mut spans = Vec::with_capacity(headings.len() + 1);
    if headings[0].0 > 0 {
        spans.push(SectionSpan {
            start: 0,
            end: headings[0].0,
            section: OTHER.to_string(),
            subsection: None,
        });
    }
    for (i, (start, section, subsection)) in headings.iter().enumerate() {
        let end = headings.get(i + 1).map(|h| h.0).unwrap_or(text.len());
        if end > *start {
            spans.push(SectionSpan {
                start: *start,
                end,
                section: section.to_string(),
                subsection: Some(subsection.clone()),
            });
        }
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_keywords() {
        assert_eq!(
            classify_section("Management Discussion of operating results"),
            MDA
        );
        assert_eq!(
            classify_section("The consolidated statements of operations"),
            FINANCIAL_STATEMENTS
        );
        assert_eq!(classify_section("Risk Factors include..."), RISK_FACTORS);
        assert_eq!(
            classify_section("Our products and services include iPhone"),
            BUSINESS_OVERVIEW
        );
        assert_eq!(classify_section("Exhibit index"), OTHER);
    }

    #[test]
    fn test_classify_order_prefers_mda() {
        // Contains both MD&A and balance-sheet keywords.
        assert_eq!(
            classify_section("MD&A discusses the balance sheet"),
            MDA
        );
    }

    #[test]
    fn test_detect_item_headings() {
        let text = "Cover page.\nItem 1. Business\nWe design phones.\nItem 1A. Risk Factors\nSupply chain risk.\nItem 7. Management's Discussion and Analysis\nNet sales rose.\nItem 8. Financial Statements\nTotals.";
        let spans = detect_sections(text);
        let labels: Vec<&str> = spans.iter().map(|s| s.section.as_str()).collect();
        assert_eq!(
            labels,
            vec![OTHER, BUSINESS_OVERVIEW, RISK_FACTORS, MDA, FINANCIAL_STATEMENTS]
        );
        assert_eq!(spans[0].start, 0);
        assert_eq!(spans.last().unwrap().end, text.len());
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(spans[2].subsection.as_deref(), Some("Item 1A. Risk Factors"));
    }

    #[test]
    fn test_detect_no_headings() {
        assert!(detect_sections("Plain prose with no items.").is_empty());
    }

    #[test]
    fn test_unknown_item_maps_to_other() {
        let spans = detect_sections("Item 9B. Other Information\nNone.");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].section, OTHER);
    }
}
