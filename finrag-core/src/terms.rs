//! Term extraction shared by the local embedder and lexical reranking.

/// Common English words ignored for term matching.
const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "been", "by", "did", "do", "does", "for",
    "from", "had", "has", "have", "how", "in", "into", "is", "it", "its", "of", "on", "or", "our",
    "s", "such", "than", "that", "the", "their", "there", "these", "this", "to", "was", "we",
    "were", "what", "when", "which", "who", "why", "will", "with",
];

pub fn is_stopword(term: &str) -> bool {
    STOPWORDS.binary_search(&term).is_ok()
}

/// Whether a term is a number such as `2023` or `383.3`.
pub fn is_numeric(term: &str) -> bool {
    term.chars().any(|c| c.is_ascii_digit())
        && term.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Lowercased alphanumeric terms with stop words removed.
///
/// Decimal points between digits are kept so `383.3` stays one term.
pub fn extract_terms(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let chars: Vec<char> = lowered.chars().collect();
    let mut terms = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        let decimal_point = c == '.'
            && i > 0
            && chars[i - 1].is_ascii_digit()
            && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
        if c.is_alphanumeric() || decimal_point {
            current.push(c);
        } else if !current.is_empty() {
            terms.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        terms.push(current);
    }
    terms.retain(|t| !is_stopword(t));
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopwords_sorted() {
        let mut sorted = STOPWORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOPWORDS);
    }

    #[test]
    fn test_extract_terms() {
        assert_eq!(
            extract_terms("What was Apple's revenue in 2023?"),
            vec!["apple", "revenue", "2023"]
        );
        assert_eq!(
            extract_terms("Net sales were $383.3 billion."),
            vec!["net", "sales", "383.3", "billion"]
        );
    }

    #[test]
    fn test_is_numeric() {
        assert!(is_numeric("2023"));
        assert!(is_numeric("383.3"));
        assert!(!is_numeric("fy2023x"));
        assert!(!is_numeric("revenue"));
    }
}
