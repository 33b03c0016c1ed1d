//! Sentence-window chunking.
//!
//! Text is segmented into contiguous sentence units (each sentence keeps its
//! trailing whitespace), so every chunk is a verbatim slice of the source and
//! dropping the overlap prefix of each chunk reconstructs the input exactly.
//! Windows are filled greedily up to `target_tokens_max`; the next window
//! re-includes the run of trailing sentences whose token total lands between
//! 10% and 15% of the smaller of the two chunks, as close to
//! `overlap_fraction` as the sentence sizes allow. A sentence that alone
//! exceeds the window is emitted as its own oversized chunk rather than
//! truncated, unless it is long enough to be re-split into word units.

use crate::config::ChunkingConfig;
use crate::error::{ChunkError, ConfigError};
use crate::sections::{self, OTHER};
use crate::tokens::TokenCounter;
use crate::types::{ChunkDraft, SectionSpan};
use std::collections::HashMap;
use std::ops::Range;
use tracing::{debug, warn};

/// Closing punctuation absorbed into the sentence that precedes it.
const CLOSERS: &[char] = &['"', '\'', ')', ']', '\u{201D}', '\u{2019}'];

/// Words whose trailing period does not end a sentence.
const ABBREVIATIONS: &[&str] = &[
    "inc", "corp", "co", "ltd", "llc", "plc", "no", "nos", "vs", "etc", "mr", "mrs", "ms", "dr",
    "st", "jr", "sr", "approx", "fig", "u.s", "e.g", "i.e", "jan", "feb", "mar", "apr", "jun",
    "jul", "aug", "sep", "sept", "oct", "nov", "dec",
];

/// A sentence longer than this many windows is re-split into words.
const SPLIT_FACTOR: usize = 4;

/// A contiguous unit of text with its token count.
#[derive(Debug, Clone)]
struct Unit {
    span: Range<usize>,
    tokens: usize,
    /// A word split out of a sentence too long to window.
    degraded: bool,
}

/// Splits normalized document text into overlapping chunk drafts.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    counter: TokenCounter,
    input_limit: usize,
}

/// The window emitted before the current one.
#[derive(Debug, Clone, Copy)]
struct Previous {
    start: usize,
    tokens: usize,
    oversized: bool,
}

impl Chunker {
    pub fn new(config: ChunkingConfig, counter: TokenCounter) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            counter,
            input_limit: usize::MAX,
        })
    }

    /// Re-split any sentence longer than the embedder accepts.
    pub fn with_input_limit(mut self, tokens: usize) -> Self {
        self.input_limit = tokens.max(1);
        self
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk raw bytes, rejecting anything that is not UTF-8 text.
    pub fn chunk_bytes(
        &self,
        bytes: &[u8],
        sections: &[SectionSpan],
    ) -> Result<Vec<ChunkDraft>, ChunkError> {
        let text = std::str::from_utf8(bytes).map_err(|e| ChunkError::NotText {
            reason: format!("invalid UTF-8 at byte {}", e.valid_up_to()),
        })?;
        self.chunk(text, sections)
    }

    /// Chunk text, detecting `Item N.` section headings automatically.
    pub fn chunk_document(&self, text: &str) -> Result<Vec<ChunkDraft>, ChunkError> {
        let spans = sections::detect_sections(text);
        self.chunk(text, &spans)
    }

    /// Chunk text using caller-supplied section spans.
    ///
    /// With no spans, each chunk is labelled by keyword classification.
    pub fn chunk(&self, text: &str, sections: &[SectionSpan]) -> Result<Vec<ChunkDraft>, ChunkError> {
        if text.trim().is_empty() {
            return Err(ChunkError::EmptyInput);
        }
        if text.contains('\0') {
            return Err(ChunkError::NotText {
                reason: "contains NUL bytes".to_string(),
            });
        }

        let units = self.split_long_units(text, self.measure(sentence_spans(text), text));
        let drafts = self.window(text, &units, sections);
        debug!(
            chunks = drafts.len(),
            units = units.len(),
            degraded = drafts.iter().filter(|d| d.degraded).count(),
            "Chunked document"
        );
        Ok(drafts)
    }

    /// Replace sentences that cannot be windowed with their words.
    ///
    /// Text with no sentence boundary at all is split as soon as it exceeds
    /// the window; otherwise a sentence is split once it exceeds several
    /// windows or the embedder input limit.
    fn split_long_units(&self, text: &str, units: Vec<Unit>) -> Vec<Unit> {
        let max = self.config.target_tokens_max;
        let limit = max.saturating_mul(SPLIT_FACTOR).min(self.input_limit);
        let single = units.len() == 1;
        let mut out = Vec::with_capacity(units.len());
        for unit in units {
            if unit.tokens > max && (single || unit.tokens > limit) {
                let offset = unit.span.start;
                let words: Vec<Range<usize>> = word_spans(&text[unit.span.clone()])
                    .into_iter()
                    .map(|w| w.start + offset..w.end + offset)
                    .collect();
                if words.len() > 1 {
                    warn!(
                        tokens = unit.tokens,
                        max_tokens = max,
                        at = offset,
                        "Sentence too long to window, falling back to word units"
                    );
                    out.extend(self.measure(words, text).into_iter().map(|mut w| {
                        w.degraded = true;
                        w
                    }));
                    continue;
                }
            }
            out.push(unit);
        }
        out
    }

    fn measure(&self, spans: Vec<Range<usize>>, text: &str) -> Vec<Unit> {
        spans
            .into_iter()
            .map(|span| Unit {
                tokens: self.counter.count(&text[span.clone()]),
                span,
                degraded: false,
            })
            .collect()
    }

    fn window(&self, text: &str, units: &[Unit], sections: &[SectionSpan]) -> Vec<ChunkDraft> {
        let max = self.config.target_tokens_max;
        let mut drafts = Vec::new();
        let mut next = 0;
        let mut prev: Option<Previous> = None;

        while next < units.len() {
            let oversized = units[next].tokens > max;
            let (start, overlap_short) = match prev {
                Some(p) if !p.oversized && !oversized => self.overlap_start(units, p, next),
                _ => (next, false),
            };

            let overlap_tokens: usize = units[start..next].iter().map(|u| u.tokens).sum();
            let mut tokens = overlap_tokens;
            let mut end = next;
            if oversized {
                tokens = units[next].tokens;
                end += 1;
            } else {
                while end < units.len() && tokens + units[end].tokens <= max {
                    tokens += units[end].tokens;
                    end += 1;
                }
            }

            let span = units[start].span.start..units[end - 1].span.end;
            let overlap_bytes = units[next].span.start - units[start].span.start;
            let (section, subsection) = label_for(text, &units[start..end], sections);

            if tokens < self.config.target_tokens_min && end < units.len() {
                debug!(
                    sequence_index = drafts.len(),
                    tokens,
                    "Chunk closed below target minimum"
                );
            }
            if oversized {
                debug!(
                    sequence_index = drafts.len(),
                    tokens,
                    max_tokens = max,
                    "Emitting oversized single-sentence chunk"
                );
            }
            if overlap_short {
                debug!(
                    sequence_index = drafts.len(),
                    overlap_tokens,
                    "No run of trailing sentences fits the overlap band"
                );
            }

            drafts.push(ChunkDraft {
                sequence_index: drafts.len(),
                text: text[span.clone()].to_string(),
                char_span: span,
                token_count: tokens,
                overlap_tokens,
                overlap_bytes,
                section,
                subsection,
                oversized,
                degraded: units[start..end].iter().any(|u| u.degraded),
                overlap_short,
            });
            prev = Some(Previous {
                start,
                tokens,
                oversized,
            });
            next = end;
        }
        drafts
    }

    /// First unit of the window starting fresh content at `next`.
    ///
    /// Candidate overlaps are runs of trailing units of the previous window,
    /// never the whole of it. A candidate is in band when its tokens lie in
    /// `[ceil(0.10 * smaller), floor(0.15 * smaller)]`, where `smaller` is the
    /// lesser of the previous window and the window the candidate produces.
    /// The in-band candidate closest to `overlap_fraction * smaller` wins.
    /// With none in band, the largest candidate under the upper bound is
    /// used and the window is marked short.
    fn overlap_start(&self, units: &[Unit], prev: Previous, next: usize) -> (usize, bool) {
        let max = self.config.target_tokens_max;
        let fraction = f64::from(self.config.overlap_fraction);
        let ceiling = prev.tokens * 3 / 20;

        let mut best: Option<(usize, f64)> = None;
        let mut fallback = next;
        let mut start = next;
        let mut overlap = 0;
        while start > prev.start + 1 {
            let tokens = units[start - 1].tokens;
            if overlap + tokens > ceiling || overlap + tokens + units[next].tokens > max {
                break;
            }
            overlap += tokens;
            start -= 1;

            let size = overlap + fill(units, next, max - overlap);
            let smaller = prev.tokens.min(size);
            if overlap > smaller * 3 / 20 {
                continue;
            }
            fallback = start;
            if overlap >= smaller.div_ceil(10) {
                let distance = (overlap as f64 - fraction * smaller as f64).abs();
                if best.is_none_or(|(_, d)| distance < d) {
                    best = Some((start, distance));
                }
            }
        }
        match best {
            Some((start, _)) => (start, false),
            None => (fallback, true),
        }
    }
}

/// Tokens a window takes from `units[from..]` when `budget` tokens remain.
fn fill(units: &[Unit], from: usize, budget: usize) -> usize {
    let mut used = 0;
    for unit in &units[from..] {
        if used + unit.tokens > budget {
            break;
        }
        used += unit.tokens;
    }
    used
}

/// Pick the section covering the majority of a window's tokens.
///
/// Ties go to the section that appears first in the window.
fn label_for(text: &str, units: &[Unit], sections: &[SectionSpan]) -> (String, Option<String>) {
    if sections.is_empty() {
        let start = units.first().map(|u| u.span.start).unwrap_or(0);
        let end = units.last().map(|u| u.span.end).unwrap_or(0);
        return (sections::classify_section(&text[start..end]).to_string(), None);
    }

    // label -> (weight, first position, heaviest span weight, subsection)
    let mut weights: HashMap<&str, (f64, usize, f64, Option<&str>)> = HashMap::new();
    for unit in units {
        let len = (unit.span.end - unit.span.start).max(1) as f64;
        for span in sections {
            let lo = unit.span.start.max(span.start);
            let hi = unit.span.end.min(span.end);
            if lo >= hi {
                continue;
            }
            let weight = unit.tokens as f64 * (hi - lo) as f64 / len;
            let entry = weights
                .entry(span.section.as_str())
                .or_insert((0.0, lo, 0.0, None));
            entry.0 += weight;
            entry.1 = entry.1.min(lo);
            if weight > entry.2 {
                entry.2 = weight;
                entry.3 = span.subsection.as_deref();
            }
        }
    }

    weights
        .into_iter()
        .max_by(|a, b| {
            a.1.0
                .partial_cmp(&b.1.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.1.cmp(&a.1.1))
        })
        .map(|(label, (_, _, _, sub))| (label.to_string(), sub.map(str::to_string)))
        .unwrap_or_else(|| (OTHER.to_string(), None))
}

/// Split text into contiguous sentence spans covering every byte.
///
/// A sentence ends after `.`, `!` or `?` (plus closing quotes or brackets)
/// followed by whitespace, or at a blank line. The trailing whitespace
/// belongs to the sentence it follows.
pub fn sentence_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '.' | '!' | '?' => {
                while let Some(&(_, nc)) = chars.peek() {
                    if CLOSERS.contains(&nc) {
                        chars.next();
                    } else {
                        break;
                    }
                }
                let followed_by_space = chars.peek().is_some_and(|&(_, nc)| nc.is_whitespace());
                followed_by_space && !(c == '.' && ends_with_abbreviation(&text[start..i]))
            }
            '\n' => text[i + 1..]
                .trim_start_matches([' ', '\t', '\r'])
                .starts_with('\n'),
            _ => false,
        };
        if !boundary {
            continue;
        }

        let mut end = text.len();
        while let Some(&(j, nc)) = chars.peek() {
            if nc.is_whitespace() {
                chars.next();
            } else {
                end = j;
                break;
            }
        }
        if end > start {
            spans.push(start..end);
            start = end;
        }
    }
    if start < text.len() {
        spans.push(start..text.len());
    }
    spans
}

fn ends_with_abbreviation(before_period: &str) -> bool {
    let word = before_period
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or_default()
        .trim_start_matches(['(', '[', '"', '\'']);
    let lower = word.to_lowercase();
    let is_initial = word.chars().count() == 1 && word.chars().all(char::is_uppercase);
    is_initial || ABBREVIATIONS.contains(&lower.as_str())
}

/// Split text into contiguous word spans, each word keeping its trailing whitespace.
pub fn word_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut seen_word = false;
    let mut in_space = false;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            in_space = true;
        } else {
            if in_space && seen_word {
                spans.push(start..i);
                start = i;
            }
            in_space = false;
            seen_word = true;
        }
    }
    if start < text.len() {
        spans.push(start..text.len());
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::{MDA, RISK_FACTORS};

    fn chunker(min: usize, max: usize, overlap: f32) -> Chunker {
        Chunker::new(
            ChunkingConfig {
                target_tokens_min: min,
                target_tokens_max: max,
                overlap_fraction: overlap,
            },
            TokenCounter::cl100k().unwrap(),
        )
        .unwrap()
    }

    fn reconstruct(drafts: &[ChunkDraft]) -> String {
        drafts
            .iter()
            .map(|d| &d.text[d.overlap_bytes..])
            .collect::<String>()
    }

    fn filing(sentences: usize) -> String {
        (0..sentences)
            .map(|i| {
                format!(
                    "In quarter {i} net sales in the Americas segment increased by {} percent year over year. ",
                    i % 9 + 1
                )
            })
            .collect()
    }

    #[test]
    fn test_sentence_spans_cover_text() {
        let text = "Net sales were $383.3 billion. Apple Inc. grew services!  Why?\n\nNew para";
        let spans = sentence_spans(text);
        let texts: Vec<&str> = spans.iter().map(|s| &text[s.clone()]).collect();
        assert_eq!(
            texts,
            vec![
                "Net sales were $383.3 billion. ",
                "Apple Inc. grew services!  ",
                "Why?\n\n",
                "New para"
            ]
        );
    }

    #[test]
    fn test_sentence_spans_blank_line_without_period() {
        let text = "Item 7 heading\n\nBody text.";
        let spans = sentence_spans(text);
        assert_eq!(spans.len(), 2);
        assert_eq!(&text[spans[0].clone()], "Item 7 heading\n\n");
    }

    #[test]
    fn test_sentence_spans_closing_quote() {
        let text = "He said \"growth was strong.\" Then margins fell.";
        let spans = sentence_spans(text);
        assert_eq!(&text[spans[0].clone()], "He said \"growth was strong.\" ");
    }

    #[test]
    fn test_word_spans() {
        let text = "  alpha beta\tgamma ";
        let spans = word_spans(text);
        let texts: Vec<&str> = spans.iter().map(|s| &text[s.clone()]).collect();
        assert_eq!(texts, vec!["  alpha ", "beta\t", "gamma "]);
    }

    #[test]
    fn test_empty_input_rejected() {
        let c = chunker(20, 100, 0.15);
        assert!(matches!(c.chunk("", &[]), Err(ChunkError::EmptyInput)));
        assert!(matches!(c.chunk(" \n\t ", &[]), Err(ChunkError::EmptyInput)));
    }

    #[test]
    fn test_non_text_rejected() {
        let c = chunker(20, 100, 0.15);
        assert!(matches!(
            c.chunk_bytes(&[0x66, 0xff, 0xfe], &[]),
            Err(ChunkError::NotText { .. })
        ));
        assert!(matches!(
            c.chunk("abc\0def", &[]),
            Err(ChunkError::NotText { .. })
        ));
    }

    #[test]
    fn test_short_text_single_chunk() {
        let c = chunker(20, 100, 0.15);
        let drafts = c.chunk("Revenue grew. Margins held.", &[]).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].sequence_index, 0);
        assert_eq!(drafts[0].char_span, 0..27);
        assert_eq!(drafts[0].overlap_bytes, 0);
    }

    fn assert_overlap_band(drafts: &[ChunkDraft]) {
        for pair in drafts.windows(2) {
            if pair[0].oversized || pair[1].oversized {
                assert_eq!(pair[1].overlap_tokens, 0);
                continue;
            }
            let smaller = pair[0].token_count.min(pair[1].token_count);
            let overlap = pair[1].overlap_tokens;
            assert!(
                overlap <= smaller * 3 / 20,
                "chunk {} overlaps {overlap} of {smaller}",
                pair[1].sequence_index
            );
            assert!(pair[1].overlap_short || overlap >= smaller.div_ceil(10));
        }
    }

    #[test]
    fn test_windows_respect_bounds_and_overlap() {
        let c = chunker(150, 300, 0.12);
        let text = filing(80);
        let drafts = c.chunk(&text, &[]).unwrap();
        assert!(drafts.len() > 3);

        for (i, d) in drafts.iter().enumerate() {
            assert_eq!(d.sequence_index, i);
            assert!(!d.oversized);
            assert!(!d.degraded);
            assert!(d.token_count <= 300, "chunk {i} has {} tokens", d.token_count);
            assert_eq!(&text[d.char_span.clone()], d.text);
        }
        for pair in drafts.windows(2) {
            assert!(pair[0].char_span.start <= pair[1].char_span.start);
            let shared = &pair[1].text[..pair[1].overlap_bytes];
            assert!(pair[0].text.ends_with(shared));
        }
        // Two ~17-token sentences land inside the band of a full window.
        assert!(!drafts[1].overlap_short);
        assert!(drafts[1].overlap_tokens > 0);
        assert_overlap_band(&drafts);
        assert_eq!(reconstruct(&drafts), text);
    }

    #[test]
    fn test_short_tail_caps_overlap() {
        let c = chunker(100, 200, 0.15);
        let text = filing(25);
        let drafts = c.chunk(&text, &[]).unwrap();
        let tail = drafts.last().unwrap();
        assert!(tail.token_count < 200);
        assert!(tail.overlap_tokens <= tail.token_count * 3 / 20);
        assert_overlap_band(&drafts);
        assert_eq!(reconstruct(&drafts), text);
    }

    #[test]
    fn test_overlap_marked_short_when_no_sentence_fits() {
        // ~17-token sentences against a 60-token window: the band is [6, 9].
        let c = chunker(20, 60, 0.12);
        let text = filing(12);
        let drafts = c.chunk(&text, &[]).unwrap();
        assert!(drafts.len() > 2);
        for d in &drafts[1..] {
            assert!(d.overlap_short);
            assert_eq!(d.overlap_tokens, 0);
            assert_eq!(d.overlap_bytes, 0);
        }
        assert!(!drafts[0].overlap_short);
        assert_eq!(reconstruct(&drafts), text);
    }

    #[test]
    fn test_oversized_sentence_emitted_whole() {
        let c = chunker(10, 40, 0.15);
        let long: String = (0..40).map(|i| format!("item{i}, ")).collect();
        let text = format!("Short intro. {}end. Closing remark.", long.trim_end());
        let drafts = c.chunk(&text, &[]).unwrap();

        let oversized: Vec<&ChunkDraft> = drafts.iter().filter(|d| d.oversized).collect();
        assert_eq!(oversized.len(), 1);
        assert!(oversized[0].token_count > 40);
        assert!(oversized[0].text.contains("item39"));
        assert!(!oversized[0].degraded);
        assert_eq!(oversized[0].overlap_bytes, 0);
        assert_overlap_band(&drafts);
        assert_eq!(reconstruct(&drafts), text);
    }

    #[test]
    fn test_degraded_mode_without_terminators() {
        let c = chunker(10, 40, 0.15);
        let text: String = (0..200).map(|i| format!("token{i} ")).collect();
        let drafts = c.chunk(&text, &[]).unwrap();
        assert!(drafts.len() > 1);
        assert!(drafts.iter().all(|d| d.degraded));
        assert!(drafts.iter().all(|d| d.token_count <= 40));
        assert_overlap_band(&drafts);
        assert_eq!(reconstruct(&drafts), text);
    }

    #[test]
    fn test_long_run_after_sentence_falls_back_to_words() {
        let c = chunker(10, 40, 0.15);
        let run: String = (0..300).map(|i| format!("cell{i} ")).collect();
        let text = format!("Intro sentence here. {run}");
        let drafts = c.chunk(&text, &[]).unwrap();
        assert!(drafts.len() > 5);
        assert!(drafts.iter().all(|d| !d.oversized));
        assert!(drafts.iter().all(|d| d.token_count <= 40));
        assert!(drafts.iter().any(|d| d.degraded));
        assert!(drafts[0].text.starts_with("Intro sentence here. "));
        assert_overlap_band(&drafts);
        assert_eq!(reconstruct(&drafts), text);
    }

    #[test]
    fn test_input_limit_splits_sentence() {
        let run: String = (0..100).map(|i| format!("figure{i} ")).collect();
        let text = format!("Intro sentence here. {run}");

        // Under four windows, the run stays one oversized chunk.
        let whole = chunker(10, 100, 0.12).chunk(&text, &[]).unwrap();
        assert_eq!(whole.iter().filter(|d| d.oversized).count(), 1);

        let limited = chunker(10, 100, 0.12).with_input_limit(150);
        let drafts = limited.chunk(&text, &[]).unwrap();
        assert!(drafts.iter().all(|d| !d.oversized && d.token_count <= 100));
        assert!(drafts.iter().any(|d| d.degraded));
        assert_eq!(reconstruct(&drafts), text);
    }

    #[test]
    fn test_section_majority_label() {
        let c = chunker(10, 400, 0.1);
        let risk = "Supply disruptions could harm results. ";
        let mda = "Net sales increased due to higher iPhone sales. Services grew strongly. Gross margin improved. ";
        let text = format!("{risk}{mda}");
        let spans = vec![
            SectionSpan {
                start: 0,
                end: risk.len(),
                section: RISK_FACTORS.into(),
                subsection: Some("Item 1A".into()),
            },
            SectionSpan {
                start: risk.len(),
                end: text.len(),
                section: MDA.into(),
                subsection: Some("Item 7".into()),
            },
        ];
        let drafts = c.chunk(&text, &spans).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].section, MDA);
        assert_eq!(drafts[0].subsection.as_deref(), Some("Item 7"));
    }

    #[test]
    fn test_section_tie_goes_to_earlier() {
        let c = chunker(1, 400, 0.1);
        let text = "Alpha beta. Alpha beta. ";
        let half = text.len() / 2;
        let spans = vec![
            SectionSpan {
                start: 0,
                end: half,
                section: "First".into(),
                subsection: None,
            },
            SectionSpan {
                start: half,
                end: text.len(),
                section: "Second".into(),
                subsection: None,
            },
        ];
        let drafts = c.chunk(text, &spans).unwrap();
        assert_eq!(drafts[0].section, "First");
    }

    #[test]
    fn test_keyword_fallback_when_no_spans() {
        let c = chunker(1, 400, 0.1);
        let drafts = c
            .chunk("The risk factors below describe uncertainty.", &[])
            .unwrap();
        assert_eq!(drafts[0].section, RISK_FACTORS);
    }

    #[test]
    fn test_chunk_document_uses_item_headings() {
        let c = chunker(1, 30, 0.1);
        let text = format!(
            "Item 1A. Risk Factors\n{}\nItem 7. Management's Discussion and Analysis\n{}",
            "Competition is intense. ".repeat(6),
            "Net sales were $383.3 billion in fiscal 2023. ".repeat(4)
        );
        let drafts = c.chunk_document(&text).unwrap();
        assert_eq!(drafts.first().unwrap().section, RISK_FACTORS);
        assert_eq!(drafts.last().unwrap().section, MDA);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Chunker::new(
            ChunkingConfig {
                target_tokens_min: 10,
                target_tokens_max: 100,
                overlap_fraction: 0.5,
            },
            TokenCounter::cl100k().unwrap(),
        );
        assert!(result.is_err());
    }
}
