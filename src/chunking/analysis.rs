//! Text analysis helpers shared by the strategies

use std::collections::HashSet;

/// Local complexity in [0, 1].
///
/// Blend of vocabulary richness (unique / total words), average sentence
/// length (saturating at 30 words) and average word length (saturating at
/// 10 chars).
pub fn complexity(text: &str) -> f32 {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    if words.is_empty() {
        return 0.0;
    }

    let unique: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();
    let richness = unique.len() as f32 / words.len() as f32;

    let sentences = text
        .chars()
        .filter(|c| matches!(c, '.' | '!' | '?'))
        .count()
        .max(1);
    let sentence_len = (words.len() as f32 / sentences as f32 / 30.0).min(1.0);

    let chars: usize = words.iter().map(|w| w.chars().count()).sum();
    let word_len = (chars as f32 / words.len() as f32 / 10.0).min(1.0);

    (0.4 * richness + 0.3 * sentence_len + 0.3 * word_len).clamp(0.0, 1.0)
}

/// Largest char boundary at or below `index`
pub fn floor_boundary(text: &str, index: usize) -> usize {
    let mut i = index.min(text.len());
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Smallest char boundary strictly above `index` (or the end)
pub fn next_boundary(text: &str, index: usize) -> usize {
    let mut i = (index + 1).min(text.len());
    while i < text.len() && !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Cut point for a chunk starting at `start` aiming at `target`.
///
/// Snapped down to a char boundary, but always advancing at least one char.
pub fn cut_point(text: &str, start: usize, target: usize) -> usize {
    let end = floor_boundary(text, target);
    if end <= start {
        next_boundary(text, start)
    } else {
        end
    }
}

/// Paragraph units as contiguous `(start, end)` ranges covering the whole text.
///
/// Blank-line separators stay attached to the preceding unit.
pub fn paragraph_units(text: &str) -> Vec<(usize, usize)> {
    let mut units = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    let mut in_gap = false;

    for line in text.split_inclusive('\n') {
        let blank = line.trim().is_empty();
        if !blank && in_gap {
            units.push((start, offset));
            start = offset;
            in_gap = false;
        }
        if blank && offset > start {
            in_gap = true;
        }
        offset += line.len();
    }

    if start < text.len() {
        units.push((start, text.len()));
    }

    units
}

/// Sentence boundaries inside `[lo, hi)`.
///
/// A boundary sits after a terminator (plus closing quotes/brackets) and the
/// whitespace that follows it, so the next piece starts at a new sentence.
pub fn sentence_boundaries(text: &str, lo: usize, hi: usize) -> Vec<usize> {
    let lo = floor_boundary(text, lo);
    let hi = floor_boundary(text, hi);
    if hi <= lo {
        return Vec::new();
    }

    let slice = &text[lo..hi];
    let chars: Vec<(usize, char)> = slice.char_indices().collect();
    let mut boundaries = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if matches!(chars[i].1, '.' | '!' | '?') {
            let mut j = i + 1;
            while j < chars.len() && matches!(chars[j].1, '"' | '\'' | ')' | ']') {
                j += 1;
            }
            if j < chars.len() && chars[j].1.is_whitespace() {
                while j < chars.len() && chars[j].1.is_whitespace() {
                    j += 1;
                }
                let pos = chars.get(j).map(|(p, _)| *p).unwrap_or(slice.len());
                boundaries.push(lo + pos);
                i = j;
                continue;
            }
        }
        i += 1;
    }

    boundaries
}

/// Sentence boundary in `(lo, hi]` nearest to `target`, if any
pub fn nearest_sentence_boundary(text: &str, lo: usize, hi: usize, target: usize) -> Option<usize> {
    sentence_boundaries(text, lo, hi)
        .into_iter()
        .filter(|&pos| pos > lo)
        .min_by_key(|&pos| pos.abs_diff(target))
}

/// Markdown heading level (1-6) of a line
pub fn heading_level(line: &str) -> Option<usize> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        let hashes = trimmed.chars().take_while(|&c| c == '#').count();
        if hashes <= 6 && trimmed.chars().nth(hashes) == Some(' ') {
            return Some(hashes);
        }
    }
    None
}

/// Check if line starts/ends a code block
pub fn is_code_fence(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

/// GitHub-style anchor slug of a heading text
pub fn slugify(heading: &str) -> String {
    let mut slug = String::with_capacity(heading.len());
    for c in heading.trim().chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if c == ' ' || c == '-' {
            slug.push('-');
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complexity_bounds_and_ordering() {
        assert_eq!(complexity(""), 0.0);

        let simple = "the cat sat. the cat sat. the cat sat. the cat sat.";
        let dense = "Heterogeneous polymorphic instantiation necessitates comprehensive \
                     monomorphization strategies throughout sophisticated compilation pipelines";

        let low = complexity(simple);
        let high = complexity(dense);
        assert!((0.0..=1.0).contains(&low));
        assert!((0.0..=1.0).contains(&high));
        assert!(high > 0.6, "dense text scored {}", high);
        assert!(low < 0.4, "simple text scored {}", low);
    }

    #[test]
    fn test_cut_point_respects_char_boundaries() {
        let text = "aé€b";
        // 'é' occupies bytes 1..3, '€' occupies 3..6
        assert_eq!(cut_point(text, 0, 2), 1);
        assert_eq!(cut_point(text, 1, 2), 3);
        assert_eq!(cut_point(text, 3, 4), 6);
        assert_eq!(cut_point(text, 0, 100), text.len());
    }

    #[test]
    fn test_paragraph_units_are_contiguous() {
        let text = "First para.\n\nSecond para.\n\n\nThird.";
        let units = paragraph_units(text);

        assert_eq!(units.len(), 3);
        assert_eq!(units[0].0, 0);
        assert_eq!(units.last().map(|u| u.1), Some(text.len()));
        for pair in units.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        assert!(text[units[1].0..units[1].1].starts_with("Second"));
    }

    #[test]
    fn test_nearest_sentence_boundary() {
        let text = "One two. Three four. Five six.";
        // boundaries after "One two. " (9) and "Three four. " (21)
        assert_eq!(nearest_sentence_boundary(text, 0, text.len(), 10), Some(9));
        assert_eq!(nearest_sentence_boundary(text, 0, text.len(), 19), Some(21));
        assert_eq!(nearest_sentence_boundary(text, 0, 5, 3), None);
    }

    #[test]
    fn test_heading_and_slug() {
        assert_eq!(heading_level("## Setup"), Some(2));
        assert_eq!(heading_level("#nospace"), None);
        assert!(is_code_fence("```rust"));
        assert_eq!(slugify("Getting Started!"), "getting-started");
    }
}
