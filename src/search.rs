use std::collections::BTreeSet;

use unicode_normalization::UnicodeNormalization;

pub(crate) const DEFAULT_TOKEN_LENGTHS: [usize; 2] = [2, 3];

const HIRAGANA_START: char = '\u{3041}';
const HIRAGANA_END: char = '\u{3096}';
const HIRAGANA_TO_KATAKANA_OFFSET: u32 = 0x60;
const COMBINING_MARKS_START: char = '\u{0300}';
const COMBINING_MARKS_END: char = '\u{036F}';

fn hiragana_to_katakana(character: char) -> char {
    if (HIRAGANA_START..=HIRAGANA_END).contains(&character) {
        char::from_u32(u32::from(character) + HIRAGANA_TO_KATAKANA_OFFSET).unwrap_or(character)
    } else {
        character
    }
}

fn is_combining_mark(character: char) -> bool {
    (COMBINING_MARKS_START..=COMBINING_MARKS_END).contains(&character)
}

/// Reduces catalog text to its canonical search form.
///
/// Steps run in a fixed order: hiragana is mapped to katakana, the text is
/// decomposed and stripped of combining diacritics, width variants are folded
/// with NFKC, and finally everything is lowercased. Katakana mapping has to
/// happen before NFKC, otherwise halfwidth forms and hiragana fold differently.
pub(crate) fn normalize_for_search(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let katakana = text.chars().map(hiragana_to_katakana).collect::<String>();
    let stripped = katakana
        .nfd()
        .filter(|character| !is_combining_mark(*character))
        .collect::<String>();
    stripped.nfkc().collect::<String>().to_lowercase()
}

/// Sliding-window substrings of every requested length, deduplicated.
///
/// Lengths are counted in characters. Zero lengths are ignored and text
/// shorter than a length contributes nothing for it.
pub(crate) fn derive_tokens(text: &str, lengths: &[usize]) -> BTreeSet<String> {
    let characters = text.chars().collect::<Vec<char>>();
    let mut tokens = BTreeSet::new();

    for &length in lengths {
        if length == 0 || characters.len() < length {
            continue;
        }
        for window in characters.windows(length) {
            tokens.insert(window.iter().collect::<String>());
        }
    }

    tokens
}
