//! Text preparation before it is sent to the voice.

use std::sync::LazyLock;

use regex::Regex;

/// Longest chunk handed to the voice in one request.
pub const MAX_VOICE_CHUNK: usize = 200;

static ACRONYM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z]+").expect("Invalid regex pattern for acronyms"));

static SENTENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^。！？.!?]+[。！？.!?]+").expect("Invalid regex pattern for sentences")
});

/// Katakana letter names, `A` through `Z`.
const LETTER_NAMES: [&str; 26] = [
    "エー",
    "ビー",
    "シー",
    "ディー",
    "イー",
    "エフ",
    "ジー",
    "エイチ",
    "アイ",
    "ジェー",
    "ケー",
    "エル",
    "エム",
    "エヌ",
    "オー",
    "ピー",
    "キュー",
    "アール",
    "エス",
    "ティー",
    "ユー",
    "ブイ",
    "ダブリュー",
    "エックス",
    "ワイ",
    "ゼット",
];

/// Spell out upper-case acronyms of two to five letters, one letter name per line.
///
/// `API` becomes `\nエー\nピー\nアイ`. Runs touching other ASCII word characters
/// (`APIs`, `X11`) are left alone.
pub fn prepare_for_speech(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for found in ACRONYM.find_iter(text) {
        let len = found.len();
        if !(2..=5).contains(&len) || touches_word(text, found.start(), found.end()) {
            continue;
        }
        out.push_str(&text[last..found.start()]);
        for letter in found.as_str().bytes() {
            out.push('\n');
            out.push_str(LETTER_NAMES[usize::from(letter - b'A')]);
        }
        last = found.end();
    }

    out.push_str(&text[last..]);
    out
}

fn touches_word(text: &str, start: usize, end: usize) -> bool {
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let before = start
        .checked_sub(1)
        .and_then(|i| text.as_bytes().get(i))
        .is_some_and(|b| is_word(*b));
    let after = text.as_bytes().get(end).is_some_and(|b| is_word(*b));
    before || after
}

/// Split a reply into sentence-aligned chunks of at most `max` characters.
///
/// A single sentence longer than `max` becomes its own chunk. Text without any
/// sentence terminator is returned whole.
pub fn split_for_voice(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut consumed = 0;
    let mut matched = false;

    for sentence in SENTENCE.find_iter(text) {
        matched = true;
        push_sentence(&mut chunks, &mut current, sentence.as_str(), max);
        consumed = sentence.end();
    }

    if !matched {
        return vec![text.to_string()];
    }

    let rest = &text[consumed..];
    if !rest.trim().is_empty() {
        push_sentence(&mut chunks, &mut current, rest, max);
    }

    let tail = current.trim();
    if !tail.is_empty() {
        chunks.push(tail.to_string());
    }
    chunks
}

fn push_sentence(chunks: &mut Vec<String>, current: &mut String, sentence: &str, max: usize) {
    let len = current.chars().count() + sentence.chars().count();
    if len > max && !current.is_empty() {
        let chunk = current.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        current.clear();
    }
    current.push_str(sentence);
}
