//! Модуль подготовки текста реплик к синтезу
//!
//! `normalize` - чистая детерминированная функция: результат либо пустой,
//! либо заканчивается знаком конца предложения.

use once_cell::sync::Lazy;
use regex::Regex;

/// Слово, которым заменяются ссылки
pub const URL_PLACEHOLDER: &str = "link";

static MARKUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid markup regex"));

static ANNOTATIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[[^\]]*\]|\([^)]*\)|\{[^}]*\}").expect("valid annotation regex")
});

static MUSIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"[♪♫♬♩]+").expect("valid music regex"));

static URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:https?://|www\.)[^\s]+").expect("valid url regex")
});

static SPACE_BEFORE_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+([,.!?…;:])").expect("valid punctuation regex"));

static TRAILING_JUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s,;:\-–—]+$").expect("valid trailing regex"));

static ABBREVIATIONS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)\bmrs\.", "Missus"),
        (r"(?i)\bmr\.", "Mister"),
        (r"(?i)\bms\.", "Miss"),
        (r"(?i)\bdr\.", "Doctor"),
        (r"(?i)\bst\.", "Saint"),
        (r"(?i)\bjr\.", "Junior"),
        (r"(?i)\bvs\b\.?", "versus"),
        (r"(?i)\betc\.", "et cetera"),
        (r"(?i)\be\.g\.", "for example"),
        (r"(?i)\bi\.e\.", "that is"),
        (r"\bw/", "with "),
        (r"\s&\s", " and "),
        (r"%", " percent"),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Декодирует HTML-сущности, которые встречаются в субтитрах
fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn expand_abbreviations(text: &str) -> String {
    let mut result = text.to_string();
    for (regex, replacement) in ABBREVIATIONS.iter() {
        result = regex.replace_all(&result, *replacement).into_owned();
    }
    result
}

fn ends_with_terminal(text: &str) -> bool {
    matches!(text.chars().last(), Some('.' | '!' | '?' | '…'))
}

/// Подготовить текст реплики для синтеза речи
pub fn normalize(raw_text: &str) -> String {
    // разметку снимаем до декодирования сущностей: "a &lt; b" остаётся текстом
    let text = MARKUP.replace_all(raw_text, "");
    let text = decode_entities(&text);
    let text = ANNOTATIONS.replace_all(&text, " ");
    let text = MUSIC.replace_all(&text, " ");
    let text = URL.replace_all(&text, URL_PLACEHOLDER);
    let text = expand_abbreviations(&text);

    let text = text.split_whitespace().collect::<Vec<&str>>().join(" ");
    let text = SPACE_BEFORE_PUNCT.replace_all(&text, "$1");
    if !text.chars().any(char::is_alphanumeric) {
        return String::new();
    }

    let mut text = TRAILING_JUNK.replace(&text, "").into_owned();
    if !ends_with_terminal(&text) {
        text.push('.');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_annotations_and_music() {
        assert_eq!(normalize("♪ [music] Hello (laughs) there ♪"), "Hello there.");
        assert_eq!(normalize("<i>Hello</i>   <b>world</b>!"), "Hello world!");
        assert_eq!(normalize("Thanks (applause)."), "Thanks.");
    }

    #[test]
    fn test_empty_after_cleanup() {
        assert_eq!(normalize("[APPLAUSE]"), "");
        assert_eq!(normalize("♪ ♪"), "");
        assert_eq!(normalize("..."), "");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn test_terminal_punctuation() {
        assert_eq!(normalize("So, we begin"), "So, we begin.");
        assert_eq!(normalize("and then,"), "and then.");
        assert_eq!(normalize("Really?"), "Really?");
        assert_eq!(normalize("Wait…"), "Wait…");
    }

    #[test]
    fn test_urls_replaced() {
        assert_eq!(normalize("see https://example.com/a?b=c now"), "see link now.");
        assert_eq!(normalize("Visit www.example.org"), "Visit link.");
    }

    #[test]
    fn test_abbreviations_and_entities() {
        assert_eq!(normalize("Mr. Smith &amp; Dr. Jones"), "Mister Smith and Doctor Jones.");
        assert_eq!(normalize("50% off"), "50 percent off.");
    }

    #[test]
    fn test_deterministic() {
        let raw = "  <v Roger>Hey,   you (whispers)  ";
        assert_eq!(normalize(raw), normalize(raw));
        assert_eq!(normalize(raw), "Hey, you.");
    }
}
