// Speech-friendly token splitter: breaks dialog-service response text (1)
// after sentence-ending punctuation followed by whitespace, honoring an
// exceptions list so common abbreviations don't get mis-split mid-sentence,
// and (2) before a language-specific separator word (a discourse connective
// like "but"/"however"), so a long clause still gets handed to TTS in
// speakable pieces even without terminal punctuation.

const DEFAULT_EXCEPTIONS: &[&str] = &["mr.", "mrs.", "dr.", "vs.", "etc.", "e.g.", "i.e."];

/// English discourse connectives worth breaking a TTS token before. A
/// deployment for another language supplies its own list via
/// `split_with_exceptions`.
const DEFAULT_SEPARATOR_WORDS: &[&str] =
    &["but", "however", "meanwhile", "otherwise", "therefore", "although"];

pub fn split_into_tokens(text: &str) -> Vec<String> {
    split_with_exceptions(text, DEFAULT_EXCEPTIONS, DEFAULT_SEPARATOR_WORDS)
}

pub fn split_with_exceptions(text: &str, exceptions: &[&str], separator_words: &[&str]) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        current.push(c);

        let is_boundary_char = matches!(c, '?' | '!' | ',' | '.');
        let next_is_whitespace = chars.get(i + 1).map_or(true, |n| n.is_whitespace());
        let punctuation_split =
            is_boundary_char && next_is_whitespace && !ends_with_exception(&current, exceptions);

        let separator_skip = if punctuation_split {
            None
        } else {
            separator_word_follows(&chars, i, separator_words)
        };

        if punctuation_split || separator_skip.is_some() {
            let trimmed = current.trim().to_string();
            if !trimmed.is_empty() {
                tokens.push(trimmed);
            }
            current.clear();

            if punctuation_split {
                // Skip the whitespace that follows the punctuation boundary.
                while chars.get(i + 1).is_some_and(|n| n.is_whitespace()) {
                    i += 1;
                }
            } else if let Some(ws_len) = separator_skip {
                // Skip only the whitespace run, so the separator word itself
                // starts the next token.
                i += ws_len;
            }
        }

        i += 1;
    }

    let trailing = current.trim().to_string();
    if !trailing.is_empty() {
        tokens.push(trailing);
    }

    tokens
}

fn ends_with_exception(current: &str, exceptions: &[&str]) -> bool {
    let lower = current.trim().to_lowercase();
    exceptions.iter().any(|exc| lower.ends_with(exc))
}

/// If a whitespace run starting right after `i` is immediately followed by
/// one of `separator_words` (case-insensitive) and then a word boundary,
/// returns the length of that whitespace run.
fn separator_word_follows(chars: &[char], i: usize, separator_words: &[&str]) -> Option<usize> {
    if separator_words.is_empty() {
        return None;
    }
    let mut j = i + 1;
    while chars.get(j).is_some_and(|c| c.is_whitespace()) {
        j += 1;
    }
    let ws_len = j - (i + 1);
    if ws_len == 0 {
        return None;
    }
    for &word in separator_words {
        if matches_word_at(chars, j, word) {
            let after = j + word.chars().count();
            let boundary_ok = chars
                .get(after)
                .map_or(true, |c| c.is_whitespace() || matches!(c, '?' | '!' | ',' | '.'));
            if boundary_ok {
                return Some(ws_len);
            }
        }
    }
    None
}

fn matches_word_at(chars: &[char], start: usize, word: &str) -> bool {
    let word_chars: Vec<char> = word.chars().collect();
    if start + word_chars.len() > chars.len() {
        return false;
    }
    chars[start..start + word_chars.len()]
        .iter()
        .zip(word_chars.iter())
        .all(|(a, b)| a.eq_ignore_ascii_case(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_on_period() {
        let tokens = split_into_tokens("Hello there. How are you?");
        assert_eq!(tokens, vec!["Hello there.", "How are you?"]);
    }

    #[test]
    fn test_splits_on_comma_and_exclamation() {
        let tokens = split_into_tokens("Wait, stop! Don't go.");
        assert_eq!(tokens, vec!["Wait,", "stop!", "Don't go."]);
    }

    #[test]
    fn test_abbreviation_not_split() {
        let tokens = split_into_tokens("Please see Dr. Smith tomorrow.");
        assert_eq!(tokens, vec!["Please see Dr. Smith tomorrow."]);
    }

    #[test]
    fn test_no_terminal_punctuation_yields_single_token() {
        let tokens = split_into_tokens("just one phrase with no stop");
        assert_eq!(tokens, vec!["just one phrase with no stop"]);
    }

    #[test]
    fn test_period_not_followed_by_whitespace_not_split() {
        let tokens = split_into_tokens("version 1.5 is out.");
        assert_eq!(tokens, vec!["version 1.5 is out."]);
    }

    #[test]
    fn test_splits_before_separator_word() {
        let tokens = split_into_tokens("I checked the schedule but there's nothing open today.");
        assert_eq!(
            tokens,
            vec!["I checked the schedule", "but there's nothing open today."]
        );
    }

    #[test]
    fn test_separator_word_mid_other_word_not_split() {
        // "button" contains "but" but isn't the separator word itself.
        let tokens = split_into_tokens("Press the button to continue.");
        assert_eq!(tokens, vec!["Press the button to continue."]);
    }

    #[test]
    fn test_empty_separator_list_only_splits_on_punctuation() {
        let tokens = split_with_exceptions("Wait but stop.", DEFAULT_EXCEPTIONS, &[]);
        assert_eq!(tokens, vec!["Wait but stop."]);
    }
}
