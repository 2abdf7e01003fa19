//! Outbound text splitting.
//!
//! Lengths are measured in characters so a cut never lands inside a
//! multi-byte sequence.

/// Break points closer to the start of the window than this are ignored.
const MIN_BREAK_RATIO: f64 = 0.7;

/// Always yields at least one chunk; input with no visible text yields `[""]`.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    Chunks::new(text, max_len).collect()
}

/// Lazy, restartable chunk sequence; clone it to iterate again from the
/// same position.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    remaining: &'a str,
    max_len: usize,
    started: bool,
    emitted: bool,
}

impl<'a> Chunks<'a> {
    pub fn new(text: &'a str, max_len: usize) -> Self {
        Self {
            remaining: text,
            max_len: max_len.max(1),
            started: false,
            emitted: false,
        }
    }
}

impl Iterator for Chunks<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if !self.started {
            self.started = true;
            if nth_char_index(self.remaining, self.max_len).is_none() {
                let whole = std::mem::take(&mut self.remaining);
                return self.emit(whole);
            }
        }

        loop {
            if self.remaining.is_empty() {
                return self.finish();
            }

            let Some(window_end) = nth_char_index(self.remaining, self.max_len) else {
                let last = std::mem::take(&mut self.remaining).trim();
                if last.is_empty() {
                    return self.finish();
                }
                return self.emit(last);
            };

            let window = &self.remaining[..window_end];
            let split_at = find_break(window, self.max_len).unwrap_or(window_end);
            let (head, tail) = self.remaining.split_at(split_at);
            self.remaining = tail.trim_start();

            let head = head.trim();
            if !head.is_empty() {
                return self.emit(head);
            }
        }
    }
}

impl Chunks<'_> {
    fn emit(&mut self, chunk: &str) -> Option<String> {
        self.emitted = true;
        Some(chunk.to_string())
    }

    /// Whitespace-only input still produces one (empty) chunk.
    fn finish(&mut self) -> Option<String> {
        if self.emitted {
            return None;
        }
        self.emit("")
    }
}

/// Byte index of the `n`th character, or `None` when `text` has at most `n`
/// characters.
fn nth_char_index(text: &str, n: usize) -> Option<usize> {
    text.char_indices().nth(n).map(|(index, _)| index)
}

fn find_break(window: &str, max_len: usize) -> Option<usize> {
    let min_chars = (max_len as f64 * MIN_BREAK_RATIO) as usize;
    let past_threshold = |index: usize| window[..index].chars().count() > min_chars;

    let candidates = [
        window.rfind('\n'),
        window.rfind(". ").map(|index| index + 1),
        window.rfind(' '),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|&index| past_threshold(index))
}

#[cfg(test)]
mod tests {
    use super::{Chunks, split_message};

    #[test]
    fn empty_input_yields_one_empty_chunk() {
        assert_eq!(split_message("", 400), vec![String::new()]);
    }

    #[test]
    fn long_blank_input_yields_one_empty_chunk() {
        assert_eq!(split_message(&" ".repeat(500), 400), vec![String::new()]);
        assert_eq!(split_message(&"\n ".repeat(300), 100), vec![String::new()]);
    }

    #[test]
    fn short_text_is_returned_unchanged() {
        assert_eq!(split_message("  hi there \n", 400), vec!["  hi there \n"]);
    }

    #[test]
    fn unbroken_text_is_cut_at_max_len() {
        let text = "a".repeat(1000);
        let chunks = split_message(&text, 400);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| !c.is_empty() && c.chars().count() <= 400));
        assert_eq!(chunks[2].len(), 200);
    }

    #[test]
    fn prefers_newline_then_sentence_then_space() {
        let text = format!("{}\n{}. {} tail", "a".repeat(80), "b".repeat(5), "c".repeat(10));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks[0], "a".repeat(80));

        let text = format!("{}. {} {}", "a".repeat(80), "b".repeat(10), "c".repeat(30));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks[0], format!("{}.", "a".repeat(80)));
        assert!(chunks[1].starts_with(&"b".repeat(10)));

        let text = format!("{}. {} {}", "a".repeat(20), "b".repeat(70), "c".repeat(30));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks[0], format!("{}. {}", "a".repeat(20), "b".repeat(70)));
    }

    #[test]
    fn early_break_points_are_ignored() {
        let text = format!("{} {}", "a".repeat(10), "b".repeat(200));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks[0].chars().count(), 100);
        assert!(chunks[0].starts_with(&"a".repeat(10)));
    }

    #[test]
    fn counts_characters_not_bytes() {
        let text = "é".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
    }

    #[test]
    fn chunks_rejoin_to_original_words() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        let chunks = split_message(&text, 120);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.is_empty() && c.chars().count() <= 120));
        let rejoined = chunks.join(" ");
        assert_eq!(
            rejoined.split_whitespace().collect::<Vec<_>>(),
            text.split_whitespace().collect::<Vec<_>>()
        );
    }

    #[test]
    fn sequence_is_restartable() {
        let text = "word ".repeat(100);
        let chunks = Chunks::new(&text, 64);
        let first: Vec<String> = chunks.clone().collect();
        let second: Vec<String> = chunks.collect();
        assert_eq!(first, second);
    }
}
