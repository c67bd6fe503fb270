//! Sentence splitting and per-sentence speaking speed.

/// Characters that end a sentence. Newlines also end one but are not kept.
const TERMINALS: &[char] = &['。', '！', '？', '!', '?', '.', '；', ';', '…'];

/// Closing quotes and brackets that stay with the sentence they close.
const CLOSERS: &[char] = &[
    '"', '\'', '”', '’', '」', '』', '）', ')', '】', ']', '》', '〉',
];

const SHORT_SENTENCE_CHARS: usize = 10;
const MEDIUM_SENTENCE_CHARS: usize = 30;

fn is_terminal(c: char) -> bool {
    TERMINALS.contains(&c)
}

fn flush(current: &mut String, out: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    current.clear();
}

/// Split `text` into sentences, in order.
///
/// Terminal punctuation and any closing quotes after it stay attached; a run
/// of terminals (`?!`, `...`, `……`) is one boundary; a `.` between two digits
/// is part of a number. Whitespace-only pieces are dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        i += 1;

        if c == '\n' || c == '\r' {
            flush(&mut current, &mut out);
            continue;
        }
        current.push(c);
        if !is_terminal(c) {
            continue;
        }

        let decimal_point = c == '.'
            && i >= 2
            && chars[i - 2].is_ascii_digit()
            && chars.get(i).is_some_and(|n| n.is_ascii_digit());
        if decimal_point {
            continue;
        }

        while let Some(&next) = chars.get(i) {
            if is_terminal(next) || CLOSERS.contains(&next) {
                current.push(next);
                i += 1;
            } else {
                break;
            }
        }
        flush(&mut current, &mut out);
    }

    flush(&mut current, &mut out);
    out
}

/// Speed to request for `sentence`: short sentences at `base`, longer ones
/// slightly slower.
pub fn speed_for_sentence(sentence: &str, base: f32) -> f32 {
    let chars = sentence.trim().chars().count();
    if chars <= SHORT_SENTENCE_CHARS {
        base
    } else if chars <= MEDIUM_SENTENCE_CHARS {
        base * 0.95
    } else {
        base * 0.9
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn splits_mixed_punctuation() {
        assert_eq!(
            split_sentences("你好。今天天气不错！Really? Yes."),
            vec!["你好。", "今天天气不错！", "Really?", "Yes."]
        );
    }

    #[test]
    fn keeps_closing_quotes_and_runs() {
        assert_eq!(
            split_sentences("他说：“走吧！”然后呢？！……好"),
            vec!["他说：“走吧！”", "然后呢？！……", "好"]
        );
    }

    #[test]
    fn decimal_point_is_not_a_boundary() {
        assert_eq!(
            split_sentences("Pi is 3.14 roughly. Done"),
            vec!["Pi is 3.14 roughly.", "Done"]
        );
    }

    #[test]
    fn newlines_split_and_blanks_drop() {
        assert_eq!(split_sentences("line one\n\n  \nline two"), vec!["line one", "line two"]);
        assert!(split_sentences("   \n ").is_empty());
    }

    #[test]
    fn speed_slows_with_length() {
        assert_relative_eq!(speed_for_sentence("短句。", 1.0), 1.0);
        assert_relative_eq!(speed_for_sentence("这是一个中等长度的句子，用来测试。", 1.0), 0.95);
        assert_relative_eq!(speed_for_sentence(&"长".repeat(31), 1.2), 1.08, epsilon = 1e-6);
    }

    #[test]
    fn speed_thresholds_are_inclusive() {
        assert_relative_eq!(speed_for_sentence(&"a".repeat(10), 1.0), 1.0);
        assert_relative_eq!(speed_for_sentence(&"a".repeat(11), 1.0), 0.95);
        assert_relative_eq!(speed_for_sentence(&"a".repeat(30), 1.0), 0.95);
    }
}
