//! Final-text normalization.
//!
//! Some providers occasionally re-emit the whole assistant body inside
//! one response. Two passes over the blank-line paragraph list fix the
//! observed shapes: consecutive exact duplicates collapse, and a body
//! whose second half repeats its first half loses the second half.
//! Comparison normalizes whitespace; the retained text is the original.

/// Normalize a final assistant body. Idempotent.
pub fn normalize_final_text(text: &str) -> String {
    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.is_empty() {
        return text.trim().to_owned();
    }

    // Pass 1: drop consecutive exact duplicates.
    let mut deduped: Vec<&str> = Vec::with_capacity(paragraphs.len());
    for paragraph in paragraphs {
        if deduped
            .last()
            .is_some_and(|prev| normalized_eq(prev, paragraph))
        {
            continue;
        }
        deduped.push(paragraph);
    }

    // Pass 2: an even-length sequence whose first half equals the
    // second half keeps only the first half.
    if deduped.len() >= 2 && deduped.len() % 2 == 0 {
        let half = deduped.len() / 2;
        let halves_match = (0..half).all(|i| normalized_eq(deduped[i], deduped[half + i]));
        if halves_match {
            deduped.truncate(half);
        }
    }

    deduped.join("\n\n")
}

fn normalized_eq(a: &str, b: &str) -> bool {
    normalize_ws(a) == normalize_ws(b)
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_clean_text_through() {
        assert_eq!(normalize_final_text("Hello.\n\nWorld."), "Hello.\n\nWorld.");
        assert_eq!(normalize_final_text("single paragraph"), "single paragraph");
    }

    #[test]
    fn drops_consecutive_duplicates() {
        assert_eq!(
            normalize_final_text("Same.\n\nSame.\n\nOther."),
            "Same.\n\nOther."
        );
    }

    #[test]
    fn whitespace_differences_still_count_as_duplicates() {
        assert_eq!(
            normalize_final_text("A  B.\n\nA B.\n\nC."),
            "A  B.\n\nC."
        );
    }

    #[test]
    fn halved_body_loses_second_half() {
        // The doubled-body shape seen in the wild.
        assert_eq!(
            normalize_final_text("Hello.\n\nWorld.\n\nHello.\n\nWorld."),
            "Hello.\n\nWorld."
        );
    }

    #[test]
    fn non_matching_halves_are_kept() {
        let text = "A.\n\nB.\n\nA.\n\nC.";
        assert_eq!(normalize_final_text(text), text);
    }

    #[test]
    fn odd_length_bodies_skip_the_half_rule() {
        let text = "A.\n\nB.\n\nA.";
        assert_eq!(normalize_final_text(text), text);
    }

    #[test]
    fn is_idempotent() {
        for text in [
            "Hello.\n\nWorld.\n\nHello.\n\nWorld.",
            "Same.\n\nSame.",
            "A.\n\nB.\n\nA.\n\nC.",
            "",
            "   padded   ",
        ] {
            let once = normalize_final_text(text);
            assert_eq!(normalize_final_text(&once), once, "input: {text:?}");
        }
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(normalize_final_text(""), "");
        assert_eq!(normalize_final_text("\n\n\n\n"), "");
    }
}
