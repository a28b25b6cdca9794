//! Turns whole-text snapshots into incremental deltas.

use std::sync::LazyLock;

use regex::Regex;

/// A backslash followed by a markdown marker run to end of text: a
/// formatting token the server has not finished emitting yet.
static PARTIAL_MARKDOWN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\+[`*_~].*$").expect("partial markdown regex is valid"));

/// Strip a trailing partial-markdown artifact from a non-final snapshot.
pub fn clean_text(raw: &str) -> &str {
    match PARTIAL_MARKDOWN.find(raw) {
        Some(m) => &raw[..m.start()],
        None => raw,
    }
}

/// Byte length of the longest common prefix, cut on a char boundary.
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}

/// Suffix of `new` not yet covered by `last_sent`.
pub fn delta<'a>(last_sent: &str, new: &'a str) -> &'a str {
    if let Some(suffix) = new.strip_prefix(last_sent) {
        return suffix;
    }
    &new[common_prefix_len(last_sent, new)..]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub delta: String,
    pub text: String,
}

/// Tracks the last emitted snapshot of one text channel.
#[derive(Debug, Clone, Default)]
pub struct DeltaReconciler {
    last_sent: String,
}

impl DeltaReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sent(&self) -> &str {
        &self.last_sent
    }

    /// Reconcile one raw snapshot. `is_final` disables artifact stripping.
    pub fn reconcile(&mut self, raw: &str, is_final: bool) -> Reconciled {
        let clean = if is_final { raw } else { clean_text(raw) };
        let delta = delta(&self.last_sent, clean).to_string();
        self.last_sent = clean.to_string();
        Reconciled {
            delta,
            text: self.last_sent.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn growing_snapshots_emit_suffixes() {
        let mut r = DeltaReconciler::new();
        assert_eq!(r.reconcile("Hello", false).delta, "Hello");
        assert_eq!(r.reconcile("Hello world", false).delta, " world");
        assert_eq!(r.reconcile("Hello world", false).delta, "");
    }

    #[test]
    fn trailing_markdown_artifact_is_stripped_until_final() {
        let mut r = DeltaReconciler::new();
        let first = r.reconcile("Use the \\*", false);
        assert_eq!(first.text, "Use the ");
        let last = r.reconcile("Use the \\*", true);
        assert_eq!(last.delta, "\\*");
        assert_eq!(last.text, "Use the \\*");
    }

    #[test]
    fn clean_text_only_touches_escaped_markers() {
        assert_eq!(clean_text("plain *bold*"), "plain *bold*");
        assert_eq!(clean_text("code \\`partial"), "code ");
        assert_eq!(clean_text("a \\\\_b"), "a ");
    }

    #[test]
    fn revised_text_falls_back_to_common_prefix() {
        let mut r = DeltaReconciler::new();
        r.reconcile("The cat sat", false);
        let revised = r.reconcile("The car sat down", false);
        assert_eq!(revised.delta, "r sat down");
    }

    #[test]
    fn common_prefix_respects_char_boundaries() {
        assert_eq!(common_prefix_len("héllo", "hélp"), "hél".len());
        assert_eq!(common_prefix_len("über", "üb"), "üb".len());
        assert_eq!(common_prefix_len("", "x"), 0);
        assert_eq!(delta("日本語", "日本人"), "人");
    }

    #[test]
    fn reconstruction_law_holds() {
        let pairs = [
            ("", "abc"),
            ("abc", "abcdef"),
            ("abcdef", "abXdef"),
            ("shorter text", "short"),
            ("same", "same"),
        ];
        for (last, new) in pairs {
            let c = common_prefix_len(last, new);
            let d = delta(last, new);
            assert_eq!(format!("{}{}", &last[..c], d), new, "{last:?} -> {new:?}");
        }
    }
}
