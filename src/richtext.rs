//! Rich text as a flat sequence of typed, nestable spans.
//!
//! A [`RichText`] value is the bridge's internal document format:
//! the markdown transcoder produces one, and the Telegram sender
//! renders it to text plus entity offsets. Concatenation appends
//! spans without merging or splitting them, so span kinds, boundaries
//! and nesting survive any amount of composition.

/// A single formatted fragment.
///
/// Container kinds nest a full [`RichText`] so formatting can stack
/// (bold text containing a link, a quote containing a list, …).
/// Literal kinds (`Plain`, `Code`, `Pre`) carry raw text that is never
/// re-parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Span {
    /// Unformatted text.
    Plain(String),
    /// Bold wrapper.
    Bold(RichText),
    /// Italic wrapper.
    Italic(RichText),
    /// Strikethrough wrapper.
    Strikethrough(RichText),
    /// Inline monospace, literal content.
    Code(String),
    /// Preformatted block with an optional language tag.
    Pre {
        /// Literal block content.
        text: String,
        /// Declared language, if any (`None` for plain fences).
        language: Option<String>,
    },
    /// Hyperlink with a resolved absolute URL and a formatted label.
    Link {
        /// Resolved target URL.
        url: String,
        /// Link label.
        label: RichText,
    },
    /// Block quote.
    Quote(RichText),
    /// Collapsible block quote (rendered folded by the target chat).
    ExpandableQuote(RichText),
}

/// An immutable-once-built sequence of [`Span`]s.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RichText {
    spans: Vec<Span>,
}

impl RichText {
    /// Empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-span document.
    pub fn from_span(span: Span) -> Self {
        Self { spans: vec![span] }
    }

    /// Plain-text document. Empty input produces an empty span list.
    pub fn plain(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            Self::new()
        } else {
            Self::from_span(Span::Plain(text))
        }
    }

    /// Bold wrapper around existing rich text.
    pub fn bold(inner: RichText) -> Self {
        Self::from_span(Span::Bold(inner))
    }

    /// Italic wrapper around existing rich text.
    pub fn italic(inner: RichText) -> Self {
        Self::from_span(Span::Italic(inner))
    }

    /// Strikethrough wrapper around existing rich text.
    pub fn strikethrough(inner: RichText) -> Self {
        Self::from_span(Span::Strikethrough(inner))
    }

    /// Inline code span.
    pub fn code(text: impl Into<String>) -> Self {
        Self::from_span(Span::Code(text.into()))
    }

    /// Preformatted block with an optional language tag.
    pub fn pre(text: impl Into<String>, language: Option<String>) -> Self {
        Self::from_span(Span::Pre {
            text: text.into(),
            language,
        })
    }

    /// Link span with a resolved URL and a formatted label.
    pub fn link(url: impl Into<String>, label: RichText) -> Self {
        Self::from_span(Span::Link {
            url: url.into(),
            label,
        })
    }

    /// Block quote wrapper.
    pub fn quote(inner: RichText) -> Self {
        Self::from_span(Span::Quote(inner))
    }

    /// Collapsible block quote wrapper.
    pub fn expandable_quote(inner: RichText) -> Self {
        Self::from_span(Span::ExpandableQuote(inner))
    }

    /// Borrow the span sequence.
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// True when the document holds no spans.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Append another document in place. Spans are moved over
    /// verbatim; adjacent spans are never merged.
    pub fn append(&mut self, other: RichText) {
        self.spans.extend(other.spans);
    }

    /// Append a plain-text fragment. No-op for empty input.
    pub fn push_plain(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.spans.push(Span::Plain(text));
        }
    }

    /// Concatenate two documents. Associative by construction.
    pub fn concat(mut self, other: RichText) -> Self {
        self.append(other);
        self
    }

    /// Join documents with a plain-text separator between non-empty
    /// neighbours. The separator becomes its own `Plain` span, never
    /// part of an adjacent span.
    pub fn join(parts: impl IntoIterator<Item = RichText>, separator: &str) -> Self {
        let mut out = Self::new();
        for part in parts {
            if part.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_plain(separator);
            }
            out.append(part);
        }
        out
    }

    /// Flatten to unformatted text, dropping all styling. Link labels
    /// render as their text; quotes render as their content.
    pub fn to_plain_text(&self) -> String {
        let mut out = String::new();
        for span in &self.spans {
            match span {
                Span::Plain(t) | Span::Code(t) => out.push_str(t),
                Span::Pre { text, .. } => out.push_str(text),
                Span::Bold(inner)
                | Span::Italic(inner)
                | Span::Strikethrough(inner)
                | Span::Quote(inner)
                | Span::ExpandableQuote(inner) => out.push_str(&inner.to_plain_text()),
                Span::Link { label, .. } => out.push_str(&label.to_plain_text()),
            }
        }
        out
    }
}

impl From<Span> for RichText {
    fn from(span: Span) -> Self {
        Self::from_span(span)
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_is_associative() {
        let a = RichText::bold(RichText::plain("a"));
        let b = RichText::plain("b");
        let c = RichText::code("c");

        let left = a.clone().concat(b.clone()).concat(c.clone());
        let right = a.concat(b.concat(c));

        assert_eq!(left, right);
        assert_eq!(left.spans().len(), 3);
    }

    #[test]
    fn concat_never_merges_adjacent_spans() {
        let joined = RichText::plain("x").concat(RichText::plain("y"));
        // Two plain spans stay two plain spans.
        assert_eq!(
            joined.spans(),
            &[
                Span::Plain("x".to_string()),
                Span::Plain("y".to_string())
            ]
        );
    }

    #[test]
    fn join_keeps_separator_out_of_adjacent_spans() {
        let parts = vec![RichText::bold(RichText::plain("x")), RichText::plain("y")];
        let joined = RichText::join(parts, " ");

        assert_eq!(joined.spans().len(), 3);
        assert_eq!(
            joined.spans()[0],
            Span::Bold(RichText::plain("x")),
            "bold content must stay exactly \"x\""
        );
        assert_eq!(joined.spans()[1], Span::Plain(" ".to_string()));
        assert_eq!(joined.spans()[2], Span::Plain("y".to_string()));
    }

    #[test]
    fn join_skips_empty_parts() {
        let parts = vec![RichText::plain("a"), RichText::new(), RichText::plain("b")];
        let joined = RichText::join(parts, "\n");
        assert_eq!(joined.to_plain_text(), "a\nb");
        // One separator only: the empty middle part contributes nothing.
        assert_eq!(joined.spans().len(), 3);
    }

    #[test]
    fn empty_plain_is_empty_document() {
        assert!(RichText::plain("").is_empty());
        let mut doc = RichText::new();
        doc.push_plain("");
        assert!(doc.is_empty());
    }

    #[test]
    fn nesting_survives_concat() {
        let link = RichText::link("https://example.com/", RichText::plain("here"));
        let bold_link = RichText::bold(link.clone());
        let doc = RichText::plain("see ").concat(bold_link);

        let Span::Bold(inner) = &doc.spans()[1] else {
            panic!("second span should be bold");
        };
        assert_eq!(inner, &link);
    }

    #[test]
    fn to_plain_text_flattens_all_kinds() {
        let doc = RichText::bold(RichText::plain("b"))
            .concat(RichText::code("c"))
            .concat(RichText::pre("p", Some("rust".to_string())))
            .concat(RichText::link("https://x.test/", RichText::plain("l")))
            .concat(RichText::quote(RichText::plain("q")));
        assert_eq!(doc.to_plain_text(), "bcplq");
    }
}
