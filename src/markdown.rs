//! Markdown → [`RichText`] transcoding.
//!
//! The tokenizer is `pulldown-cmark`; its event stream is first
//! assembled into a [`Token`] tree, then a recursive dispatcher maps
//! each token kind to rich-text spans. The transcoder is total: any
//! input produces *some* document, unparseable fragments degrade to
//! plain text.
//!
//! Soft line breaks are rendered as hard breaks, matching how the
//! personal chat displays forwarded messages.

use std::sync::LazyLock;

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag};
use regex::Regex;
use url::Url;

use crate::richtext::RichText;

// ── Token tree ──────────────────────────────────────────────────

/// One node of the parsed markdown tree.
///
/// One variant per token kind the dispatcher understands, plus
/// [`Token::Other`] for anything the tokenizer emits that has no
/// mapping (tables, footnotes, task markers, …).
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// `# heading` with its inline content.
    Heading {
        /// Heading depth, 1-6.
        level: u8,
        /// Inline children.
        children: Vec<Token>,
    },
    /// Paragraph of inline content.
    Paragraph(Vec<Token>),
    /// `> quote` containing block children.
    BlockQuote(Vec<Token>),
    /// Ordered or unordered list.
    List {
        /// Starting number for ordered lists, `None` for bullets.
        start: Option<u64>,
        /// One entry per list item, each holding the item's children.
        items: Vec<Vec<Token>>,
    },
    /// Fenced or indented code block.
    CodeBlock {
        /// Declared language tag, absent for plain fences.
        language: Option<String>,
        /// Literal block content.
        text: String,
    },
    /// Literal inline text.
    Text(String),
    /// `**strong**` wrapper.
    Strong(Vec<Token>),
    /// `*emphasis*` wrapper.
    Emphasis(Vec<Token>),
    /// `~~strikethrough~~` wrapper.
    Strikethrough(Vec<Token>),
    /// Inline code span, literal content.
    Code(String),
    /// Link with an unresolved href and inline label children.
    Link {
        /// Raw href as written in the source.
        href: String,
        /// Label children.
        children: Vec<Token>,
    },
    /// Image; the target format has no image span, so only the alt
    /// text (children) and URL survive.
    Image {
        /// Raw image URL.
        url: String,
        /// Alt-text children.
        children: Vec<Token>,
    },
    /// Soft or hard line break.
    Break,
    /// Raw embedded HTML, dropped by the dispatcher.
    Html,
    /// Thematic break (`---`).
    Rule,
    /// Unrecognized container; children are kept for the best-effort
    /// fallback arm.
    Other(Vec<Token>),
}

/// Pending container while assembling the event stream.
enum Frame {
    Heading(u8),
    Paragraph,
    BlockQuote,
    List(Option<u64>),
    Item,
    CodeBlock(Option<String>),
    Strong,
    Emphasis,
    Strikethrough,
    Link(String),
    Image(String),
    Other,
}

impl Frame {
    fn into_token(self, children: Vec<Token>) -> Token {
        match self {
            Frame::Heading(level) => Token::Heading { level, children },
            Frame::Paragraph => Token::Paragraph(children),
            Frame::BlockQuote => Token::BlockQuote(children),
            Frame::List(start) => Token::List {
                start,
                items: children
                    .into_iter()
                    .map(|child| match child {
                        // Items are the only legal children of a list.
                        Token::Other(inner) => inner,
                        other => vec![other],
                    })
                    .collect(),
            },
            // Items are flattened into their parent list above.
            Frame::Item => Token::Other(children),
            Frame::CodeBlock(language) => {
                let mut text = String::new();
                for child in children {
                    if let Token::Text(t) = child {
                        text.push_str(&t);
                    }
                }
                Token::CodeBlock { language, text }
            }
            Frame::Strong => Token::Strong(children),
            Frame::Emphasis => Token::Emphasis(children),
            Frame::Strikethrough => Token::Strikethrough(children),
            Frame::Link(href) => Token::Link { href, children },
            Frame::Image(url) => Token::Image { url, children },
            Frame::Other => Token::Other(children),
        }
    }
}

/// Parse markdown into a token tree.
///
/// Strikethrough is enabled on top of the CommonMark core; everything
/// the tokenizer emits that the dispatcher has no mapping for lands in
/// [`Token::Other`].
pub fn parse(markdown: &str) -> Vec<Token> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(markdown, options);

    let mut root: Vec<Token> = Vec::new();
    let mut stack: Vec<(Frame, Vec<Token>)> = Vec::new();

    let push = |root: &mut Vec<Token>, stack: &mut Vec<(Frame, Vec<Token>)>, token: Token| {
        match stack.last_mut() {
            Some((_, children)) => children.push(token),
            None => root.push(token),
        }
    };

    for event in parser {
        match event {
            Event::Start(tag) => {
                let frame = match tag {
                    Tag::Heading { level, .. } => Frame::Heading(heading_depth(level)),
                    Tag::Paragraph => Frame::Paragraph,
                    Tag::BlockQuote(_) => Frame::BlockQuote,
                    Tag::List(start) => Frame::List(start),
                    Tag::Item => Frame::Item,
                    Tag::CodeBlock(kind) => Frame::CodeBlock(match kind {
                        CodeBlockKind::Fenced(lang) if !lang.is_empty() => {
                            Some(lang.to_string())
                        }
                        _ => None,
                    }),
                    Tag::Strong => Frame::Strong,
                    Tag::Emphasis => Frame::Emphasis,
                    Tag::Strikethrough => Frame::Strikethrough,
                    Tag::Link { dest_url, .. } => Frame::Link(dest_url.to_string()),
                    Tag::Image { dest_url, .. } => Frame::Image(dest_url.to_string()),
                    _ => Frame::Other,
                };
                stack.push((frame, Vec::new()));
            }
            Event::End(_) => {
                if let Some((frame, children)) = stack.pop() {
                    let token = frame.into_token(children);
                    push(&mut root, &mut stack, token);
                }
            }
            Event::Text(text) => push(&mut root, &mut stack, Token::Text(text.to_string())),
            Event::Code(text) => push(&mut root, &mut stack, Token::Code(text.to_string())),
            Event::SoftBreak | Event::HardBreak => {
                push(&mut root, &mut stack, Token::Break);
            }
            Event::Html(_) | Event::InlineHtml(_) => {
                push(&mut root, &mut stack, Token::Html);
            }
            Event::Rule => push(&mut root, &mut stack, Token::Rule),
            // Footnote references, task markers, math — no mapping.
            _ => {}
        }
    }

    // Unclosed containers at EOF still become tokens.
    while let Some((frame, children)) = stack.pop() {
        let token = frame.into_token(children);
        match stack.last_mut() {
            Some((_, parent)) => parent.push(token),
            None => root.push(token),
        }
    }

    root
}

fn heading_depth(level: pulldown_cmark::HeadingLevel) -> u8 {
    use pulldown_cmark::HeadingLevel::*;
    match level {
        H1 => 1,
        H2 => 2,
        H3 => 3,
        H4 => 4,
        H5 => 5,
        H6 => 6,
    }
}

// ── Transcoding ─────────────────────────────────────────────────

/// Transcoding options.
#[derive(Debug, Clone, Default)]
pub struct TranscodeOptions {
    /// Base URL for resolving relative links.
    pub base_url: Option<String>,
}

/// Convert a markdown string into a rich-text document.
///
/// Pure and re-entrant; safe to call from any task. Block results are
/// concatenated with one blank line between consecutive blocks, and
/// each block terminates its own content with a line break.
pub fn transcode(markdown: &str, options: &TranscodeOptions) -> RichText {
    let blocks: Vec<RichText> = parse(markdown)
        .into_iter()
        .map(|token| convert_token(&token, options))
        .collect();
    RichText::join(blocks, "\n")
}

/// Convert a sequence of sibling tokens in document order.
///
/// Trailing whitespace is trimmed from a text token only when it is
/// the last of its siblings, so interior spacing around styled spans
/// survives verbatim.
fn convert_children(tokens: &[Token], options: &TranscodeOptions) -> RichText {
    let mut out = RichText::new();
    for (i, token) in tokens.iter().enumerate() {
        let last = i.saturating_add(1) == tokens.len();
        match token {
            Token::Text(text) if last => out.push_plain(text.trim_end()),
            _ => out.append(convert_token(token, options)),
        }
    }
    out
}

/// Dispatch one token to its rich-text mapping.
fn convert_token(token: &Token, options: &TranscodeOptions) -> RichText {
    match token {
        Token::Heading { level, children } => {
            let mut out = RichText::new();
            if *level == 1 {
                out.push_plain("\n");
            }
            out.append(RichText::bold(convert_children(children, options)));
            out.push_plain("\n");
            out
        }
        Token::Paragraph(children) => {
            let mut out = convert_children(children, options);
            out.push_plain("\n");
            out
        }
        Token::BlockQuote(children) => {
            let inner = RichText::join(
                children.iter().map(|c| {
                    trim_trailing_break(convert_token(c, options))
                }),
                "\n",
            );
            let mut out = RichText::quote(inner);
            out.push_plain("\n");
            out
        }
        Token::List { start, items } => {
            let rendered = items.iter().enumerate().map(|(i, item)| {
                let mut line = RichText::new();
                match start {
                    Some(n) => {
                        let offset = u64::try_from(i).unwrap_or(u64::MAX);
                        line.push_plain(format!("{}. ", n.saturating_add(offset)));
                    }
                    None => line.push_plain("\u{2022} "),
                }
                line.append(convert_item(item, options));
                line
            });
            let mut out = RichText::join(rendered, "\n");
            out.push_plain("\n");
            out
        }
        Token::CodeBlock { language, text } => {
            let mut out = RichText::pre(text.clone(), language.clone());
            out.push_plain("\n");
            out
        }
        Token::Text(text) => {
            // Bare text outside any trimming context.
            RichText::plain(text.clone())
        }
        Token::Strong(children) => RichText::bold(convert_children(children, options)),
        Token::Emphasis(children) => RichText::italic(convert_children(children, options)),
        Token::Strikethrough(children) => {
            RichText::strikethrough(convert_children(children, options))
        }
        Token::Code(text) => RichText::code(text.clone()),
        Token::Link { href, children } => {
            let label = convert_children(children, options);
            let url = resolve_href(href, options.base_url.as_deref());
            RichText::link(url, label)
        }
        Token::Image { url, children } => {
            // No image span in the target format: degrade to the alt
            // text, falling back to the raw URL.
            let alt = convert_children(children, options).to_plain_text();
            if alt.is_empty() {
                RichText::plain(url.clone())
            } else {
                RichText::plain(alt)
            }
        }
        Token::Break => RichText::plain("\n"),
        Token::Html => RichText::new(),
        Token::Rule => RichText::plain("---\n"),
        Token::Other(children) => convert_children(children, options),
    }
}

/// List items may hold bare inlines (tight lists) or block children
/// (loose lists); either way the item renders as a single prefixed
/// line group without a trailing break.
fn convert_item(children: &[Token], options: &TranscodeOptions) -> RichText {
    fn is_block(token: &Token) -> bool {
        matches!(
            token,
            Token::Paragraph(_)
                | Token::BlockQuote(_)
                | Token::List { .. }
                | Token::CodeBlock { .. }
                | Token::Heading { .. }
        )
    }

    // Runs of consecutive inline tokens convert together so interior
    // spacing survives; block children become their own line group.
    let mut segments: Vec<RichText> = Vec::new();
    let mut run_start = 0;
    for (i, child) in children.iter().enumerate() {
        if is_block(child) {
            if run_start < i {
                segments.push(convert_children(&children[run_start..i], options));
            }
            let segment = match child {
                Token::Paragraph(inlines) => convert_children(inlines, options),
                other => trim_trailing_break(convert_token(other, options)),
            };
            segments.push(segment);
            run_start = i.saturating_add(1);
        }
    }
    if run_start < children.len() {
        segments.push(convert_children(&children[run_start..], options));
    }
    RichText::join(segments, "\n")
}

/// Drop one trailing line-break span, if present.
fn trim_trailing_break(rich: RichText) -> RichText {
    use crate::richtext::Span;
    let mut spans: Vec<Span> = rich.spans().to_vec();
    if matches!(spans.last(), Some(Span::Plain(t)) if t == "\n") {
        spans.pop();
    }
    spans.into_iter().fold(RichText::new(), |acc, span| {
        acc.concat(RichText::from_span(span))
    })
}

// ── Link resolution ─────────────────────────────────────────────

/// Schemeless-domain pattern: `word(.word)+` optionally followed by a
/// path, port, query or fragment.
static BARE_DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
    Regex::new(r"^[\w.-]+\.[A-Za-z]{2,}(?:[/:?#].*)?$").unwrap()
});

/// Resolve a markdown href to an absolute URL.
///
/// In order: already-absolute hrefs pass through, bare domains get
/// `https://` prepended, relative references resolve against
/// `base_url` when supplied, and anything still unresolved returns
/// verbatim. Each step's parse failure falls through silently.
pub fn resolve_href(href: &str, base_url: Option<&str>) -> String {
    if let Ok(url) = Url::parse(href) {
        return url.to_string();
    }

    if BARE_DOMAIN.is_match(href) {
        if let Ok(url) = Url::parse(&format!("https://{href}")) {
            return url.to_string();
        }
    }

    if let Some(base) = base_url {
        if let Ok(resolved) = Url::parse(base).and_then(|b| b.join(href)) {
            return resolved.to_string();
        }
    }

    href.to_string()
}

// ── Tests ───────────────────────────────────────────────────────
