//! Telegram Bot API delivery — single-call `sendMessage` wrapper.
//!
//! [`RichText`] renders to message text plus a flat entity list with
//! UTF-16 offsets (the unit the Bot API counts in). Nested spans
//! become overlapping entities, so formatting survives exactly as
//! composed. No retries happen here; the fallback policy lives in the
//! orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::richtext::{RichText, Span};

/// Base URL for the Telegram Bot API.
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

// ---------------------------------------------------------------------------
// Configuration & errors
// ---------------------------------------------------------------------------

/// Telegram delivery settings.
#[derive(Clone)]
pub struct TelegramConfig {
    /// Bot API token.
    pub bot_token: String,
    /// Operator's private chat id. `None` disables delivery (the
    /// bridge logs instead of sending).
    pub chat_id: Option<i64>,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"__REDACTED__")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

/// Delivery errors.
#[derive(Debug, Error)]
pub enum SendError {
    /// The Bot API answered `ok: false`.
    #[error("Telegram API error: {0}")]
    Api(String),
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Generic Bot API response wrapper.
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    #[allow(dead_code)] // deserialized but unused for sends
    result: Option<T>,
    description: Option<String>,
}

/// One formatting entity over the message text.
///
/// `offset` and `length` are in UTF-16 code units per the Bot API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageEntity {
    /// Entity type (`bold`, `italic`, `text_link`, …).
    #[serde(rename = "type")]
    pub kind: String,
    /// Start offset in UTF-16 code units.
    pub offset: usize,
    /// Length in UTF-16 code units.
    pub length: usize,
    /// Target URL, for `text_link` entities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Language tag, for `pre` entities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
struct LinkPreviewOptions {
    is_disabled: bool,
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// A rendered message: text plus the entities that format it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedMessage {
    /// Message text.
    pub text: String,
    /// Formatting entities over `text`.
    pub entities: Vec<MessageEntity>,
}

/// Flatten a rich-text document into Bot API text and entities.
pub fn render(rich: &RichText) -> RenderedMessage {
    let mut out = RenderedMessage::default();
    let mut cursor = 0usize;
    render_spans(rich, &mut out, &mut cursor);
    out
}

fn render_spans(rich: &RichText, out: &mut RenderedMessage, cursor: &mut usize) {
    for span in rich.spans() {
        render_span(span, out, cursor);
    }
}

fn render_span(span: &Span, out: &mut RenderedMessage, cursor: &mut usize) {
    match span {
        Span::Plain(text) => push_text(text, out, cursor),
        Span::Code(text) => push_wrapped_literal("code", text, None, out, cursor),
        Span::Pre { text, language } => {
            push_wrapped_literal("pre", text, language.clone(), out, cursor);
        }
        Span::Bold(inner) => push_wrapped("bold", inner, None, out, cursor),
        Span::Italic(inner) => push_wrapped("italic", inner, None, out, cursor),
        Span::Strikethrough(inner) => push_wrapped("strikethrough", inner, None, out, cursor),
        Span::Quote(inner) => push_wrapped("blockquote", inner, None, out, cursor),
        Span::ExpandableQuote(inner) => {
            push_wrapped("expandable_blockquote", inner, None, out, cursor);
        }
        Span::Link { url, label } => {
            let offset = *cursor;
            render_spans(label, out, cursor);
            let length = cursor.saturating_sub(offset);
            if length > 0 {
                out.entities.push(MessageEntity {
                    kind: "text_link".to_string(),
                    offset,
                    length,
                    url: Some(url.clone()),
                    language: None,
                });
            }
        }
    }
}

fn push_text(text: &str, out: &mut RenderedMessage, cursor: &mut usize) {
    out.text.push_str(text);
    *cursor = cursor.saturating_add(utf16_len(text));
}

fn push_wrapped(
    kind: &str,
    inner: &RichText,
    language: Option<String>,
    out: &mut RenderedMessage,
    cursor: &mut usize,
) {
    let offset = *cursor;
    render_spans(inner, out, cursor);
    let length = cursor.saturating_sub(offset);
    // Zero-length entities are rejected by the API; skip them.
    if length > 0 {
        out.entities.push(MessageEntity {
            kind: kind.to_string(),
            offset,
            length,
            url: None,
            language,
        });
    }
}

fn push_wrapped_literal(
    kind: &str,
    text: &str,
    language: Option<String>,
    out: &mut RenderedMessage,
    cursor: &mut usize,
) {
    let offset = *cursor;
    push_text(text, out, cursor);
    let length = cursor.saturating_sub(offset);
    if length > 0 {
        out.entities.push(MessageEntity {
            kind: kind.to_string(),
            offset,
            length,
            url: None,
            language,
        });
    }
}

fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Thin `sendMessage` client. One HTTP call per send, no retries.
pub struct TelegramSender {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramSender {
    /// Create a sender for the given bot.
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Operator chat id, if configured.
    pub fn chat_id(&self) -> Option<i64> {
        self.config.chat_id
    }

    /// Send a rich document to a chat, link previews disabled.
    pub async fn send_rich(&self, chat_id: i64, rich: &RichText) -> Result<(), SendError> {
        let rendered = render(rich);
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": rendered.text,
            "entities": rendered.entities,
            "link_preview_options": LinkPreviewOptions { is_disabled: true },
        });
        self.call_send_message(&body).await?;
        debug!(chat_id, entities = rendered.entities.len(), "sent rich message");
        Ok(())
    }

    /// Send unformatted text to a chat.
    pub async fn send_plain(&self, chat_id: i64, text: &str) -> Result<(), SendError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "link_preview_options": LinkPreviewOptions { is_disabled: true },
        });
        self.call_send_message(&body).await?;
        debug!(chat_id, "sent plain message");
        Ok(())
    }

    async fn call_send_message(&self, body: &serde_json::Value) -> Result<(), SendError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            TELEGRAM_API_BASE, self.config.bot_token
        );
        let resp = self.client.post(&url).json(body).send().await?;
        let response: TelegramResponse<serde_json::Value> = resp.json().await?;
        if !response.ok {
            return Err(SendError::Api(
                response
                    .description
                    .unwrap_or_else(|| "sendMessage failed".to_string()),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(kind: &str, offset: usize, length: usize) -> MessageEntity {
        MessageEntity {
            kind: kind.to_string(),
            offset,
            length,
            url: None,
            language: None,
        }
    }

    #[test]
    fn render_plain_has_no_entities() {
        let rendered = render(&RichText::plain("hello"));
        assert_eq!(rendered.text, "hello");
        assert!(rendered.entities.is_empty());
    }

    #[test]
    fn render_bold_span_offsets() {
        let doc = RichText::plain("say ").concat(RichText::bold(RichText::plain("hi")));
        let rendered = render(&doc);
        assert_eq!(rendered.text, "say hi");
        assert_eq!(rendered.entities, vec![entity("bold", 4, 2)]);
    }

    #[test]
    fn render_nested_spans_overlap() {
        // bold( "a " + link("b") )
        let doc = RichText::bold(
            RichText::plain("a ").concat(RichText::link(
                "https://x.test/",
                RichText::plain("b"),
            )),
        );
        let rendered = render(&doc);
        assert_eq!(rendered.text, "a b");

        let link = rendered
            .entities
            .iter()
            .find(|e| e.kind == "text_link")
            .expect("link entity");
        assert_eq!((link.offset, link.length), (2, 1));
        assert_eq!(link.url.as_deref(), Some("https://x.test/"));

        let bold = rendered
            .entities
            .iter()
            .find(|e| e.kind == "bold")
            .expect("bold entity");
        assert_eq!((bold.offset, bold.length), (0, 3));
    }

    #[test]
    fn render_offsets_are_utf16() {
        // '𝄞' is outside the BMP: 4 bytes, 2 UTF-16 units, 1 char.
        let doc = RichText::plain("𝄞 ").concat(RichText::bold(RichText::plain("x")));
        let rendered = render(&doc);
        assert_eq!(rendered.entities, vec![entity("bold", 3, 1)]);
    }

    #[test]
    fn render_pre_carries_language() {
        let rendered = render(&RichText::pre("fn main() {}", Some("rust".to_string())));
        assert_eq!(rendered.entities.len(), 1);
        let e = &rendered.entities[0];
        assert_eq!(e.kind, "pre");
        assert_eq!(e.language.as_deref(), Some("rust"));
        assert_eq!(e.length, utf16_len("fn main() {}"));
    }

    #[test]
    fn render_expandable_quote() {
        let rendered = render(&RichText::expandable_quote(RichText::plain("long body")));
        assert_eq!(rendered.entities[0].kind, "expandable_blockquote");
        assert_eq!(rendered.entities[0].length, 9);
    }

    #[test]
    fn render_skips_zero_length_entities() {
        let rendered = render(&RichText::bold(RichText::new()));
        assert!(rendered.text.is_empty());
        assert!(rendered.entities.is_empty());
    }

    #[test]
    fn render_concat_matches_independent_builds() {
        // Span boundaries survive concatenation: rendering a
        // concatenated document equals rendering parts and shifting.
        let a = RichText::bold(RichText::plain("ab"));
        let b = RichText::code("cd");
        let joined = render(&a.clone().concat(b.clone()));

        let ra = render(&a);
        let rb = render(&b);
        assert_eq!(joined.text, format!("{}{}", ra.text, rb.text));
        assert_eq!(joined.entities[0], ra.entities[0]);
        let shifted = &joined.entities[1];
        assert_eq!(shifted.kind, rb.entities[0].kind);
        assert_eq!(shifted.offset, utf16_len(&ra.text));
        assert_eq!(shifted.length, rb.entities[0].length);
    }

    #[test]
    fn entity_serialization_shape() {
        let e = MessageEntity {
            kind: "text_link".to_string(),
            offset: 0,
            length: 4,
            url: Some("https://x.test/".to_string()),
            language: None,
        };
        let json = serde_json::to_value(&e).expect("serialize");
        assert_eq!(json["type"], "text_link");
        assert_eq!(json["url"], "https://x.test/");
        assert!(
            json.get("language").is_none(),
            "absent language must be omitted"
        );
    }

    #[test]
    fn config_debug_redacts_token() {
        let config = TelegramConfig {
            bot_token: "123:secret".to_string(),
            chat_id: Some(42),
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("__REDACTED__"));
        assert!(!debug.contains("secret"));
    }
}
