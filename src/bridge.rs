//! Bridge orchestration: Zulip DMs and inbound webhooks become
//! Telegram messages to the operator chat.
//!
//! Formatting is a pure compose step over [`RichText`], so the exact
//! message layout is testable without any network.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::markdown::{self, TranscodeOptions};
use crate::richtext::RichText;
use crate::telegram::TelegramSender;
use crate::webhook::{HookHandler, WebhookRequest};
use crate::zulip::PrivateMessage;

/// Matches Zulip mention markup, including the silent `@_**` form.
static MENTION: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a checked constant
    Regex::new(r"@_?\*\*").unwrap()
});

/// Defuse Zulip mention markup before markdown parsing.
///
/// `@**Full Name**` would otherwise render as a bold span starting
/// with `@`; inserting a space keeps the name readable while making
/// the result inert.
pub fn preprocess_mentions(content: &str) -> String {
    MENTION.replace_all(content, "@ **").into_owned()
}

/// Permalink to a message on the Zulip web client.
pub fn deep_link(site: &str, message_id: i64) -> String {
    format!("{site}#narrow/near/{message_id}")
}

/// The parts of a forwarded notification, before layout.
#[derive(Debug, Clone)]
pub struct ForwardedData {
    /// Bolded first line.
    pub header: String,
    /// Sender description, appended after `From: `.
    pub from: RichText,
    /// Other participants, joined with `, ` after `With: `.
    pub with: Vec<String>,
    /// Main payload, wrapped in an expandable quote.
    pub content: RichText,
    /// Optional permalink for the trailing link line.
    pub url: Option<String>,
}

impl ForwardedData {
    /// Lay the parts out as a single document.
    ///
    /// Shape: bold header, `From:` line, optional `With:` line, blank
    /// line, expandable-quoted content, optional link line.
    pub fn compose(&self) -> RichText {
        let mut doc = self.preamble();
        doc.push_plain("\n\n");
        doc.append(RichText::expandable_quote(self.content.clone()));
        self.push_link_line(&mut doc);
        doc
    }

    /// Layout used when the composed message could not be delivered:
    /// same envelope, an error notice instead of the content.
    pub fn compose_fallback(&self) -> RichText {
        let mut doc = self.preamble();
        doc.push_plain("\n\n");
        doc.append(RichText::bold(RichText::plain("Error:")));
        doc.push_plain(" Cannot format forwarded message");
        self.push_link_line(&mut doc);
        doc
    }

    fn preamble(&self) -> RichText {
        let mut doc = RichText::bold(RichText::plain(self.header.clone()));
        doc.push_plain("\nFrom: ");
        doc.append(self.from.clone());
        if !self.with.is_empty() {
            doc.push_plain(format!("\nWith: {}", self.with.join(", ")));
        }
        doc
    }

    fn push_link_line(&self, doc: &mut RichText) {
        if let Some(url) = &self.url {
            doc.push_plain(format!("\n\n🔗 View in Zulip: {url}"));
        }
    }
}

/// Wires the inbound sources to the Telegram sender.
pub struct Bridge {
    telegram: Arc<TelegramSender>,
    site: String,
}

impl Bridge {
    /// Create a bridge delivering to `telegram`, resolving relative
    /// Zulip links against `site`.
    pub fn new(telegram: Arc<TelegramSender>, site: String) -> Self {
        Self { telegram, site }
    }

    /// Forward one Zulip private message to the operator chat.
    ///
    /// When no chat id is configured the message is logged and
    /// dropped. A failed rich send falls back to the error-notice
    /// layout so the operator still learns a message arrived.
    pub async fn forward_private_message(&self, message: &PrivateMessage) -> anyhow::Result<()> {
        let Some(chat_id) = self.telegram.chat_id() else {
            info!(
                message_id = message.id,
                "no operator chat configured; dropping private message"
            );
            return Ok(());
        };

        let data = self.compose_private_message(message);
        if let Err(error) = self.telegram.send_rich(chat_id, &data.compose()).await {
            // The rich payload is what just failed, so the retry
            // carries no entities at all.
            warn!(%error, message_id = message.id, "rich send failed; sending plain fallback");
            self.telegram
                .send_plain(chat_id, &data.compose_fallback().to_plain_text())
                .await?;
            return Ok(());
        }
        info!(
            message_id = message.id,
            sender = %message.sender_full_name,
            "forwarded Zulip DM"
        );
        Ok(())
    }

    fn compose_private_message(&self, message: &PrivateMessage) -> ForwardedData {
        let mut from = RichText::bold(RichText::plain(message.sender_full_name.clone()));
        from.push_plain(format!(" ({})", message.sender_email));

        let with: Vec<String> = message
            .recipients
            .iter()
            .map(|r| r.full_name.clone())
            .filter(|name| name != &message.sender_full_name)
            .collect();

        let options = TranscodeOptions {
            base_url: Some(self.site.clone()),
        };
        let content = markdown::transcode(&preprocess_mentions(&message.content), &options);

        ForwardedData {
            header: "📩 Zulip DM".to_string(),
            from,
            with,
            content,
            url: Some(deep_link(&self.site, message.id)),
        }
    }

    fn compose_webhook(request: &WebhookRequest) -> ForwardedData {
        ForwardedData {
            header: "📩 Webhooks".to_string(),
            from: RichText::plain(
                request.host.clone().unwrap_or_else(|| "Unknown".to_string()),
            ),
            with: vec![request.path.clone()],
            content: RichText::code(request.body.clone()),
            url: None,
        }
    }

    /// Announce startup on the operator chat, if configured.
    pub async fn send_startup_notice(&self) -> anyhow::Result<()> {
        let Some(chat_id) = self.telegram.chat_id() else {
            warn!("no operator chat configured; skipping startup notice");
            return Ok(());
        };
        let notice = format!(
            "Bot v{} launched at {}",
            env!("CARGO_PKG_VERSION"),
            chrono::Utc::now().to_rfc3339()
        );
        self.telegram.send_plain(chat_id, &notice).await?;
        Ok(())
    }
}

#[async_trait]
impl HookHandler for Bridge {
    async fn handle(&self, request: WebhookRequest) -> anyhow::Result<()> {
        let Some(chat_id) = self.telegram.chat_id() else {
            info!(
                method = %request.method,
                path = %request.path,
                "no operator chat configured; dropping webhook"
            );
            return Ok(());
        };
        let data = Self::compose_webhook(&request);
        self.telegram.send_rich(chat_id, &data.compose()).await?;
        info!(
            method = %request.method,
            path = %request.path,
            host = request.host.as_deref().unwrap_or("Unknown"),
            "forwarded webhook"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::richtext::Span;
    use crate::telegram::render;

    #[test]
    fn mentions_are_defused() {
        assert_eq!(
            preprocess_mentions("hi @**Igor Markov** and @_**Silent One**"),
            "hi @ **Igor Markov** and @ **Silent One**"
        );
    }

    #[test]
    fn non_mention_markup_is_untouched() {
        assert_eq!(preprocess_mentions("**just bold**"), "**just bold**");
    }

    #[test]
    fn deep_link_format() {
        assert_eq!(
            deep_link("https://org.zulipchat.com", 123),
            "https://org.zulipchat.com#narrow/near/123"
        );
    }

    fn sample_data() -> ForwardedData {
        let mut from = RichText::bold(RichText::plain("Alice"));
        from.push_plain(" (alice@example.com)");
        ForwardedData {
            header: "📩 Zulip DM".to_string(),
            from,
            with: vec!["Bob".to_string()],
            content: RichText::plain("hello there"),
            url: Some("https://site#narrow/near/1".to_string()),
        }
    }

    #[test]
    fn compose_layout() {
        let rendered = render(&sample_data().compose());
        assert_eq!(
            rendered.text,
            "📩 Zulip DM\nFrom: Alice (alice@example.com)\nWith: Bob\n\nhello there\n\n🔗 View in Zulip: https://site#narrow/near/1"
        );
        let kinds: Vec<&str> = rendered.entities.iter().map(|e| e.kind.as_str()).collect();
        assert!(kinds.contains(&"bold"));
        assert!(kinds.contains(&"expandable_blockquote"));
    }

    #[test]
    fn compose_omits_empty_with_line() {
        let mut data = sample_data();
        data.with.clear();
        let rendered = render(&data.compose());
        assert!(!rendered.text.contains("With:"));
    }

    #[test]
    fn compose_omits_missing_link_line() {
        let mut data = sample_data();
        data.url = None;
        let rendered = render(&data.compose());
        assert!(!rendered.text.contains("View in Zulip"));
    }

    #[test]
    fn fallback_replaces_content_with_notice() {
        let rendered = render(&sample_data().compose_fallback());
        assert!(rendered.text.contains("Error: Cannot format forwarded message"));
        assert!(!rendered.text.contains("hello there"));
        assert!(
            rendered.text.contains("🔗 View in Zulip"),
            "link line survives the fallback"
        );
    }

    #[test]
    fn webhook_compose_uses_host_and_path() {
        let request = WebhookRequest {
            method: "POST".to_string(),
            path: "/gh/push".to_string(),
            host: Some("hooks.example.com".to_string()),
            content_type: Some("application/json".to_string()),
            user_agent: None,
            received_at: chrono::Utc::now(),
            body: "{\n  \"ok\": true\n}".to_string(),
        };
        let data = Bridge::compose_webhook(&request);
        assert_eq!(data.header, "📩 Webhooks");
        assert_eq!(data.from.to_plain_text(), "hooks.example.com");
        assert_eq!(data.with, vec!["/gh/push".to_string()]);
        assert!(matches!(data.content.spans(), [Span::Code(_)]));
    }

    #[test]
    fn webhook_compose_defaults_missing_host() {
        let request = WebhookRequest {
            method: "GET".to_string(),
            path: "/".to_string(),
            host: None,
            content_type: None,
            user_agent: None,
            received_at: chrono::Utc::now(),
            body: String::new(),
        };
        let data = Bridge::compose_webhook(&request);
        assert_eq!(data.from.to_plain_text(), "Unknown");
    }
}
