use async_trait::async_trait;
use serde_json::json;

use super::{classify_request_error, classify_status, Destination, DestinationConfig};
use crate::error::DeliveryError;
use crate::notify::RichNotification;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const DIVIDER: &str = "━━━━━━━━━━";

/// Telegram-style renderer: HTML message via the Bot API with an inline
/// keyboard for the action buttons.
pub struct TelegramDestination {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramDestination {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }
}

fn emoji(icon: &str) -> &'static str {
    match icon {
        "money" => "💰",
        "warning" => "⚠️",
        "chart" => "📈",
        "rocket" => "🚀",
        "new" => "✨",
        "celebration" => "🎉",
        "trophy" => "🏆",
        "cart" => "🛒",
        "hourglass" => "⏳",
        "person" => "👤",
        _ => "🎫",
    }
}

fn provider_badge(provider: &str) -> &'static str {
    match provider {
        "stripe" => "💳",
        "chargify" => "🔄",
        "shopify" => "🛍️",
        "zendesk" => "🎧",
        _ => "🔔",
    }
}

pub fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Renders the message body as Telegram HTML.
pub fn render_text(notification: &RichNotification) -> String {
    let mut lines: Vec<String> = Vec::new();

    lines.push(format!(
        "{} <b>{}</b>",
        emoji(notification.headline_icon),
        html_escape(&notification.headline)
    ));

    if let Some(insight) = &notification.insight {
        lines.push(format!(
            "{} <i>{}</i>",
            emoji(insight.icon),
            html_escape(&insight.message)
        ));
    }

    lines.push(format!(
        "{} via {}",
        provider_badge(&notification.provider),
        html_escape(&notification.provider_display)
    ));
    lines.push(String::new());

    if let Some(payment) = &notification.payment {
        lines.push(format!(
            "<b>Amount:</b> {}",
            html_escape(&payment.amount_display())
        ));
        if let Some(method) = &payment.method {
            lines.push(format!("<b>Method:</b> {}", html_escape(method)));
        }
    }

    if let Some(ticket) = &notification.ticket {
        if let Some(subject) = &ticket.subject {
            lines.push(format!("<b>Subject:</b> {}", html_escape(subject)));
        }
        if let Some(status) = &ticket.status {
            lines.push(format!("<b>Status:</b> {}", html_escape(status)));
        }
        if let Some(priority) = &ticket.priority {
            lines.push(format!("<b>Priority:</b> {}", html_escape(priority)));
        }
        if let Some(assignee) = &ticket.assignee {
            lines.push(format!("<b>Assignee:</b> {}", html_escape(assignee)));
        }
    }

    for section in &notification.detail_sections {
        lines.push(format!("<b>{}</b>", html_escape(&section.title)));
        if let Some(text) = &section.text {
            lines.push(html_escape(text));
        }
        for field in &section.fields {
            lines.push(format!(
                "<b>{}:</b> {}",
                html_escape(&field.label),
                html_escape(&field.value)
            ));
        }
    }

    lines.push(DIVIDER.to_string());

    let mut footer = vec![html_escape(&notification.customer.display_name)];
    if let Some(company) = &notification.customer.company_name {
        footer.push(html_escape(company));
    }
    if let Some(email) = &notification.customer.email {
        footer.push(html_escape(email));
    }
    if let Some(tenure) = &notification.customer.tenure_display {
        footer.push(tenure.clone());
    }
    if let Some(ltv) = &notification.customer.ltv_display {
        footer.push(format!("LTV {ltv}"));
    }
    for flag in &notification.customer.flags {
        footer.push(format!("<b>{}</b>", flag.label()));
    }
    lines.push(footer.join(" · "));

    lines.join("\n")
}

/// Inline keyboard rows, one button per row.
pub fn render_keyboard(notification: &RichNotification) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = notification
        .actions
        .iter()
        .filter(|a| !a.url.starts_with("mailto:"))
        .map(|a| json!([{ "text": a.text.clone(), "url": a.url.clone() }]))
        .collect();
    json!({ "inline_keyboard": rows })
}

#[async_trait]
impl Destination for TelegramDestination {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn accepts(&self, config: &DestinationConfig) -> bool {
        matches!(config, DestinationConfig::Telegram { .. })
    }

    async fn deliver(
        &self,
        config: &DestinationConfig,
        notification: &RichNotification,
    ) -> Result<(), DeliveryError> {
        let DestinationConfig::Telegram { bot_token, chat_id } = config else {
            return Err(DeliveryError::Terminal("not a telegram config".into()));
        };

        let url = format!("{}/bot{bot_token}/sendMessage", self.api_base);
        let body = json!({
            "chat_id": chat_id,
            "text": render_text(notification),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
            "reply_markup": render_keyboard(notification),
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_request_error("telegram", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status("telegram", status));
        }

        // The Bot API wraps errors in 200 responses with ok=false.
        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| classify_request_error("telegram", e))?;
        if parsed.get("ok").and_then(|v| v.as_bool()).unwrap_or(true) {
            tracing::debug!("telegram delivery ok");
            Ok(())
        } else {
            let description = parsed
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            Err(DeliveryError::Terminal(format!(
                "telegram rejected message: {description}"
            )))
        }
    }
}
