use async_trait::async_trait;
use serde_json::{json, Value};

use super::{classify_request_error, classify_status, Destination, DestinationConfig};
use crate::error::DeliveryError;
use crate::notify::{RichNotification, Severity};

pub const MAX_LIST_LINES: usize = 5;

/// Slack-style Block Kit renderer delivering through an incoming webhook.
pub struct SlackDestination {
    client: reqwest::Client,
}

impl SlackDestination {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn emoji(icon: &str) -> &'static str {
    match icon {
        "money" => ":moneybag:",
        "warning" => ":warning:",
        "chart" => ":chart_with_upwards_trend:",
        "rocket" => ":rocket:",
        "new" => ":sparkles:",
        "celebration" => ":tada:",
        "trophy" => ":trophy:",
        "cart" => ":shopping_trolley:",
        "hourglass" => ":hourglass_flowing_sand:",
        "person" => ":bust_in_silhouette:",
        _ => ":ticket:",
    }
}

/// Escapes the three characters Slack's mrkdwn treats specially.
pub fn mrkdwn_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Caps a multi-line list at `MAX_LIST_LINES`, appending "+N more".
fn cap_lines(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= MAX_LIST_LINES {
        return text.to_string();
    }
    let mut capped: Vec<String> = lines[..MAX_LIST_LINES]
        .iter()
        .map(|l| l.to_string())
        .collect();
    capped.push(format!("+{} more", lines.len() - MAX_LIST_LINES));
    capped.join("\n")
}

/// Renders the full webhook payload: `{"blocks": [...], "attachments": ...}`.
pub fn render(notification: &RichNotification) -> Value {
    let mut blocks: Vec<Value> = Vec::new();

    blocks.push(json!({
        "type": "header",
        "text": {
            "type": "plain_text",
            "text": format!(
                "{} {}",
                emoji(notification.headline_icon),
                notification.headline
            ),
            "emoji": true
        }
    }));

    if let Some(insight) = &notification.insight {
        blocks.push(json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!(
                    "{} _{}_",
                    emoji(insight.icon),
                    mrkdwn_escape(&insight.message)
                )
            }
        }));
    }

    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": format!("via *{}*", mrkdwn_escape(&notification.provider_display))
        }]
    }));

    if let Some(payment) = &notification.payment {
        let mut fields = vec![json!({
            "type": "mrkdwn",
            "text": format!("*Amount:*\n{}", mrkdwn_escape(&payment.amount_display()))
        })];
        if let Some(method) = &payment.method {
            fields.push(json!({
                "type": "mrkdwn",
                "text": format!("*Method:*\n{}", mrkdwn_escape(method))
            }));
        }
        blocks.push(json!({"type": "section", "fields": fields}));
    }

    if let Some(ticket) = &notification.ticket {
        let mut fields = Vec::new();
        if let Some(subject) = &ticket.subject {
            fields.push(json!({
                "type": "mrkdwn",
                "text": format!("*Subject:*\n{}", mrkdwn_escape(subject))
            }));
        }
        if let Some(status) = &ticket.status {
            fields.push(json!({
                "type": "mrkdwn",
                "text": format!("*Status:*\n{}", mrkdwn_escape(status))
            }));
        }
        if let Some(priority) = &ticket.priority {
            fields.push(json!({
                "type": "mrkdwn",
                "text": format!("*Priority:*\n{}", mrkdwn_escape(priority))
            }));
        }
        if let Some(assignee) = &ticket.assignee {
            fields.push(json!({
                "type": "mrkdwn",
                "text": format!("*Assignee:*\n{}", mrkdwn_escape(assignee))
            }));
        }
        if !fields.is_empty() {
            blocks.push(json!({"type": "section", "fields": fields}));
        }
    }

    for section in &notification.detail_sections {
        if let Some(text) = &section.text {
            blocks.push(json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!(
                        "*{}*\n{}",
                        mrkdwn_escape(&section.title),
                        mrkdwn_escape(&cap_lines(text))
                    )
                }
            }));
        }
        if !section.fields.is_empty() {
            let fields: Vec<Value> = section
                .fields
                .iter()
                .take(10)
                .map(|f| {
                    json!({
                        "type": "mrkdwn",
                        "text": format!(
                            "*{}:*\n{}",
                            mrkdwn_escape(&f.label),
                            mrkdwn_escape(&f.value)
                        )
                    })
                })
                .collect();
            blocks.push(json!({"type": "section", "fields": fields}));
        }
    }

    blocks.push(json!({"type": "divider"}));

    let mut footer_parts = vec![mrkdwn_escape(&notification.customer.display_name)];
    if let Some(company) = &notification.customer.company_name {
        footer_parts.push(mrkdwn_escape(company));
    }
    if let Some(email) = &notification.customer.email {
        footer_parts.push(mrkdwn_escape(email));
    }
    if let Some(tenure) = &notification.customer.tenure_display {
        footer_parts.push(tenure.clone());
    }
    if let Some(ltv) = &notification.customer.ltv_display {
        footer_parts.push(format!("LTV {ltv}"));
    }
    for flag in &notification.customer.flags {
        footer_parts.push(format!("*{}*", flag.label()));
    }
    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": footer_parts.join(" · ")
        }]
    }));

    if !notification.actions.is_empty() {
        let elements: Vec<Value> = notification
            .actions
            .iter()
            .map(|a| {
                let mut button = json!({
                    "type": "button",
                    "text": {"type": "plain_text", "text": a.text.clone(), "emoji": true},
                    "url": a.url.clone()
                });
                if let Some(style) = a.style {
                    button["style"] = json!(style);
                }
                button
            })
            .collect();
        blocks.push(json!({"type": "actions", "elements": elements}));
    }

    json!({
        "blocks": blocks,
        "attachments": [{
            "color": severity_color(notification.severity),
            "blocks": []
        }]
    })
}

fn severity_color(severity: Severity) -> &'static str {
    severity.color()
}

#[async_trait]
impl Destination for SlackDestination {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn accepts(&self, config: &DestinationConfig) -> bool {
        matches!(config, DestinationConfig::Slack { .. })
    }

    async fn deliver(
        &self,
        config: &DestinationConfig,
        notification: &RichNotification,
    ) -> Result<(), DeliveryError> {
        let DestinationConfig::Slack { webhook_url } = config else {
            return Err(DeliveryError::Terminal("not a slack config".into()));
        };

        let response = self
            .client
            .post(webhook_url)
            .json(&render(notification))
            .send()
            .await
            .map_err(|e| classify_request_error("slack", e))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(status = %status, "slack delivery ok");
            Ok(())
        } else {
            Err(classify_status("slack", status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CustomerContext, EventType, NormalizedEvent};
    use crate::notify::{Composer, InsightDetector, MilestoneConfig};
    use chrono::{TimeZone, Utc};

    fn sample() -> RichNotification {
        let composer = Composer::new(InsightDetector::new(MilestoneConfig::default()));
        let mut event = NormalizedEvent::new(
            "acme",
            "stripe",
            EventType::PaymentSuccess,
            "evt_1",
            Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
        );
        event.customer_id = Some("cus_1".into());
        event.amount = Some(299.0);
        event.currency = Some("USD".into());
        let customer = CustomerContext {
            email: Some("a&b@acme.io".into()),
            first_name: Some("Ana".into()),
            company_name: Some("Tilde <&> Co".into()),
            total_spent: Some(7_120.0),
            ..Default::default()
        };
        composer.compose(&event, &customer)
    }

    #[test]
    fn renders_header_first_and_color() {
        let payload = render(&sample());
        let blocks = payload["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "header");
        assert!(blocks[0]["text"]["text"]
            .as_str()
            .unwrap()
            .contains("Payment received"));
        assert_eq!(payload["attachments"][0]["color"], "#36a64f");
    }

    #[test]
    fn escapes_mrkdwn_in_footer() {
        let payload = render(&sample());
        let text = payload.to_string();
        assert!(text.contains("Tilde &lt;&amp;&gt; Co"));
        assert!(!text.contains("Tilde <&> Co"));
    }

    #[test]
    fn caps_long_lists() {
        let long = (1..=8)
            .map(|i| format!("{i}x Widget"))
            .collect::<Vec<_>>()
            .join("\n");
        let capped = cap_lines(&long);
        assert_eq!(capped.lines().count(), MAX_LIST_LINES + 1);
        assert!(capped.ends_with("+3 more"));
    }

    #[test]
    fn actions_render_as_buttons() {
        let note = sample();
        assert!(!note.actions.is_empty());
        let payload = render(&note);
        let blocks = payload["blocks"].as_array().unwrap();
        let actions = blocks.last().unwrap();
        assert_eq!(actions["type"], "actions");
        assert_eq!(actions["elements"][0]["type"], "button");
    }
}
