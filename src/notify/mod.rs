use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EventCategory, EventType};

pub mod builder;
pub mod insights;

pub use builder::Composer;
pub use insights::{InsightDetector, InsightKind, MilestoneConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Attachment bar color in the Slack-style renderer.
    pub fn color(&self) -> &'static str {
        match self {
            Severity::Success => "#36a64f",
            Severity::Info => "#439fe0",
            Severity::Warning => "#f2c744",
            Severity::Error => "#d72b3f",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    Vip,
    AtRisk,
}

impl RiskFlag {
    pub fn label(&self) -> &'static str {
        match self {
            RiskFlag::Vip => "VIP",
            RiskFlag::AtRisk => "At risk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Quarterly,
    Annual,
    Weekly,
    Daily,
}

impl BillingInterval {
    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "monthly" => Some(BillingInterval::Monthly),
            "quarterly" => Some(BillingInterval::Quarterly),
            "annual" => Some(BillingInterval::Annual),
            "weekly" => Some(BillingInterval::Weekly),
            "daily" => Some(BillingInterval::Daily),
            _ => None,
        }
    }

    pub fn periods_per_year(&self) -> f64 {
        match self {
            BillingInterval::Monthly => 12.0,
            BillingInterval::Quarterly => 4.0,
            BillingInterval::Annual => 1.0,
            BillingInterval::Weekly => 52.0,
            BillingInterval::Daily => 365.0,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "/mo",
            BillingInterval::Quarterly => "/qtr",
            BillingInterval::Annual => "/yr",
            BillingInterval::Weekly => "/wk",
            BillingInterval::Daily => "/day",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentBlock {
    pub amount: f64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub is_recurring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_interval: Option<BillingInterval>,
}

impl PaymentBlock {
    /// Annualized run rate, only meaningful for recurring payments.
    pub fn arr(&self) -> Option<f64> {
        let interval = self.billing_interval?;
        if !self.is_recurring {
            return None;
        }
        Some(self.amount * interval.periods_per_year())
    }

    /// "$299.00/mo = $3,588 ARR" for recurring payments, "$149.95" otherwise.
    pub fn amount_display(&self) -> String {
        let base = format_amount(self.amount, &self.currency);
        match (self.billing_interval, self.arr()) {
            (Some(interval), Some(arr)) => format!(
                "{base}{} = {} ARR",
                interval.suffix(),
                format_amount_whole(arr, &self.currency)
            ),
            _ => base,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketBlock {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerBlock {
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    /// "Since Mar 2024"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenure_display: Option<String>,
    /// "$7.1k"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ltv_display: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<RiskFlag>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Insight {
    pub kind: InsightKind,
    pub message: String,
    pub icon: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailField {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailSection {
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<DetailField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionButton {
    pub text: String,
    pub url: String,
    /// "primary" or "danger"; renderers fall back to default styling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<&'static str>,
}

/// Renderer-agnostic notification. Destination renderers turn this into
/// Block Kit blocks or Telegram HTML without re-deriving any business facts.
#[derive(Debug, Clone, Serialize)]
pub struct RichNotification {
    pub event_type: EventType,
    pub category: EventCategory,
    pub severity: Severity,
    pub headline: String,
    /// Logical icon name; each renderer maps it to its own emoji set.
    pub headline_icon: &'static str,
    pub provider: String,
    pub provider_display: String,
    pub customer: CustomerBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insight: Option<Insight>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<TicketBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detail_sections: Vec<DetailSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionButton>,
}

pub fn format_amount(amount: f64, currency: &str) -> String {
    let symbol = currency_symbol(currency);
    format!("{symbol}{}", group_thousands(&format!("{amount:.2}")))
}

/// Whole-unit formatting with thousands separators, used for ARR.
pub fn format_amount_whole(amount: f64, currency: &str) -> String {
    let symbol = currency_symbol(currency);
    format!("{symbol}{}", group_thousands(&format!("{:.0}", amount.round())))
}

fn currency_symbol(currency: &str) -> &str {
    match currency {
        "USD" | "" => "$",
        "EUR" => "€",
        "GBP" => "£",
        _ => "$",
    }
}

fn group_thousands(digits: &str) -> String {
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };
    let mut grouped = String::new();
    let chars: Vec<char> = int_part.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }
    match frac_part {
        Some(f) => format!("{grouped}.{f}"),
        None => grouped,
    }
}

/// "$7.1k" style lifetime value.
pub fn compact_ltv(amount: f64) -> String {
    if amount >= 1_000_000.0 {
        format!("${:.1}M", amount / 1_000_000.0)
    } else if amount >= 1_000.0 {
        format!("${:.1}k", amount / 1_000.0)
    } else {
        format!("${amount:.0}")
    }
}

pub fn tenure_display(created_at: DateTime<Utc>) -> String {
    format!("Since {}", created_at.format("%b %Y"))
}
