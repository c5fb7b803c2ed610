use chrono::Datelike;
use serde::{Deserialize, Serialize};

use super::{compact_ltv, format_amount, Insight, RiskFlag};
use crate::models::{CustomerContext, EventType, NormalizedEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    TrialStarted,
    FirstPayment,
    LtvMilestone,
    Anniversary,
    PaymentGrowth,
    VipCustomer,
    RepeatedFailures,
    LargePayment,
}

#[derive(Debug, Clone)]
pub struct MilestoneConfig {
    pub ltv_milestones: Vec<f64>,
    pub payment_growth_threshold: f64,
    pub vip_ltv_threshold: f64,
    pub anniversary_months: Vec<u32>,
    pub large_payment_threshold: f64,
    pub at_risk_ltv_threshold: f64,
}

impl Default for MilestoneConfig {
    fn default() -> Self {
        Self {
            ltv_milestones: vec![1_000.0, 5_000.0, 10_000.0, 50_000.0, 100_000.0],
            payment_growth_threshold: 0.20,
            vip_ltv_threshold: 10_000.0,
            anniversary_months: vec![12, 24, 36, 48, 60],
            large_payment_threshold: 1_000.0,
            at_risk_ltv_threshold: 1_000.0,
        }
    }
}

/// Scans an event plus its customer context for the single most interesting
/// fact. Detectors run in a fixed priority order; the first hit wins.
pub struct InsightDetector {
    config: MilestoneConfig,
}

impl InsightDetector {
    pub fn new(config: MilestoneConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, event: &NormalizedEvent, customer: &CustomerContext) -> Option<Insight> {
        self.trial_started(event)
            .or_else(|| self.first_payment(event, customer))
            .or_else(|| self.ltv_milestone(event, customer))
            .or_else(|| self.anniversary(event, customer))
            .or_else(|| self.payment_growth(event, customer))
            .or_else(|| self.vip_customer(event, customer))
            .or_else(|| self.repeated_failures(event, customer))
            .or_else(|| self.large_payment(event))
    }

    pub fn risk_flags(&self, event: &NormalizedEvent, customer: &CustomerContext) -> Vec<RiskFlag> {
        let mut flags = Vec::new();
        let ltv = customer.total_spent.unwrap_or(0.0);
        if ltv >= self.config.vip_ltv_threshold {
            flags.push(RiskFlag::Vip);
        }
        let recent_failures = Self::recent_failures(customer);
        let failing_now = event.event_type == EventType::PaymentFailure;
        if (failing_now && ltv >= self.config.at_risk_ltv_threshold) || recent_failures >= 2 {
            flags.push(RiskFlag::AtRisk);
        }
        flags
    }

    fn recent_failures(customer: &CustomerContext) -> usize {
        let history = &customer.payment_history;
        let tail = history.len().saturating_sub(5);
        history[tail..].iter().filter(|p| !p.success).count()
    }

    fn successful_payments(customer: &CustomerContext) -> Vec<f64> {
        customer
            .payment_history
            .iter()
            .filter(|p| p.success)
            .map(|p| p.amount)
            .collect()
    }

    fn trial_started(&self, event: &NormalizedEvent) -> Option<Insight> {
        if event.event_type != EventType::TrialStarted {
            return None;
        }
        Some(Insight {
            kind: InsightKind::TrialStarted,
            message: "New trial signup".to_string(),
            icon: "new",
        })
    }

    fn first_payment(
        &self,
        event: &NormalizedEvent,
        customer: &CustomerContext,
    ) -> Option<Insight> {
        if event.event_type != EventType::PaymentSuccess
            && event.event_type != EventType::CheckoutCompleted
        {
            return None;
        }
        let few_orders = customer.orders_count.map_or(true, |n| n <= 1);
        let few_payments = Self::successful_payments(customer).len() <= 1;
        if few_orders && few_payments {
            Some(Insight {
                kind: InsightKind::FirstPayment,
                message: "First payment from this customer".to_string(),
                icon: "rocket",
            })
        } else {
            None
        }
    }

    fn ltv_milestone(
        &self,
        event: &NormalizedEvent,
        customer: &CustomerContext,
    ) -> Option<Insight> {
        let amount = event.amount.filter(|a| *a > 0.0)?;
        let total = customer.total_spent?;
        let before = total - amount;
        let crossed = self
            .config
            .ltv_milestones
            .iter()
            .rev()
            .find(|m| before < **m && total >= **m)?;
        Some(Insight {
            kind: InsightKind::LtvMilestone,
            message: format!("Crossed {} lifetime value", compact_ltv(*crossed)),
            icon: "celebration",
        })
    }

    fn anniversary(&self, event: &NormalizedEvent, customer: &CustomerContext) -> Option<Insight> {
        if event.event_type != EventType::PaymentSuccess
            && event.event_type != EventType::InvoicePaid
        {
            return None;
        }
        let created = customer.created_at?;
        let occurred = event.occurred_at;
        let months = (occurred.year() - created.year()) * 12
            + (occurred.month() as i32 - created.month() as i32);
        if months <= 0 {
            return None;
        }
        let months = months as u32;
        if self.config.anniversary_months.contains(&months) {
            Some(Insight {
                kind: InsightKind::Anniversary,
                message: format!("{} year customer anniversary", months / 12),
                icon: "trophy",
            })
        } else {
            None
        }
    }

    fn payment_growth(
        &self,
        event: &NormalizedEvent,
        customer: &CustomerContext,
    ) -> Option<Insight> {
        if event.event_type != EventType::PaymentSuccess {
            return None;
        }
        let amount = event.amount.filter(|a| *a > 0.0)?;
        let successes = Self::successful_payments(customer);
        if successes.len() < 3 {
            return None;
        }
        let average = successes.iter().sum::<f64>() / successes.len() as f64;
        if average <= 0.0 {
            return None;
        }
        let growth = (amount - average) / average;
        if growth >= self.config.payment_growth_threshold {
            Some(Insight {
                kind: InsightKind::PaymentGrowth,
                message: format!("+{:.0}% vs. typical payment", growth * 100.0),
                icon: "chart",
            })
        } else {
            None
        }
    }

    fn vip_customer(
        &self,
        event: &NormalizedEvent,
        customer: &CustomerContext,
    ) -> Option<Insight> {
        if event.event_type == EventType::PaymentFailure {
            return None;
        }
        let total = customer.total_spent?;
        if total >= self.config.vip_ltv_threshold {
            Some(Insight {
                kind: InsightKind::VipCustomer,
                message: format!("VIP customer ({} lifetime)", compact_ltv(total)),
                icon: "trophy",
            })
        } else {
            None
        }
    }

    fn repeated_failures(
        &self,
        event: &NormalizedEvent,
        customer: &CustomerContext,
    ) -> Option<Insight> {
        if event.event_type != EventType::PaymentFailure {
            return None;
        }
        let failures = Self::recent_failures(customer);
        if failures >= 2 {
            Some(Insight {
                kind: InsightKind::RepeatedFailures,
                message: format!("{failures} failed payments recently"),
                icon: "warning",
            })
        } else {
            None
        }
    }

    fn large_payment(&self, event: &NormalizedEvent) -> Option<Insight> {
        if event.event_type != EventType::PaymentSuccess
            && event.event_type != EventType::CheckoutCompleted
        {
            return None;
        }
        let amount = event.amount?;
        if amount >= self.config.large_payment_threshold {
            Some(Insight {
                kind: InsightKind::LargePayment,
                message: format!(
                    "Large payment: {}",
                    format_amount(amount, event.currency.as_deref().unwrap_or("USD"))
                ),
                icon: "money",
            })
        } else {
            None
        }
    }
}
