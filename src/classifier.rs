//! Classifier seam and the built-in keyword classifier
//!
//! The pipeline treats a classifier as a black box: it may be called more
//! than once for the same message and is not assumed to be idempotent.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;
use crate::models::{Classification, Message};

/// Assigns a vocabulary label, a confidence and a reason to a message.
/// Confidence is expected in `[0, 1]` but callers must not rely on it.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn categorise(&self, message: &Message) -> Result<Classification>;
}

/// Subject/body pattern regexes
static PATTERNS: Lazy<Patterns> = Lazy::new(|| Patterns {
    spam: Regex::new(
        r"(?i)(you have won|lottery|claim your (prize|reward)|act now|risk.free|crypto giveaway|beneficiary|wire the fee)",
    )
    .unwrap(),
    finance: Regex::new(
        r"(?i)\b(invoice|receipt|payment|statement|bank|credit card|billing|refund|transaction|tax|payroll)\b",
    )
    .unwrap(),
    marketing: Regex::new(
        r"(?i)(sale|discount|offer|deal|promo|coupon|limited time|exclusive|% off|free shipping)",
    )
    .unwrap(),
    unsubscribe: Regex::new(r"(?i)(unsubscribe|opt.?out|manage.?preferences)").unwrap(),
    updates: Regex::new(
        r"(?i)(notification|alert|reminder|verify|security|shipped|delivery|tracking|newsletter|digest|update)",
    )
    .unwrap(),
    work: Regex::new(
        r"(?i)\b(meeting|agenda|deadline|project|standup|quarterly|proposal|contract|sprint|roadmap)\b",
    )
    .unwrap(),
});

struct Patterns {
    spam: Regex,
    finance: Regex,
    marketing: Regex,
    unsubscribe: Regex,
    updates: Regex,
    work: Regex,
}

const SOCIAL_DOMAINS: &[&str] = &[
    "facebook.com",
    "facebookmail.com",
    "twitter.com",
    "x.com",
    "linkedin.com",
    "instagram.com",
    "reddit.com",
    "pinterest.com",
    "tiktok.com",
    "discord.com",
];

const PERSONAL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "outlook.com",
    "hotmail.com",
    "live.com",
    "yahoo.com",
    "icloud.com",
    "me.com",
    "proton.me",
];

const AUTOMATED_PREFIXES: &[&str] = &[
    "noreply@",
    "no-reply@",
    "donotreply@",
    "do-not-reply@",
    "notifications@",
    "notify@",
    "alerts@",
    "newsletter@",
    "updates@",
];

/// Extract the bare address from `Name <addr>` or `addr`
fn sender_address(sender: &str) -> String {
    let address = match (sender.rfind('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if start < end => &sender[start + 1..end],
        _ => sender,
    };
    address.trim().to_lowercase()
}

fn sender_domain(address: &str) -> &str {
    address.rsplit_once('@').map_or("", |(_, domain)| domain)
}

fn domain_matches(domain: &str, known: &[&str]) -> bool {
    known
        .iter()
        .any(|k| domain == *k || domain.ends_with(&format!(".{}", k)))
}

/// Deterministic keyword and sender rules
///
/// Rules are checked in priority order; the first match wins. Messages that
/// match nothing are labelled `Other` with low confidence.
#[derive(Debug, Default, Clone)]
pub struct RuleClassifier;

impl RuleClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, message: &Message) -> Classification {
        let text = format!("{}\n{}", message.subject, message.body);
        let address = sender_address(&message.sender);
        let domain = sender_domain(&address);
        let automated = AUTOMATED_PREFIXES.iter().any(|p| address.starts_with(p));

        let verdict = |label: &str, confidence: f64, reason: String| Classification {
            label: label.to_string(),
            confidence,
            reason,
        };

        if let Some(m) = PATTERNS.spam.find(&text) {
            return verdict("Spam", 0.85, format!("spam phrase '{}'", m.as_str()));
        }
        if let Some(m) = PATTERNS.finance.find(&message.subject) {
            return verdict(
                "Finance",
                0.9,
                format!("{} keyword", m.as_str().to_lowercase()),
            );
        }
        if domain_matches(domain, SOCIAL_DOMAINS) {
            return verdict("Social", 0.8, format!("social network sender {}", domain));
        }
        if let Some(m) = PATTERNS.marketing.find(&message.subject) {
            let confidence = if PATTERNS.unsubscribe.is_match(&message.body) {
                0.85
            } else {
                0.7
            };
            return verdict(
                "Promotions",
                confidence,
                format!("marketing keyword '{}'", m.as_str()),
            );
        }
        if let Some(m) = PATTERNS.finance.find(&message.body) {
            return verdict(
                "Finance",
                0.7,
                format!("{} keyword in body", m.as_str().to_lowercase()),
            );
        }
        if automated || PATTERNS.updates.is_match(&message.subject) {
            return verdict("Updates", 0.7, "automated notification".to_string());
        }
        if let Some(m) = PATTERNS.work.find(&text) {
            return verdict("Work", 0.65, format!("work keyword '{}'", m.as_str()));
        }
        if domain_matches(domain, PERSONAL_DOMAINS) {
            return verdict("Personal", 0.6, "personal mailbox sender".to_string());
        }
        verdict("Other", 0.3, "no rule matched".to_string())
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn categorise(&self, message: &Message) -> Result<Classification> {
        Ok(self.classify(message))
    }
}
