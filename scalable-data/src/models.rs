//! Campaign and activity records served by the data layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Campaign lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Completed,
}

/// A backlink campaign row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    /// Campaign identifier
    pub id: String,

    /// Owning user
    pub user_id: String,

    pub name: String,

    #[serde(default)]
    pub status: CampaignStatus,

    /// Links posted so far
    #[serde(default)]
    pub links_built: u64,

    /// Posted links verified as live
    #[serde(default)]
    pub links_live: u64,

    pub created_at: DateTime<Utc>,
}

/// Aggregate campaign numbers for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub user_id: String,
    pub total_campaigns: usize,
    pub active_campaigns: usize,
    pub links_built: u64,
    pub links_live: u64,

    /// Live links as a percentage of built links
    pub success_rate: f64,

    pub computed_at: DateTime<Utc>,
}

impl CampaignStats {
    /// Aggregate a user's campaigns
    pub fn from_campaigns(user_id: &str, campaigns: &[Campaign]) -> Self {
        let links_built: u64 = campaigns.iter().map(|c| c.links_built).sum();
        let links_live: u64 = campaigns.iter().map(|c| c.links_live).sum();

        Self {
            user_id: user_id.to_string(),
            total_campaigns: campaigns.len(),
            active_campaigns: campaigns
                .iter()
                .filter(|c| c.status == CampaignStatus::Active)
                .count(),
            links_built,
            links_live,
            success_rate: if links_built > 0 {
                links_live as f64 / links_built as f64 * 100.0
            } else {
                0.0
            },
            computed_at: Utc::now(),
        }
    }
}

/// Stage of URL processing an activity refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Discovery,
    Processing,
    Posting,
    Verification,
    Error,
}

/// One entry in a campaign's URL activity feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlActivity {
    pub id: String,
    pub campaign_id: String,
    pub event_type: ActivityType,
    pub url: String,
    pub domain: String,
    pub status: String,

    #[serde(default)]
    pub message: String,

    pub timestamp: DateTime<Utc>,

    /// Free-form details (response codes, anchor text, ...)
    #[serde(default)]
    pub data: serde_json::Value,
}

impl UrlActivity {
    /// New activity stamped now, with a fresh id and the domain taken from `url`
    pub fn new(campaign_id: &str, event_type: ActivityType, url: &str, status: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            campaign_id: campaign_id.to_string(),
            event_type,
            url: url.to_string(),
            domain: domain_of(url),
            status: status.to_string(),
            message: String::new(),
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Host part of a URL, lowercased, without scheme, credentials, or port.
/// IPv6 literals come back without their brackets.
pub fn domain_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = match host.strip_prefix('[') {
        Some(bracketed) => bracketed.split(']').next().unwrap_or(bracketed),
        None => host.split(':').next().unwrap_or(host),
    };
    host.to_ascii_lowercase()
}

/// Partial campaign update merged into the `campaigns` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsUpdate {
    #[serde(rename = "id")]
    pub campaign_id: String,

    pub user_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub links_built: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub links_live: Option<u64>,

    pub updated_at: DateTime<Utc>,
}

impl AnalyticsUpdate {
    pub fn new(campaign_id: &str, user_id: &str) -> Self {
        Self {
            campaign_id: campaign_id.to_string(),
            user_id: user_id.to_string(),
            links_built: None,
            links_live: None,
            updated_at: Utc::now(),
        }
    }

    pub fn links_built(mut self, count: u64) -> Self {
        self.links_built = Some(count);
        self
    }

    pub fn links_live(mut self, count: u64) -> Self {
        self.links_live = Some(count);
        self
    }
}
