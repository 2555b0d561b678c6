use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::AppError;
use crate::util;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    GooglePlay,
    AppleAppStore,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GooglePlay => write!(f, "google_play"),
            Self::AppleAppStore => write!(f, "apple_app_store"),
        }
    }
}

/// Canonical subscription lifecycle state, independent of which store
/// produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Active,
    Canceled,
    Expired,
    Paused,
    PastDue,
    Unknown,
}

/// The slice of a subscriptions row this service reads back.
#[derive(Debug, Deserialize)]
pub struct SubscriptionRow {
    #[serde(default)]
    pub purchase_token: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
}

/// Fields written back on reconciliation. `None` fields are omitted from
/// the PATCH body and leave the stored value untouched;
/// `last_verified_date` is always written.
#[derive(Debug, Default, PartialEq, Serialize)]
pub struct SubscriptionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    pub last_verified_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_sandbox: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled_date_period_end: Option<bool>,
}

impl SubscriptionUpdate {
    /// Record the reconciliation attempt without touching anything else.
    pub fn touch() -> Self {
        Self {
            last_verified_date: util::now_iso(),
            ..Default::default()
        }
    }

    /// Soft-failure downgrade: status + sandbox flag + attempt timestamp.
    pub fn downgrade(status: Status, is_sandbox: bool) -> Self {
        Self {
            status: Some(status),
            is_sandbox: Some(is_sandbox),
            last_verified_date: util::now_iso(),
            ..Default::default()
        }
    }
}

/// REST client for the external subscriptions store. Rows are addressed by
/// `purchase_token`, never by surrogate id.
#[derive(Clone)]
pub struct Db {
    base_url: String,
    service_key: String,
    client: reqwest::Client,
}

impl Db {
    pub fn new(base_url: &str, service_key: &str, client: reqwest::Client) -> Self {
        Db {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            client,
        }
    }

    fn subscriptions_url(&self) -> String {
        format!("{}/rest/v1/subscriptions", self.base_url)
    }

    /// Newest row for `(user_id, store)`, by creation time.
    pub async fn latest_subscription(
        &self,
        user_id: &str,
        store: StoreKind,
    ) -> Result<Option<SubscriptionRow>, AppError> {
        let resp = self
            .client
            .get(self.subscriptions_url())
            .query(&[
                ("user_id", format!("eq.{user_id}")),
                ("store", format!("eq.{store}")),
                ("order", "created_at.desc".to_string()),
                ("limit", "1".to_string()),
            ])
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Unexpected(format!(
                "subscription lookup returned {status}: {body}"
            )));
        }

        let mut rows: Vec<SubscriptionRow> = resp.json().await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// Conditional update keyed by purchase token. No retry; a failure is
    /// surfaced with the store's status and body.
    pub async fn update_subscription(
        &self,
        purchase_token: &str,
        update: &SubscriptionUpdate,
    ) -> Result<(), AppError> {
        let resp = self
            .client
            .patch(self.subscriptions_url())
            .query(&[("purchase_token", format!("eq.{purchase_token}"))])
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .json(update)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "subscriptions update failed");
            return Err(AppError::Persistence {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
