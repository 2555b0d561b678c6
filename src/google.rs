use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::db::Status;
use crate::error::AppError;
use crate::sign::AssertionSigner;
use crate::util;

const ANDROID_PUBLISHER_SCOPE: &str = "https://www.googleapis.com/auth/androidpublisher";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

#[derive(Serialize)]
struct OauthClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Mint a one-hour RS256 assertion for the service account and exchange it
/// for an OAuth2 bearer token.
pub async fn fetch_access_token(
    client: &reqwest::Client,
    config: &Config,
) -> Result<String, AppError> {
    let signer = AssertionSigner::rs256(&config.service_account.private_key)?;
    let now = chrono::Utc::now().timestamp();
    let assertion = signer.sign(&OauthClaims {
        iss: &config.service_account.client_email,
        scope: ANDROID_PUBLISHER_SCOPE,
        aud: &config.google_token_url,
        iat: now,
        exp: now + 3600,
    })?;

    let resp = client
        .post(&config.google_token_url)
        .form(&[
            ("grant_type", JWT_BEARER_GRANT),
            ("assertion", assertion.as_str()),
        ])
        .send()
        .await?;

    let body: Value = resp.json().await?;
    body.get("access_token")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| AppError::Unexpected(format!("no access_token in OAuth response: {body}")))
}

/// Look up the purchase via the Play Developer subscriptionsV2 endpoint.
pub async fn fetch_subscription(
    client: &reqwest::Client,
    config: &Config,
    access_token: &str,
    purchase_token: &str,
) -> Result<Value, AppError> {
    let mut url = reqwest::Url::parse(&config.play_api_base)
        .map_err(|e| AppError::Unexpected(format!("bad play api base: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| AppError::Unexpected("bad play api base".into()))?
        .extend([
            "androidpublisher",
            "v3",
            "applications",
            config.android_package_name.as_str(),
            "purchases",
            "subscriptionsv2",
            "tokens",
            purchase_token,
        ]);

    let resp = client.get(url).bearer_auth(access_token).send().await?;
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(AppError::StoreVerification {
            source: "google",
            status: Some(status.as_u16() as i64),
            detail: text,
        });
    }

    debug!("play verification response received");
    serde_json::from_str(&text)
        .map_err(|e| AppError::Unexpected(format!("play response parse: {e}")))
}

/// Map the store's subscription-state enum onto the canonical status set.
/// Second value: canceled but still entitled until the period end.
pub fn map_state(state: Option<&str>) -> (Status, bool) {
    match state.unwrap_or("") {
        "SUBSCRIPTION_STATE_PENDING" => (Status::Pending, false),
        "SUBSCRIPTION_STATE_ACTIVE" => (Status::Active, false),
        "SUBSCRIPTION_STATE_PAUSED" => (Status::Paused, false),
        "SUBSCRIPTION_STATE_IN_GRACE_PERIOD" | "SUBSCRIPTION_STATE_ON_HOLD" => {
            (Status::PastDue, false)
        }
        "SUBSCRIPTION_STATE_CANCELED" => (Status::Canceled, true),
        "SUBSCRIPTION_STATE_EXPIRED" => (Status::Expired, false),
        "SUBSCRIPTION_STATE_PENDING_PURCHASE_CANCELED" => (Status::Canceled, false),
        _ => (Status::Unknown, false),
    }
}

#[derive(Debug)]
pub struct PlayVerification {
    pub status: Status,
    pub canceled_period_end: bool,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub is_sandbox: bool,
}

/// Normalize a subscriptionsV2 response. Dates come from the first line
/// item, falling back to the top-level fields; `testPurchase` marks a
/// license-tester purchase.
pub fn normalize(resp: &Value) -> PlayVerification {
    let item = resp.pointer("/lineItems/0");
    let start = item
        .and_then(|i| i.get("startTime"))
        .or_else(|| resp.get("startTime"));
    let end = item
        .and_then(|i| i.get("expiryTime"))
        .or_else(|| resp.get("expiryTime"));

    let (status, canceled_period_end) =
        map_state(resp.get("subscriptionState").and_then(|v| v.as_str()));

    PlayVerification {
        status,
        canceled_period_end,
        start_date: start.and_then(util::to_iso_date),
        end_date: end.and_then(util::to_iso_date),
        is_sandbox: resp.get("testPurchase").is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_state_table() {
        let cases = [
            ("SUBSCRIPTION_STATE_PENDING", Status::Pending, false),
            ("SUBSCRIPTION_STATE_ACTIVE", Status::Active, false),
            ("SUBSCRIPTION_STATE_PAUSED", Status::Paused, false),
            ("SUBSCRIPTION_STATE_IN_GRACE_PERIOD", Status::PastDue, false),
            ("SUBSCRIPTION_STATE_ON_HOLD", Status::PastDue, false),
            ("SUBSCRIPTION_STATE_CANCELED", Status::Canceled, true),
            ("SUBSCRIPTION_STATE_EXPIRED", Status::Expired, false),
            (
                "SUBSCRIPTION_STATE_PENDING_PURCHASE_CANCELED",
                Status::Canceled,
                false,
            ),
        ];
        for (input, status, period_end) in cases {
            assert_eq!(map_state(Some(input)), (status, period_end), "{input}");
        }
    }

    #[test]
    fn test_map_state_unrecognized() {
        assert_eq!(map_state(Some("SOMETHING_NEW")), (Status::Unknown, false));
        assert_eq!(map_state(None), (Status::Unknown, false));
    }

    #[test]
    fn test_normalize_line_item_dates() {
        let resp = json!({
            "subscriptionState": "SUBSCRIPTION_STATE_ACTIVE",
            "startTime": "2024-01-01T00:00:00Z",
            "lineItems": [{"expiryTime": "2024-02-01T00:00:00Z"}],
        });
        let v = normalize(&resp);
        assert_eq!(v.status, Status::Active);
        assert!(!v.canceled_period_end);
        assert_eq!(
            crate::util::iso_to_ms(v.start_date.as_deref().unwrap()),
            Some(1_704_067_200_000)
        );
        assert_eq!(
            crate::util::iso_to_ms(v.end_date.as_deref().unwrap()),
            Some(1_706_745_600_000)
        );
        assert!(!v.is_sandbox);
    }

    #[test]
    fn test_normalize_top_level_fallback_and_sandbox() {
        let resp = json!({
            "subscriptionState": "SUBSCRIPTION_STATE_CANCELED",
            "startTime": "2024-01-01T00:00:00Z",
            "expiryTime": "2024-02-01T00:00:00Z",
            "testPurchase": {},
        });
        let v = normalize(&resp);
        assert_eq!(v.status, Status::Canceled);
        assert!(v.canceled_period_end);
        assert!(v.end_date.is_some());
        assert!(v.is_sandbox);
    }
}
