use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::db::Status;
use crate::error::AppError;
use crate::sign::AssertionSigner;
use crate::util;

const B64URL: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;
const ASC_AUDIENCE: &str = "appstoreconnect-v1";

/// Which verification protocol a purchase token calls for.
#[derive(Debug, PartialEq)]
pub enum TokenShape {
    /// StoreKit2 JSON bundle carrying the original transaction id.
    StoreKit2 {
        original_transaction_id: String,
        product_id: Option<String>,
    },
    /// Base64 receipt for the legacy verifyReceipt endpoint.
    Receipt,
    /// Neither; only the verification attempt gets recorded.
    Invalid,
}

pub fn classify_token(token: &str) -> TokenShape {
    let trimmed = token.trim();
    if trimmed.starts_with('{') {
        if let Ok(obj) = serde_json::from_str::<Value>(trimmed) {
            let otid = obj
                .get("originalTransactionId")
                .or_else(|| obj.get("original_transaction_id"))
                .map(|v| match v {
                    Value::String(s) => s.trim().to_string(),
                    Value::Number(n) => n.to_string(),
                    _ => String::new(),
                })
                .unwrap_or_default();
            if !otid.is_empty() && otid.chars().all(|c| c.is_ascii_digit()) {
                let product_id = obj
                    .get("productId")
                    .or_else(|| obj.get("product_id"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                return TokenShape::StoreKit2 {
                    original_transaction_id: otid,
                    product_id,
                };
            }
            return TokenShape::Invalid;
        }
        // JSON-shaped but unparsable: fall through to the receipt check.
    }
    if looks_like_receipt(trimmed) {
        TokenShape::Receipt
    } else {
        TokenShape::Invalid
    }
}

fn looks_like_receipt(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('{')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=') || c.is_whitespace())
}

#[derive(Serialize)]
struct AscClaims<'a> {
    iss: &'a str,
    iat: i64,
    exp: i64,
    aud: &'a str,
    bid: &'a str,
}

/// Mint a 20-minute ES256 token for the App Store Server API. The `bid`
/// claim is always included.
pub fn mint_asc_token(config: &Config) -> Result<String, AppError> {
    let signer = AssertionSigner::es256(&config.asc_private_key_pem, &config.asc_key_id)?;
    let now = chrono::Utc::now().timestamp();
    Ok(signer.sign(&AscClaims {
        iss: &config.asc_issuer_id,
        iat: now - 5,
        exp: now + 1200,
        aud: ASC_AUDIENCE,
        bid: &config.ios_bundle_id,
    })?)
}

pub struct AscStatuses {
    pub body: Value,
    pub sandbox: bool,
}

/// Subscription-status lookup, production first, sandbox on any production
/// failure (401 included). Both failing surfaces the production error.
pub async fn fetch_subscription_statuses(
    client: &reqwest::Client,
    config: &Config,
    asc_token: &str,
    original_transaction_id: &str,
) -> Result<AscStatuses, AppError> {
    match fetch_statuses_from(client, &config.asc_prod_base, asc_token, original_transaction_id)
        .await
    {
        Ok(body) => Ok(AscStatuses {
            body,
            sandbox: false,
        }),
        Err(prod_err) => {
            warn!(otid = %original_transaction_id, "production status lookup failed, retrying sandbox");
            match fetch_statuses_from(
                client,
                &config.asc_sandbox_base,
                asc_token,
                original_transaction_id,
            )
            .await
            {
                Ok(body) => Ok(AscStatuses {
                    body,
                    sandbox: true,
                }),
                Err(_) => Err(prod_err),
            }
        }
    }
}

async fn fetch_statuses_from(
    client: &reqwest::Client,
    base: &str,
    asc_token: &str,
    original_transaction_id: &str,
) -> Result<Value, AppError> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| AppError::Unexpected(format!("bad app store base: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| AppError::Unexpected("bad app store base".into()))?
        .extend(["inApps", "v1", "subscriptions", original_transaction_id]);

    let resp = client.get(url).bearer_auth(asc_token).send().await?;
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(AppError::StoreVerification {
            source: "asc",
            status: Some(status.as_u16() as i64),
            detail: text,
        });
    }
    serde_json::from_str(&text)
        .map_err(|e| AppError::Unexpected(format!("app store response parse: {e}")))
}

/// The API is already authenticated; the JWS payload is trusted without
/// signature verification. Middle segment, base64url JSON.
pub fn decode_jws_payload(jws: &str) -> Option<Value> {
    let payload = jws.split('.').nth(1)?;
    let bytes = B64URL.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Candidate transactions out of a subscription-status response:
/// `data[0].lastTransactions[*].signedTransactionInfo`, then a bare
/// `signedTransactions` array, then the raw `data` entries.
pub fn extract_candidates(body: &Value) -> Vec<Value> {
    let mut candidates = Vec::new();
    let data = body
        .get("data")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    if let Some(transactions) = data
        .first()
        .and_then(|d| d.get("lastTransactions"))
        .and_then(|v| v.as_array())
    {
        for t in transactions {
            let jws = t
                .get("signedTransactionInfo")
                .or_else(|| t.get("signedRenewalInfo"))
                .and_then(|v| v.as_str());
            if let Some(payload) = jws.and_then(decode_jws_payload) {
                candidates.push(payload);
            }
        }
    }

    if candidates.is_empty() {
        if let Some(arr) = body.get("signedTransactions").and_then(|v| v.as_array()) {
            for jws in arr {
                if let Some(payload) = jws.as_str().and_then(decode_jws_payload) {
                    candidates.push(payload);
                }
            }
        }
    }

    if candidates.is_empty() {
        // Non-standard plaintext shape seen from some intermediaries.
        candidates = data;
    }
    candidates
}

/// Latest-expiring candidate after filtering by product id when one is
/// known. An empty pool after filtering selects nothing.
pub fn select_latest(candidates: &[Value], product_id: Option<&str>) -> Option<Value> {
    let mut pool: Vec<&Value> = match product_id {
        Some(pid) => candidates.iter().filter(|c| matches_product(c, pid)).collect(),
        None => candidates.iter().collect(),
    };
    pool.sort_by_key(|c| expiry_ms(c));
    pool.pop().cloned()
}

fn matches_product(c: &Value, pid: &str) -> bool {
    c.get("productId").and_then(|v| v.as_str()) == Some(pid)
        || c.get("product_id").and_then(|v| v.as_str()) == Some(pid)
}

pub fn expiry_ms(c: &Value) -> i64 {
    c.get("expiresDate")
        .or_else(|| c.get("expires_date_ms"))
        .map(util::to_ms)
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct AppleVerification {
    pub product_id: Option<String>,
    pub status: Status,
    pub active: bool,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// Normalize one transaction, StoreKit2 JWS payload or legacy
/// latest_receipt_info entry.
pub fn normalize_candidate(c: &Value) -> AppleVerification {
    let expires_ms = expiry_ms(c);
    let start_ms = [
        "signedDate",
        "originalPurchaseDate",
        "original_purchase_date_ms",
        "purchaseDate",
        "purchase_date_ms",
    ]
    .iter()
    .filter_map(|k| c.get(*k))
    .find(|v| !v.is_null())
    .map(util::to_ms)
    .unwrap_or(0);

    let active = expires_ms > util::now_ms();
    let canceled = ["revocationDate", "cancellation_date_ms", "revocationReason"]
        .iter()
        .any(|k| c.get(*k).is_some_and(|v| !v.is_null()));

    let status = if canceled {
        Status::Canceled
    } else if active {
        Status::Active
    } else {
        Status::Expired
    };

    AppleVerification {
        product_id: c
            .get("productId")
            .or_else(|| c.get("product_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        status,
        active,
        start_date: (start_ms > 0).then(|| util::ms_to_iso(start_ms)).flatten(),
        end_date: (expires_ms > 0).then(|| util::ms_to_iso(expires_ms)).flatten(),
    }
}

pub struct ReceiptOutcome {
    pub body: Value,
    pub sandbox: bool,
}

/// Legacy verifyReceipt call, production first; status 21007 means a
/// sandbox receipt hit production, retried once against sandbox.
pub async fn verify_receipt(
    client: &reqwest::Client,
    config: &Config,
    receipt: &str,
) -> Result<ReceiptOutcome, AppError> {
    let body = call_verify_receipt(
        client,
        &config.apple_receipt_prod_url,
        receipt,
        &config.apple_shared_secret,
    )
    .await?;

    if body.get("status").and_then(|v| v.as_i64()) == Some(21007) {
        warn!("sandbox receipt sent to production, retrying against sandbox");
        let body = call_verify_receipt(
            client,
            &config.apple_receipt_sandbox_url,
            receipt,
            &config.apple_shared_secret,
        )
        .await?;
        return Ok(ReceiptOutcome {
            body,
            sandbox: true,
        });
    }
    Ok(ReceiptOutcome {
        body,
        sandbox: false,
    })
}

async fn call_verify_receipt(
    client: &reqwest::Client,
    url: &str,
    receipt: &str,
    shared_secret: &str,
) -> Result<Value, AppError> {
    let payload = serde_json::json!({
        "receipt-data": receipt,
        "password": shared_secret,
        "exclude-old-transactions": true,
    });
    let resp = client.post(url).json(&payload).send().await?;
    Ok(resp.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fake_jws(payload: &Value) -> String {
        let seg = |v: &[u8]| B64URL.encode(v);
        format!(
            "{}.{}.{}",
            seg(b"{}"),
            seg(payload.to_string().as_bytes()),
            seg(b"sig")
        )
    }

    #[test]
    fn test_classify_storekit2_token() {
        let token = r#"{"originalTransactionId": "200001234", "productId": "premium.monthly"}"#;
        match classify_token(token) {
            TokenShape::StoreKit2 {
                original_transaction_id,
                product_id,
            } => {
                assert_eq!(original_transaction_id, "200001234");
                assert_eq!(product_id.as_deref(), Some("premium.monthly"));
            }
            other => panic!("expected StoreKit2, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_snake_case_and_numeric_otid() {
        let token = r#"{"original_transaction_id": 200001234}"#;
        assert!(matches!(
            classify_token(token),
            TokenShape::StoreKit2 { original_transaction_id, .. } if original_transaction_id == "200001234"
        ));
    }

    #[test]
    fn test_classify_json_without_usable_otid() {
        assert_eq!(
            classify_token(r#"{"originalTransactionId": "abc"}"#),
            TokenShape::Invalid
        );
        assert_eq!(classify_token(r#"{"foo": 1}"#), TokenShape::Invalid);
    }

    #[test]
    fn test_classify_broken_json_falls_through() {
        // Looks like JSON but does not parse; ends up Invalid via the
        // receipt check, not an immediate error.
        assert_eq!(classify_token("{not json"), TokenShape::Invalid);
    }

    #[test]
    fn test_classify_receipt() {
        assert_eq!(classify_token("MIIbase64receipt+/=="), TokenShape::Receipt);
        assert_eq!(classify_token("  MIIb\n64 == "), TokenShape::Receipt);
    }

    #[test]
    fn test_classify_garbage() {
        assert_eq!(classify_token("!!!"), TokenShape::Invalid);
        assert_eq!(classify_token(""), TokenShape::Invalid);
    }

    #[test]
    fn test_decode_jws_payload() {
        let payload = json!({"productId": "p1", "expiresDate": 1700000000000_i64});
        let decoded = decode_jws_payload(&fake_jws(&payload)).unwrap();
        assert_eq!(decoded, payload);

        assert!(decode_jws_payload("only-one-part").is_none());
        assert!(decode_jws_payload("a.!!!.c").is_none());
    }

    #[test]
    fn test_extract_candidates_last_transactions() {
        let body = json!({
            "data": [{
                "lastTransactions": [
                    {"signedTransactionInfo": fake_jws(&json!({"productId": "p1"}))},
                    {"signedRenewalInfo": fake_jws(&json!({"productId": "p2"}))},
                ],
            }],
        });
        let candidates = extract_candidates(&body);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0]["productId"], "p1");
    }

    #[test]
    fn test_extract_candidates_signed_transactions_fallback() {
        let body = json!({
            "signedTransactions": [fake_jws(&json!({"productId": "p1"}))],
        });
        let candidates = extract_candidates(&body);
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_extract_candidates_raw_data_fallback() {
        let body = json!({"data": [{"productId": "p1"}]});
        let candidates = extract_candidates(&body);
        assert_eq!(candidates, vec![json!({"productId": "p1"})]);
    }

    #[test]
    fn test_select_latest_max_expiry() {
        let candidates = vec![
            json!({"productId": "p1", "expiresDate": 2_000_000_000_000_i64}),
            json!({"productId": "p1", "expiresDate": 3_000_000_000_000_i64}),
            json!({"productId": "p1", "expiresDate": 1_000_000_000_000_i64}),
        ];
        let latest = select_latest(&candidates, None).unwrap();
        assert_eq!(latest["expiresDate"], 3_000_000_000_000_i64);
    }

    #[test]
    fn test_select_latest_filters_by_product() {
        let candidates = vec![
            json!({"productId": "other", "expiresDate": 9_000_000_000_000_i64}),
            json!({"product_id": "p1", "expires_date_ms": "2000000000000"}),
        ];
        let latest = select_latest(&candidates, Some("p1")).unwrap();
        assert_eq!(latest["product_id"], "p1");

        assert!(select_latest(&candidates, Some("missing")).is_none());
    }

    #[test]
    fn test_select_latest_mixed_second_and_millisecond_expiries() {
        // 10-digit seconds vs 13-digit millis of a LATER instant
        let candidates = vec![
            json!({"expiresDate": 4_000_000_000_i64}),
            json!({"expiresDate": 3_000_000_000_000_i64}),
        ];
        let latest = select_latest(&candidates, None).unwrap();
        assert_eq!(latest["expiresDate"], 4_000_000_000_i64);
    }

    #[test]
    fn test_normalize_candidate_active() {
        let future = util::now_ms() + 3_600_000;
        let v = normalize_candidate(&json!({
            "productId": "p1",
            "expiresDate": future,
            "signedDate": future - 7_200_000,
        }));
        assert!(v.active);
        assert_eq!(v.status, Status::Active);
        assert_eq!(v.product_id.as_deref(), Some("p1"));
        assert!(v.start_date.is_some());
        assert_eq!(
            util::iso_to_ms(v.end_date.as_deref().unwrap()),
            Some(future)
        );
    }

    #[test]
    fn test_normalize_candidate_revoked() {
        let future = util::now_ms() + 3_600_000;
        let v = normalize_candidate(&json!({
            "expiresDate": future,
            "revocationDate": future - 1000,
        }));
        assert_eq!(v.status, Status::Canceled);
    }

    #[test]
    fn test_normalize_candidate_expired_receipt_entry() {
        let v = normalize_candidate(&json!({
            "product_id": "p1",
            "expires_date_ms": "1000",
            "original_purchase_date_ms": "500",
        }));
        assert!(!v.active);
        assert_eq!(v.status, Status::Expired);
        assert_eq!(v.product_id.as_deref(), Some("p1"));
    }
}
