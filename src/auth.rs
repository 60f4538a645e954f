//! HS256 bearer-token verification. Claims are validated here, never
//! issued. Identity management is explicitly out of scope.

use crate::error::{GatewayError, Result};
use crate::model::{ClaimValue, Claims, Role};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Verifies a compact `header.payload.signature` HS256 token against
/// `secret` and returns the resulting `Claims`. Required claims are `sub`
/// (client id), `gw` (gateway id), and `exp`; every other string/string-list
/// claim passes through as a custom claim consulted by sync rules.
pub fn verify_token(token: &str, secret: &str) -> Result<Claims> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(GatewayError::Unauthenticated);
    }

    let signing_input = format!("{}.{}", parts[0], parts[1]);
    let signature = URL_SAFE_NO_PAD
        .decode(parts[2])
        .map_err(|_| GatewayError::Unauthenticated)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| GatewayError::Unauthenticated)?;
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| GatewayError::Unauthenticated)?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| GatewayError::Unauthenticated)?;
    let payload: serde_json::Value =
        serde_json::from_slice(&payload_bytes).map_err(|_| GatewayError::Unauthenticated)?;
    let payload = payload
        .as_object()
        .ok_or(GatewayError::Unauthenticated)?;

    let client_id = payload
        .get("sub")
        .and_then(|v| v.as_str())
        .ok_or(GatewayError::Unauthenticated)?
        .to_string();
    let gateway_id = payload
        .get("gw")
        .and_then(|v| v.as_str())
        .ok_or(GatewayError::Unauthenticated)?
        .to_string();
    let exp = payload
        .get("exp")
        .and_then(|v| v.as_u64())
        .ok_or(GatewayError::Unauthenticated)?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if exp < now {
        return Err(GatewayError::Unauthenticated);
    }

    let role = match payload.get("role").and_then(|v| v.as_str()) {
        Some("admin") => Role::Admin,
        _ => Role::Client,
    };

    let mut custom = BTreeMap::new();
    for (key, value) in payload.iter() {
        if matches!(key.as_str(), "sub" | "gw" | "exp" | "role" | "iat" | "nbf") {
            continue;
        }
        if let Some(s) = value.as_str() {
            custom.insert(key.clone(), ClaimValue::Single(s.to_string()));
        } else if let Some(arr) = value.as_array() {
            let items: Option<Vec<String>> =
                arr.iter().map(|v| v.as_str().map(|s| s.to_string())).collect();
            if let Some(items) = items {
                custom.insert(key.clone(), ClaimValue::List(items));
            }
        }
    }

    Ok(Claims {
        client_id,
        gateway_id,
        role,
        custom,
    })
}

/// Test/tooling helper: mints a token the same way a client SDK would,
/// without depending on one. Not used by the gateway's own verification
/// path, which never issues tokens.
#[cfg(test)]
pub fn sign_token(claims_json: &serde_json::Value, secret: &str) -> String {
    let header = serde_json::json!({"alg": "HS256", "typ": "JWT"});
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims_json).unwrap());
    let signing_input = format!("{header_b64}.{payload_b64}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(signing_input.as_bytes());
    let signature = mac.finalize().into_bytes();
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature);
    format!("{signing_input}.{signature_b64}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn future_exp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600
    }

    #[test]
    fn valid_token_round_trips_claims() {
        let secret = "test-secret";
        let token = sign_token(
            &serde_json::json!({"sub": "c1", "gw": "gw-1", "exp": future_exp(), "org": "acme"}),
            secret,
        );
        let claims = verify_token(&token, secret).unwrap();
        assert_eq!(claims.client_id, "c1");
        assert_eq!(claims.gateway_id, "gw-1");
        assert_eq!(
            claims.get("org"),
            Some(&ClaimValue::Single("acme".to_string()))
        );
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let secret = "test-secret";
        let token = sign_token(
            &serde_json::json!({"sub": "c1", "gw": "gw-1", "exp": future_exp()}),
            secret,
        );
        let wrong = verify_token(&token, "wrong-secret");
        assert!(wrong.is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = "test-secret";
        let token = sign_token(
            &serde_json::json!({"sub": "c1", "gw": "gw-1", "exp": 1}),
            secret,
        );
        assert!(verify_token(&token, secret).is_err());
    }

    #[test]
    fn missing_required_claim_is_rejected() {
        let secret = "test-secret";
        let token = sign_token(&serde_json::json!({"sub": "c1", "exp": future_exp()}), secret);
        assert!(verify_token(&token, secret).is_err());
    }

    #[test]
    fn malformed_token_is_rejected() {
        assert!(verify_token("not-a-jwt", "secret").is_err());
    }

    #[test]
    fn admin_role_claim_is_recognized() {
        let secret = "s";
        let token = sign_token(
            &serde_json::json!({"sub": "c1", "gw": "gw-1", "exp": future_exp(), "role": "admin"}),
            secret,
        );
        let claims = verify_token(&token, secret).unwrap();
        assert!(claims.is_admin());
    }
}
