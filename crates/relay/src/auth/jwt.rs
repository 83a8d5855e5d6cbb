use anyhow::{anyhow, bail, Context};
use bookclub_common::types::UserIdentity;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use super::IdentityVerifier;

pub const IDENTITY_TOKEN_TTL_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityClaims {
    sub: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    avatar: Option<String>,
    iat: i64,
    exp: i64,
}

/// HS256 identity tokens shared with the platform's web tier.
#[derive(Clone)]
pub struct JwtIdentityVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_token(&self, identity: &UserIdentity) -> anyhow::Result<String> {
        self.issue_token_at(identity, current_unix_timestamp()?)
    }

    fn issue_token_at(&self, identity: &UserIdentity, issued_at: i64) -> anyhow::Result<String> {
        let claims = IdentityClaims {
            sub: identity.user_id.to_string(),
            name: identity.display_name.clone(),
            avatar: identity.avatar_ref.clone(),
            iat: issued_at,
            exp: issued_at + IDENTITY_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode identity token")
    }
}

impl IdentityVerifier for JwtIdentityVerifier {
    fn verify(&self, token: &str) -> anyhow::Result<UserIdentity> {
        let claims = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode identity token")?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .with_context(|| format!("identity token subject '{}' is not a UUID", claims.sub))?;
        let display_name = claims.name.trim();
        if display_name.is_empty() {
            bail!("identity token carries an empty display name");
        }

        Ok(UserIdentity {
            user_id,
            display_name: display_name.to_string(),
            avatar_ref: claims.avatar,
        })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, JwtIdentityVerifier, IDENTITY_TOKEN_TTL_SECONDS};
    use crate::auth::IdentityVerifier;
    use bookclub_common::types::UserIdentity;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde::Serialize;
    use uuid::Uuid;

    const TEST_SECRET: &str = "bookclub_test_secret_that_is_definitely_long_enough";

    fn reader() -> UserIdentity {
        UserIdentity {
            user_id: Uuid::new_v4(),
            display_name: "Ada".into(),
            avatar_ref: Some("avatars/ada.png".into()),
        }
    }

    #[test]
    fn issues_and_verifies_identity_tokens() {
        let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let identity = reader();

        let token = verifier.issue_token(&identity).expect("token should be issued");
        let verified = verifier.verify(&token).expect("token should verify");

        assert_eq!(verified, identity);
    }

    #[test]
    fn rejects_tampered_tokens() {
        let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = verifier.issue_token(&reader()).expect("token should be issued");
        let tampered = format!("{token}x");

        assert!(verifier.verify(&tampered).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - IDENTITY_TOKEN_TTL_SECONDS
            - 1;
        let token = verifier.issue_token_at(&reader(), issued_at).expect("token should be issued");

        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn rejects_tokens_signed_with_another_secret() {
        let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let other = JwtIdentityVerifier::new("another_secret_that_is_also_long_enough_for_hs256")
            .expect("verifier should initialize");
        let token = other.issue_token(&reader()).expect("token should be issued");

        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn rejects_non_uuid_subjects() {
        #[derive(Serialize)]
        struct Claims<'a> {
            sub: &'a str,
            name: &'a str,
            iat: i64,
            exp: i64,
        }

        let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let token = encode(
            &Header::new(Algorithm::HS256),
            &Claims { sub: "not-a-uuid", name: "Ada", iat: now, exp: now + 60 },
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(JwtIdentityVerifier::new("short").is_err());
    }
}
