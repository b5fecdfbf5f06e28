//! Auth hook (spec §1, §4.7, §9): modeled as a trait returning an
//! allow/deny decision plus an optional principal, replacing the
//! callback-style hooks the system this was distilled from used.

use crate::error::AppError;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

#[derive(Debug)]
pub enum Decision {
    Allow { principal: Option<String> },
    Deny(AppError),
}

pub trait AuthHook: Send + Sync {
    /// Mutations (PUT/POST/DELETE) always require a valid credential with
    /// write scope, regardless of the stream's public flag.
    fn authorize_mutation(&self, signing_secrets: &[String], authorization: Option<&str>) -> Decision;

    /// Reads skip auth entirely when the stream is public.
    fn authorize_read(
        &self,
        public: bool,
        signing_secrets: &[String],
        authorization: Option<&str>,
    ) -> Decision {
        if public {
            return Decision::Allow { principal: None };
        }
        self.authorize_mutation(signing_secrets, authorization)
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Default hook: validates a bearer JWT against the project's signing
/// secrets (HS256), requiring a `write` scope claim for mutations.
pub struct JwtAuth;

impl JwtAuth {
    fn decode_with_any_secret(&self, token: &str, secrets: &[String]) -> Option<Claims> {
        let validation = {
            let mut v = Validation::new(Algorithm::HS256);
            v.required_spec_claims.clear();
            v.validate_exp = false;
            v
        };
        secrets.iter().find_map(|secret| {
            decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
                .ok()
                .map(|data| data.claims)
        })
    }

    fn require_scope(&self, authorization: Option<&str>, secrets: &[String], scope: &str) -> Decision {
        let Some(token) = authorization.and_then(|h| h.strip_prefix("Bearer ")) else {
            return Decision::Deny(AppError::unauthorized("missing bearer token"));
        };
        if secrets.is_empty() {
            return Decision::Deny(AppError::unauthorized("project has no signing secrets configured"));
        }
        let Some(claims) = self.decode_with_any_secret(token, secrets) else {
            return Decision::Deny(AppError::unauthorized("invalid bearer token"));
        };
        match claims.scope.as_deref() {
            Some(s) if s.split(' ').any(|part| part == scope) => {
                Decision::Allow { principal: claims.sub }
            }
            Some(_) => Decision::Deny(AppError::forbidden("token missing required scope")),
            None => Decision::Deny(AppError::forbidden("token carries no scope claim")),
        }
    }
}

impl AuthHook for JwtAuth {
    fn authorize_mutation(&self, signing_secrets: &[String], authorization: Option<&str>) -> Decision {
        self.require_scope(authorization, signing_secrets, "write")
    }

    fn authorize_read(
        &self,
        public: bool,
        signing_secrets: &[String],
        authorization: Option<&str>,
    ) -> Decision {
        if public {
            return Decision::Allow { principal: None };
        }
        self.require_scope(authorization, signing_secrets, "read")
    }
}

/// Allow-all hook used by tests and by deployments that delegate all auth
/// to a fronting proxy.
pub struct NullAuth;

impl AuthHook for NullAuth {
    fn authorize_mutation(&self, _signing_secrets: &[String], _authorization: Option<&str>) -> Decision {
        Decision::Allow { principal: None }
    }

    fn authorize_read(&self, _public: bool, _signing_secrets: &[String], _authorization: Option<&str>) -> Decision {
        Decision::Allow { principal: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_with_scope(secret: &str, scope: &str) -> String {
        #[derive(serde::Serialize)]
        struct C<'a> {
            sub: &'a str,
            scope: &'a str,
        }
        encode(&Header::new(Algorithm::HS256), &C { sub: "user-1", scope }, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn jwt_auth_allows_matching_scope() {
        let hook = JwtAuth;
        let secrets = vec!["topsecret".to_owned()];
        let token = token_with_scope("topsecret", "write");
        let header = format!("Bearer {token}");
        match hook.authorize_mutation(&secrets, Some(&header)) {
            Decision::Allow { principal } => assert_eq!(principal, Some("user-1".to_owned())),
            other => panic!("expected Allow, got {other:?}"),
        }
    }

    #[test]
    fn jwt_auth_denies_wrong_scope() {
        let hook = JwtAuth;
        let secrets = vec!["topsecret".to_owned()];
        let token = token_with_scope("topsecret", "read");
        let header = format!("Bearer {token}");
        assert!(matches!(hook.authorize_mutation(&secrets, Some(&header)), Decision::Deny(_)));
    }

    #[test]
    fn jwt_auth_denies_missing_token() {
        let hook = JwtAuth;
        assert!(matches!(hook.authorize_mutation(&["s".to_owned()], None), Decision::Deny(_)));
    }

    #[test]
    fn public_reads_skip_auth_entirely() {
        let hook = JwtAuth;
        assert!(matches!(
            hook.authorize_read(true, &[], None),
            Decision::Allow { principal: None }
        ));
    }

    #[test]
    fn null_auth_always_allows() {
        let hook = NullAuth;
        assert!(matches!(hook.authorize_mutation(&[], None), Decision::Allow { .. }));
        assert!(matches!(hook.authorize_read(false, &[], None), Decision::Allow { .. }));
    }
}
