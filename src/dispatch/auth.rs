//! HTTP authentication modules.
//!
//! The dispatcher picks the module whose [`name`](AuthenticationModule::name)
//! matches the scheme of the `Authorization` header. The first registered
//! module is the default one: it issues the challenge when a module flagged
//! `401` without a more specific candidate.

use crate::dispatch::error::HttpError;
use crate::http::{Request, Response};
use crate::protocol::{Method, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Session key the authenticated principal is stored under.
pub const AUTH_TAG: &str = "__authtag";

/// An authentication scheme.
pub trait AuthenticationModule: Send + Sync {
    /// Scheme name in lowercase, as it appears in `Authorization`
    /// (`basic`, `digest`, ...).
    fn name(&self) -> &str;

    /// Whether `request` may only proceed once authenticated.
    fn authentication_required(&self, request: &Request) -> bool;

    /// Checks the credentials in an `Authorization` header value.
    ///
    /// Returns the principal on success, `Ok(None)` for wrong credentials,
    /// and an error for a header that cannot be parsed.
    fn authenticate(
        &self,
        header: &str,
        realm: &str,
        method: &Method,
    ) -> Result<Option<String>, HttpError>;

    /// The `WWW-Authenticate` value challenging the client.
    fn challenge(&self, realm: &str) -> String;
}

/// Turns `response` into a 401 challenge from `module`.
pub fn request_authentication(
    module: &dyn AuthenticationModule,
    realm: &str,
    response: &mut Response,
) {
    response.set_header("WWW-Authenticate", module.challenge(realm));
    response.set_reason("Authentication required.");
    response.set_status(StatusCode::UNAUTHORIZED);
}

type CredentialCheck = dyn Fn(&str, &str, &str) -> bool + Send + Sync;
type RequirePredicate = dyn Fn(&Request) -> bool + Send + Sync;

/// The `Basic` scheme (RFC 7617).
///
/// # Example
/// ```
/// use portico::dispatch::{AuthenticationModule, BasicAuthentication};
/// use portico::protocol::Method;
///
/// let auth = BasicAuthentication::new(|_realm, user, pass| user == "ada" && pass == "secret");
///
/// // "ada:secret"
/// let principal = auth
///     .authenticate("Basic YWRhOnNlY3JldA==", "portico", &Method::Get)
///     .unwrap();
/// assert_eq!(principal.as_deref(), Some("ada"));
/// ```
pub struct BasicAuthentication {
    check: Box<CredentialCheck>,
    required: Option<Box<RequirePredicate>>,
}

impl BasicAuthentication {
    /// `check(realm, user, password)` decides whether credentials are valid.
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&str, &str, &str) -> bool + Send + Sync + 'static,
    {
        Self {
            check: Box::new(check),
            required: None,
        }
    }

    /// Demands authentication for requests matching `predicate`.
    pub fn require_for<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.required = Some(Box::new(predicate));
        self
    }
}

impl AuthenticationModule for BasicAuthentication {
    fn name(&self) -> &str {
        "basic"
    }

    fn authentication_required(&self, request: &Request) -> bool {
        self.required.as_ref().is_some_and(|p| p(request))
    }

    fn authenticate(
        &self,
        header: &str,
        realm: &str,
        _method: &Method,
    ) -> Result<Option<String>, HttpError> {
        let (scheme, credentials) = header
            .split_once(' ')
            .ok_or_else(|| HttpError::bad_request("Invalid authorization header"))?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Ok(None);
        }

        let decoded = STANDARD
            .decode(credentials.trim())
            .map_err(|e| HttpError::bad_request("Invalid basic credentials").with_source(e))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| HttpError::bad_request("Invalid basic credentials").with_source(e))?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| HttpError::bad_request("Invalid basic credentials"))?;

        Ok((self.check)(realm, user, password).then(|| user.to_string()))
    }

    fn challenge(&self, realm: &str) -> String {
        format!("Basic realm=\"{}\"", realm)
    }
}

impl std::fmt::Debug for BasicAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthentication")
            .field("required", &self.required.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> BasicAuthentication {
        BasicAuthentication::new(|realm, user, pass| {
            realm == "vault" && user == "ada" && pass == "pa:ss"
        })
    }

    #[test]
    fn test_valid_credentials() {
        let header = format!("Basic {}", STANDARD.encode("ada:pa:ss"));
        let principal = auth().authenticate(&header, "vault", &Method::Get).unwrap();
        assert_eq!(principal.as_deref(), Some("ada"));
    }

    #[test]
    fn test_wrong_password_or_realm() {
        let header = format!("Basic {}", STANDARD.encode("ada:nope"));
        assert_eq!(auth().authenticate(&header, "vault", &Method::Get).unwrap(), None);

        let header = format!("Basic {}", STANDARD.encode("ada:pa:ss"));
        assert_eq!(auth().authenticate(&header, "other", &Method::Get).unwrap(), None);
    }

    #[test]
    fn test_malformed_header() {
        let err = auth()
            .authenticate("Basic !!notbase64!!", "vault", &Method::Get)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = auth()
            .authenticate(&format!("Basic {}", STANDARD.encode("nocolon")), "vault", &Method::Get)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_required_predicate() {
        let plain = auth();
        let guarded = auth().require_for(|r| r.path().starts_with("/admin"));

        let admin = Request::builder().uri("/admin/users").build();
        let public = Request::builder().uri("/").build();

        assert!(!plain.authentication_required(&admin));
        assert!(guarded.authentication_required(&admin));
        assert!(!guarded.authentication_required(&public));
    }

    #[test]
    fn test_challenge() {
        assert_eq!(auth().challenge("vault"), "Basic realm=\"vault\"");
    }
}
