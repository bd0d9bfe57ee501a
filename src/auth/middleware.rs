use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};

use super::{gate, AuthError, Principal};
use crate::error::Error;
use crate::AppState;

/// Pull the raw token from a request. An `Authorization: Bearer` header
/// wins over the `token` query parameter; the scheme is matched
/// case-insensitively (RFC 7235 §2.1).
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() > 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        })
        .filter(|t| !t.is_empty());

    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
            .filter(|t| !t.is_empty())
    })
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let Some(token) = extract_token(req.headers(), req.uri().query()) else {
        log::warn!(
            "AUDIT DENIED method={} path={} reason=missing_token",
            method,
            path
        );
        return Err(AuthError::Missing.into());
    };

    let subject = match state.tokens.validate(&token) {
        Ok(subject) => subject,
        Err(e) => {
            log::warn!(
                "AUDIT DENIED method={} path={} reason={}",
                method,
                path,
                e
            );
            return Err(e.into());
        }
    };

    req.extensions_mut().insert(Principal {
        subject: subject.clone(),
    });

    let response = next.run(req).await;

    log::info!(
        "AUDIT principal={} method={} path={} status={}",
        subject,
        method,
        path,
        response.status().as_u16()
    );

    Ok(response)
}

/// Admin gate. Layered inside [`auth_middleware`], so a principal is always
/// present; a missing one is still treated as unauthenticated.
pub async fn admin_only(req: Request<Body>, next: Next) -> Result<Response, Error> {
    let principal = req
        .extensions()
        .get::<Principal>()
        .ok_or(AuthError::Missing)?;

    if let Err(e) = gate::require_admin(principal) {
        log::warn!(
            "AUDIT DENIED principal={} path={} reason=not_admin",
            principal.subject,
            req.uri().path()
        );
        return Err(e.into());
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", value.parse().unwrap());
        headers
    }

    #[test]
    fn nothing_supplied() {
        assert_eq!(extract_token(&HeaderMap::new(), None), None);
        assert_eq!(extract_token(&HeaderMap::new(), Some("other=1")), None);
    }

    #[test]
    fn bearer_header() {
        assert_eq!(
            extract_token(&headers("Bearer abc.def.ghi"), None),
            Some("abc.def.ghi".to_string())
        );
    }

    #[test]
    fn bearer_scheme_case_insensitive() {
        for scheme in ["bearer", "Bearer", "BEARER", "bEaReR"] {
            assert_eq!(
                extract_token(&headers(&format!("{} tok", scheme)), None),
                Some("tok".to_string()),
                "scheme '{}' must be accepted",
                scheme
            );
        }
    }

    #[test]
    fn query_parameter_fallback() {
        assert_eq!(
            extract_token(&HeaderMap::new(), Some("a=1&token=from-query")),
            Some("from-query".to_string())
        );
    }

    #[test]
    fn header_takes_precedence_over_query() {
        assert_eq!(
            extract_token(&headers("Bearer from-header"), Some("token=from-query")),
            Some("from-header".to_string())
        );
    }

    #[test]
    fn non_bearer_header_falls_back_to_query() {
        assert_eq!(
            extract_token(&headers("Basic dXNlcjpwYXNz"), Some("token=q")),
            Some("q".to_string())
        );
        assert_eq!(extract_token(&headers("Basic dXNlcjpwYXNz"), None), None);
    }

    #[test]
    fn empty_values_are_missing() {
        assert_eq!(extract_token(&headers("Bearer    "), None), None);
        assert_eq!(extract_token(&HeaderMap::new(), Some("token=")), None);
    }
}
