//! Optional bearer-token gate for the `/api` routes.
//!
//! A server started without `--auth-token` runs open. `/health` and the
//! public artifact routes are mounted outside this middleware.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::state::AppState;

pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.auth_token.as_deref() else {
        return Ok(next.run(req).await);
    };

    match bearer_token(&req) {
        Some(token) if token == expected => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn bearer_token(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_auth(value: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/api/status");
        if let Some(value) = value {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn extracts_bearer_tokens_only() {
        assert_eq!(
            bearer_token(&request_with_auth(Some("Bearer sekrit"))),
            Some("sekrit")
        );
        assert_eq!(bearer_token(&request_with_auth(Some("Basic sekrit"))), None);
        assert_eq!(bearer_token(&request_with_auth(None)), None);
    }
}
