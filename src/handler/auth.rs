use crate::app::AppState;
use crate::error::ApiError;
use crate::store::Agent;
use axum::extract::FromRequestParts;
use http::request::Parts;

/// Authenticated agent identity, resolved through the injected directory.
/// Accepts a bearer header or, for WebSocket upgrades where browsers
/// cannot set headers, a `token` query parameter.
pub struct AuthAgent(pub Agent);

impl FromRequestParts<AppState> for AuthAgent {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .or_else(|| query_token(parts))
            .ok_or(ApiError::Unauthorized)?;
        let agent = state
            .agents
            .authenticate(&token)
            .await
            .ok_or(ApiError::Unauthorized)?;
        Ok(AuthAgent(agent))
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

fn query_token(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}
