use axum::Json;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Extension;

use super::{Caller, IssuedToken};
use crate::app::App;
use crate::error::{RegistryError, RegistryResult};

/// Resolve the caller of every request. Bad credentials fail here; missing
/// credentials leave an anonymous [`Caller`] for the handler to judge.
pub async fn authenticate(State(app): State<App>, mut request: Request, next: Next) -> Response {
    let caller = match app.auth() {
        None => Caller(None),
        Some(auth) => match auth.identify(request.headers()).await {
            Ok(identity) => Caller(identity),
            Err(err) => return err.into_response(),
        },
    };
    if let Some(identity) = &caller.0 {
        tracing::Span::current().record("user", identity.username.as_str());
    }
    request.extensions_mut().insert(caller);
    next.run(request).await
}

/// `GET /v2/token`: trade the credentials the middleware checked for a
/// bearer token.
pub async fn token(
    State(app): State<App>,
    Extension(caller): Extension<Caller>,
) -> RegistryResult<Json<IssuedToken>> {
    let auth = app
        .auth()
        .ok_or_else(|| RegistryError::Unsupported("authentication is disabled".into()))?;
    let identity = caller
        .0
        .ok_or_else(|| auth.unauthorized("credentials required"))?;
    tracing::debug!(username = %identity.username, "issuing token");
    Ok(Json(auth.issue(identity.user_id)?))
}

/// `DELETE /v2/token`: revoke the bearer token presented with the request.
pub async fn logout(State(app): State<App>, request: Request) -> RegistryResult<StatusCode> {
    let auth = app
        .auth()
        .ok_or_else(|| RegistryError::Unsupported("authentication is disabled".into()))?;
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .ok_or_else(|| auth.unauthorized("a bearer token is required"))?;
    let claims = auth.validate(token).await?;
    auth.revoke(&claims.jti).await?;
    Ok(StatusCode::NO_CONTENT)
}
