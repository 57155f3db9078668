//! Who may do what to a repository.

use crate::app::App;
use crate::auth::Caller;
use crate::config::Visibility;
use crate::dal::{namespaces, repositories};
use crate::error::{RegistryError, RegistryResult};

/// What a request does to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Pull,
    Push,
    Delete,
}

/// With authentication off everything is allowed. Otherwise any signed-in
/// user may pull and push, anonymous callers may pull public repositories,
/// and deleting needs the admin role.
pub(crate) async fn authorize(
    app: &App,
    caller: &Caller,
    name: &str,
    action: Action,
) -> RegistryResult<()> {
    let Some(auth) = app.auth() else {
        return Ok(());
    };
    match (&caller.0, action) {
        (Some(identity), Action::Delete) if !identity.is_admin() => Err(RegistryError::Denied(
            format!("{} may not delete from {name}", identity.username),
        )),
        (Some(_), _) => Ok(()),
        (None, Action::Pull) if is_public(app, name).await? => Ok(()),
        (None, _) => Err(auth.unauthorized("authentication required")),
    }
}

/// A repository is public if it says so, or if it doesn't exist yet and its
/// namespace is public.
async fn is_public(app: &App, name: &str) -> RegistryResult<bool> {
    let mut conn = app.dal().acquire().await?;
    if let Some(repo) = repositories::find_by_name(&mut conn, name).await? {
        return Ok(Visibility::from_column(&repo.visibility) == Visibility::Public);
    }
    let namespace = name.split('/').next().unwrap_or(name);
    Ok(namespaces::find_by_name(&mut conn, namespace)
        .await?
        .is_some_and(|ns| ns.visibility() == Visibility::Public))
}
