//! Registry users.

use sqlx::AnyConnection;

use super::{DalError, DalResult, now_ms};

/// A user row. `password_hash` is a PHC string.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub email: Option<String>,
    pub role: String,
    pub last_login: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

const COLUMNS: &str =
    "id, username, password_hash, email, role, last_login, created_at, updated_at";

/// Insert a user.
pub async fn create(
    conn: &mut AnyConnection,
    username: &str,
    password_hash: &str,
    email: Option<&str>,
    role: &str,
) -> DalResult<User> {
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO users (username, password_hash, email, role, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $5) RETURNING id",
    )
    .bind(username)
    .bind(password_hash)
    .bind(email)
    .bind(role)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(DalError::unique(format!("user {username}")))?;
    get(conn, id).await
}

/// Look a user up by id.
pub async fn get(conn: &mut AnyConnection, id: i64) -> DalResult<User> {
    sqlx::query_as(&format!("SELECT {COLUMNS} FROM users WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("user {id}")))
}

/// Look a user up by login name.
pub async fn find_by_username(conn: &mut AnyConnection, username: &str) -> DalResult<Option<User>> {
    Ok(
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM users WHERE username = $1"))
            .bind(username)
            .fetch_optional(conn)
            .await?,
    )
}

/// Record a successful login.
pub async fn touch_login(conn: &mut AnyConnection, id: i64) -> DalResult<()> {
    sqlx::query("UPDATE users SET last_login = $2 WHERE id = $1")
        .bind(id)
        .bind(now_ms())
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::testing;

    #[tokio::test]
    async fn usernames_are_unique() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();

        let user = create(&mut conn, "admin", "$argon2id$x", None, "admin")
            .await
            .unwrap();
        assert!(matches!(
            create(&mut conn, "admin", "$argon2id$y", None, "admin").await,
            Err(DalError::Conflict(_))
        ));
        touch_login(&mut conn, user.id).await.unwrap();
        let found = find_by_username(&mut conn, "admin").await.unwrap().unwrap();
        assert!(found.last_login > 0);
    }
}
