//! Credentials for `/v2/`.
//!
//! Clients either send Basic credentials on every request or trade them for
//! an RS512 bearer token at `/v2/token`. Tokens carry `{sub, jti, iat, nbf,
//! exp}`; a revoked `jti` is remembered in the cache for the refresh TTL.
//!
//! The signing key comes from `auth.jwt.privateKey` when set. Otherwise the
//! first replica to start generates one under the `auth-jwt-key` lock and
//! stores it in settings, so every replica signs with the same key.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, header};
use base64::Engine as _;
use cacher::{CacheBackend, Cacher};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use locker::Locker;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::config::{AdminConfig, Config};
use crate::dal::users::User;
use crate::dal::{Dal, DalError, settings, users};
use crate::error::{RegistryError, RegistryResult};

mod handler;
pub mod password;

pub use handler::{authenticate, logout, token};

const KEY_SETTING: &str = "auth-jwt-key";
const KEY_BITS: usize = 2048;

/// A signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Row id.
    pub user_id: i64,
    /// Login name.
    pub username: String,
    /// `admin` or `user`.
    pub role: String,
}

impl Identity {
    fn from_user(user: &User) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            role: user.role.clone(),
        }
    }

    /// Whether the user administers the registry.
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Who sent a request; inserted into request extensions by [`authenticate`].
#[derive(Debug, Clone, Default)]
pub struct Caller(pub Option<Identity>);

/// Bearer token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Token id, the revocation handle.
    pub jti: String,
    /// Issued at, unix seconds.
    pub iat: i64,
    /// Not before, unix seconds.
    pub nbf: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Response body of the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    /// The bearer token.
    pub token: String,
    /// Same token, for OAuth2 style clients.
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// RFC 3339 issue time.
    pub issued_at: String,
}

/// Verifies credentials and issues bearer tokens.
pub struct Authenticator {
    dal: Dal,
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    realm: String,
    service: String,
    revoked: Cacher<bool>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("realm", &self.realm)
            .field("service", &self.service)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn key_error(err: impl std::fmt::Display) -> RegistryError {
    RegistryError::Internal(format!("jwt key: {err}"))
}

fn parse_private_key(pem: &str) -> RegistryResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(key_error)
}

impl Authenticator {
    /// Load or generate the signing key, then seed the admin user.
    #[tracing::instrument(skip_all)]
    pub async fn from_config(
        config: &Config,
        dal: &Dal,
        locker: &Locker,
        cache: Arc<dyn CacheBackend>,
    ) -> RegistryResult<Self> {
        let pem = match &config.auth.jwt.private_key {
            Some(encoded) if !encoded.is_empty() => {
                let raw = encoded
                    .decode_base64()
                    .map_err(|err| key_error(format!("auth.jwt.privateKey is not base64: {err}")))?;
                String::from_utf8(raw).map_err(key_error)?
            }
            _ => shared_private_key(dal, locker).await?,
        };
        let auth = Self::with_private_key_pem(&pem, config, dal.clone(), cache)?;
        auth.seed_admin(&config.auth.admin).await?;
        Ok(auth)
    }

    /// Build from a PEM encoded RSA private key (PKCS#1 or PKCS#8).
    pub fn with_private_key_pem(
        pem: &str,
        config: &Config,
        dal: Dal,
        cache: Arc<dyn CacheBackend>,
    ) -> RegistryResult<Self> {
        let private = parse_private_key(pem)?;
        let public = RsaPublicKey::from(&private)
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(key_error)?;
        let encoding = EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(key_error)?;
        let decoding = DecodingKey::from_rsa_pem(public.as_bytes()).map_err(key_error)?;

        let jwt = &config.auth.jwt;
        let revoked = Cacher::new(
            cache,
            &config.cache.prefix,
            "jwt-revoked",
            Some(jwt.refresh_ttl),
            |_jti: String| async { Ok(false) },
        );
        Ok(Self {
            dal,
            encoding,
            decoding,
            ttl: jwt.ttl,
            realm: format!("{}/v2/token", config.http.public_url()),
            service: jwt.service.clone(),
            revoked,
        })
    }

    /// Create the configured administrator unless the name is taken.
    pub async fn seed_admin(&self, admin: &AdminConfig) -> RegistryResult<()> {
        let mut conn = self.dal.acquire().await?;
        if users::find_by_username(&mut conn, &admin.username).await?.is_some() {
            return Ok(());
        }
        let hash = password::hash(admin.password.revealed())?;
        match users::create(&mut conn, &admin.username, &hash, None, "admin").await {
            Ok(user) => tracing::info!(username = %user.username, "seeded admin user"),
            // another replica won the race
            Err(DalError::Conflict(_)) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// `WWW-Authenticate` value for a 401.
    pub fn challenge(&self) -> String {
        format!(r#"Bearer realm="{}",service="{}""#, self.realm, self.service)
    }

    /// An unauthorized error carrying the challenge.
    pub fn unauthorized(&self, message: impl Into<String>) -> RegistryError {
        RegistryError::unauthorized(message, Some(self.challenge()))
    }

    /// Check a username and password.
    pub async fn login(&self, username: &str, secret: &str) -> RegistryResult<User> {
        let mut conn = self.dal.acquire().await?;
        let user = users::find_by_username(&mut conn, username)
            .await?
            .filter(|user| password::verify(&user.password_hash, secret))
            .ok_or_else(|| self.unauthorized("invalid username or password"))?;
        users::touch_login(&mut conn, user.id).await?;
        Ok(user)
    }

    /// Sign a token for the user with id `user_id`.
    pub fn issue(&self, user_id: i64) -> RegistryResult<IssuedToken> {
        let now = chrono::Utc::now();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX / 2);
        let claims = Claims {
            sub: user_id.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: now.timestamp() + ttl,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::RS512), &claims, &self.encoding)
            .map_err(key_error)?;
        Ok(IssuedToken {
            access_token: token.clone(),
            token,
            expires_in: self.ttl.as_secs(),
            issued_at: now.to_rfc3339(),
        })
    }

    /// Verify signature, time window and revocation.
    pub async fn validate(&self, token: &str) -> RegistryResult<Claims> {
        let mut validation = Validation::new(Algorithm::RS512);
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);
        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|err| self.unauthorized(format!("invalid token: {err}")))?
            .claims;

        let revoked = self
            .revoked
            .get(&claims.jti)
            .await
            .map_err(|err| RegistryError::Unavailable(format!("revocation cache: {err}")))?;
        if revoked {
            return Err(self.unauthorized("token has been revoked"));
        }
        Ok(claims)
    }

    /// Refuse `jti` from now on.
    pub async fn revoke(&self, jti: &str) -> RegistryResult<()> {
        self.revoked
            .set(jti, &true, None)
            .await
            .map_err(|err| RegistryError::Unavailable(format!("revocation cache: {err}")))
    }

    /// The identity behind an `Authorization` header, `None` without one.
    pub async fn identify(&self, headers: &HeaderMap) -> RegistryResult<Option<Identity>> {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|_| self.unauthorized("malformed authorization header"))?;
        let (scheme, credentials) = value
            .split_once(' ')
            .ok_or_else(|| self.unauthorized("malformed authorization header"))?;

        if scheme.eq_ignore_ascii_case("basic") {
            let (username, secret) = decode_basic(credentials)
                .ok_or_else(|| self.unauthorized("malformed basic credentials"))?;
            let user = self.login(&username, &secret).await?;
            return Ok(Some(Identity::from_user(&user)));
        }
        if scheme.eq_ignore_ascii_case("bearer") {
            let claims = self.validate(credentials.trim()).await?;
            let id: i64 = claims
                .sub
                .parse()
                .map_err(|_| self.unauthorized("token subject is not a user"))?;
            let mut conn = self.dal.acquire().await?;
            let user = users::get(&mut conn, id).await.map_err(|err| match err {
                DalError::NotFound(_) => self.unauthorized("token subject no longer exists"),
                other => other.into(),
            })?;
            return Ok(Some(Identity::from_user(&user)));
        }
        Err(self.unauthorized(format!("unsupported authorization scheme {scheme}")))
    }
}

/// `user:password` from a Basic credential.
pub(crate) fn decode_basic(credentials: &str) -> Option<(String, String)> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(credentials.trim())
        .ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let (username, password) = raw.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}

/// The key stored in settings, generated by whichever replica gets there
/// first.
async fn shared_private_key(dal: &Dal, locker: &Locker) -> RegistryResult<String> {
    let lock = locker
        .acquire(KEY_SETTING, Duration::from_secs(30), Duration::from_secs(60))
        .await?;
    let result = async {
        let mut conn = dal.acquire().await?;
        if let Some(stored) = settings::get(&mut conn, KEY_SETTING).await? {
            return String::from_utf8(stored).map_err(key_error);
        }
        drop(conn);

        tracing::info!(bits = KEY_BITS, "generating jwt signing key");
        let pem = tokio::task::spawn_blocking(|| {
            let key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS).map_err(key_error)?;
            key.to_pkcs1_pem(LineEnding::LF)
                .map(|pem| pem.to_string())
                .map_err(key_error)
        })
        .await
        .map_err(key_error)??;

        let mut conn = dal.acquire().await?;
        settings::set(&mut conn, KEY_SETTING, pem.as_bytes()).await?;
        Ok(pem)
    }
    .await;
    lock.unlock().await?;
    result
}


#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::dal::testing as dal_testing;

    fn basic(user: &str, password: &str) -> HeaderMap {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        headers
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn basic_credentials_identify_the_admin() {
        let dal = dal_testing::dal().await;
        let auth = testing::authenticator(&dal).await;

        let identity = auth.identify(&basic("admin", "Admin@123")).await.unwrap().unwrap();
        assert_eq!(identity.username, "admin");
        assert!(identity.is_admin());

        let err = auth.identify(&basic("admin", "wrong")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized { challenge: Some(_), .. }));
        assert!(auth.identify(&HeaderMap::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tokens_validate_until_revoked() {
        let dal = dal_testing::dal().await;
        let auth = testing::authenticator(&dal).await;
        let user = auth.login("admin", "Admin@123").await.unwrap();

        let issued = auth.issue(user.id).unwrap();
        assert_eq!(issued.token, issued.access_token);
        let claims = auth.validate(&issued.token).await.unwrap();
        assert_eq!(claims.sub, user.id.to_string());
        assert_eq!(claims.exp - claims.iat, 3600);

        let identity = auth.identify(&bearer(&issued.token)).await.unwrap().unwrap();
        assert_eq!(identity.user_id, user.id);

        auth.revoke(&claims.jti).await.unwrap();
        assert!(auth.validate(&issued.token).await.is_err());
    }

    #[tokio::test]
    async fn tampered_tokens_are_rejected() {
        let dal = dal_testing::dal().await;
        let auth = testing::authenticator(&dal).await;
        let user = auth.login("admin", "Admin@123").await.unwrap();
        let mut token = auth.issue(user.id).unwrap().token;
        token.push('x');
        assert!(auth.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn challenge_points_at_the_token_endpoint() {
        let dal = dal_testing::dal().await;
        let auth = testing::authenticator(&dal).await;
        assert_eq!(
            auth.challenge(),
            r#"Bearer realm="http://127.0.0.1:3000/v2/token",service="registry""#
        );
    }

    #[test]
    fn basic_decoding() {
        assert_eq!(
            decode_basic("YWRtaW46QWRtaW5AMTIz"),
            Some(("admin".into(), "Admin@123".into()))
        );
        assert_eq!(decode_basic("!!"), None);
    }
}
