//! Basic / Bearer authentication.
//!
//! Basic credentials verify against inline users or a secret table
//! materialized in the engine from an external secret store; stored
//! passwords may be plaintext or a 32-character lowercase MD5 hex digest
//! (accepted only to accommodate pre-hashed stores). Bearer tokens are
//! HS256 JWTs checked against the endpoint's secret and issuer.

use std::collections::HashSet;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{AuthConfig, AuthUser, EndpointConfig, SecretManagerConfig};
use crate::engine::convert::{batches_to_json_rows, record_batch_from_json};
use crate::engine::Engine;
use crate::errors::{FlapiError, Result};

pub const REALM: &str = "flAPI";

/// Authentication outcome attached to the request.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub authenticated: bool,
    pub username: String,
    pub roles: Vec<String>,
}

/// `WWW-Authenticate` challenge for a failed attempt.
pub fn challenge(auth: &AuthConfig) -> String {
    if auth.r#type.eq_ignore_ascii_case("bearer") {
        format!("Bearer realm=\"{REALM}\"")
    } else {
        format!("Basic realm=\"{REALM}\"")
    }
}

pub struct AuthService {
    engine: Arc<Engine>,
    /// Secret tables already materialized this process.
    ready_tables: std::sync::Mutex<HashSet<String>>,
}

impl AuthService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            ready_tables: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Authenticate one request against the endpoint's auth settings.
    /// Returns an unauthenticated context when auth is disabled.
    pub async fn authenticate(
        &self,
        endpoint: &EndpointConfig,
        authorization: Option<&str>,
    ) -> Result<AuthContext> {
        let auth = &endpoint.auth;
        if !auth.enabled {
            return Ok(AuthContext::default());
        }

        let header = authorization
            .ok_or_else(|| FlapiError::Auth("missing Authorization header".to_string()))?;

        if auth.r#type.eq_ignore_ascii_case("bearer") {
            self.authenticate_bearer(header, auth)
        } else {
            self.authenticate_basic(header, auth).await
        }
    }

    async fn authenticate_basic(&self, header: &str, auth: &AuthConfig) -> Result<AuthContext> {
        let encoded = header
            .strip_prefix("Basic ")
            .ok_or_else(|| FlapiError::Auth("expected Basic authorization".to_string()))?;
        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| FlapiError::Auth("invalid base64 credentials".to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| FlapiError::Auth("invalid credential encoding".to_string()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| FlapiError::Auth("malformed Basic credentials".to_string()))?;

        if let Some(secret) = &auth.from_aws_secretmanager {
            return self
                .authenticate_against_secret_table(secret, username, password)
                .await;
        }
        authenticate_inline(&auth.users, username, password)
    }

    fn authenticate_bearer(&self, header: &str, auth: &AuthConfig) -> Result<AuthContext> {
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| FlapiError::Auth("expected Bearer authorization".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims::<&str>(&[]);
        validation.validate_exp = false;

        let data = decode::<JwtClaims>(
            token.trim(),
            &DecodingKey::from_secret(auth.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| FlapiError::Auth(format!("invalid token: {e}")))?;

        let claims = data.claims;

        if let Some(exp) = claims.exp {
            let now = chrono::Utc::now().timestamp();
            if (exp as i64) < now {
                return Err(FlapiError::Auth("token expired".to_string()));
            }
        }

        match &claims.iss {
            Some(iss) if *iss == auth.jwt_issuer => {}
            _ => return Err(FlapiError::Auth("invalid token issuer".to_string())),
        }

        let username = claims
            .sub
            .ok_or_else(|| FlapiError::Auth("token missing subject".to_string()))?;

        Ok(AuthContext {
            authenticated: true,
            username,
            roles: claims.roles.map(parse_roles).unwrap_or_default(),
        })
    }

    async fn authenticate_against_secret_table(
        &self,
        secret: &SecretManagerConfig,
        username: &str,
        password: &str,
    ) -> Result<AuthContext> {
        self.ensure_secret_table(secret).await?;

        let table = secret.table_name();
        let escaped = username.replace('\'', "''");
        let query = format!(
            "SELECT username, password, roles FROM {table} \
             WHERE username = '{escaped}' LIMIT 1"
        );

        let batches = self.engine.query(&query).await.map_err(|e| {
            warn!("Secret table lookup failed: {e}");
            FlapiError::Auth("credential lookup failed".to_string())
        })?;
        let rows = batches_to_json_rows(&batches)?;
        let Some(row) = rows.first() else {
            return Err(FlapiError::Auth("unknown user".to_string()));
        };

        let stored = row
            .get("password")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !verify_password(password, stored) {
            return Err(FlapiError::Auth("invalid credentials".to_string()));
        }

        let roles = row
            .get("roles")
            .cloned()
            .map(parse_roles)
            .unwrap_or_default();

        Ok(AuthContext {
            authenticated: true,
            username: username.to_string(),
            roles,
        })
    }

    /// Materialize the backing secret table on first use: run the init
    /// statement, fetch the secret payload as JSON, and persist it as
    /// `auth_<sanitized>` with one row per user.
    async fn ensure_secret_table(&self, secret: &SecretManagerConfig) -> Result<()> {
        let table = secret.table_name();
        {
            let ready = self.ready_tables.lock().expect("auth lock poisoned");
            if ready.contains(&table) {
                return Ok(());
            }
        }

        self.engine
            .execute_statements(&secret.init_sql())
            .await
            .map_err(|e| {
                FlapiError::Auth(format!("secret store initialization failed: {e}"))
            })?;

        let payload = self.fetch_secret_json(secret).await?;
        let users = parse_secret_payload(&payload)?;
        if users.is_empty() {
            return Err(FlapiError::Auth(format!(
                "secret '{}' contains no users",
                secret.secret_name
            )));
        }

        let values: Vec<serde_json::Value> = users
            .iter()
            .map(|user| {
                serde_json::json!({
                    "username": user.username,
                    "password": user.password,
                    "roles": user.roles.join(","),
                })
            })
            .collect();
        let batch = record_batch_from_json(&values)?;
        self.engine.replace_table(&table, vec![batch]).await?;

        debug!("Materialized secret table {table} with {} user(s)", users.len());
        self.ready_tables
            .lock()
            .expect("auth lock poisoned")
            .insert(table);
        Ok(())
    }

    async fn fetch_secret_json(&self, secret: &SecretManagerConfig) -> Result<String> {
        let query = format!(
            "SELECT secret_string FROM aws_secretmanager('{}')",
            secret.secret_name.replace('\'', "''")
        );
        let batches = self.engine.query(&query).await.map_err(|e| {
            FlapiError::Auth(format!(
                "could not fetch secret '{}': {e}",
                secret.secret_name
            ))
        })?;
        let rows = batches_to_json_rows(&batches)?;
        rows.first()
            .and_then(|row| row.values().next())
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                FlapiError::Auth(format!("secret '{}' returned no payload", secret.secret_name))
            })
    }
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: Option<String>,
    iss: Option<String>,
    #[serde(default)]
    roles: Option<serde_json::Value>,
    exp: Option<u64>,
}

fn authenticate_inline(
    users: &[AuthUser],
    username: &str,
    password: &str,
) -> Result<AuthContext> {
    let user = users
        .iter()
        .find(|u| u.username == username)
        .ok_or_else(|| FlapiError::Auth("unknown user".to_string()))?;

    if !verify_password(password, &user.password) {
        return Err(FlapiError::Auth("invalid credentials".to_string()));
    }

    Ok(AuthContext {
        authenticated: true,
        username: username.to_string(),
        roles: user.roles.clone(),
    })
}

/// Accept a plaintext match, or an MD5 hex digest match when the stored
/// value looks like one.
pub fn verify_password(provided: &str, stored: &str) -> bool {
    if provided == stored {
        return true;
    }
    if is_md5_digest(stored) {
        return md5_hash(provided) == stored;
    }
    false
}

pub fn md5_hash(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn is_md5_digest(value: &str) -> bool {
    value.len() == 32
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Roles may arrive as a list or a comma-separated string.
fn parse_roles(value: serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        serde_json::Value::String(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// The secret payload is either `{"auth": [user...]}` or a bare user
/// list.
fn parse_secret_payload(payload: &str) -> Result<Vec<AuthUser>> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| FlapiError::Auth(format!("secret payload is not JSON: {e}")))?;

    let list = match &value {
        serde_json::Value::Object(map) => map.get("auth").cloned().unwrap_or_default(),
        serde_json::Value::Array(_) => value.clone(),
        _ => serde_json::Value::Null,
    };

    let serde_json::Value::Array(items) = list else {
        return Err(FlapiError::Auth(
            "secret payload has no user list".to_string(),
        ));
    };

    let mut users = Vec::new();
    for item in items {
        let username = item
            .get("username")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let password = item
            .get("password")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if username.is_empty() {
            continue;
        }
        let roles = item
            .get("roles")
            .cloned()
            .map(parse_roles)
            .unwrap_or_default();
        users.push(AuthUser {
            username,
            password,
            roles,
        });
    }
    Ok(users)
}
