use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tokio::sync::Mutex;

// ── Role ────────────────────────────────────────────────────────────

/// Viewer reads, Operator launches/cancels/promotes, Agent is a node daemon
/// (heartbeats, run outcomes, metrics), Admin does everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Operator,
    Agent,
    Admin,
}

impl Role {
    pub fn allows(self, required: Role) -> bool {
        matches!(
            (self, required),
            (Role::Admin, _)
                | (Role::Operator, Role::Viewer | Role::Operator)
                | (Role::Agent, Role::Viewer | Role::Agent)
                | (Role::Viewer, Role::Viewer)
        )
    }

    fn parse(raw: &str) -> Option<Role> {
        match raw.to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "operator" => Some(Role::Operator),
            "agent" => Some(Role::Agent),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    pub tokens: Arc<HashMap<String, Role>>,
    pub rate_limits: Arc<Mutex<HashMap<String, RateWindow>>>,
    pub limit_per_minute: u64,
}

#[derive(Debug, Clone)]
pub struct RateWindow {
    pub window_start: Instant,
    pub count: u64,
}

impl AuthConfig {
    /// Auth switched off: every caller is treated as admin.
    pub fn disabled() -> Self {
        Self::from_tokens(None, 0)
    }

    /// `raw` is a comma separated `token:role` list. `None` disables auth.
    pub fn from_tokens(raw: Option<&str>, limit_per_minute: u64) -> Self {
        let enabled = raw.is_some();
        let mut tokens = HashMap::new();

        for entry in raw.unwrap_or_default().split(',') {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Some((token, role_raw)) = trimmed.split_once(':') else {
                tracing::warn!("invalid FORGE_AUTH_TOKENS entry, expected token:role");
                continue;
            };
            match Role::parse(role_raw) {
                Some(role) => {
                    tokens.insert(token.to_string(), role);
                }
                None => {
                    tracing::warn!(role=%role_raw, "unknown role in FORGE_AUTH_TOKENS, skipping");
                }
            }
        }

        Self {
            enabled,
            tokens: Arc::new(tokens),
            rate_limits: Arc::new(Mutex::new(HashMap::new())),
            limit_per_minute,
        }
    }
}

pub fn parse_auth_from_env() -> AuthConfig {
    let tokens_raw = std::env::var("FORGE_AUTH_TOKENS").ok();
    let limit_per_minute = std::env::var("FORGE_AUTH_RATE_LIMIT_PER_MINUTE")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(600);

    if tokens_raw.is_none() {
        tracing::warn!("auth disabled: FORGE_AUTH_TOKENS not set");
    }

    AuthConfig::from_tokens(tokens_raw.as_deref(), limit_per_minute)
}

// ── Middleware ───────────────────────────────────────────────────────
// Generic over any state type S that implements AsRef<AuthConfig>.

pub async fn auth_middleware<S>(
    State(state): State<S>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible>
where
    S: AsRef<AuthConfig> + Clone + Send + Sync + 'static,
{
    let auth = state.as_ref();

    if !auth.enabled {
        req.extensions_mut().insert(AuthContext {
            principal: "guest".into(),
            role: Role::Admin,
        });
        return Ok(next.run(req).await);
    }

    let Some(token) = extract_token(&req) else {
        return Ok(unauthorized("missing token"));
    };

    let Some(role) = auth.tokens.get(&token).copied() else {
        return Ok(forbidden("invalid token"));
    };

    if auth.limit_per_minute > 0 {
        let mut guard = auth.rate_limits.lock().await;
        let now = Instant::now();
        let entry = guard.entry(token.clone()).or_insert(RateWindow {
            window_start: now,
            count: 0,
        });
        if now.duration_since(entry.window_start) >= Duration::from_secs(60) {
            entry.window_start = now;
            entry.count = 0;
        }
        if entry.count >= auth.limit_per_minute {
            return Ok(too_many_requests());
        }
        entry.count += 1;
    }

    req.extensions_mut().insert(AuthContext {
        principal: token,
        role,
    });

    Ok(next.run(req).await)
}

fn extract_token(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
        .or_else(|| {
            req.headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
}

/// `None` when the caller may proceed, otherwise a ready 403 response.
pub fn require_role(ctx: &AuthContext, required: Role) -> Option<Response> {
    if ctx.role.allows(required) {
        None
    } else {
        Some(forbidden("insufficient permissions"))
    }
}

// ── Error helpers ───────────────────────────────────────────────────

fn error_body(code: &str, msg: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": {"code": code, "message": msg}}))
}

pub fn unauthorized(msg: &str) -> Response {
    (
        axum::http::StatusCode::UNAUTHORIZED,
        error_body("unauthorized", msg),
    )
        .into_response()
}

pub fn forbidden(msg: &str) -> Response {
    (axum::http::StatusCode::FORBIDDEN, error_body("forbidden", msg)).into_response()
}

pub fn too_many_requests() -> Response {
    (
        axum::http::StatusCode::TOO_MANY_REQUESTS,
        error_body("rate_limited", "rate limited"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_hierarchy() {
        assert!(Role::Admin.allows(Role::Agent));
        assert!(Role::Operator.allows(Role::Viewer));
        assert!(!Role::Operator.allows(Role::Agent));
        assert!(Role::Agent.allows(Role::Agent));
        assert!(!Role::Agent.allows(Role::Operator));
        assert!(!Role::Viewer.allows(Role::Operator));
    }

    #[test]
    fn parses_token_list() {
        let cfg = AuthConfig::from_tokens(Some("abc:admin, def:Viewer,bad,ghi:root,jkl:agent"), 10);
        assert!(cfg.enabled);
        assert_eq!(cfg.tokens.len(), 3);
        assert_eq!(cfg.tokens.get("abc"), Some(&Role::Admin));
        assert_eq!(cfg.tokens.get("def"), Some(&Role::Viewer));
        assert_eq!(cfg.tokens.get("jkl"), Some(&Role::Agent));
        assert!(!cfg.tokens.contains_key("ghi"));
    }

    #[test]
    fn disabled_without_tokens() {
        let cfg = AuthConfig::disabled();
        assert!(!cfg.enabled);
        assert!(cfg.tokens.is_empty());
    }
}
