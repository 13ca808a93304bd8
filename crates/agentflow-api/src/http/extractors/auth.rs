//! Caller identity extractor.
//!
//! Every API route except `/health` needs:
//! - `X-User-Id: <id>` naming the caller
//! - `Authorization: Bearer <key>` when `server.api_key` is configured
//!
//! Optional `X-User-Email` and `X-User-Roles` (comma-separated) headers are
//! used for approver matching.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use agentflow_types::approval::Approver;

use crate::http::error::AppError;
use crate::state::AppState;

/// Authenticated caller. Extracting this validates the API key, if any.
pub struct AuthUser(pub Approver);

impl AuthUser {
    pub fn user_id(&self) -> &str {
        &self.0.user_id
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(expected) = state.config.server.api_key.as_deref() {
            let provided = extract_bearer(parts)?;
            if provided != expected {
                return Err(AppError::Unauthorized("Invalid API key".to_string()));
            }
        }

        let user_id = header_value(parts, "x-user-id")?
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id header".to_string()))?;
        let email = header_value(parts, "x-user-email")?.filter(|v| !v.is_empty());
        let roles = header_value(parts, "x-user-roles")?
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(AuthUser(Approver {
            user_id,
            email,
            roles,
        }))
    }
}

/// Extract the API key from `Authorization: Bearer <key>`.
fn extract_bearer(parts: &Parts) -> Result<String, AppError> {
    let auth = header_value(parts, "authorization")?.ok_or_else(|| {
        AppError::Unauthorized(
            "Missing API key. Provide via 'Authorization: Bearer <key>' header.".to_string(),
        )
    })?;
    auth.strip_prefix("Bearer ")
        .map(|key| key.trim().to_string())
        .ok_or_else(|| AppError::Unauthorized("Authorization header must use the Bearer scheme".to_string()))
}

fn header_value(parts: &Parts, name: &str) -> Result<Option<String>, AppError> {
    parts
        .headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(|s| s.trim().to_string())
                .map_err(|_| AppError::Unauthorized(format!("Invalid {name} header encoding")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/api/v1/workflows");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_extract_bearer() {
        let p = parts(&[("authorization", "Bearer  k-123 ")]);
        assert_eq!(extract_bearer(&p).unwrap(), "k-123");

        let p = parts(&[("authorization", "Basic abc")]);
        let err = extract_bearer(&p).unwrap_err().to_string();
        assert!(err.contains("Bearer"), "got: {err}");

        let err = extract_bearer(&parts(&[])).unwrap_err().to_string();
        assert!(err.contains("Missing API key"), "got: {err}");
    }

    #[test]
    fn test_header_value_trims() {
        let p = parts(&[("x-user-id", "  alice ")]);
        assert_eq!(header_value(&p, "x-user-id").unwrap().as_deref(), Some("alice"));
        assert_eq!(header_value(&p, "x-user-email").unwrap(), None);
    }
}
