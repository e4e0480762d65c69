//! Tenant context extractor.
//!
//! Organization and user ids arrive as headers set by the BFF after it has
//! authenticated the user and checked their organization membership.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const ORG_ID_HEADER: &str = "X-Org-ID";
pub const USER_ID_HEADER: &str = "X-User-ID";

/// Organization and acting user of an import request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantContext {
    pub org_id: Uuid,
    pub user_id: Uuid,
}

fn header_uuid(parts: &Parts, name: &str) -> Result<Uuid, AppError> {
    let raw = parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::AuthError(anyhow::anyhow!("Missing {} header (required from BFF)", name))
        })?;

    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("{} header is not a valid UUID", name)))
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let org_id = header_uuid(parts, ORG_ID_HEADER)?;
        let user_id = header_uuid(parts, USER_ID_HEADER)?;

        let span = tracing::Span::current();
        span.record("org_id", tracing::field::display(org_id));
        span.record("user_id", tracing::field::display(user_id));

        Ok(TenantContext { org_id, user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(headers: &[(&str, &str)]) -> Result<TenantContext, AppError> {
        let mut builder = Request::builder().uri("/imports/preview");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        TenantContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_both_headers() {
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();
        let ctx = extract(&[
            ("x-org-id", &org.to_string()),
            ("x-user-id", &user.to_string()),
        ])
        .await
        .unwrap();
        assert_eq!(ctx, TenantContext { org_id: org, user_id: user });
    }

    #[tokio::test]
    async fn missing_or_malformed_headers_are_rejected() {
        assert!(matches!(
            extract(&[("x-user-id", &Uuid::new_v4().to_string())]).await,
            Err(AppError::AuthError(_))
        ));
        assert!(matches!(
            extract(&[("x-org-id", "acme"), ("x-user-id", "bob")]).await,
            Err(AppError::BadRequest(_))
        ));
    }
}
