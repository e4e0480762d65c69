use crate::error::ImportError;
use crate::import::{PreviewRequest, UploadedDocument};
use crate::middleware::TenantContext;
use crate::models::{ConfirmImportRequest, StatementMonth};
use crate::startup::AppState;
use axum::{
    extract::{Multipart, Path, State},
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

/// Upload a vendor document and get the matched/unmatched preview back.
///
/// Multipart fields: `file`, `month` (YYYY-MM), `vendor`, `description`.
pub async fn preview_import(
    State(state): State<AppState>,
    tenant: TenantContext,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ImportError> {
    let mut document: Option<UploadedDocument> = None;
    let mut month: Option<StatementMonth> = None;
    let mut vendor = String::new();
    let mut description = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ImportError::Validation(format!("Failed to read multipart field: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| {
                        ImportError::Validation(format!("Failed to read file bytes: {}", e))
                    })?
                    .to_vec();
                document = Some(UploadedDocument {
                    file_name,
                    content_type,
                    data,
                });
            }
            "month" | "vendor" | "description" => {
                let value = field.text().await.map_err(|e| {
                    ImportError::Validation(format!("Failed to read field '{}': {}", name, e))
                })?;
                match name.as_str() {
                    "month" => month = Some(value.trim().parse()?),
                    "vendor" => vendor = value,
                    _ => description = value,
                }
            }
            other => tracing::debug!(field = %other, "Ignoring unknown multipart field"),
        }
    }

    let document =
        document.ok_or_else(|| ImportError::Validation("No file uploaded".to_string()))?;
    let month = month.ok_or_else(|| ImportError::Validation("month is required".to_string()))?;

    tracing::info!(
        org_id = %tenant.org_id,
        month = %month,
        file_name = %document.file_name,
        size = document.data.len(),
        "Import preview requested"
    );

    let response = state
        .imports
        .preview(PreviewRequest {
            org_id: tenant.org_id,
            user_id: tenant.user_id,
            month,
            vendor,
            description,
            document,
        })
        .await?;

    Ok(Json(response))
}

pub async fn confirm_import(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(job_id): Path<Uuid>,
    Json(request): Json<ConfirmImportRequest>,
) -> Result<impl IntoResponse, ImportError> {
    let report = state
        .imports
        .confirm(tenant.org_id, tenant.user_id, job_id, request)
        .await?;
    Ok(Json(report))
}

pub async fn cancel_import(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ImportError> {
    let job = state.imports.cancel(tenant.org_id, job_id).await?;
    Ok(Json(job))
}

pub async fn get_import(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ImportError> {
    let job = state.imports.get_job(tenant.org_id, job_id).await?;
    Ok(Json(job))
}
