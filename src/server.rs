//! HTTP surface. `/hello` is public; every other route sits behind the
//! authorization gate.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Form, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, Level};

use crate::auth::{require_auth, Authorizer};
use crate::config::parse_bool;
use crate::converter::ConversionOptions;
use crate::error::ServiceError;
use crate::service::{PdfService, Poll, Upload};
use crate::storage::SafeName;

#[derive(Clone)]
pub struct AppState {
    pub service: PdfService,
    pub authorizer: Arc<dyn Authorizer>,
}

impl AppState {
    pub fn new(service: PdfService, authorizer: Arc<dyn Authorizer>) -> Self {
        Self { service, authorizer }
    }
}

pub fn create_router(state: AppState, max_upload_bytes: usize) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let protected = Router::new()
        .route("/", get(index_handler))
        .route("/pdfs", get(pdfs_handler))
        .route("/fonts", get(fonts_handler))
        .route("/queue-stats", get(queue_stats_handler))
        .route("/convert", post(convert_handler))
        .route("/convert-in-shared-dir", post(convert_in_shared_dir_handler))
        .route("/queue-job", post(queue_job_handler))
        .route("/check-pdf/{filename}", get(check_pdf_handler))
        .route("/upload-font", post(upload_font_handler))
        .route("/delete-file", post(delete_file_handler))
        .route("/files/{filename}", get(file_handler))
        .route_layer(middleware::from_fn_with_state(
            state.authorizer.clone(),
            require_auth,
        ));

    Router::new()
        .route("/hello", get(hello_handler))
        .merge(protected)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(trace_layer)
        .with_state(state)
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::InputInvalid(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::EngineFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::QueuePublish(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::EngineTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Storage(_) | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, kind = self.kind(), "Request failed");
        } else {
            info!(error = %self, kind = self.kind(), "Request rejected");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));
        (status, body).into_response()
    }
}

/// Fields of a multipart upload form.
#[derive(Default)]
struct UploadForm {
    file: Option<Upload>,
    lo_options: Option<String>,
    delete_original: bool,
}

impl UploadForm {
    fn require_file(&mut self, field: &str) -> Result<Upload, ServiceError> {
        self.file
            .take()
            .ok_or_else(|| ServiceError::InputInvalid(format!("missing file field '{field}'")))
    }
}

async fn read_upload_form(mut multipart: Multipart, file_field: &str) -> Result<UploadForm, ServiceError> {
    let bad_form = |e: axum::extract::multipart::MultipartError| {
        ServiceError::InputInvalid(format!("malformed multipart body: {e}"))
    };

    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == file_field {
            let filename = field.file_name().unwrap_or_default().to_string();
            let data = field.bytes().await.map_err(bad_form)?;
            tracing::debug!(filename = %filename, bytes = data.len(), "Received upload");
            form.file = Some(Upload { filename, data });
        } else if name == "lo_options" {
            form.lo_options = Some(field.text().await.map_err(bad_form)?);
        } else if name == "delete_original" {
            let raw = field.text().await.map_err(bad_form)?;
            form.delete_original = parse_bool(&raw)
                .map_err(|e| ServiceError::InputInvalid(format!("delete_original: {e}")))?;
        }
    }
    Ok(form)
}

fn content_type_for(name: &SafeName) -> &'static str {
    match name.extension().as_deref() {
        Some("pdf") => "application/pdf",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("xls") => "application/vnd.ms-excel",
        Some("ods") => "application/vnd.oasis.opendocument.spreadsheet",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        _ => "application/octet-stream",
    }
}

fn file_response(name: &SafeName, len: Option<u64>, body: Body) -> Response {
    let disposition = format!("attachment; filename=\"{name}\"");
    let mut response = (
        [
            (header::CONTENT_TYPE, content_type_for(name).to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response();
    if let Some(len) = len {
        response.headers_mut().insert(header::CONTENT_LENGTH, len.into());
    }
    response
}

async fn hello_handler() -> impl IntoResponse {
    Json(json!({ "message": "Hello, worldest!" }))
}

#[tracing::instrument(skip_all)]
async fn convert_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ServiceError> {
    let mut form = read_upload_form(multipart, "file").await?;
    let upload = form.require_file("file")?;
    let options = ConversionOptions::from_form(form.lo_options.as_deref());

    let pdf = state.service.convert_upload(upload, &options).await?;
    let len = pdf.data.len() as u64;
    Ok(file_response(&pdf.filename, Some(len), Body::from(pdf.data)))
}

#[derive(Debug, Deserialize)]
struct ConvertExistingForm {
    filename: String,
    lo_options: Option<String>,
    delete_original: Option<String>,
}

#[tracing::instrument(skip_all)]
async fn convert_in_shared_dir_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<ConvertExistingForm>,
) -> Result<Response, ServiceError> {
    let delete_original = match form.delete_original.as_deref() {
        Some(raw) => parse_bool(raw)
            .map_err(|e| ServiceError::InputInvalid(format!("delete_original: {e}")))?,
        None => false,
    };
    let options = ConversionOptions::from_form(form.lo_options.as_deref());

    let target = state
        .service
        .convert_existing(&form.filename, &options, delete_original)
        .await?;

    let wants_pdf = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/pdf"));
    if !wants_pdf {
        return Ok(Json(json!({ "status": "success", "pdf": target.as_str() })).into_response());
    }

    let (name, file, len) = state.service.open(target.as_str()).await?;
    let body = Body::from_stream(state.service.stream(name.clone(), file, false));
    Ok(file_response(&name, Some(len), body))
}

#[tracing::instrument(skip_all)]
async fn queue_job_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ServiceError> {
    let mut form = read_upload_form(multipart, "file").await?;
    let upload = form.require_file("file")?;
    let options = ConversionOptions::from_form(form.lo_options.as_deref());

    let accepted = state
        .service
        .enqueue(upload, options, form.delete_original)
        .await?;
    info!(job_id = %accepted.job_id, file = %accepted.file, "Job queued");
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

#[derive(Debug, Deserialize)]
struct CheckPdfQuery {
    delete: Option<String>,
}

async fn check_pdf_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(query): Query<CheckPdfQuery>,
) -> Result<Response, ServiceError> {
    let delete = match query.delete.as_deref() {
        Some(raw) => parse_bool(raw).map_err(|e| ServiceError::InputInvalid(format!("delete: {e}")))?,
        None => false,
    };

    match state.service.poll(&filename).await? {
        Poll::Ready { name, file, len } => {
            let body = Body::from_stream(state.service.stream(name.clone(), file, delete));
            Ok(file_response(&name, Some(len), body))
        }
        Poll::NotReady => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "pending", "detail": "PDF not ready" })),
        )
            .into_response()),
    }
}

#[tracing::instrument(skip_all)]
async fn upload_font_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ServiceError> {
    let mut form = read_upload_form(multipart, "font_file").await?;
    let upload = form.require_file("font_file")?;
    let font = state.service.install_font(upload).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "installed", "font": font.as_str() })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct DeleteForm {
    filename: String,
}

async fn delete_file_handler(
    State(state): State<AppState>,
    Form(form): Form<DeleteForm>,
) -> Result<Response, ServiceError> {
    let removed = state.service.delete(&form.filename).await?;
    let status = if removed { "deleted" } else { "absent" };
    Ok(Json(json!({ "status": status, "filename": form.filename })).into_response())
}

async fn file_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ServiceError> {
    let (name, file, len) = state.service.open(&filename).await?;
    let body = Body::from_stream(state.service.stream(name.clone(), file, false));
    Ok(file_response(&name, Some(len), body))
}

async fn pdfs_handler(State(state): State<AppState>) -> Result<Response, ServiceError> {
    Ok(Json(state.service.list_pdfs().await?).into_response())
}

async fn fonts_handler(State(state): State<AppState>) -> Result<Response, ServiceError> {
    Ok(Json(state.service.list_fonts().await?).into_response())
}

async fn queue_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "queue_length": state.service.queue_length().await }))
}

async fn index_handler(State(state): State<AppState>) -> Result<Html<String>, ServiceError> {
    let files = state.service.list_files().await?;

    let mut page = String::from(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>pdf-printer</title></head><body>\n<h1>Shared files</h1>\n",
    );
    if files.is_empty() {
        page.push_str("<p>No files.</p>\n");
    } else {
        page.push_str("<table>\n<tr><th>Name</th><th>Size</th></tr>\n");
        for file in &files {
            let name = escape_html(&file.name);
            page.push_str(&format!(
                "<tr><td><a href=\"/files/{name}\">{name}</a></td><td>{}</td></tr>\n",
                file.size
            ));
        }
        page.push_str("</table>\n");
    }
    page.push_str("</body></html>\n");
    Ok(Html(page))
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&#39;");
        assert_eq!(escape_html("report.pdf"), "report.pdf");
    }

    #[test]
    fn test_content_type_by_extension() {
        let pdf = SafeName::parse("Report.PDF").unwrap();
        assert_eq!(content_type_for(&pdf), "application/pdf");
        let other = SafeName::parse("notes.txt").unwrap();
        assert_eq!(content_type_for(&other), "application/octet-stream");
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (ServiceError::InputInvalid("x".into()), StatusCode::BAD_REQUEST),
            (ServiceError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ServiceError::Conflict("x".into()), StatusCode::CONFLICT),
            (ServiceError::EngineFailure("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                ServiceError::QueuePublish(crate::queue::QueueError::Closed),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ServiceError::EngineTimeout(std::time::Duration::from_secs(1)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (ServiceError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
