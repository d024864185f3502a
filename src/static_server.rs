use actix_web::http::header::{CacheControl, CacheDirective};
use actix_web::{web, HttpResponse};
use mime_guess::from_path;

use crate::core::errors::{ApiError, ApiResult};
use crate::handlers::run;
use crate::state::AppState;

/// `GET /uploads/{filename}`: serves a stored thumbnail or avatar.
pub async fn serve_upload(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let file_path = path.into_inner();
    let name = file_path.clone();

    let file = run(move || Ok(state.assets.read(&name)?))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Not Found: /uploads/{}", file_path)))?;

    let mime = from_path(&file_path).first_or_octet_stream();

    Ok(HttpResponse::Ok()
        .content_type(mime.as_ref())
        // generated names are never reused
        .insert_header(CacheControl(vec![CacheDirective::Public, CacheDirective::MaxAge(31_536_000)]))
        .body(file))
}
