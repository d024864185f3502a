use actix_multipart::Multipart;
use actix_web::{error::JsonPayloadError, web, HttpRequest, HttpResponse};
use futures_util::TryStreamExt;

use crate::auth::{login_user, AuthUser};
use crate::config::{MAX_FORM_BYTES, MAX_FORM_PARTS, MAX_TEXT_FIELD_BYTES, MAX_THUMBNAIL_BYTES};
use crate::core::assets::Upload;
use crate::core::errors::{ApiError, ApiResult};
use crate::models::models::{EditUserRequest, LoginRequest, PostFields, RegisterRequest};
use crate::state::AppState;
use crate::{posts, static_server, users};

/// Runs a store/file workflow on the blocking pool.
pub(crate) async fn run<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    web::block(f).await?
}

/// Text fields and files of a multipart form.
#[derive(Default)]
struct Form {
    fields: Vec<(String, String)>,
    files: Vec<(String, Upload)>,
}

impl Form {
    fn text(&self, name: &str) -> String {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    fn take_file(&mut self, name: &str) -> Option<Upload> {
        let idx = self.files.iter().position(|(k, _)| k == name)?;
        Some(self.files.swap_remove(idx).1)
    }

    fn post_fields(&self) -> PostFields {
        PostFields {
            title: self.text("title"),
            category: self.text("category"),
            description: self.text("description"),
        }
    }
}

fn malformed(e: actix_multipart::MultipartError) -> ApiError {
    ApiError::validation(format!("Malformed form data: {e}"))
}

/// Drains the multipart stream. Only the first file part named `file_field`
/// and the first text part of each name are kept. A file body is kept up to
/// one byte past the largest accepted upload and the rest is counted and
/// dropped, so the size check can still reject it. The whole request is
/// capped at `MAX_FORM_BYTES` across at most `MAX_FORM_PARTS` parts.
async fn read_form(mut payload: Multipart, file_field: &str) -> ApiResult<Form> {
    let mut form = Form::default();
    let mut parts = 0usize;
    let mut total = 0usize;

    while let Some(mut field) = payload.try_next().await.map_err(malformed)? {
        parts += 1;
        if parts > MAX_FORM_PARTS {
            return Err(ApiError::validation("Too many form fields."));
        }

        let name = field.name().unwrap_or_default().to_string();
        let file_name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);

        let (keep, cap) = match file_name {
            Some(_) => (name == file_field && form.files.is_empty(), MAX_THUMBNAIL_BYTES + 1),
            None => (form.fields.iter().all(|(k, _)| *k != name), MAX_TEXT_FIELD_BYTES + 1),
        };

        let mut bytes = Vec::new();
        let mut size = 0usize;
        while let Some(chunk) = field.try_next().await.map_err(malformed)? {
            size += chunk.len();
            total += chunk.len();
            if total > MAX_FORM_BYTES {
                return Err(ApiError::AssetTooLarge("Request body too large.".to_string()));
            }
            if keep && bytes.len() < cap {
                let take = chunk.len().min(cap - bytes.len());
                bytes.extend_from_slice(&chunk[..take]);
            }
        }

        if !keep {
            continue;
        }
        match file_name {
            Some(file_name) if size > 0 => form.files.push((name, Upload { file_name, bytes, size })),
            Some(_) => {}
            None if size > MAX_TEXT_FIELD_BYTES => {
                return Err(ApiError::validation(format!("Field {name} is too long.")));
            }
            None => form
                .fields
                .push((name, String::from_utf8_lossy(&bytes).into_owned())),
        }
    }

    Ok(form)
}

// === Users ===

async fn register(state: web::Data<AppState>, body: web::Json<RegisterRequest>) -> ApiResult<HttpResponse> {
    let user = run(move || users::register_user(state.store.as_ref(), body.into_inner())).await?;
    Ok(HttpResponse::Created().json(format!("New User {} Registered.", user.email)))
}

async fn login(state: web::Data<AppState>, body: web::Json<LoginRequest>) -> ApiResult<HttpResponse> {
    let resp = run(move || login_user(state.store.as_ref(), &state.tokens, body.into_inner())).await?;
    Ok(HttpResponse::Ok().json(resp))
}

async fn get_users(state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let list = run(move || users::get_users(state.store.as_ref())).await?;
    Ok(HttpResponse::Ok().json(list))
}

async fn get_user(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let user = run(move || users::get_user(state.store.as_ref(), &id)).await?;
    Ok(HttpResponse::Ok().json(user))
}

async fn change_avatar(state: web::Data<AppState>, auth: AuthUser, payload: Multipart) -> ApiResult<HttpResponse> {
    let mut form = read_form(payload, "avatar").await?;
    let avatar = form.take_file("avatar");
    let user = run(move || users::change_avatar(state.store.as_ref(), &state.assets, &auth.id, avatar)).await?;
    Ok(HttpResponse::Ok().json(user))
}

async fn edit_user(
    state: web::Data<AppState>,
    auth: AuthUser,
    body: web::Json<EditUserRequest>,
) -> ApiResult<HttpResponse> {
    let user = run(move || users::edit_user(state.store.as_ref(), &auth.id, body.into_inner())).await?;
    Ok(HttpResponse::Ok().json(user))
}

// === Posts ===

async fn create_post(state: web::Data<AppState>, auth: AuthUser, payload: Multipart) -> ApiResult<HttpResponse> {
    let mut form = read_form(payload, "thumbnail").await?;
    let fields = form.post_fields();
    let thumbnail = form.take_file("thumbnail");
    let post = run(move || posts::create_post(state.store.as_ref(), &state.assets, &auth.id, fields, thumbnail)).await?;
    Ok(HttpResponse::Created().json(post))
}

async fn get_posts(state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let list = run(move || posts::get_posts(state.store.as_ref())).await?;
    Ok(HttpResponse::Ok().json(list))
}

async fn get_post(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let post = run(move || posts::get_post(state.store.as_ref(), &id)).await?;
    Ok(HttpResponse::Ok().json(post))
}

async fn get_cat_posts(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let category = path.into_inner();
    let list = run(move || posts::get_cat_posts(state.store.as_ref(), &category)).await?;
    Ok(HttpResponse::Ok().json(list))
}

async fn get_user_posts(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let user_id = path.into_inner();
    let list = run(move || posts::get_user_posts(state.store.as_ref(), &user_id)).await?;
    Ok(HttpResponse::Ok().json(list))
}

async fn edit_post(
    state: web::Data<AppState>,
    auth: AuthUser,
    path: web::Path<String>,
    payload: Multipart,
) -> ApiResult<HttpResponse> {
    let post_id = path.into_inner();
    let mut form = read_form(payload, "thumbnail").await?;
    let fields = form.post_fields();
    let thumbnail = form.take_file("thumbnail");
    let post = run(move || {
        posts::edit_post(state.store.as_ref(), &state.assets, &auth.id, &post_id, fields, thumbnail)
    })
    .await?;
    Ok(HttpResponse::Ok().json(post))
}

async fn delete_post(state: web::Data<AppState>, auth: AuthUser, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let post_id = path.into_inner();
    let id = post_id.clone();
    run(move || posts::delete_post(state.store.as_ref(), &state.assets, &auth.id, &id)).await?;
    Ok(HttpResponse::Ok().json(format!("Post {} deleted successfully", post_id)))
}

async fn not_found(req: HttpRequest) -> ApiResult<HttpResponse> {
    Err(ApiError::not_found(format!("Not Found: {}", req.uri())))
}

fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    ApiError::validation(format!("Invalid request body: {err}")).into()
}

/// Mounts every route on `cfg`. The caller provides `web::Data<AppState>`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .service(
            web::scope("/users")
                .route("", web::get().to(get_users))
                .route("/register", web::post().to(register))
                .route("/login", web::post().to(login))
                .route("/avatar", web::post().to(change_avatar))
                .route("/edit", web::patch().to(edit_user))
                .route("/{id}", web::get().to(get_user)),
        )
        .service(
            web::scope("/posts")
                .route("", web::get().to(get_posts))
                .route("", web::post().to(create_post))
                .route("/categories/{category}", web::get().to(get_cat_posts))
                .route("/users/{id}", web::get().to(get_user_posts))
                .route("/{id}", web::get().to(get_post))
                .route("/{id}", web::patch().to(edit_post))
                .route("/{id}", web::delete().to(delete_post)),
        )
        .route("/uploads/{filename}", web::get().to(static_server::serve_upload))
        .default_service(web::route().to(not_found));
}
