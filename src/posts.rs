use tracing::{info, warn};
use uuid::Uuid;

use crate::config::*;
use crate::core::assets::{unique_filename, AssetStore, Upload};
use crate::core::db::{Store, StoreExt};
use crate::core::errors::{ApiError, ApiResult};
use crate::core::helpers::{now, validate_uuid};
use crate::models::models::{Post, PostFields, User};
use crate::users::discard_asset;

/// Trims surrounding whitespace. Text is otherwise stored exactly as sent;
/// the API only ever returns it inside JSON.
fn clean_fields(fields: PostFields) -> PostFields {
    PostFields {
        title: fields.title.trim().to_string(),
        category: fields.category.trim().to_string(),
        description: fields.description.trim().to_string(),
    }
}

fn check_thumbnail(upload: &Upload) -> ApiResult<()> {
    if upload.size > MAX_THUMBNAIL_BYTES {
        return Err(ApiError::AssetTooLarge(
            "Thumbnail too big. File should be less than 2mb.".to_string(),
        ));
    }
    Ok(())
}

/// Adds `delta` to the creator's post counter in a single store update.
fn adjust_post_count(store: &dyn Store, user_id: &str, delta: i64) {
    match store.update_json::<User, _>(&user_key(user_id), |u| u.posts += delta) {
        Ok(Some(_)) => {}
        Ok(None) => warn!(user_id = %user_id, "post counter not updated: user missing"),
        Err(e) => warn!(user_id = %user_id, error = %e, "post counter not updated"),
    }
}

fn load_post(store: &dyn Store, id: &str) -> ApiResult<Post> {
    if !validate_uuid(id) {
        return Err(ApiError::not_found("Post not found."));
    }
    store
        .get_json::<Post>(&post_key(id))?
        .ok_or_else(|| ApiError::not_found("Post not found."))
}

fn all_posts(store: &dyn Store) -> ApiResult<Vec<Post>> {
    let ids: Vec<String> = store.get_json(POSTS_LIST_KEY)?.unwrap_or_default();

    let mut posts = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(p) = store.get_json::<Post>(&post_key(&id))? {
            posts.push(p);
        }
    }
    Ok(posts)
}

pub fn create_post(
    store: &dyn Store,
    assets: &AssetStore,
    actor_id: &str,
    fields: PostFields,
    thumbnail: Option<Upload>,
) -> ApiResult<Post> {
    let fields = clean_fields(fields);
    let thumbnail = match thumbnail {
        Some(t) if !fields.title.is_empty() && !fields.category.is_empty() && !fields.description.is_empty() => t,
        _ => {
            return Err(ApiError::validation(
                "Fill in all the fields and choose thumbnail.",
            ))
        }
    };
    check_thumbnail(&thumbnail)?;

    let file_name = unique_filename(&thumbnail.file_name);
    assets
        .save(&file_name, &thumbnail.bytes)
        .map_err(ApiError::storage)?;

    let created = now();
    let post = Post {
        id: Uuid::new_v4().to_string(),
        title: fields.title,
        category: fields.category,
        description: fields.description,
        thumbnail: file_name,
        creator: actor_id.to_string(),
        created_at: created,
        updated_at: created,
    };

    let saved = store.set_json(&post_key(&post.id), &post).and_then(|()| {
        store.upsert_json::<Vec<String>, _>(POSTS_LIST_KEY, |ids| ids.insert(0, post.id.clone()))
    });
    if let Err(e) = saved {
        discard_asset(assets, &post.thumbnail);
        if let Err(cleanup) = store.delete(&post_key(&post.id)) {
            warn!(post_id = %post.id, error = %cleanup, "failed to remove unindexed post");
        }
        return Err(ApiError::Internal(format!("Post could not be created: {e}")));
    }

    adjust_post_count(store, actor_id, 1);

    info!(post_id = %post.id, user_id = %actor_id, "post created");
    Ok(post)
}

/// All posts, most recently updated first.
pub fn get_posts(store: &dyn Store) -> ApiResult<Vec<Post>> {
    let mut posts = all_posts(store)?;
    posts.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(posts)
}

pub fn get_post(store: &dyn Store, id: &str) -> ApiResult<Post> {
    load_post(store, id)
}

/// Posts in `category`, newest first.
pub fn get_cat_posts(store: &dyn Store, category: &str) -> ApiResult<Vec<Post>> {
    let mut posts: Vec<Post> = all_posts(store)?
        .into_iter()
        .filter(|p| p.category == category)
        .collect();
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(posts)
}

/// Posts created by `user_id`, newest first.
pub fn get_user_posts(store: &dyn Store, user_id: &str) -> ApiResult<Vec<Post>> {
    let mut posts: Vec<Post> = all_posts(store)?
        .into_iter()
        .filter(|p| p.creator == user_id)
        .collect();
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(posts)
}

pub fn edit_post(
    store: &dyn Store,
    assets: &AssetStore,
    actor_id: &str,
    post_id: &str,
    fields: PostFields,
    thumbnail: Option<Upload>,
) -> ApiResult<Post> {
    let fields = clean_fields(fields);
    if fields.title.is_empty()
        || fields.category.is_empty()
        || fields.description.chars().count() < MIN_DESCRIPTION_LENGTH
    {
        return Err(ApiError::validation("Fill in all the fields."));
    }

    let existing = load_post(store, post_id)?;
    if existing.creator != actor_id {
        return Err(ApiError::Forbidden("Only the creator can edit this post.".to_string()));
    }

    let new_thumbnail = match thumbnail {
        Some(upload) => {
            check_thumbnail(&upload)?;
            let file_name = unique_filename(&upload.file_name);
            assets.save(&file_name, &upload.bytes).map_err(ApiError::storage)?;
            Some(file_name)
        }
        None => None,
    };

    let mut replaced = None;
    let updated = store.update_json::<Post, _>(&post_key(post_id), |p| {
        p.title = fields.title;
        p.category = fields.category;
        p.description = fields.description;
        if let Some(name) = &new_thumbnail {
            replaced = Some(std::mem::replace(&mut p.thumbnail, name.clone()));
        }
        p.updated_at = now();
    });

    let updated = match updated {
        Ok(Some(p)) => p,
        other => {
            if let Some(name) = &new_thumbnail {
                discard_asset(assets, name);
            }
            return match other {
                Err(e) => Err(ApiError::UpdateFailed(format!("Could not update post: {e}"))),
                _ => Err(ApiError::not_found("Post not found.")),
            };
        }
    };

    if let Some(old) = replaced {
        discard_asset(assets, &old);
    }

    info!(post_id = %post_id, user_id = %actor_id, "post updated");
    Ok(updated)
}

pub fn delete_post(store: &dyn Store, assets: &AssetStore, actor_id: &str, post_id: &str) -> ApiResult<()> {
    if post_id.is_empty() {
        return Err(ApiError::validation("Post unavailable."));
    }

    let post = load_post(store, post_id)?;
    if post.creator != actor_id {
        return Err(ApiError::Forbidden("Post could not be deleted.".to_string()));
    }

    // The record goes only once its thumbnail is gone
    assets.delete(&post.thumbnail).map_err(ApiError::storage)?;

    store.delete(&post_key(post_id))?;
    store.upsert_json::<Vec<String>, _>(POSTS_LIST_KEY, |ids| ids.retain(|id| id != post_id))?;
    adjust_post_count(store, &post.creator, -1);

    info!(post_id = %post_id, user_id = %actor_id, "post deleted");
    Ok(())
}
