use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::*;
use crate::core::assets::{unique_filename, AssetStore, Upload};
use crate::core::db::{Store, StoreExt};
use crate::core::errors::{ApiError, ApiResult};
use crate::core::helpers::{hash_password, normalize_email, now, validate_uuid, verify_password};
use crate::models::models::{EditUserRequest, PublicUser, RegisterRequest, User};

/// Points `email` at `user_id` unless another user already owns it.
fn claim_email(store: &dyn Store, email: &str, user_id: &str) -> anyhow::Result<bool> {
    let mut claimed = false;
    store.update(&email_key(email), &mut |current| match current {
        Some(owner) if owner != user_id.as_bytes() => Ok(Some(owner)),
        _ => {
            claimed = true;
            Ok(Some(user_id.as_bytes().to_vec()))
        }
    })?;
    Ok(claimed)
}

fn release_email(store: &dyn Store, email: &str, user_id: &str) -> anyhow::Result<()> {
    store.update(&email_key(email), &mut |current| match current {
        Some(owner) if owner == user_id.as_bytes() => Ok(None),
        other => Ok(other),
    })
}

pub fn find_user_by_email(store: &dyn Store, email: &str) -> ApiResult<Option<User>> {
    let Some(owner) = store.get(&email_key(email))? else {
        return Ok(None);
    };
    let id = String::from_utf8_lossy(&owner);
    Ok(store.get_json::<User>(&user_key(&id))?)
}

/// Stores a new user record and indexes it by email and in the users list.
pub fn insert_user(store: &dyn Store, user: &User) -> ApiResult<()> {
    if !claim_email(store, &user.email, &user.id)? {
        return Err(ApiError::validation("Email already exists."));
    }
    let stored = store.set_json(&user_key(&user.id), user).and_then(|()| {
        store.upsert_json::<Vec<String>, _>(USERS_LIST_KEY, |ids| ids.push(user.id.clone()))
    });
    if let Err(e) = stored {
        if let Err(cleanup) = store.delete(&user_key(&user.id)) {
            warn!(user_id = %user.id, error = %cleanup, "failed to remove unindexed user");
        }
        unclaim_email(store, &user.email, &user.id);
        return Err(e.into());
    }
    Ok(())
}

/// Drops a claim taken for a write that did not complete.
fn unclaim_email(store: &dyn Store, email: &str, user_id: &str) {
    if let Err(e) = release_email(store, email, user_id) {
        warn!(user_id = %user_id, email = %email, error = %e, "failed to release email claim");
    }
}

pub fn load_user(store: &dyn Store, id: &str) -> ApiResult<User> {
    if !validate_uuid(id) {
        return Err(ApiError::not_found("User not found."));
    }
    store
        .get_json::<User>(&user_key(id))?
        .ok_or_else(|| ApiError::not_found("User not found."))
}

fn registration_failed(err: impl std::fmt::Display) -> ApiError {
    error!(error = %err, "user registration failed");
    ApiError::RegistrationFailed("User registration failed.".to_string())
}

pub fn register_user(store: &dyn Store, req: RegisterRequest) -> ApiResult<PublicUser> {
    let name = req.name.trim().to_string();
    let email = normalize_email(&req.email);

    if name.is_empty() || email.is_empty() || req.password.is_empty() {
        return Err(ApiError::validation("Please fill all fields."));
    }
    if find_user_by_email(store, &email).map_err(registration_failed)?.is_some() {
        return Err(ApiError::validation("Email already exists."));
    }
    if req.password.trim().len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::validation("Password should be at least 6 characters."));
    }
    if req.password != req.confirm_password {
        return Err(ApiError::validation("Passwords do not match."));
    }

    let created = now();
    let user = User {
        id: Uuid::new_v4().to_string(),
        name,
        email,
        password: hash_password(&req.password).map_err(registration_failed)?,
        avatar: None,
        posts: 0,
        created_at: created,
        updated_at: created,
    };

    insert_user(store, &user).map_err(|e| match e {
        ApiError::Validation(_) => e,
        other => registration_failed(other),
    })?;

    info!(user_id = %user.id, "user registered");
    Ok(user.into())
}

pub fn get_users(store: &dyn Store) -> ApiResult<Vec<PublicUser>> {
    let ids: Vec<String> = store.get_json(USERS_LIST_KEY)?.unwrap_or_default();

    let mut users = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(u) = store.get_json::<User>(&user_key(&id))? {
            users.push(u.into());
        }
    }
    Ok(users)
}

pub fn get_user(store: &dyn Store, id: &str) -> ApiResult<PublicUser> {
    load_user(store, id).map(Into::into)
}

pub fn change_avatar(
    store: &dyn Store,
    assets: &AssetStore,
    actor_id: &str,
    upload: Option<Upload>,
) -> ApiResult<PublicUser> {
    let upload = upload.ok_or_else(|| ApiError::validation("Please choose an image."))?;
    if upload.size > MAX_AVATAR_BYTES {
        return Err(ApiError::AssetTooLarge(
            "Profile picture too big. Should be less than 500kb.".to_string(),
        ));
    }

    load_user(store, actor_id)?;

    let file_name = unique_filename(&upload.file_name);
    assets.save(&file_name, &upload.bytes).map_err(ApiError::storage)?;

    let mut previous = None;
    let updated = store.update_json::<User, _>(&user_key(actor_id), |u| {
        previous = u.avatar.replace(file_name.clone());
        u.updated_at = now();
    });

    let updated = match updated {
        Ok(Some(u)) => u,
        Ok(None) => {
            discard_asset(assets, &file_name);
            return Err(ApiError::UpdateFailed("Avatar could not be changed.".to_string()));
        }
        Err(e) => {
            discard_asset(assets, &file_name);
            return Err(e.into());
        }
    };

    if let Some(old) = previous {
        discard_asset(assets, &old);
    }

    info!(user_id = %actor_id, avatar = %file_name, "avatar changed");
    Ok(updated.into())
}

pub fn edit_user(store: &dyn Store, actor_id: &str, req: EditUserRequest) -> ApiResult<PublicUser> {
    let name = req.name.trim().to_string();
    let email = normalize_email(&req.email);

    if name.is_empty()
        || email.is_empty()
        || req.current_password.is_empty()
        || req.new_password.is_empty()
        || req.confirm_new_password.is_empty()
    {
        return Err(ApiError::validation("Fill in all fields."));
    }

    let user = load_user(store, actor_id)?;

    if !verify_password(&req.current_password, &user.password) {
        return Err(ApiError::InvalidCredentials("Invalid current password.".to_string()));
    }
    if let Some(owner) = find_user_by_email(store, &email)? {
        if owner.id != user.id {
            return Err(ApiError::validation("Email already exists."));
        }
    }
    if req.new_password != req.confirm_new_password {
        return Err(ApiError::validation("New passwords do not match."));
    }

    let password = hash_password(&req.new_password)?;

    let email_changed = email != user.email;
    if email_changed && !claim_email(store, &email, &user.id)? {
        return Err(ApiError::validation("Email already exists."));
    }

    let updated = store.update_json::<User, _>(&user_key(actor_id), |u| {
        u.name = name;
        u.email = email.clone();
        u.password = password;
        u.updated_at = now();
    });

    let updated = match updated {
        Ok(Some(u)) => u,
        other => {
            if email_changed {
                unclaim_email(store, &email, &user.id);
            }
            return match other {
                Err(e) => Err(e.into()),
                _ => Err(ApiError::not_found("User not found.")),
            };
        }
    };

    if email_changed {
        if let Err(e) = release_email(store, &user.email, &user.id) {
            warn!(user_id = %actor_id, error = %e, "failed to release previous email");
        }
    }

    info!(user_id = %actor_id, "user profile updated");
    Ok(updated.into())
}

/// Best-effort removal of an asset that is no longer referenced.
pub(crate) fn discard_asset(assets: &AssetStore, name: &str) {
    if let Err(e) = assets.delete(name) {
        warn!(asset = %name, error = %e, "failed to delete asset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::{FlakyStore, SqliteStore};

    fn register(name: &str, email: &str, pw: &str, confirm: &str) -> RegisterRequest {
        RegisterRequest {
            name: name.to_string(),
            email: email.to_string(),
            password: pw.to_string(),
            confirm_password: confirm.to_string(),
        }
    }

    fn edit(email: &str, current: &str, new: &str, confirm: &str) -> EditUserRequest {
        EditUserRequest {
            name: "Renamed".to_string(),
            email: email.to_string(),
            current_password: current.to_string(),
            new_password: new.to_string(),
            confirm_new_password: confirm.to_string(),
        }
    }

    fn assets() -> (tempfile::TempDir, AssetStore) {
        let dir = tempfile::tempdir().unwrap();
        let assets = AssetStore::open(dir.path()).unwrap();
        (dir, assets)
    }

    #[test]
    fn registration_hashes_and_normalizes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = register_user(&store, register("A", "A@X.com", "secret1", "secret1")).unwrap();

        assert_eq!(user.email, "a@x.com");
        assert_eq!(user.posts, 0);

        let stored = load_user(&store, &user.id).unwrap();
        assert_ne!(stored.password, "secret1");
        assert!(verify_password("secret1", &stored.password));
    }

    #[test]
    fn duplicate_email_is_rejected_case_insensitively() {
        let store = SqliteStore::open_in_memory().unwrap();
        register_user(&store, register("A", "a@x.com", "secret1", "secret1")).unwrap();

        let err = register_user(&store, register("B", "A@x.COM", "secret1", "secret1")).unwrap_err();
        assert!(matches!(err, ApiError::Validation(ref m) if m == "Email already exists."));
        assert_eq!(get_users(&store).unwrap().len(), 1);
    }

    #[test]
    fn registration_checks_run_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();

        let missing = register_user(&store, register("", "a@x.com", "secret1", "secret1")).unwrap_err();
        assert_eq!(missing.to_string(), "Please fill all fields.");

        let short = register_user(&store, register("A", "a@x.com", "  abc  ", "  abc  ")).unwrap_err();
        assert_eq!(short.to_string(), "Password should be at least 6 characters.");

        let mismatch = register_user(&store, register("A", "a@x.com", "secret1", "secret2")).unwrap_err();
        assert_eq!(mismatch.to_string(), "Passwords do not match.");

        assert!(get_users(&store).unwrap().is_empty());
    }

    #[test]
    fn lookups_never_expose_password() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = register_user(&store, register("A", "a@x.com", "secret1", "secret1")).unwrap();

        let json = serde_json::to_value(get_user(&store, &user.id).unwrap()).unwrap();
        assert!(json.get("password").is_none());

        let list = serde_json::to_value(get_users(&store).unwrap()).unwrap();
        assert!(list[0].get("password").is_none());

        assert!(matches!(get_user(&store, "nope"), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn avatar_replacement_removes_previous_file() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (_dir, assets) = assets();
        let user = register_user(&store, register("A", "a@x.com", "secret1", "secret1")).unwrap();

        let first = change_avatar(&store, &assets, &user.id, Some(Upload::new("me.png", vec![1; 10]))).unwrap();
        let first_name = first.avatar.clone().unwrap();
        assert!(first_name.starts_with("me") && first_name.ends_with(".png"));
        assert!(assets.exists(&first_name));

        let second = change_avatar(&store, &assets, &user.id, Some(Upload::new("me.png", vec![2; 10]))).unwrap();
        let second_name = second.avatar.unwrap();
        assert_ne!(first_name, second_name);
        assert!(assets.exists(&second_name));
        assert!(!assets.exists(&first_name));
    }

    #[test]
    fn oversized_avatar_is_rejected_before_any_write() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (dir, assets) = assets();
        let user = register_user(&store, register("A", "a@x.com", "secret1", "secret1")).unwrap();

        let big = Upload::new("big.png", vec![0; MAX_AVATAR_BYTES + 1]);
        let err = change_avatar(&store, &assets, &user.id, Some(big)).unwrap_err();

        assert!(matches!(err, ApiError::AssetTooLarge(_)));
        assert!(load_user(&store, &user.id).unwrap().avatar.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn avatar_requires_a_file() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (_dir, assets) = assets();
        let err = change_avatar(&store, &assets, "someone", None).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn edit_user_updates_profile_and_password() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = register_user(&store, register("A", "a@x.com", "secret1", "secret1")).unwrap();

        let updated = edit_user(&store, &user.id, edit("New@X.com", "secret1", "secret2", "secret2")).unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.email, "new@x.com");

        let stored = load_user(&store, &user.id).unwrap();
        assert!(verify_password("secret2", &stored.password));
        assert!(!verify_password("secret1", &stored.password));

        // the old address is free again, the new one resolves to the same user
        assert!(find_user_by_email(&store, "a@x.com").unwrap().is_none());
        assert_eq!(find_user_by_email(&store, "new@x.com").unwrap().unwrap().id, user.id);
    }

    #[test]
    fn edit_user_keeping_own_email_is_allowed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = register_user(&store, register("A", "a@x.com", "secret1", "secret1")).unwrap();

        let updated = edit_user(&store, &user.id, edit("a@x.com", "secret1", "secret2", "secret2")).unwrap();
        assert_eq!(updated.email, "a@x.com");
        assert_eq!(find_user_by_email(&store, "a@x.com").unwrap().unwrap().id, user.id);
    }

    #[test]
    fn edit_user_rejections() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = register_user(&store, register("A", "a@x.com", "secret1", "secret1")).unwrap();
        register_user(&store, register("B", "b@x.com", "secret1", "secret1")).unwrap();

        let wrong = edit_user(&store, &a.id, edit("a@x.com", "bad-pass", "secret2", "secret2")).unwrap_err();
        assert!(matches!(wrong, ApiError::InvalidCredentials(_)));

        let taken = edit_user(&store, &a.id, edit("B@x.com", "secret1", "secret2", "secret2")).unwrap_err();
        assert_eq!(taken.to_string(), "Email already exists.");

        let mismatch = edit_user(&store, &a.id, edit("a@x.com", "secret1", "secret2", "secret3")).unwrap_err();
        assert!(matches!(mismatch, ApiError::Validation(_)));

        let missing = edit_user(&store, &a.id, edit("a@x.com", "secret1", "secret2", "")).unwrap_err();
        assert_eq!(missing.to_string(), "Fill in all fields.");

        let stored = load_user(&store, &a.id).unwrap();
        assert_eq!(stored.name, "A");
        assert!(verify_password("secret1", &stored.password));
    }

    #[test]
    fn failed_registration_write_frees_the_email() {
        let store = FlakyStore::new("user:", 1);
        let req = register("A", "a@x.com", "secret1", "secret1");

        let err = register_user(&store, req.clone()).unwrap_err();
        assert!(matches!(err, ApiError::RegistrationFailed(_)));
        assert!(store.get(&email_key("a@x.com")).unwrap().is_none());
        assert!(get_users(&store).unwrap().is_empty());

        let user = register_user(&store, req).unwrap();
        assert_eq!(find_user_by_email(&store, "a@x.com").unwrap().unwrap().id, user.id);
    }

    #[test]
    fn failed_profile_write_frees_the_new_email() {
        let store = FlakyStore::new("user:", 0);
        let user = register_user(&store, register("A", "a@x.com", "secret1", "secret1")).unwrap();

        store.fail_next(1);
        assert!(edit_user(&store, &user.id, edit("new@x.com", "secret1", "secret2", "secret2")).is_err());

        assert!(store.get(&email_key("new@x.com")).unwrap().is_none());
        assert_eq!(find_user_by_email(&store, "a@x.com").unwrap().unwrap().id, user.id);
        assert_eq!(load_user(&store, &user.id).unwrap().email, "a@x.com");

        register_user(&store, register("B", "new@x.com", "secret1", "secret1")).unwrap();
    }

    #[test]
    fn names_are_stored_as_sent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = register_user(&store, register("  Tom & Jerry <3 ", "t@x.com", "secret1", "secret1")).unwrap();
        assert_eq!(user.name, "Tom & Jerry <3");
        assert_eq!(load_user(&store, &user.id).unwrap().name, "Tom & Jerry <3");
    }
}
