//! Blogging backend: users with avatars, posts with thumbnails.
//!
//! Workflows in [`users`] and [`posts`] are plain functions over a
//! [`Store`](crate::core::db::Store) and an
//! [`AssetStore`](crate::core::assets::AssetStore); [`handlers`] maps them
//! onto actix-web routes.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod posts;
pub mod state;
pub mod static_server;
pub mod users;

pub mod core {
    pub mod assets;
    pub mod db;
    pub mod errors;
    pub mod helpers;
}

pub mod models {
    pub mod models;
}
