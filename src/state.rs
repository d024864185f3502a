use std::sync::Arc;

use crate::auth::TokenKeys;
use crate::core::assets::AssetStore;
use crate::core::db::Store;

/// Shared by every worker through `web::Data`.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub assets: AssetStore,
    pub tokens: TokenKeys,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, assets: AssetStore, tokens: TokenKeys) -> Self {
        Self { store, assets, tokens }
    }
}
