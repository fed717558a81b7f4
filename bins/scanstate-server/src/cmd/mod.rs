pub mod inspect;
pub mod serve;

use scanstate_api::StateStore;

/// Close the store, logging instead of failing: by now the command's own
/// result is what gets reported.
pub(crate) async fn close_store(store: &dyn StateStore) {
    if let Err(e) = store.close().await {
        tracing::warn!(store = %store.kind(), error = %e, "store close error");
    }
}
