use crate::error::SetupError;
use connectors::source::DocumentSource;
use engine_core::lease::LeaseStore;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SetupReport {
    pub indices: usize,
    pub work_items: usize,
    /// Records created by this call; the rest already existed.
    pub created: usize,
}

/// Creates an unassigned lease record for every shard of `indices`, or of
/// every index in the snapshot when `indices` is empty.
///
/// Safe to run repeatedly and concurrently: existing records are left alone.
pub async fn init_work_items(
    source: &dyn DocumentSource,
    store: &dyn LeaseStore,
    indices: &[String],
) -> Result<SetupReport, SetupError> {
    let indices = if indices.is_empty() {
        source.list_indices().await?
    } else {
        indices.to_vec()
    };

    let mut items = Vec::new();
    for index in &indices {
        let shards = source.list_shards(index).await?;
        info!(index, shards = shards.len(), "Enumerated shards");
        items.extend(shards);
    }

    let created = store.create_work_items(&items).await?;
    info!(
        indices = indices.len(),
        work_items = items.len(),
        created,
        "Work items initialized"
    );

    Ok(SetupReport {
        indices: indices.len(),
        work_items: items.len(),
        created,
    })
}
