pub mod engine;
pub mod fileview;
pub mod metastore;
pub mod openfiles;
pub mod tier;

pub use engine::{AdHocWork, PassReport, TieringEngine};
pub use fileview::FileView;
pub use metastore::{MetaBatch, MetaStore};
pub use openfiles::OpenFileSet;
pub use tier::{is_hidden_move_name, MoveOutcome, QueuedMove, Tier};

use std::sync::Arc;

use autotier_core::Config;

/// Builds the tier list from a loaded [`Config`], fastest-first, as the config
/// adapter already orders its `[Tier*]` sections.
pub fn tiers_from_config(config: &Config) -> Vec<Arc<Tier>> {
    config
        .tiers
        .iter()
        .map(|t| Arc::new(Tier::new(t.id.clone(), t.path.clone(), t.quota)))
        .collect()
}
