mod error;
mod models;
mod store;

pub use error::{CatalogError, CatalogResult};
pub use models::{
    segment_filename, CatalogMetrics, SegmentRecord, SubtitleTrackRecord, VideoRecord, VideoStatus,
};
pub use store::{SqliteCatalogStore, SqliteCatalogStoreBuilder};
