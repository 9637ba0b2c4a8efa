pub mod collection_status;
pub mod db;
pub mod locales;
pub mod reviews;

pub use collection_status::{CollectionStats, CollectionStatusRecord};
pub use db::{Db, StoreRetry, StoreUnavailable, DB_UNAVAILABLE_EXIT_CODE};
pub use reviews::{ReviewRecord, ReviewSink};
