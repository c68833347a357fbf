//! Per-entity stage transforms. Each one works on a table owned by the
//! running entity and reads other entities only through frozen tables.

pub mod extract;
pub mod filter;
pub mod store;
pub mod translate;
pub mod unnest;

pub use extract::extract;
pub use filter::filter;
pub use store::{assign_ids, published_ids};
pub use translate::translate;
pub use unnest::unnest;
