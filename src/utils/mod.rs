pub mod warn_dedup;

pub use warn_dedup::*;
