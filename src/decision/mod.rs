pub mod rules;
pub mod selector;

pub use rules::*;
pub use selector::*;
