pub mod candle;
pub mod events;
pub mod position;
pub mod signal;
pub mod strategy;

pub use candle::*;
pub use events::*;
pub use position::*;
pub use signal::*;
pub use strategy::*;
