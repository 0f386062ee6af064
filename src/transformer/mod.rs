mod transformer;
mod types;

pub use transformer::Transformer;
pub use types::{RingPosition, SpectrogramInfo};
