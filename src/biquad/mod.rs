mod biquad;

pub use biquad::{Biquad, CascadedBiquad, Filter, SECTION_Q};
