mod accumulator;
mod buffer;
mod ring_buffer;

pub use accumulator::{min_window_size, Accumulator, AccumulatorEvent, ReadyBlock};
pub use buffer::AudioBuffer;
pub use ring_buffer::RingBuffer;
