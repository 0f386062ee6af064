/// Fixed-size block of mono samples.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    data: Vec<f32>,
    size: usize,
}

impl AudioBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0.0; size],
            size,
        }
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Copies as much of `input` as fits starting at `offset`; returns the count copied.
    pub fn fill_from(&mut self, offset: usize, input: &[f32]) -> usize {
        let available = self.size.saturating_sub(offset);
        let count = available.min(input.len());
        self.data[offset..offset + count].copy_from_slice(&input[..count]);
        count
    }
}
