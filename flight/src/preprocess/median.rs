/// Number of samples the running median is taken over.
pub const MEDIAN_WINDOW: usize = 9;

/// A running median over the last `W` values of a single channel.
#[derive(Clone, Debug)]
pub struct MedianFilter<const W: usize> {
  window: [f32; W],
  next: usize,
  filled: usize,
}

impl<const W: usize> Default for MedianFilter<W> {
  fn default() -> Self {
    MedianFilter {
      window: [0.0; W],
      next: 0,
      filled: 0,
    }
  }
}

impl<const W: usize> MedianFilter<W> {
  /// Adds a value and returns the median of the window. Until the window has
  /// filled, the median of the values seen so far is returned.
  pub fn push(&mut self, value: f32) -> f32 {
    self.window[self.next] = value;
    self.next = (self.next + 1) % W;
    self.filled = (self.filled + 1).min(W);

    let mut sorted = self.window;
    let sorted = &mut sorted[..self.filled];
    sorted.sort_unstable_by(f32::total_cmp);

    let middle = self.filled / 2;

    if self.filled % 2 == 0 {
      (sorted[middle - 1] + sorted[middle]) / 2.0
    } else {
      sorted[middle]
    }
  }
}
