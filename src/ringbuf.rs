//! Fixed-capacity ring buffer that overwrites its oldest entry when full.

#[derive(Debug, Clone, Copy)]
pub struct Ring<T, const N: usize> {
   items: [T; N],
   head: usize,
   count: usize,
}

impl<T: Copy + Default, const N: usize> Default for Ring<T, N> {
   fn default() -> Self {
      Self {
         items: [T::default(); N],
         head: 0,
         count: 0,
      }
   }
}

impl<T: Copy, const N: usize> Ring<T, N> {
   pub fn push(&mut self, item: T) {
      self.items[self.head] = item;
      self.head = (self.head + 1) % N;
      self.count = self.count.saturating_add(1).min(N);
   }

   /// Iterates from the oldest entry to the newest.
   pub fn iter(&self) -> impl ExactSizeIterator<Item = &T> + Clone + '_ {
      let start = if self.count < N { 0 } else { self.head };
      (0..self.count).map(move |i| &self.items[(start + i) % N])
   }

   pub fn last(&self) -> Option<&T> {
      if self.count == 0 {
         return None;
      }
      Some(&self.items[(self.head + N - 1) % N])
   }

   pub const fn len(&self) -> usize {
      self.count
   }

   pub const fn is_empty(&self) -> bool {
      self.count == 0
   }

   pub const fn clear(&mut self) {
      self.head = 0;
      self.count = 0;
   }
}
