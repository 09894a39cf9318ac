/// Variable-length rows packed as cumulative offsets over one flat buffer.
///
/// Row `i` occupies `values[offsets[i]..offsets[i + 1]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RaggedArray<T> {
    offsets: Vec<usize>,
    values: Vec<T>,
}

impl<T> Default for RaggedArray<T> {
    fn default() -> Self {
        Self {
            offsets: vec![0],
            values: Vec::new(),
        }
    }
}

impl<T: Clone> RaggedArray<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: &[T]) -> usize {
        self.values.extend_from_slice(row);
        self.offsets.push(self.values.len());
        self.offsets.len() - 2
    }

    pub fn get(&self, row: usize) -> Option<&[T]> {
        let start = *self.offsets.get(row)?;
        let end = *self.offsets.get(row + 1)?;
        Some(&self.values[start..end])
    }

    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
