//! Splits extracted text into overlapping passages for embedding.
//!
//! Deterministic for a given text and settings. Windows are measured in
//! characters; a window ends on whitespace when one exists in its second
//! half, and the next window starts `overlap` characters back, moved forward
//! to the next word boundary.

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    /// Character offsets into the source text, `start..end`.
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    /// `overlap` is clamped below `size`; `size` is at least 2.
    pub fn new(size: usize, overlap: usize) -> Self {
        let size = size.max(2);
        Self {
            size,
            overlap: overlap.min(size - 1),
        }
    }

    pub fn split(&self, text: &str) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let n = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0usize;

        loop {
            while start < n && chars[start].is_whitespace() {
                start += 1;
            }
            if start >= n {
                break;
            }

            let mut end = (start + self.size).min(n);
            if end < n {
                let floor = start + self.size / 2;
                if let Some(ws) = (floor..end).rev().find(|&i| chars[i].is_whitespace()) {
                    end = ws;
                }
            }

            let piece: String = chars[start..end].iter().collect();
            let trimmed = piece.trim_end();
            chunks.push(Chunk {
                index: chunks.len(),
                text: trimmed.to_string(),
                start,
                end: start + trimmed.chars().count(),
            });

            if end >= n {
                break;
            }

            let mut next = end.saturating_sub(self.overlap).max(start + 1);
            while next < end && !chars[next - 1].is_whitespace() {
                next += 1;
            }
            start = next;
        }

        chunks
    }
}
