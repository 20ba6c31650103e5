//! Strided matrix regions over flat device buffers.
//!
//! A region is a `rows × cols` window starting at `offset`, with consecutive rows
//! `pitch` elements apart. Kernels only ever see `(offset, pitch)`, so padding
//! and alignment stay a storage concern.

/// Round `cols` up to a multiple of `alignment` elements.
pub fn padded_pitch(cols: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    cols.div_ceil(alignment) * alignment
}

/// A `rows × cols` window into a flat buffer with row stride `pitch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixRegion {
    /// Element offset of `(0, 0)` within the buffer.
    pub offset: usize,
    pub rows: usize,
    pub cols: usize,
    /// Elements between the starts of consecutive rows (`>= cols`).
    pub pitch: usize,
}

impl MatrixRegion {
    pub fn new(offset: usize, rows: usize, cols: usize, pitch: usize) -> Self {
        debug_assert!(cols <= pitch, "pitch {pitch} narrower than {cols} columns");
        Self {
            offset,
            rows,
            cols,
            pitch,
        }
    }

    /// Buffer index of element `(row, col)`.
    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        self.offset + row * self.pitch + col
    }

    /// Same storage, first `rows` rows only.
    pub fn with_rows(self, rows: usize) -> Self {
        debug_assert!(rows <= self.rows);
        Self { rows, ..self }
    }

    /// Number of buffer elements spanned, padding of the last row excluded.
    pub fn span(&self) -> usize {
        if self.rows == 0 || self.cols == 0 {
            0
        } else {
            (self.rows - 1) * self.pitch + self.cols
        }
    }

    /// One past the last buffer element covered by full pitched rows.
    pub fn end(&self) -> usize {
        self.offset + self.rows * self.pitch
    }
}
