use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn empty_at(offset: usize) -> Self {
        Self {
            start: offset,
            end: offset,
        }
    }
}

/// One textual substitution against the original document.
///
/// An empty `range` is a pure insertion at `range.start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSpan {
    pub range: ByteRange,
    pub replacement: String,
}

impl ChangeSpan {
    pub fn replace(range: ByteRange, replacement: impl Into<String>) -> Self {
        Self {
            range,
            replacement: replacement.into(),
        }
    }

    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            range: ByteRange::empty_at(offset),
            replacement: text.into(),
        }
    }

    pub fn delete(range: ByteRange) -> Self {
        Self {
            range,
            replacement: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeSetError {
    #[error("change {index} at {start}..{end} lies outside the {len}-byte document")]
    OutOfBounds {
        index: usize,
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("change {index} at {start}..{end} splits a UTF-8 character")]
    NotCharBoundary {
        index: usize,
        start: usize,
        end: usize,
    },
    #[error("changes overlap: {first_start}..{first_end} and {second_start}..{second_end}")]
    Overlap {
        first_start: usize,
        first_end: usize,
        second_start: usize,
        second_end: usize,
    },
}

/// An ordered, validated list of substitutions.
///
/// Changes are sorted by position; insertions sharing an offset keep the
/// order in which they were produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<ChangeSpan>,
}

impl ChangeSet {
    pub fn new(mut changes: Vec<ChangeSpan>) -> Self {
        // stable: equal keys keep render order
        changes.sort_by_key(|c| (c.range.start, c.range.end));
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn spans(&self) -> &[ChangeSpan] {
        &self.changes
    }

    pub fn into_spans(self) -> Vec<ChangeSpan> {
        self.changes
    }

    pub fn validate(&self, original: &str) -> Result<(), ChangeSetError> {
        let len = original.len();
        let mut previous: Option<&ChangeSpan> = None;

        for (index, change) in self.changes.iter().enumerate() {
            let ByteRange { start, end } = change.range;
            if start > end || end > len {
                return Err(ChangeSetError::OutOfBounds {
                    index,
                    start,
                    end,
                    len,
                });
            }
            if !original.is_char_boundary(start) || !original.is_char_boundary(end) {
                return Err(ChangeSetError::NotCharBoundary { index, start, end });
            }
            if let Some(prev) = previous
                && start < prev.range.end
            {
                return Err(ChangeSetError::Overlap {
                    first_start: prev.range.start,
                    first_end: prev.range.end,
                    second_start: start,
                    second_end: end,
                });
            }
            previous = Some(change);
        }

        Ok(())
    }

    /// Applies every change exactly once, left to right.
    pub fn apply(&self, original: &str) -> Result<String, ChangeSetError> {
        self.validate(original)?;

        let growth: usize = self.changes.iter().map(|c| c.replacement.len()).sum();
        let mut out = String::with_capacity(original.len() + growth);
        let mut cursor = 0usize;
        for change in &self.changes {
            out.push_str(&original[cursor..change.range.start]);
            out.push_str(&change.replacement);
            cursor = change.range.end;
        }
        out.push_str(&original[cursor..]);

        Ok(out)
    }
}
