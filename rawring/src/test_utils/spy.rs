use crate::ring::{CompletionEntry, Opcode, Submit, SubmissionEntry};

/// A [`Submit`] that records entries instead of handing them to a kernel.
/// Tests then complete them by hand with [`SpySubmitter::complete`].
#[derive(Debug, Default)]
pub(crate) struct SpySubmitter {
    submitted: Vec<SubmissionEntry>,
}

impl SpySubmitter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.submitted.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.submitted.is_empty()
    }

    /// Removes and returns everything recorded so far.
    pub(crate) fn take(&mut self) -> Vec<SubmissionEntry> {
        std::mem::take(&mut self.submitted)
    }

    /// Removes the single recorded entry with `opcode`, panicking unless
    /// exactly one exists.
    pub(crate) fn take_one(&mut self, opcode: Opcode) -> SubmissionEntry {
        let matching: Vec<usize> = self
            .submitted
            .iter()
            .enumerate()
            .filter(|(_, e)| e.opcode() == Some(opcode))
            .map(|(i, _)| i)
            .collect();

        assert_eq!(
            matching.len(),
            1,
            "expected exactly one {opcode:?}, recorded {:?}",
            self.submitted
        );

        self.submitted.remove(matching[0])
    }

    pub(crate) fn count(&self, opcode: Opcode) -> usize {
        self.submitted
            .iter()
            .filter(|e| e.opcode() == Some(opcode))
            .count()
    }

    /// Builds the completion the kernel would post for `entry`.
    pub(crate) fn complete(entry: &SubmissionEntry, res: i32) -> CompletionEntry {
        CompletionEntry::new(entry.get_user_data(), res)
    }
}

impl Submit for SpySubmitter {
    fn submit(&mut self, entry: &SubmissionEntry) {
        self.submitted.push(*entry);
    }
}
