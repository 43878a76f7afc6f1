//! Bulk file reads through a kernel-polled ring.
//!
//! Every file is opened and sized up front, registered with the ring, and
//! read whole with a single `READV` addressed by its registered index. With
//! a kernel poller the submissions are picked up without a syscall.

use crate::arena::{OperationArena, Tag};
use crate::config::RingConfig;
use crate::error::BulkError;
use crate::ring::{RingTransport, SubmissionEntry, Target};
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Why a file was not read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Zero-length file; nothing to read.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// No read was submitted for this file.
    Rejected(RejectReason),

    /// The read completed. `result` is the byte count, or `-errno`; `data`
    /// holds the bytes actually read (empty on error). A short read is
    /// final, it is never resubmitted.
    Completed { result: i32, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: PathBuf,
    pub size: u64,
    pub outcome: FileOutcome,
}

impl FileReport {
    /// The completion result, `None` for rejected files.
    pub fn result(&self) -> Option<i32> {
        match &self.outcome {
            FileOutcome::Completed { result, .. } => Some(*result),
            FileOutcome::Rejected(_) => None,
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.outcome {
            FileOutcome::Completed { data, .. } => data,
            FileOutcome::Rejected(_) => &[],
        }
    }

    /// The last `n` bytes read, fewer if less was read.
    pub fn tail(&self, n: usize) -> &[u8] {
        let data = self.data();
        &data[data.len().saturating_sub(n)..]
    }
}

/// Per-file results, in the order the paths were given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub files: Vec<FileReport>,
}

impl BulkReport {
    pub fn has_rejections(&self) -> bool {
        self.files
            .iter()
            .any(|f| matches!(f.outcome, FileOutcome::Rejected(_)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter()
    }
}

/// Context of one in-flight read: the file's position among the accepted
/// files, which is also its registered index.
#[derive(Debug, Clone, Copy)]
struct FileRead {
    index: usize,
}

/// A file that passed the size check and gets a read.
struct Accepted {
    report: usize,
    file: File,
    buf: Vec<u8>,
}

pub struct BulkReader {
    ring: RingTransport,
}

impl BulkReader {
    pub fn new(cfg: &RingConfig) -> Result<Self, BulkError> {
        Ok(Self {
            ring: RingTransport::init(cfg)?,
        })
    }

    /// A reader on [`RingConfig::kernel_polled`].
    pub fn kernel_polled() -> Result<Self, BulkError> {
        Self::new(&RingConfig::kernel_polled())
    }

    pub fn ring(&self) -> &RingTransport {
        &self.ring
    }

    /// Reads every file in `paths` whole. Open and stat failures abort before
    /// any ring activity; empty files are reported as rejected.
    ///
    /// Consumes the reader: a ring holds one registered descriptor table.
    pub fn read_all<P: AsRef<Path>>(mut self, paths: &[P]) -> Result<BulkReport, BulkError> {
        if paths.is_empty() {
            return Err(BulkError::NoFiles);
        }

        let mut reports = Vec::with_capacity(paths.len());
        let mut accepted = Vec::with_capacity(paths.len());

        for (i, path) in paths.iter().enumerate() {
            let path = path.as_ref();

            let file = File::open(path).map_err(|source| BulkError::Open {
                path: path.to_path_buf(),
                source,
            })?;
            let size = file
                .metadata()
                .map_err(|source| BulkError::Stat {
                    path: path.to_path_buf(),
                    source,
                })?
                .len();

            if size > i32::MAX as u64 {
                return Err(BulkError::TooLarge {
                    path: path.to_path_buf(),
                    size,
                });
            }

            let outcome = if size == 0 {
                tracing::warn!(path = %path.display(), "skipping empty file");
                FileOutcome::Rejected(RejectReason::Empty)
            } else {
                accepted.push(Accepted {
                    report: i,
                    file,
                    buf: vec![0u8; size as usize],
                });
                FileOutcome::Completed {
                    result: 0,
                    data: Vec::new(),
                }
            };

            reports.push(FileReport {
                path: path.to_path_buf(),
                size,
                outcome,
            });
        }

        if !accepted.is_empty() {
            let fds: Vec<RawFd> = accepted.iter().map(|a| a.file.as_raw_fd()).collect();
            self.ring.register_descriptors(&fds)?;

            // Built once and never resized: the kernel reads these while the
            // reads are in flight.
            let iovecs: Vec<libc::iovec> = accepted
                .iter_mut()
                .map(|a| libc::iovec {
                    iov_base: a.buf.as_mut_ptr().cast(),
                    iov_len: a.buf.len(),
                })
                .collect();

            let results = match self.read_registered(&accepted, &iovecs) {
                Ok(results) => results,
                Err(e) => {
                    // Reads may still be in flight, and closing the ring
                    // cancels them asynchronously. The buffers are leaked
                    // rather than freed under the kernel.
                    drop(self);
                    std::mem::forget(iovecs);
                    for a in accepted {
                        std::mem::forget(a.buf);
                    }
                    return Err(e);
                }
            };

            for (file, result) in accepted.into_iter().zip(results) {
                let mut data = file.buf;
                data.truncate(usize::try_from(result).unwrap_or(0));
                reports[file.report].outcome = FileOutcome::Completed { result, data };
            }
        }

        Ok(BulkReport { files: reports })
    }

    /// Reads each registered file into its iovec, keeping at most one ring's
    /// worth of reads in flight. Returns the completion result per file, in
    /// `accepted` order.
    fn read_registered(
        &mut self,
        accepted: &[Accepted],
        iovecs: &[libc::iovec],
    ) -> Result<Vec<i32>, BulkError> {
        let window = (self.ring.sq_capacity() as usize).min(iovecs.len());
        let mut ops = OperationArena::with_capacity(window);
        let mut results = vec![0i32; iovecs.len()];

        self.ring.wake_if_needed()?;

        let mut next = 0;
        let mut done = 0;
        let mut completed = Vec::new();
        while done < iovecs.len() {
            while next < iovecs.len() && ops.len() < window {
                let tag = ops.insert(FileRead { index: next })?;
                let entry =
                    SubmissionEntry::readv(Target::Fixed(next as u32), &iovecs[next], 1, 0)
                        .user_data(tag.user_data());

                self.ring.submit(&entry);
                next += 1;
            }

            self.ring.drain_completions(1, |cqe| completed.push(cqe))?;

            for cqe in completed.drain(..) {
                let op = match ops.take(Tag::from_user_data(cqe.user_data())) {
                    Ok(op) => op,
                    Err(e) => {
                        tracing::warn!(error = %e, res = cqe.result(), "dropping completion");
                        continue;
                    }
                };
                let a = &accepted[op.index];

                tracing::debug!(
                    fd = a.file.as_raw_fd(),
                    index = op.index,
                    res = cqe.result(),
                    "read complete"
                );

                if cqe.result() >= 0 && (cqe.result() as usize) < a.buf.len() {
                    tracing::warn!(index = op.index, res = cqe.result(), "short read");
                }

                results[op.index] = cqe.result();
                done += 1;
            }
        }

        Ok(results)
    }

    #[cfg(test)]
    fn ring_mut(&mut self) -> &mut RingTransport {
        &mut self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingMode;
    use crate::test_utils::io_uring_available;
    use anyhow::Result;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(bytes: &[u8]) -> Result<NamedTempFile> {
        let mut f = NamedTempFile::new()?;
        f.write_all(bytes)?;
        f.flush()?;
        Ok(f)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'a' + (i % 26) as u8).collect()
    }

    fn reader_or_skip(cfg: &RingConfig) -> Result<Option<BulkReader>> {
        if !io_uring_available(cfg) {
            return Ok(None);
        }
        Ok(Some(BulkReader::new(cfg)?))
    }

    #[rstest]
    #[case::kernel_polled(RingConfig::kernel_polled())]
    #[case::default_mode(RingConfig::new(1024, RingMode::Default))]
    fn test_read_mixed_sizes(#[case] cfg: RingConfig) -> Result<()> {
        let Some(reader) = reader_or_skip(&cfg)? else {
            return Ok(());
        };

        let empty = file_with(b"")?;
        let small = file_with(&pattern(100))?;
        let large = file_with(&pattern(5000))?;

        let report = reader.read_all(&[empty.path(), small.path(), large.path()])?;

        assert_eq!(report.files.len(), 3);
        assert!(report.has_rejections());

        let [e, s, l] = &report.files[..] else {
            anyhow::bail!("unexpected report shape");
        };

        assert_eq!(e.path, empty.path());
        assert_eq!(e.outcome, FileOutcome::Rejected(RejectReason::Empty));
        assert_eq!(e.result(), None);
        assert!(e.tail(10).is_empty());

        assert_eq!(s.size, 100);
        assert_eq!(s.result(), Some(100));
        assert_eq!(s.data(), pattern(100).as_slice());

        assert_eq!(l.size, 5000);
        assert_eq!(l.result(), Some(5000));
        assert_eq!(l.tail(10), &pattern(5000)[4990..]);

        Ok(())
    }

    #[test]
    fn test_more_files_than_ring_slots() -> Result<()> {
        let cfg = RingConfig::new(4, RingMode::Default);
        let Some(reader) = reader_or_skip(&cfg)? else {
            return Ok(());
        };

        let files = (1..=10)
            .map(|i| file_with(&pattern(i * 37)))
            .collect::<Result<Vec<_>>>()?;
        let paths: Vec<&Path> = files.iter().map(|f| f.path()).collect();

        let report = reader.read_all(&paths)?;

        assert!(!report.has_rejections());
        for (i, file) in report.iter().enumerate() {
            assert_eq!(file.result(), Some(((i + 1) * 37) as i32));
            assert_eq!(file.data(), pattern((i + 1) * 37).as_slice());
        }

        Ok(())
    }

    #[test]
    fn test_stray_completion_is_skipped() -> Result<()> {
        let cfg = RingConfig::new(8, RingMode::Default);
        let Some(mut reader) = reader_or_skip(&cfg)? else {
            return Ok(());
        };

        // Completes alongside the reads with a tag no read owns.
        reader.ring_mut().submit(&SubmissionEntry::nop().user_data(999));

        let first = file_with(&pattern(64))?;
        let second = file_with(&pattern(300))?;
        let report = reader.read_all(&[first.path(), second.path()])?;

        assert_eq!(report.files[0].result(), Some(64));
        assert_eq!(report.files[1].result(), Some(300));
        assert_eq!(report.files[1].data(), pattern(300).as_slice());

        Ok(())
    }

    #[test]
    fn test_only_empty_files_skip_the_ring() -> Result<()> {
        let cfg = RingConfig::new(8, RingMode::Default);
        let Some(reader) = reader_or_skip(&cfg)? else {
            return Ok(());
        };

        let empty = file_with(b"")?;
        let report = reader.read_all(&[empty.path()])?;

        assert!(report.has_rejections());
        Ok(())
    }

    #[test]
    fn test_no_files() -> Result<()> {
        let cfg = RingConfig::new(8, RingMode::Default);
        let Some(reader) = reader_or_skip(&cfg)? else {
            return Ok(());
        };

        let paths: [&Path; 0] = [];
        assert!(matches!(reader.read_all(&paths), Err(BulkError::NoFiles)));

        Ok(())
    }

    #[test]
    fn test_missing_file_fails_before_submission() -> Result<()> {
        let cfg = RingConfig::new(8, RingMode::Default);
        let Some(reader) = reader_or_skip(&cfg)? else {
            return Ok(());
        };

        let good = file_with(b"data")?;
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("missing");

        let err = reader
            .read_all(&[good.path(), missing.as_path()])
            .expect_err("missing file");
        assert!(matches!(err, BulkError::Open { ref path, .. } if path == &missing));

        Ok(())
    }

    #[test]
    fn test_tail_shorter_than_request() {
        let report = FileReport {
            path: PathBuf::from("x"),
            size: 3,
            outcome: FileOutcome::Completed {
                result: 3,
                data: b"abc".to_vec(),
            },
        };

        assert_eq!(report.tail(10), b"abc");
        assert_eq!(report.tail(2), b"bc");
    }
}
