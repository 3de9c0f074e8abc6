use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

use super::protocol::{FileChunk, ProtocolError};

pub const MAX_FILE_BYTES: usize = 64 * 1024 * 1024;
/// Partially received files one session may hold at once.
pub const MAX_IN_FLIGHT_FILES: usize = 64;
/// Bytes buffered across every partial file of one session.
pub const MAX_SESSION_BUFFERED_BYTES: usize = 256 * 1024 * 1024;

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Chunks of one file in flight. Indices may arrive in any order; a repeated
/// index replaces the earlier bytes.
#[derive(Debug)]
pub struct FileReceiver {
    checksum: String,
    total_chunks: i64,
    chunks: BTreeMap<i64, Vec<u8>>,
    buffered: usize,
}

impl FileReceiver {
    /// # Errors
    /// Returns `InvalidChunk` when `total_chunks` is not positive.
    pub fn new(checksum: &str, total_chunks: i64) -> Result<Self, ProtocolError> {
        if total_chunks <= 0 {
            return Err(ProtocolError::InvalidChunk {
                index: 0,
                total_chunks,
            });
        }
        Ok(Self {
            checksum: checksum.to_ascii_lowercase(),
            total_chunks,
            chunks: BTreeMap::new(),
            buffered: 0,
        })
    }

    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// # Errors
    /// Returns `InvalidChunk` for indices outside `0..total_chunks`.
    pub fn add_chunk(&mut self, index: i64, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        if !(0..self.total_chunks).contains(&index) {
            return Err(ProtocolError::InvalidChunk {
                index,
                total_chunks: self.total_chunks,
            });
        }
        self.buffered += bytes.len();
        if let Some(previous) = self.chunks.insert(index, bytes) {
            self.buffered -= previous.len();
        }
        Ok(())
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        i64::try_from(self.chunks.len()).is_ok_and(|received| received == self.total_chunks)
    }

    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Concatenates the chunks in index order and verifies the SHA-256.
    ///
    /// # Errors
    /// Returns `InvalidChunk` if chunks are missing and `ChecksumMismatch`
    /// if the assembled bytes do not hash to the declared checksum.
    pub fn reassemble(self, path: &str) -> Result<Vec<u8>, ProtocolError> {
        if !self.is_complete() {
            let missing = (0..self.total_chunks)
                .find(|index| !self.chunks.contains_key(index))
                .unwrap_or(self.total_chunks);
            return Err(ProtocolError::InvalidChunk {
                index: missing,
                total_chunks: self.total_chunks,
            });
        }

        let mut assembled = Vec::with_capacity(self.buffered);
        for bytes in self.chunks.into_values() {
            assembled.extend_from_slice(&bytes);
        }
        if sha256_hex(&assembled) != self.checksum {
            return Err(ProtocolError::ChecksumMismatch(path.to_string()));
        }
        Ok(assembled)
    }
}

/// In-flight files of one application, keyed by relative path.
#[derive(Debug)]
pub struct Transfers {
    files: HashMap<String, FileReceiver>,
    max_files: usize,
    max_buffered: usize,
}

impl Default for Transfers {
    fn default() -> Self {
        Self::with_limits(MAX_IN_FLIGHT_FILES, MAX_SESSION_BUFFERED_BYTES)
    }
}

impl Transfers {
    #[must_use]
    pub fn with_limits(max_files: usize, max_buffered: usize) -> Self {
        Self {
            files: HashMap::new(),
            max_files,
            max_buffered,
        }
    }

    /// Starts (or restarts) a file. Called for `file_change` headers.
    pub fn reset(&mut self, path: &str) {
        self.files.remove(path);
    }

    /// Feeds one chunk; returns the verified file once the last chunk lands.
    /// A chunk whose checksum or chunk count differs from the file in flight
    /// starts that file over.
    ///
    /// # Errors
    /// Chunk index, size or checksum failures. The path's buffer is dropped
    /// on any error.
    pub fn accept(&mut self, chunk: FileChunk) -> Result<Option<Vec<u8>>, ProtocolError> {
        let FileChunk {
            path,
            index,
            total_chunks,
            checksum,
            bytes,
        } = chunk;

        let mut receiver = match self.files.remove(&path) {
            Some(receiver)
                if receiver.checksum().eq_ignore_ascii_case(&checksum) && receiver.total_chunks == total_chunks =>
            {
                receiver
            }
            _ => FileReceiver::new(&checksum, total_chunks)?,
        };
        receiver.add_chunk(index, bytes)?;

        if receiver.buffered_bytes() > MAX_FILE_BYTES {
            return Err(ProtocolError::FileTooLarge {
                path,
                limit: MAX_FILE_BYTES,
            });
        }
        if receiver.is_complete() {
            return receiver.reassemble(&path).map(Some);
        }

        if self.files.len() >= self.max_files {
            return Err(ProtocolError::TooManyInFlight {
                what: "files",
                limit: self.max_files,
            });
        }
        if self.buffered_bytes() + receiver.buffered_bytes() > self.max_buffered {
            return Err(ProtocolError::TooManyInFlight {
                what: "buffered bytes",
                limit: self.max_buffered,
            });
        }
        self.files.insert(path, receiver);
        Ok(None)
    }

    /// Bytes held by every partial file.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.files.values().map(FileReceiver::buffered_bytes).sum()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn chunk(path: &str, index: i64, total_chunks: i64, checksum: &str, bytes: &[u8]) -> FileChunk {
        FileChunk {
            path: path.to_string(),
            index,
            total_chunks,
            checksum: checksum.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let mut receiver = FileReceiver::new("ab", 2).expect("receiver");
        assert!(matches!(receiver.add_chunk(2, vec![1]), Err(ProtocolError::InvalidChunk { index: 2, .. })));
        assert!(matches!(receiver.add_chunk(-1, vec![1]), Err(ProtocolError::InvalidChunk { index: -1, .. })));
        assert!(FileReceiver::new("ab", 0).is_err());
    }

    #[test]
    fn partial_files_beyond_the_cap_end_the_session() {
        let mut transfers = Transfers::default();
        let checksum = sha256_hex(b"never completes");
        for file in 0..MAX_IN_FLIGHT_FILES {
            let path = format!("src/{file}.txt");
            assert_eq!(transfers.accept(chunk(&path, 0, 3, &checksum, b"x")).expect("buffered"), None);
        }

        let error = transfers
            .accept(chunk("src/one-more.txt", 0, 3, &checksum, b"x"))
            .expect_err("cap reached");
        assert!(error.closes_session());
        assert_eq!(error.code(), "too_many_in_flight");
        assert_eq!(transfers.in_flight(), MAX_IN_FLIGHT_FILES);

        // Chunks of files already in flight are still taken.
        assert_eq!(transfers.accept(chunk("src/0.txt", 1, 3, &checksum, b"y")).expect("known file"), None);
    }

    #[test]
    fn buffered_bytes_are_capped_across_files() {
        let mut transfers = Transfers::with_limits(10, 8);
        let checksum = sha256_hex(b"never completes");
        assert_eq!(transfers.accept(chunk("a.bin", 0, 2, &checksum, b"1234")).expect("buffered"), None);
        assert_eq!(transfers.accept(chunk("b.bin", 0, 2, &checksum, b"5678")).expect("buffered"), None);

        let error = transfers
            .accept(chunk("c.bin", 0, 2, &checksum, b"9"))
            .expect_err("byte cap reached");
        assert!(matches!(error, ProtocolError::TooManyInFlight { what: "buffered bytes", limit: 8 }));
        assert!(error.closes_session());
        assert_eq!(transfers.buffered_bytes(), 8);
        assert_eq!(transfers.in_flight(), 2);
    }

    #[test]
    fn a_wrong_checksum_aborts_the_file() {
        let mut transfers = Transfers::default();
        let error = transfers
            .accept(chunk("a.txt", 0, 1, &sha256_hex(b"expected"), b"different"))
            .expect_err("mismatch");
        assert_eq!(error, ProtocolError::ChecksumMismatch("a.txt".to_string()));
        assert_eq!(transfers.in_flight(), 0);
    }

    #[test]
    fn a_new_checksum_restarts_the_file_in_flight() {
        let mut transfers = Transfers::default();
        let stale = sha256_hex(b"old-old-");
        assert_eq!(transfers.accept(chunk("a.txt", 0, 2, &stale, b"old-")).expect("first"), None);

        let fresh = sha256_hex(b"new-new-");
        assert_eq!(transfers.accept(chunk("a.txt", 1, 2, &fresh, b"new-")).expect("restart"), None);
        let done = transfers.accept(chunk("a.txt", 0, 2, &fresh, b"new-")).expect("complete");
        assert_eq!(done.as_deref(), Some(&b"new-new-"[..]));
    }

    #[test]
    fn uppercase_checksums_are_accepted() {
        let mut transfers = Transfers::default();
        let checksum = sha256_hex(b"hello").to_ascii_uppercase();
        let done = transfers.accept(chunk("a.txt", 0, 1, &checksum, b"hello")).expect("complete");
        assert_eq!(done.as_deref(), Some(&b"hello"[..]));
    }

    proptest! {
        #[test]
        fn chunks_in_any_order_reassemble_to_the_declared_checksum(
            parts in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..12),
            seed in any::<u64>(),
        ) {
            let original = parts.concat();
            let checksum = sha256_hex(&original);
            let total = i64::try_from(parts.len()).expect("small");

            let mut order = (0..parts.len()).collect::<Vec<_>>();
            let mut state = seed;
            for position in (1..order.len()).rev() {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
                let swap_with = usize::try_from(state >> 33).expect("fits") % (position + 1);
                order.swap(position, swap_with);
            }

            let mut transfers = Transfers::default();
            let mut assembled = None;
            for (step, index) in order.iter().enumerate() {
                let result = transfers
                    .accept(chunk("f.bin", i64::try_from(*index).expect("small"), total, &checksum, &parts[*index]))
                    .expect("accept");
                if step + 1 < order.len() {
                    prop_assert!(result.is_none());
                } else {
                    assembled = result;
                }
            }

            let assembled = assembled.expect("complete after the last chunk");
            prop_assert_eq!(sha256_hex(&assembled), checksum);
            prop_assert_eq!(assembled, original);
        }
    }
}
