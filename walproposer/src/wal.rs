//! The host database's WAL reader/writer is an external collaborator (spec §1); this
//! module defines the capability trait the rest of the crate consumes, plus the
//! page-header arithmetic needed for the election cross-check (spec §4.4) and the
//! per-message size cap used while streaming (spec §4.5).

use walproposer_api::Lsn;

/// A postgres WAL page is always this many bytes.
pub const XLOG_BLCKSZ: u64 = 8192;
/// `XLogShortPageHeaderData` size, MAXALIGN'd.
const SIZE_OF_XLOG_SHORT_PHD: u64 = 24;
/// `XLogLongPageHeaderData` size (short header plus system id/seg size/block size).
const SIZE_OF_XLOG_LONG_PHD: u64 = 40;

/// Upper bound on the WAL range packed into one `AppendRequest` (spec §4.5).
pub const MAX_SEND_SIZE: usize = 16 * XLOG_BLCKSZ as usize;

/// Advance `lsn` past the XLog page header that begins at or before it: the long
/// (segment) header if `lsn` sits at a WAL segment boundary, otherwise the short
/// (block) header if it sits at a page boundary. A position in the middle of a page
/// already past its header is returned unchanged.
pub fn skip_xlog_page_headers(lsn: Lsn, wal_segment_size: u32) -> Lsn {
    let raw: u64 = lsn.into();
    let seg_size = wal_segment_size as u64;

    if seg_size != 0 && raw.is_multiple_of(seg_size) {
        return Lsn(raw + SIZE_OF_XLOG_LONG_PHD);
    }
    if raw.is_multiple_of(XLOG_BLCKSZ) {
        return Lsn(raw + SIZE_OF_XLOG_SHORT_PHD);
    }
    lsn
}

/// WAL production/reading lives entirely in the host database; the proposer only ever
/// asks "how far has WAL been produced" and "give me these bytes".
pub trait WalSource: Send {
    /// Highest WAL end position produced so far (`availableLsn`).
    fn flush_lsn(&self) -> Lsn;

    /// LSN at which this host's on-disk image begins (basebackup / redo start LSN).
    fn redo_start_lsn(&self) -> Lsn;

    /// Read `[begin, end)` of WAL into `out`, appending. `end <= self.flush_lsn()`.
    fn read_wal(&self, begin: Lsn, end: Lsn, out: &mut Vec<u8>) -> std::io::Result<()>;
}

/// A `WalSource` backed by one flat local file, standing in for the host database's WAL
/// when running the binary outside postgres: `flush_lsn` tracks the file's current
/// length and `redo_start_lsn` is fixed at construction. Real WAL production is out of
/// scope (spec §1); this exists only so the binary has something concrete to stream.
pub struct FileWalSource {
    path: std::path::PathBuf,
    redo_start_lsn: Lsn,
}

impl FileWalSource {
    pub fn open(path: std::path::PathBuf, redo_start_lsn: Lsn) -> std::io::Result<FileWalSource> {
        if !path.exists() {
            std::fs::write(&path, [])?;
        }
        Ok(FileWalSource { path, redo_start_lsn })
    }
}

impl WalSource for FileWalSource {
    fn flush_lsn(&self) -> Lsn {
        let len = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Lsn(len)
    }

    fn redo_start_lsn(&self) -> Lsn {
        self.redo_start_lsn
    }

    fn read_wal(&self, begin: Lsn, end: Lsn, out: &mut Vec<u8>) -> std::io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut f = std::fs::File::open(&self.path)?;
        f.seek(SeekFrom::Start(begin.into()))?;
        let want = (u64::from(end) - u64::from(begin)) as usize;
        let start = out.len();
        out.resize(start + want, 0);
        f.read_exact(&mut out[start..])?;
        Ok(())
    }
}
