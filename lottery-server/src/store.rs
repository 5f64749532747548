//! Append-only bet storage shared by every connection handler.
//!
//! Rows are newline-terminated bet records in a single file. One async mutex
//! covers both directions: a batch append and a full scan never overlap, so
//! a reader only ever sees complete rows and rows of different batches never
//! interleave.
//!
//! A row counts as stored once its newline is on disk. An unterminated tail
//! left by a failed or interrupted write is skipped by scans and cut off
//! before the next append.

use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::bet::Bet;

const ROW_END: u8 = b'\n';
const TAIL_WINDOW: usize = 512;

pub struct BetStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl BetStore {
    /// Prepares a store at `path`, creating missing parent directories and
    /// dropping any partial row a previous run left behind.
    ///
    /// The file itself is created by the first append.
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        match OpenOptions::new().read(true).write(true).open(&path).await {
            Ok(mut file) => {
                discard_partial_row(&mut file, &path).await?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a whole batch as one unit.
    ///
    /// The batch is rendered into one buffer and written and flushed before
    /// the lock is released. If the write fails, the file is cut back to its
    /// previous length so no partial row stays behind.
    pub async fn append(&self, bets: &[Bet]) -> io::Result<()> {
        if bets.is_empty() {
            return Ok(());
        }

        let mut rows = Vec::new();
        for bet in bets {
            rows.extend_from_slice(&bet.encode());
            rows.push(ROW_END);
        }

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        let committed = discard_partial_row(&mut file, &self.path).await?;

        if let Err(err) = write_rows(&mut file, &rows).await {
            if let Err(rollback) = file.set_len(committed).await {
                warn!(error = %rollback, path = %self.path.display(), "failed to cut back a partial batch");
            }
            return Err(err);
        }
        debug!(rows = bets.len(), path = %self.path.display(), "batch appended");
        Ok(())
    }

    /// Visits every stored bet in insertion order while holding the lock.
    ///
    /// Rows are decoded one at a time; the store is never loaded whole.
    pub async fn scan<F>(&self, mut visit: F) -> io::Result<()>
    where
        F: FnMut(Bet),
    {
        let _guard = self.lock.lock().await;
        let Some(mut rows) = BetScan::open(&self.path).await? else {
            return Ok(());
        };
        while let Some(bet) = rows.next_bet().await? {
            visit(bet);
        }
        Ok(())
    }
}

async fn write_rows(file: &mut File, rows: &[u8]) -> io::Result<()> {
    file.write_all(rows).await?;
    file.flush().await
}

/// Truncates the file to its last complete row and returns that length.
async fn discard_partial_row(file: &mut File, path: &Path) -> io::Result<u64> {
    let len = file.metadata().await?.len();
    let complete = complete_rows_len(file, len).await?;
    if complete < len {
        file.set_len(complete).await?;
        warn!(
            path = %path.display(),
            discarded = len - complete,
            "dropped an unterminated row at the end of the store"
        );
    }
    Ok(complete)
}

/// Offset just past the last row terminator, scanning backwards from `len`.
async fn complete_rows_len(file: &mut File, len: u64) -> io::Result<u64> {
    let mut window = [0u8; TAIL_WINDOW];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(TAIL_WINDOW as u64);
        let chunk = &mut window[..(end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(chunk).await?;
        if let Some(last) = chunk.iter().rposition(|&byte| byte == ROW_END) {
            return Ok(start + last as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Lazy cursor over the rows of a store file.
///
/// Opening a new cursor restarts from the first row. A trailing row without
/// its terminator is not yet stored and ends the scan.
pub struct BetScan {
    reader: BufReader<File>,
    row: Vec<u8>,
}

impl BetScan {
    /// Returns `None` when no bet has been stored yet.
    pub async fn open(path: &Path) -> io::Result<Option<Self>> {
        match File::open(path).await {
            Ok(file) => Ok(Some(Self {
                reader: BufReader::new(file),
                row: Vec::new(),
            })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn next_bet(&mut self) -> io::Result<Option<Bet>> {
        loop {
            self.row.clear();
            if self.reader.read_until(ROW_END, &mut self.row).await? == 0 {
                return Ok(None);
            }
            let Some((&ROW_END, record)) = self.row.split_last() else {
                return Ok(None);
            };
            if record.is_empty() {
                continue;
            }
            return Bet::decode(record)
                .map(Some)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err));
        }
    }
}
