//! Flat-file persistence for header chains.
//!
//! Each chain is one file of raw 80-byte header records starting at the chain's first
//! stored height. Fork files encode their forkpoint, parent and id in the file name so
//! the tree can be rebuilt without a separate index.

use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bitcoin::BlockHash;
use tokio::sync::{mpsc, oneshot};

use super::header::HEADER_SIZE;
use super::header_chain::{ChainId, HeaderChain};
use crate::error::{ChainError, ChainResult};

const MAIN_FILE_PREFIX: &str = "blockchain_headers_";
const FORKS_DIR: &str = "forks";
const FORK_FILE_PREFIX: &str = "fork_";

/// A fork file read back from disk.
#[derive(Debug)]
pub struct StoredFork {
    pub forkpoint: u32,
    pub parent: ChainId,
    pub id: ChainId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HeaderStore {
    dir: PathBuf,
}

impl HeaderStore {
    pub fn open(dir: impl Into<PathBuf>) -> ChainResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(FORKS_DIR))?;
        Ok(Self {
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn main_path(&self, start: u32) -> PathBuf {
        self.dir.join(format!("{}{}", MAIN_FILE_PREFIX, start))
    }

    fn path_for(&self, chain: &HeaderChain) -> PathBuf {
        match chain.parent() {
            None => self.main_path(chain.start()),
            Some(parent) => self.dir.join(FORKS_DIR).join(format!(
                "{}{}_{}_{}",
                FORK_FILE_PREFIX,
                chain.forkpoint(),
                parent.hash(),
                chain.id().hash()
            )),
        }
    }

    /// Records of `chain` from `from_height` up to its tip, ready to be written.
    fn records_from(&self, chain: &HeaderChain, from_height: u32) -> ChainResult<PendingWrite> {
        let skip = from_height.checked_sub(chain.start()).ok_or_else(|| {
            ChainError::Storage(format!(
                "cannot write height {} below chain start {}",
                from_height,
                chain.start()
            ))
        })? as usize;
        let records = chain.headers().get(skip..).unwrap_or(&[]);

        let mut bytes = Vec::with_capacity(records.len() * HEADER_SIZE);
        for header in records {
            bytes.extend_from_slice(&header.to_bytes());
        }
        Ok(PendingWrite {
            path: self.path_for(chain),
            offset: (skip * HEADER_SIZE) as u64,
            bytes,
        })
    }

    /// Start the background task that performs all further writes for this store.
    ///
    /// Must be called from within a tokio runtime. The task exits once every
    /// [`StoreWriter`] clone is dropped.
    pub fn spawn_writer(&self) -> StoreWriter {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(rx));
        StoreWriter {
            store: self.clone(),
            tx,
        }
    }

    /// Raw records of the main chain stored from `start`.
    pub fn load_main(&self, start: u32) -> ChainResult<Vec<u8>> {
        let path = self.main_path(start);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(fs::read(path)?)
    }

    /// All fork files, parents before children.
    pub fn load_forks(&self) -> ChainResult<Vec<StoredFork>> {
        let mut forks = Vec::new();
        for entry in fs::read_dir(self.dir.join(FORKS_DIR))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match parse_fork_name(name) {
                Some((forkpoint, parent, id)) => forks.push(StoredFork {
                    forkpoint,
                    parent,
                    id,
                    bytes: fs::read(entry.path())?,
                }),
                None => tracing::warn!("Ignoring unexpected file in forks dir: {}", name),
            }
        }
        forks.sort_by_key(|fork| fork.forkpoint);
        Ok(forks)
    }
}

/// A file region to overwrite: the file is cut at `offset` and `bytes` appended.
#[derive(Debug)]
struct PendingWrite {
    path: PathBuf,
    offset: u64,
    bytes: Vec<u8>,
}

impl PendingWrite {
    fn apply(&self) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).write(true).open(&self.path)?;
        file.set_len(self.offset)?;
        file.seek(SeekFrom::Start(self.offset))?;
        file.write_all(&self.bytes)?;
        file.sync_data()
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

/// Commands for the background writer
#[derive(Debug)]
enum StoreCommand {
    Write(PendingWrite),
    Remove(PathBuf),
    Flush(oneshot::Sender<()>),
}

/// Queues header file writes to a background task. Commands are applied in the
/// order they were queued.
#[derive(Debug, Clone)]
pub struct StoreWriter {
    store: HeaderStore,
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl StoreWriter {
    /// Queue a rewrite of the chain's file from `from_height`.
    pub fn write_from(&self, chain: &HeaderChain, from_height: u32) -> ChainResult<()> {
        let write = self.store.records_from(chain, from_height)?;
        self.send(StoreCommand::Write(write))
    }

    /// Queue removal of the chain's file.
    pub fn remove(&self, chain: &HeaderChain) -> ChainResult<()> {
        self.send(StoreCommand::Remove(self.store.path_for(chain)))
    }

    /// Wait until every command queued so far has been applied.
    pub async fn flush(&self) -> ChainResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(StoreCommand::Flush(done_tx))?;
        done_rx.await.map_err(|_| writer_stopped())
    }

    fn send(&self, command: StoreCommand) -> ChainResult<()> {
        self.tx.send(command).map_err(|_| writer_stopped())
    }
}

fn writer_stopped() -> ChainError {
    ChainError::Storage("header writer stopped".to_string())
}

async fn run_writer(mut rx: mpsc::UnboundedReceiver<StoreCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            StoreCommand::Write(write) => {
                let path = write.path.clone();
                match tokio::task::spawn_blocking(move || write.apply()).await {
                    Ok(Ok(())) => tracing::trace!("Background writer completed {}", path.display()),
                    Ok(Err(e)) => tracing::error!("Failed to write {}: {}", path.display(), e),
                    Err(e) => tracing::error!("Task join error: {}", e),
                }
            }
            StoreCommand::Remove(path) => {
                let removed = tokio::task::spawn_blocking({
                    let path = path.clone();
                    move || remove_if_exists(&path)
                })
                .await;
                match removed {
                    Ok(Ok(())) => tracing::trace!("Background writer removed {}", path.display()),
                    Ok(Err(e)) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
                    Err(e) => tracing::error!("Task join error: {}", e),
                }
            }
            StoreCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Header writer stopped");
}

fn parse_fork_name(name: &str) -> Option<(u32, ChainId, ChainId)> {
    let mut parts = name.strip_prefix(FORK_FILE_PREFIX)?.splitn(3, '_');
    let forkpoint = parts.next()?.parse().ok()?;
    let parent = BlockHash::from_str(parts.next()?).ok()?;
    let id = BlockHash::from_str(parts.next()?).ok()?;
    Some((forkpoint, ChainId::new(parent), ChainId::new(id)))
}
