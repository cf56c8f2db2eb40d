//! File-backed warehouse: one JSONL history file per session

use super::{PersistentStore, StoreCommand, StoreError, StoreOutput};
use crate::memory::ConversationTurn;
use async_trait::async_trait;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Local stand-in for a remote warehouse.
///
/// Appends are one JSON object per line, so a batch is visible in order as
/// soon as the write returns. A batch is written all or nothing: a failed
/// write is truncated away before the error is returned, and a torn tail
/// left by a crash is dropped before the next append.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        let safe_id: String = session_id
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.jsonl", safe_id))
    }

    async fn append(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
    ) -> Result<usize, StoreError> {
        if turns.is_empty() {
            return Ok(0);
        }
        fs::create_dir_all(&self.dir).await.map_err(io_error)?;

        let mut lines = String::new();
        for turn in turns {
            let json = serde_json::to_string(turn)
                .map_err(|e| StoreError::permanent(format!("unserializable turn: {e}")))?;
            lines.push_str(&json);
            lines.push('\n');
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.session_path(session_id))
            .await
            .map_err(io_error)?;

        let len = file.metadata().await.map_err(io_error)?.len();
        let committed = committed_len(&mut file, len).await.map_err(io_error)?;
        if committed < len {
            warn!(
                session = session_id,
                bytes = len - committed,
                "Dropping torn tail of history file"
            );
            file.set_len(committed).await.map_err(io_error)?;
        }
        file.seek(SeekFrom::Start(committed)).await.map_err(io_error)?;

        let written = match file.write_all(lines.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(rollback) = file.set_len(committed).await {
                warn!(session = session_id, "Could not roll back partial append: {}", rollback);
            }
            return Err(io_error(e));
        }

        debug!(session = session_id, turns = turns.len(), "Appended turns");
        Ok(turns.len())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<ConversationTurn>, StoreError> {
        let path = self.session_path(session_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(e)),
        };

        let mut turns = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ConversationTurn>(line) {
                Ok(turn) => turns.push(turn),
                Err(e) => warn!(
                    session = session_id,
                    line = index + 1,
                    "Skipping unreadable history line: {}",
                    e
                ),
            }
        }
        Ok(turns)
    }
}

/// Length of the file up to and including its last newline
async fn committed_len(file: &mut fs::File, len: u64) -> std::io::Result<u64> {
    let mut chunk = [0u8; 4096];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(chunk.len() as u64);
        let size = (end - start) as usize;
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut chunk[..size]).await?;
        if let Some(pos) = chunk[..size].iter().rposition(|b| *b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Denied access will not fix itself; anything else may
fn io_error(e: std::io::Error) -> StoreError {
    match e.kind() {
        ErrorKind::PermissionDenied => StoreError::permanent(e.to_string()),
        _ => StoreError::transient(e.to_string()),
    }
}

#[async_trait]
impl PersistentStore for JsonlStore {
    async fn run(&self, command: &StoreCommand) -> Result<StoreOutput, StoreError> {
        match command {
            StoreCommand::AppendTurns { session_id, turns } => {
                self.append(session_id, turns).await.map(StoreOutput::Written)
            }
            StoreCommand::LoadHistory { session_id } => {
                self.load(session_id).await.map(StoreOutput::History)
            }
            StoreCommand::Ping => {
                fs::create_dir_all(&self.dir).await.map_err(io_error)?;
                Ok(StoreOutput::Pong)
            }
        }
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        debug!("Reopening warehouse directory {}", self.dir.display());
        fs::create_dir_all(&self.dir).await.map_err(io_error)
    }
}
