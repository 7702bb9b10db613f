use super::{AckToken, SpillQueue};
use crate::model::TxBatch;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;

/// Disk-backed FIFO for `mem_only = false`. Batches are appended as
/// length-prefixed JSON records to a segment file; segments roll over once
/// they exceed [`SEGMENT_SIZE_LIMIT`] and are deleted once fully consumed.
///
/// No fsync is issued and no record is replayed across process restarts —
/// the queue is discarded on crash along with the partially bootstrapped
/// state, so durability would be wasted effort here.
///
/// All segment-file I/O runs inside `tokio::task::spawn_blocking`: this is
/// the replica's only collaborator backed by plain `std::fs`, and a large
/// bootstrap can buffer enough real-time traffic to make a blocking read or
/// write worth offloading from the shared runtime.
pub struct DiskSpillQueue {
    dir: PathBuf,
    /// All segment files not yet fully consumed, oldest first. The last
    /// entry is the one currently open for writes.
    segments: VecDeque<PathBuf>,
    next_segment_id: u64,
    write_file: Option<std::fs::File>,
    write_len: u64,
    read_file: Option<BufReader<std::fs::File>>,
    count: usize,
    pending: Option<AckToken>,
    next_token: u64,
}

const SEGMENT_SIZE_LIMIT: u64 = 8 << 20; // 8MB

enum ReadOutcome {
    Record {
        reader: BufReader<std::fs::File>,
        body: Vec<u8>,
    },
    Eof,
}

impl DiskSpillQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segments: VecDeque::new(),
            next_segment_id: 0,
            write_file: None,
            write_len: 0,
            read_file: None,
            count: 0,
            pending: None,
            next_token: 0,
        }
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id:020}.seg"))
    }

    async fn roll_segment(&mut self) -> anyhow::Result<()> {
        let dir = self.dir.clone();
        let path = self.segment_path(self.next_segment_id);
        self.next_segment_id += 1;
        let open_path = path.clone();
        let file = tokio::task::spawn_blocking(move || -> anyhow::Result<std::fs::File> {
            std::fs::create_dir_all(&dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&open_path)?;
            Ok(file)
        })
        .await??;
        self.segments.push_back(path);
        self.write_file = Some(file);
        self.write_len = 0;
        Ok(())
    }

    async fn open_oldest_for_read(&mut self) -> anyhow::Result<bool> {
        let Some(path) = self.segments.front().cloned() else {
            return Ok(false);
        };
        let file = tokio::task::spawn_blocking(move || std::fs::File::open(&path)).await??;
        self.read_file = Some(BufReader::new(file));
        Ok(true)
    }
}

#[async_trait]
impl SpillQueue for DiskSpillQueue {
    async fn append(&mut self, batch: TxBatch) -> anyhow::Result<()> {
        if self.write_file.is_none() || self.write_len >= SEGMENT_SIZE_LIMIT {
            self.roll_segment().await?;
        }
        let body = serde_json::to_vec(&batch)?;
        let len = u32::try_from(body.len())?;
        let written = 4 + body.len() as u64;
        let file = self.write_file.take().expect("rolled above");
        let file = tokio::task::spawn_blocking(move || -> anyhow::Result<std::fs::File> {
            let mut file = file;
            file.write_all(&len.to_be_bytes())?;
            file.write_all(&body)?;
            file.flush()?;
            Ok(file)
        })
        .await??;
        self.write_file = Some(file);
        self.write_len += written;
        self.count += 1;
        Ok(())
    }

    async fn pop(&mut self) -> anyhow::Result<Option<(TxBatch, AckToken)>> {
        if let Some(pending) = self.pending {
            anyhow::bail!("pop called with outstanding unacked token {:?}", pending);
        }
        if self.count == 0 {
            return Ok(None);
        }

        loop {
            if self.read_file.is_none() && !self.open_oldest_for_read().await? {
                return Ok(None);
            }
            let reader = self.read_file.take().expect("opened above");

            let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<ReadOutcome> {
                let mut reader = reader;
                let mut len_buf = [0u8; 4];
                match reader.read_exact(&mut len_buf) {
                    Ok(()) => {
                        let len = u32::from_be_bytes(len_buf) as usize;
                        let mut body = vec![0u8; len];
                        reader.read_exact(&mut body)?;
                        Ok(ReadOutcome::Record { reader, body })
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(ReadOutcome::Eof),
                    Err(err) => Err(err.into()),
                }
            })
            .await??;

            match outcome {
                ReadOutcome::Record { reader, body } => {
                    self.read_file = Some(reader);
                    let batch: TxBatch = serde_json::from_slice(&body)?;
                    let token = AckToken(self.next_token);
                    self.next_token += 1;
                    self.pending = Some(token);
                    return Ok(Some((batch, token)));
                }
                ReadOutcome::Eof => {
                    // This segment is exhausted (reader already dropped).
                    // If it's also still the active write segment, there is
                    // genuinely nothing more buffered right now.
                    let oldest = self.segments.front().cloned();
                    let is_active_write_segment =
                        matches!((&oldest, self.segments.len()), (Some(_), 1)) && self.write_file.is_some();
                    if is_active_write_segment {
                        return Ok(None);
                    }
                    if let Some(path) = self.segments.pop_front() {
                        tokio::task::spawn_blocking(move || {
                            let _ = std::fs::remove_file(path);
                        })
                        .await?;
                    }
                    continue;
                }
            }
        }
    }

    async fn ack(&mut self, token: AckToken) -> anyhow::Result<()> {
        match self.pending {
            Some(pending) if pending == token => {
                self.pending = None;
                self.count -= 1;
                Ok(())
            }
            Some(pending) => {
                anyhow::bail!("ack token {:?} does not match pending {:?}", token, pending)
            }
            None => anyhow::bail!("ack called with no outstanding pop"),
        }
    }

    fn count(&self) -> usize {
        self.count
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.write_file = None;
        self.read_file = None;
        let paths: Vec<PathBuf> = self.segments.drain(..).collect();
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            for path in paths {
                let _ = std::fs::remove_file(path);
            }
            if dir.exists() {
                let _ = std::fs::remove_dir(&dir);
            }
        })
        .await?;
        self.count = 0;
        self.pending = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentHandle, SeqNo, TxKind};

    fn batch(seqno: u64) -> TxBatch {
        TxBatch {
            agent: AgentHandle("a".into()),
            seqno: SeqNo(seqno),
            tx_kind: TxKind::Dirty,
            ops: vec![],
        }
    }

    fn tmp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("replicant-spill-test-{name}-{:x}", rand_suffix()));
        dir
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos() as u64
    }

    #[tokio::test]
    async fn fifo_order_across_segments() {
        let dir = tmp_dir("fifo");
        let mut q = DiskSpillQueue::new(&dir);

        for i in 0..5 {
            q.append(batch(i)).await.unwrap();
        }
        assert_eq!(q.count(), 5);

        for i in 0..5 {
            let (b, t) = q.pop().await.unwrap().unwrap();
            assert_eq!(b.seqno, SeqNo(i));
            q.ack(t).await.unwrap();
        }
        assert!(q.is_empty());
        q.close().await.unwrap();
    }

    #[tokio::test]
    async fn pop_on_empty_returns_none_and_is_reentrant() {
        let dir = tmp_dir("empty");
        let mut q = DiskSpillQueue::new(&dir);
        assert!(q.pop().await.unwrap().is_none());
        assert!(q.pop().await.unwrap().is_none());
        q.close().await.unwrap();
    }

    #[tokio::test]
    async fn append_interleaved_with_drain() {
        let dir = tmp_dir("interleave");
        let mut q = DiskSpillQueue::new(&dir);

        q.append(batch(0)).await.unwrap();
        let (b0, t0) = q.pop().await.unwrap().unwrap();
        assert_eq!(b0.seqno, SeqNo(0));

        q.append(batch(1)).await.unwrap();
        q.ack(t0).await.unwrap();

        let (b1, t1) = q.pop().await.unwrap().unwrap();
        assert_eq!(b1.seqno, SeqNo(1));
        q.ack(t1).await.unwrap();
        assert!(q.is_empty());
        q.close().await.unwrap();
    }
}
