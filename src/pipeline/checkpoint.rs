//! Append-only result files and the checkpointed run.
//!
//! Workers pull items from a shared queue, each with its own model, and send
//! finished records back over a channel. Only the collecting task touches the
//! buffer and the file; it flushes every `batch_size` records so a crash loses
//! at most one buffer.

use super::context::PreparedItem;
use super::orchestrator::{error_record, infer_item, into_record, RunContext, RunPhase, RunSummary};
use crate::corpus::read_jsonl_lenient;
use crate::llm::ModelLoader;
use crate::types::ResultRecord;
use crate::Result;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Rename an existing file to `<name>.bak`, replacing any older backup
pub fn backup_existing(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    let backup = PathBuf::from(name);

    std::fs::rename(path, &backup)?;
    info!("[CHECKPOINT] Backed up {:?} to {:?}", path, backup);
    Ok(Some(backup))
}

pub struct ResultSink {
    path: PathBuf,
    file: File,
    written: usize,
}

impl ResultSink {
    /// Start a fresh file, backing up whatever was there
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        backup_existing(path)?;

        let file = File::create(path)?;
        Ok(Self { path: path.to_path_buf(), file, written: 0 })
    }

    /// Continue an existing file; returns the input indices it already holds
    pub fn resume(path: &Path) -> Result<(Self, BTreeSet<usize>)> {
        if !path.exists() {
            return Ok((Self::create(path)?, BTreeSet::new()));
        }

        let read = read_jsonl_lenient::<ResultRecord, _>(BufReader::new(File::open(path)?))?;
        let done: BTreeSet<usize> = read.records.iter().map(|(_, r)| r.index).collect();

        let mut file = OpenOptions::new().read(true).append(true).open(path)?;
        if Self::ends_mid_line(&mut file)? {
            writeln!(file)?;
        }

        info!(
            "[CHECKPOINT] Resuming {:?}: {} records present, {} unreadable lines",
            path,
            done.len(),
            read.skipped
        );
        Ok((Self { path: path.to_path_buf(), file, written: 0 }, done))
    }

    fn ends_mid_line(file: &mut File) -> Result<bool> {
        if file.metadata()?.len() == 0 {
            return Ok(false);
        }
        file.seek(SeekFrom::End(-1))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)?;
        Ok(last[0] != b'\n')
    }

    pub fn append_batch(&mut self, records: &[ResultRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut writer = BufWriter::new(&mut self.file);
        for record in records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);
        self.file.sync_data()?;

        self.written += records.len();
        info!("[CHECKPOINT] Saved {} records (total this run: {})", records.len(), self.written);
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Bounded-concurrency run that checkpoints every `batch_size` records.
///
/// Records land in completion order; each carries its input `index`. With
/// `resume`, items already in the output file are skipped.
pub async fn run_checkpointed(ctx: RunContext, loader: Arc<dyn ModelLoader>, resume: bool) -> Result<RunSummary> {
    let start = std::time::Instant::now();
    info!("[ORCHESTRATOR] {}: {} items", RunPhase::Loaded, ctx.items.len());

    let (mut sink, done) = if resume {
        ResultSink::resume(&ctx.output)?
    } else {
        (ResultSink::create(&ctx.output)?, BTreeSet::new())
    };

    let pending: Vec<PreparedItem> = ctx.items.into_iter().filter(|item| !done.contains(&item.index)).collect();
    if !done.is_empty() {
        info!("[CHECKPOINT] {} items already done, {} pending", done.len(), pending.len());
    }
    let fallback: Vec<(usize, ResultRecord)> = pending.iter().map(|item| (item.index, error_record(item))).collect();
    let total = pending.len();

    let queue = Arc::new(Mutex::new(pending.into_iter()));
    let (tx, mut rx) = mpsc::channel::<ResultRecord>(ctx.batch_size.max(1) * 2);
    let workers = ctx.num_workers.max(1).min(total.max(1));

    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let queue = queue.clone();
        let tx = tx.clone();
        let loader = loader.clone();
        let max_tokens = ctx.max_tokens;
        let timeout = ctx.item_timeout;

        handles.push(tokio::spawn(async move {
            let model = match loader.load(worker_id).await {
                Ok(model) => model,
                Err(e) => {
                    warn!("[WORKER {}] Failed to load model: {}", worker_id, e);
                    return;
                }
            };

            loop {
                let next = queue.lock().await.next();
                let Some(item) = next else { break };
                let outcome = infer_item(model.as_ref(), &item, max_tokens, timeout).await;
                if tx.send(into_record(&item, outcome)).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);
    info!("[ORCHESTRATOR] {}: {} workers", RunPhase::Dispatched, workers);

    let mut buffer = Vec::with_capacity(ctx.batch_size);
    let mut received = BTreeSet::new();
    let mut errors = 0;

    while let Some(record) = rx.recv().await {
        received.insert(record.index);
        if record.is_error() {
            errors += 1;
        }
        buffer.push(record);

        if buffer.len() >= ctx.batch_size.max(1) {
            sink.append_batch(&buffer)?;
            buffer.clear();
        }
        if received.len() % 50 == 0 {
            info!("[ORCHESTRATOR] {}/{} items done", received.len(), total);
        }
    }

    for (worker_id, handle) in handles.into_iter().enumerate() {
        if let Err(e) = handle.await {
            warn!("[WORKER {}] Task failed: {}", worker_id, e);
        }
    }

    // items a crashed or unloaded worker never finished
    for (index, record) in fallback {
        if !received.contains(&index) {
            warn!("[ORCHESTRATOR] Item {} produced no result, recording ERROR", index);
            errors += 1;
            buffer.push(record);
        }
    }
    sink.append_batch(&buffer)?;
    info!("[ORCHESTRATOR] {}: {} records in {:?}", RunPhase::Persisted, sink.written(), sink.path());

    Ok(RunSummary::new(total, errors, start.elapsed()))
}
