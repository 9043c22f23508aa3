//! Partitioned scatter-gather inference.
//!
//! The dataset is cut into contiguous chunks, one per worker task. Every
//! worker loads its own model and answers its chunk in order, sending each
//! record as soon as it is finished. Items a crashed worker never reached are
//! recorded as `ERROR`. Records are tagged with their input index and sorted
//! on merge, so the output file follows input order.

use super::checkpoint::backup_existing;
use super::context::PreparedItem;
use crate::llm::{LanguageModel, ModelLoader};
use crate::types::{ResultRecord, ERROR_RESPONSE};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

const PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Loaded,
    Partitioned,
    Dispatched,
    Merging,
    Persisted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Loaded => "loaded",
            RunPhase::Partitioned => "partitioned",
            RunPhase::Dispatched => "dispatched",
            RunPhase::Merging => "merging",
            RunPhase::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

/// One worker's share of the dataset
#[derive(Debug, Clone)]
pub struct BatchTask<T = PreparedItem> {
    pub worker_id: usize,
    pub items: Vec<T>,
}

/// Contiguous chunks of `ceil(len / workers)` items; the last may be shorter
pub fn partition<T>(items: Vec<T>, workers: usize) -> Result<Vec<BatchTask<T>>> {
    if workers == 0 {
        return Err(Error::Config("number of workers must be at least 1".to_string()));
    }
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let chunk_size = items.len().div_ceil(workers);
    let mut tasks = Vec::with_capacity(workers);
    let mut items = items.into_iter().peekable();

    while items.peek().is_some() {
        tasks.push(BatchTask {
            worker_id: tasks.len(),
            items: items.by_ref().take(chunk_size).collect(),
        });
    }

    Ok(tasks)
}

/// Everything a run needs besides the model loader
#[derive(Debug, Clone)]
pub struct RunContext {
    pub items: Vec<PreparedItem>,
    pub output: PathBuf,
    pub max_tokens: usize,
    pub num_workers: usize,
    /// Records per checkpoint flush
    pub batch_size: usize,
    pub item_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub errors: usize,
    pub elapsed_secs: f64,
    /// Items per second
    pub throughput: f64,
}

impl RunSummary {
    pub fn new(total: usize, errors: usize, elapsed: Duration) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let throughput = if elapsed_secs > 0.0 { total as f64 / elapsed_secs } else { 0.0 };
        Self { total, errors, elapsed_secs, throughput }
    }
}

pub async fn infer_item(
    model: &dyn LanguageModel,
    item: &PreparedItem,
    max_tokens: usize,
    timeout: Option<Duration>,
) -> Result<String> {
    let generation = model.generate(&item.prompt, max_tokens);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, generation)
            .await
            .map_err(|_| Error::Inference(format!("timed out after {}s", limit.as_secs_f64())))?,
        None => generation.await,
    }
}

/// Turn an inference outcome into a record; failures become `ERROR` records
pub fn into_record(item: &PreparedItem, outcome: Result<String>) -> ResultRecord {
    match outcome {
        Ok(response) => ResultRecord {
            index: item.index,
            custom_id: Some(item.custom_id.clone()),
            response,
            answer: item.answer.clone(),
            metadata: None,
        },
        Err(e) => {
            warn!("[ORCHESTRATOR] Item {} failed: {}", item.index, e);
            error_record(item)
        }
    }
}

pub fn error_record(item: &PreparedItem) -> ResultRecord {
    ResultRecord {
        index: item.index,
        custom_id: Some(item.custom_id.clone()),
        response: ERROR_RESPONSE.to_string(),
        answer: item.answer.clone(),
        metadata: None,
    }
}

async fn run_worker(
    task: BatchTask,
    loader: Arc<dyn ModelLoader>,
    max_tokens: usize,
    timeout: Option<Duration>,
    tx: mpsc::UnboundedSender<ResultRecord>,
) {
    let BatchTask { worker_id, items } = task;

    let model = match loader.load(worker_id).await {
        Ok(model) => model,
        Err(e) => {
            warn!("[WORKER {}] Failed to load model, {} items recorded as ERROR: {}", worker_id, items.len(), e);
            for item in &items {
                let _ = tx.send(error_record(item));
            }
            return;
        }
    };

    info!("[WORKER {}] Processing {} items", worker_id, items.len());
    let start = Instant::now();

    for (done, item) in items.iter().enumerate() {
        let outcome = infer_item(model.as_ref(), item, max_tokens, timeout).await;
        if tx.send(into_record(item, outcome)).is_err() {
            return;
        }

        if (done + 1) % PROGRESS_EVERY == 0 {
            info!("[WORKER {}] {}/{} done", worker_id, done + 1, items.len());
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    let speed = if elapsed > 0.0 { items.len() as f64 / elapsed } else { 0.0 };
    info!("[WORKER {}] Finished. Speed: {:.2} it/s", worker_id, speed);
}

/// Scatter the items over `num_workers` tasks, gather, sort by input index and
/// write the result file (backing up any previous one).
pub async fn run_partitioned(ctx: RunContext, loader: Arc<dyn ModelLoader>) -> Result<RunSummary> {
    let start = Instant::now();
    let total = ctx.items.len();
    info!("[ORCHESTRATOR] {}: {} items", RunPhase::Loaded, total);

    let fallback: Vec<ResultRecord> = ctx.items.iter().map(error_record).collect();
    let tasks = partition(ctx.items, ctx.num_workers)?;
    info!(
        "[ORCHESTRATOR] {}: {:?}",
        RunPhase::Partitioned,
        tasks.iter().map(|t| t.items.len()).collect::<Vec<_>>()
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<ResultRecord>();
    let mut handles = Vec::with_capacity(tasks.len());
    for task in tasks {
        let worker_id = task.worker_id;
        let handle = tokio::spawn(run_worker(task, loader.clone(), ctx.max_tokens, ctx.item_timeout, tx.clone()));
        handles.push((worker_id, handle));
    }
    drop(tx);
    info!("[ORCHESTRATOR] {}: {} workers", RunPhase::Dispatched, handles.len());

    for (worker_id, handle) in handles {
        if let Err(e) = handle.await {
            warn!("[WORKER {}] Crashed: {}", worker_id, e);
        }
    }

    let mut records = Vec::with_capacity(total);
    let mut received = BTreeSet::new();
    while let Some(record) = rx.recv().await {
        received.insert(record.index);
        records.push(record);
    }

    // items a crashed worker never reached
    for record in fallback {
        if !received.contains(&record.index) {
            warn!("[ORCHESTRATOR] Item {} produced no result, recording ERROR", record.index);
            records.push(record);
        }
    }

    info!("[ORCHESTRATOR] {}: {} records", RunPhase::Merging, records.len());
    records.sort_by_key(|r| r.index);
    let errors = records.iter().filter(|r| r.is_error()).count();

    write_results(&ctx.output, &records)?;
    info!("[ORCHESTRATOR] {}: {:?}", RunPhase::Persisted, ctx.output);

    let summary = RunSummary::new(total, errors, start.elapsed());
    info!(
        "[ORCHESTRATOR] {} items, {} errors, {:.2}s ({:.2} it/s)",
        summary.total, summary.errors, summary.elapsed_secs, summary.throughput
    );
    Ok(summary)
}

/// One JSON object per line; an existing file is moved to `.bak` first
pub fn write_results(path: &Path, records: &[ResultRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    backup_existing(path)?;

    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Answers "A"; prompts containing FAIL error, PANIC panic, SLOW hang
    pub(crate) struct ScriptedModel {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn generate(&self, prompt: &str, _max_tokens: usize) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if prompt.contains("PANIC") {
                panic!("model crashed");
            }
            if prompt.contains("SLOW") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if prompt.contains("FAIL") {
                return Err(Error::Inference("backend unavailable".to_string()));
            }
            Ok("A".to_string())
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    #[derive(Default)]
    pub(crate) struct ScriptedLoader {
        calls: Arc<AtomicUsize>,
        loads: AtomicUsize,
        fail_worker: Option<usize>,
    }

    impl ScriptedLoader {
        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelLoader for ScriptedLoader {
        async fn load(&self, worker_id: usize) -> Result<Box<dyn LanguageModel>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_worker == Some(worker_id) {
                return Err(Error::Inference("no GPU context".to_string()));
            }
            Ok(Box::new(ScriptedModel { calls: self.calls.clone() }))
        }
    }

    pub(crate) fn items(prompts: &[&str]) -> Vec<PreparedItem> {
        prompts
            .iter()
            .enumerate()
            .map(|(index, prompt)| PreparedItem {
                index,
                custom_id: format!("req-{index}-A"),
                prompt: prompt.to_string(),
                answer: serde_json::json!(["A", "answer", ""]),
            })
            .collect()
    }

    pub(crate) fn run_context(items: Vec<PreparedItem>, output: &Path, batch_size: usize) -> RunContext {
        RunContext {
            items,
            output: output.to_path_buf(),
            max_tokens: 16,
            num_workers: 4,
            batch_size,
            item_timeout: Some(Duration::from_millis(200)),
        }
    }

    fn read_records(path: &Path) -> Vec<ResultRecord> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_partition_sizes() {
        let tasks = partition((0..17).collect::<Vec<_>>(), 4).unwrap();
        assert_eq!(tasks.iter().map(|t| t.items.len()).collect::<Vec<_>>(), vec![5, 5, 5, 2]);
        assert_eq!(tasks.iter().map(|t| t.worker_id).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(tasks[3].items, vec![15, 16]);
    }

    #[test]
    fn test_partition_edge_cases() {
        assert!(matches!(partition(vec![1, 2], 0), Err(Error::Config(_))));
        assert!(partition(Vec::<u8>::new(), 4).unwrap().is_empty());
        assert_eq!(partition(vec![1, 2], 8).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_partitioned_run_keeps_input_order() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out").join("results.jsonl");
        let prompts: Vec<String> = (0..17).map(|i| if i == 6 { "FAIL".to_string() } else { format!("q{i}") }).collect();
        let prompts: Vec<&str> = prompts.iter().map(String::as_str).collect();

        let loader = Arc::new(ScriptedLoader::default());
        let summary = run_partitioned(run_context(items(&prompts), &output, 50), loader.clone()).await.unwrap();

        assert_eq!(summary.total, 17);
        assert_eq!(summary.errors, 1);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 4);

        let records = read_records(&output);
        assert_eq!(records.iter().map(|r| r.index).collect::<Vec<_>>(), (0..17).collect::<Vec<_>>());
        assert!(records[6].is_error());
        assert_eq!(records[0].response, "A");
        assert_eq!(records[0].answer, serde_json::json!(["A", "answer", ""]));
    }

    #[tokio::test]
    async fn test_rerun_backs_up_previous_output() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("results.jsonl");
        std::fs::write(&output, "previous run\n").unwrap();

        let loader = Arc::new(ScriptedLoader::default());
        run_partitioned(run_context(items(&["q0"]), &output, 50), loader).await.unwrap();

        let backup = dir.path().join("results.jsonl.bak");
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "previous run\n");
        assert_eq!(read_records(&output).len(), 1);
    }

    #[tokio::test]
    async fn test_crashed_or_unloaded_workers_still_yield_records() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("results.jsonl");

        // chunks of 2: worker 0 panics on its second item, worker 1 cannot load, worker 2 is fine
        let loader = Arc::new(ScriptedLoader { fail_worker: Some(1), ..Default::default() });
        let ctx = RunContext {
            num_workers: 3,
            ..run_context(items(&["q0", "PANIC", "q2", "q3", "q4", "q5"]), &output, 50)
        };

        let summary = run_partitioned(ctx, loader).await.unwrap();
        let records = read_records(&output);

        assert_eq!(records.len(), 6);
        assert_eq!(summary.errors, 3);
        assert_eq!(records[0].response, "A");
        assert!(records[1..4].iter().all(ResultRecord::is_error));
        assert!(records[4..].iter().all(|r| r.response == "A"));
    }

    #[tokio::test]
    async fn test_panic_keeps_records_finished_before_it() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("results.jsonl");

        let loader = Arc::new(ScriptedLoader::default());
        let ctx = RunContext { num_workers: 1, ..run_context(items(&["q0", "q1", "PANIC", "q3"]), &output, 50) };

        let summary = run_partitioned(ctx, loader.clone()).await.unwrap();
        let records = read_records(&output);

        assert_eq!(loader.calls(), 3);
        assert_eq!(summary.errors, 2);
        assert_eq!(records.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(records[0].response, "A");
        assert_eq!(records[1].response, "A");
        assert!(records[2..].iter().all(ResultRecord::is_error));
    }

    #[tokio::test]
    async fn test_slow_item_times_out() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("results.jsonl");

        let loader = Arc::new(ScriptedLoader::default());
        let summary = run_partitioned(run_context(items(&["SLOW", "q1"]), &output, 50), loader).await.unwrap();

        assert_eq!(summary.errors, 1);
        assert!(read_records(&output)[0].is_error());
    }
}
