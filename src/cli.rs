use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// medrag - retrieval-augmented answering for multiple-choice medical exams
#[derive(Parser)]
#[command(name = "medrag", version, about)]
pub struct Cli {
    /// Directory holding indexes and the manifest.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Passage corpus, one passage per line.
    #[arg(long, global = true)]
    pub corpus: Option<PathBuf>,

    /// Use the lexical index only.
    #[arg(long, global = true)]
    pub lexical_only: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build the lexical and embedding indexes.
    Index,
    /// Retrieve passages for a query.
    Search {
        query: String,
        #[arg(long, default_value_t = 4)]
        limit: usize,
        /// Query with the text as given, skipping keyword extraction.
        #[arg(long)]
        no_extract: bool,
    },
    /// Answer a question dataset with the configured language model.
    Run(RunArgs),
    /// Score a result file.
    Score(ScoreArgs),
    /// Hosted batch request files.
    Batch(BatchCommand),
    /// Serve retrieval over MCP on stdio.
    Serve,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    /// One contiguous chunk per worker, results written at the end in input order.
    Partitioned,
    /// Shared queue, results appended every batch.
    Checkpointed,
}

#[derive(Parser)]
pub struct RunArgs {
    /// Question dataset (JSONL).
    #[arg(long)]
    pub input: PathBuf,

    #[arg(long, default_value = "results.jsonl")]
    pub output: PathBuf,

    #[arg(long, value_enum, default_value_t = RunMode::Checkpointed)]
    pub mode: RunMode,

    /// Prompt with question and options only.
    #[arg(long)]
    pub no_rag: bool,

    /// Continue an existing result file (checkpointed mode).
    #[arg(long)]
    pub resume: bool,

    #[arg(long)]
    pub workers: Option<usize>,

    /// Records per checkpoint flush.
    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub max_tokens: Option<usize>,

    /// Only the first N questions.
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LabelSource {
    /// First element of the `answer` field.
    Answer,
    /// Segment of the `custom_id` field.
    Id,
}

#[derive(Parser)]
pub struct ScoreArgs {
    /// Result file (JSONL).
    #[arg(long)]
    pub input: PathBuf,

    #[arg(long, value_enum, default_value_t = LabelSource::Answer)]
    pub rule: LabelSource,

    /// Write the full report as JSON.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Mismatches to print.
    #[arg(long, default_value_t = 10)]
    pub details: usize,
}

#[derive(Parser)]
pub struct BatchCommand {
    #[command(subcommand)]
    pub action: BatchAction,
}

#[derive(Subcommand)]
pub enum BatchAction {
    /// Render prompts into a batch request file.
    Generate {
        /// Question dataset (JSONL).
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "batch_requests.jsonl")]
        output: PathBuf,
        #[arg(long)]
        no_rag: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Check a batch request file before upload.
    Validate {
        #[arg(long)]
        input: PathBuf,
    },
}
