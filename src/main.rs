mod cli;

use anyhow::{bail, Context};
use clap::Parser;
use medrag::batch::{validate_batch_file, write_batch_file, BatchSettings};
use medrag::config::RetrievalMode;
use medrag::corpus::load_questions;
use medrag::handlers::{IndexStatusArgs, RetrievePassagesArgs, ToolHandlers};
use medrag::llm::{ConfiguredModelLoader, ModelLoader};
use medrag::pipeline::{
    build_indexes, prepare_items, run_checkpointed, run_partitioned, PreparedItem, RetrievalContext, RunContext,
};
use medrag::scoring::{write_report, AccuracyScorer, LabelRule};
use medrag::{Config, QuestionRecord};
use rmcp::{
    handler::server::router::tool::ToolRouter,
    model::*,
    tool, tool_handler,
    transport::stdio,
    ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::cli::{BatchAction, Cli, Command, LabelSource, RunArgs, RunMode, ScoreArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Index => {
            let stats = build_indexes(&config).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Search { query, limit, no_extract } => {
            let context = RetrievalContext::open_or_build(&config).await?;
            let query_text = context.query_text(&query, !no_extract).await;
            let result = context.retrieve(&query_text, limit).await?;

            println!("query: {}", query_text);
            for (rank, hit) in result.iter().enumerate() {
                println!("{:>2}. [{}] {:.4}  {}", rank + 1, hit.document.id, hit.score, hit.document.text);
            }
        }
        Command::Run(args) => run(&config, args).await?,
        Command::Score(args) => score(&config, args)?,
        Command::Batch(cmd) => match cmd.action {
            BatchAction::Generate { input, output, no_rag, limit } => {
                let items = prepare(&config, &input, no_rag, limit).await?;
                let written = write_batch_file(&output, &items, &BatchSettings::default())?;
                println!("Wrote {} requests to {}", written, output.display());
            }
            BatchAction::Validate { input } => {
                let count = validate_batch_file(&input)?;
                println!("{} is valid ({} requests)", input.display(), count);
            }
        },
        Command::Serve => serve(config).await?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::from_env().context("Failed to load configuration")?;

    if let Some(data_dir) = &cli.data_dir {
        config.storage = config.storage.relocated(data_dir);
    }
    if let Some(corpus) = &cli.corpus {
        config.storage.corpus_path = corpus.clone();
    }
    if cli.lexical_only {
        config.retrieval.mode = RetrievalMode::Lexical;
    }

    tracing::info!(
        "[CONFIG] {:?} retrieval, embeddings {:?}/{}, llm {:?}/{}",
        config.retrieval.mode,
        config.embedding.provider,
        config.embedding.model,
        config.llm.provider,
        config.llm.model
    );
    Ok(config)
}

async fn prepare(config: &Config, input: &Path, no_rag: bool, limit: Option<usize>) -> anyhow::Result<Vec<PreparedItem>> {
    let mut questions: Vec<QuestionRecord> =
        load_questions(input).with_context(|| format!("Failed to read dataset {}", input.display()))?;
    if let Some(limit) = limit {
        questions.truncate(limit);
    }

    let context = if no_rag {
        None
    } else {
        Some(Arc::new(RetrievalContext::open_or_build(config).await?))
    };

    Ok(prepare_items(context, &questions, config.inference.retrieval_threads).await)
}

async fn run(config: &Config, args: RunArgs) -> anyhow::Result<()> {
    if args.resume && args.mode == RunMode::Partitioned {
        bail!("--resume is only supported with --mode checkpointed");
    }

    let items = prepare(config, &args.input, args.no_rag, args.limit).await?;
    let item_timeout = config.inference.item_timeout_secs.map(Duration::from_secs);

    let ctx = RunContext {
        items,
        output: args.output,
        max_tokens: args.max_tokens.unwrap_or(config.llm.max_tokens),
        num_workers: args.workers.unwrap_or(config.inference.num_workers),
        batch_size: args.batch_size.unwrap_or(config.inference.batch_size),
        item_timeout,
    };
    let loader: Arc<dyn ModelLoader> =
        Arc::new(ConfiguredModelLoader::new(config.llm.clone()).with_request_timeout(item_timeout));

    let summary = match args.mode {
        RunMode::Partitioned => run_partitioned(ctx, loader).await?,
        RunMode::Checkpointed => run_checkpointed(ctx, loader, args.resume).await?,
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn score(config: &Config, args: ScoreArgs) -> anyhow::Result<()> {
    let rule = match args.rule {
        LabelSource::Answer => LabelRule::answer_field(&config.scoring),
        LabelSource::Id => LabelRule::id_segment(&config.scoring),
    };
    let scorer = AccuracyScorer::from_config(&config.scoring, rule)?;
    let report = scorer.score_file(&args.input)?;

    println!("Total samples:       {}", report.total);
    println!("Correct predictions: {}", report.correct);
    println!("Format compliant:    {}", report.valid_format_count);
    println!("Skipped lines:       {}", report.skipped);
    println!("Accuracy:            {:.2}%", report.accuracy * 100.0);

    let mismatches: Vec<_> = report.details.iter().filter(|d| !d.is_correct).take(args.details).collect();
    if !mismatches.is_empty() {
        println!("\nFirst {} mismatches:", mismatches.len());
        for detail in mismatches {
            println!(
                "  line {} {}: expected {}, got {}",
                detail.line,
                detail.id.as_deref().unwrap_or("-"),
                detail.true_label,
                detail.predicted_label.as_deref().unwrap_or("(none)")
            );
        }
    }

    if let Some(path) = &args.report {
        write_report(path, &report)?;
    }
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting medrag MCP Server");

    let context = RetrievalContext::open(&config)
        .context("Indexes are not available; run `medrag index` first")?;
    let handlers = ToolHandlers::new(config, Arc::new(context));
    tracing::info!("Tool handlers initialized");

    let server = RetrievalServer::new(Arc::new(handlers));

    tracing::info!("Server initialized, starting stdio transport");

    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct RetrievePassagesParams {
    #[schemars(description = "Question or keywords to search the medical corpus for")]
    query: String,
    #[schemars(description = "Maximum number of passages to return")]
    #[serde(default = "default_limit")]
    limit: usize,
    #[schemars(description = "Reduce the query to its most salient phrase before searching")]
    #[serde(default)]
    extract_keywords: Option<bool>,
}

fn default_limit() -> usize {
    4
}

#[derive(Debug, Deserialize, JsonSchema)]
struct IndexStatusParams {}

struct RetrievalServer {
    handlers: Arc<ToolHandlers>,
    tool_router: ToolRouter<Self>,
}

impl RetrievalServer {
    fn new(handlers: Arc<ToolHandlers>) -> Self {
        Self {
            handlers,
            tool_router: Self::tool_router(),
        }
    }
}

#[rmcp::tool_router]
impl RetrievalServer {
    #[tool(
        name = "retrieve_passages",
        description = "Find corpus passages relevant to a medical question. Combines keyword (BM25) search with embedding similarity and returns ranked passages."
    )]
    async fn retrieve_passages(
        &self,
        params: rmcp::handler::server::wrapper::Parameters<RetrievePassagesParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let args = RetrievePassagesArgs {
            query: params.query,
            limit: params.limit,
            extract_keywords: params.extract_keywords,
        };

        match self.handlers.handle_retrieve_passages(args).await {
            Ok(json_response) => Ok(CallToolResult::success(vec![Content::text(json_response)])),
            Err(e) => Ok(CallToolResult::success(vec![Content::text(
                serde_json::json!({"error": format!("Retrieval failed: {}", e)}).to_string()
            )])),
        }
    }

    #[tool(
        name = "index_status",
        description = "Show which indexes are built, their document counts and the retrieval settings in use."
    )]
    async fn index_status(
        &self,
        _params: rmcp::handler::server::wrapper::Parameters<IndexStatusParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        match self.handlers.handle_index_status(IndexStatusArgs::default()).await {
            Ok(json_response) => Ok(CallToolResult::success(vec![Content::text(json_response)])),
            Err(e) => Ok(CallToolResult::success(vec![Content::text(
                serde_json::json!({"error": format!("Status check failed: {}", e)}).to_string()
            )])),
        }
    }
}

#[tool_handler]
impl rmcp::ServerHandler for RetrievalServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Medical corpus retrieval server. Use retrieve_passages to find supporting \
                 passages for a question, index_status to inspect the indexes.".to_string()
            ),
        }
    }
}
