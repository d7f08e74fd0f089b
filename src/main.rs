// ===============================
// src/main.rs
// ===============================
/*
 # paper mode (default)
 cargo run -- serve
 curl -s -XPOST localhost:3000/allocations -d '{"totalAmount":"10000000",
   "items":[{"assetSymbol":"WETH","fraction":0.6},{"assetSymbol":"cbBTC","fraction":0.4}]}'

 # what happened
 curl -s localhost:3000/metrics | egrep '^(batches_total|pipeline_transitions_total)'
*/
/*
=============================================================================
Project : basket_swap — USDC allocation swap orchestrator in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Splits a USDC deposit across a basket of Base assets by caller
          fractions, runs an ERC-20 allowance gate, then quotes, signs
          (custodial Privy wallet) and submits one CoW Protocol order per
          asset. Exposes an HTTP API, Prometheus metrics and a JSONL
          audit trail.
=============================================================================
*/
mod allowance;
mod api;
mod chain;
mod config;
mod domain;
mod error;
mod guard;
mod metrics;
mod mock;         // paper chain / order book / signer (EXECUTION_MODE=mock)
mod orchestrator;
mod orderbook;    // CoW Protocol order book client
mod pipeline;
mod recorder;
mod signer;       // Privy server wallets
mod splitter;
mod tokens;
mod validator;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::{sync::mpsc, task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::allowance::AllowanceGate;
use crate::chain::RpcChainReader;
use crate::config::{ConfigError, ExecutionMode, Settings};
use crate::domain::AuditEvent;
use crate::orchestrator::{Orchestrator, SignerLocks};
use crate::orderbook::CowOrderBook;
use crate::pipeline::SwapPipeline;
use crate::recorder::AuditSink;
use crate::signer::PrivySigner;
use crate::tokens::TokenDirectory;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "basket_swap", version, about = "USDC -> basket swaps through CoW Protocol")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Execute one allocation batch from a JSON file and print the report
    Execute {
        #[arg(short, long, help = "request JSON ({totalAmount, items} or the legacy shape)")]
        file: String,
    },
    /// Create a custodial server wallet with the signing service
    #[command(name = "create-wallet")]
    CreateWallet {
        #[arg(long, default_value = "ethereum")]
        chain_type: String,
    },
    /// Print the resolved token directory
    Tokens,
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    // ---- Load config ----
    let settings = config::load()?;
    let dir = load_directory(&settings)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings, dir).await,
        Command::Execute { file } => execute_file(settings, dir, &file).await,
        Command::CreateWallet { chain_type } => create_wallet(&settings, &chain_type).await,
        Command::Tokens => {
            for t in dir.entries() {
                println!("{:<8} {} {:>2}", t.symbol, t.address, t.decimals);
            }
            Ok(())
        }
    }
}

fn load_directory(settings: &Settings) -> Result<Arc<TokenDirectory>, BoxError> {
    let mut dir = TokenDirectory::base_mainnet()?;
    if let Some(path) = &settings.token_list_file {
        dir = dir.with_token_list(path)?;
        info!(%path, "token list merged");
    }
    Ok(Arc::new(dir))
}

fn http_client(settings: &Settings) -> Result<reqwest::Client, BoxError> {
    Ok(reqwest::Client::builder()
        .timeout(settings.http_timeout)
        .build()?)
}

fn live_orchestrator(settings: &Settings, dir: Arc<TokenDirectory>) -> Result<Orchestrator, BoxError> {
    let privy = settings
        .privy
        .as_ref()
        .ok_or(ConfigError::Missing("PRIVY_APP_ID/PRIVY_APP_SECRET"))?;
    let http = http_client(settings)?;

    let chain = Arc::new(RpcChainReader::new(
        http.clone(),
        settings.rpc_url.clone(),
        settings.http_timeout,
    ));
    let signer = Arc::new(PrivySigner::new(
        http.clone(),
        privy.api_url.clone(),
        privy.app_id.clone(),
        privy.app_secret.clone(),
        settings.http_timeout,
    ));
    let book = Arc::new(CowOrderBook::new(
        http,
        settings.cow_api_url.clone(),
        &settings.cow_app_code,
        settings.http_timeout,
    ));

    let gate = AllowanceGate::new(chain, signer.clone(), settings.identity.clone(), settings.chain_id)
        .with_approval_policy(settings.approval)
        .with_confirmation(settings.confirmation);
    let pipeline = SwapPipeline::new(
        book,
        signer,
        settings.identity.clone(),
        settings.pipeline_config(),
    );
    Ok(Orchestrator::new(
        dir,
        gate,
        pipeline,
        SignerLocks::default(),
        settings.orchestrator_config(),
    )?)
}

/// Orchestrator for the configured mode, plus the recorder task when RECORD_FILE is set.
async fn build(
    settings: &Settings,
    dir: Arc<TokenDirectory>,
) -> Result<(Orchestrator, Option<JoinHandle<()>>), BoxError> {
    let orch = match settings.mode {
        ExecutionMode::Mock => mock::paper_orchestrator(settings, dir)?.0,
        ExecutionMode::Live => live_orchestrator(settings, dir)?,
    };

    // ---- Recorder (optional) ----
    match &settings.record_file {
        Some(path) => {
            let writer = recorder::open_writer(path).await?;
            let (tx, rx) = mpsc::channel::<AuditEvent>(1024);
            let handle = tokio::spawn(recorder::run(rx, writer, path.clone()));
            Ok((orch.with_audit(AuditSink::new(tx)), Some(handle)))
        }
        None => Ok((orch, None)),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c: shutting down");
            t.cancel();
        }
    });
    token
}

async fn drain_recorder(handle: Option<JoinHandle<()>>) {
    if let Some(h) = handle {
        if tokio::time::timeout(Duration::from_secs(5), h).await.is_err() {
            warn!("recorder did not stop in time");
        }
    }
}

async fn serve(settings: Settings, dir: Arc<TokenDirectory>) -> Result<(), BoxError> {
    // ---- Metrics ----
    metrics::init();
    metrics::CONFIG_EXECUTION_MODE
        .with_label_values(&[settings.mode.as_str()])
        .set(1);

    // ---- Human-friendly startup info ----
    info!(
        mode = %settings.mode.as_str(),
        signer = %settings.identity.address,
        chain_id = settings.chain_id,
        cow = %settings.cow_api_url,
        slippage_bps = settings.slippage_bps,
        approval = ?settings.approval,
        confirmation = ?settings.confirmation,
        remainder = ?settings.remainder,
        failure = ?settings.failure,
        deadline = ?settings.batch_deadline,
        "startup config"
    );

    let (orch, recorder) = build(&settings, dir).await?;
    let state = api::AppState {
        orchestrator: Arc::new(orch),
        shutdown: cancel_on_ctrl_c(),
    };
    if let Some(port) = settings.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve_metrics(addr, shutdown).await {
                error!(error = %e, %addr, "metrics listener failed");
            }
        });
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let served = api::serve(addr, state).await;
    drain_recorder(recorder).await;
    served?;
    info!("bye");
    Ok(())
}

async fn execute_file(settings: Settings, dir: Arc<TokenDirectory>, file: &str) -> Result<(), BoxError> {
    let raw = tokio::fs::read(file).await?;
    let request = api::parse_allocation_body(&raw)?;

    let (orch, recorder) = build(&settings, dir).await?;
    let result = orch.execute_with_cancel(&request, cancel_on_ctrl_c()).await;
    drop(orch);
    drain_recorder(recorder).await;

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report.summary())?);
    match report.first_failure() {
        Some(f) => Err(f.into()),
        None => Ok(()),
    }
}

async fn create_wallet(settings: &Settings, chain_type: &str) -> Result<(), BoxError> {
    let privy = settings
        .privy
        .as_ref()
        .ok_or(ConfigError::Missing("PRIVY_APP_ID/PRIVY_APP_SECRET"))?;
    let signer = PrivySigner::new(
        http_client(settings)?,
        privy.api_url.clone(),
        privy.app_id.clone(),
        privy.app_secret.clone(),
        settings.http_timeout,
    );
    let wallet = signer.create_wallet(chain_type).await?;
    info!(id = %wallet.id, address = %wallet.address, "wallet created");
    println!("{}", serde_json::to_string_pretty(&wallet)?);
    Ok(())
}
