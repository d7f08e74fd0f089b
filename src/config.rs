// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : basket_swap — USDC allocation swap orchestrator in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Splits a USDC deposit across a basket of Base assets by caller
          fractions, runs an ERC-20 allowance gate, then quotes, signs
          (custodial Privy wallet) and submits one CoW Protocol order per
          asset. Exposes an HTTP API, Prometheus metrics and a JSONL
          audit trail.
=============================================================================
*/
use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use thiserror::Error;
use url::Url;

use crate::allowance::{ApprovalPolicy, ConfirmationPolicy};
use crate::domain::{Address, Amount};
use crate::orchestrator::{FailurePolicy, OrchestratorConfig};
use crate::pipeline::PipelineConfig;
use crate::signer::SignerIdentity;
use crate::splitter::RemainderPolicy;

pub const DEFAULT_COW_API_URL: &str = "https://api.cow.fi/base";
pub const DEFAULT_PRIVY_API_URL: &str = "https://api.privy.io";
pub const DEFAULT_RPC_URL: &str = "https://mainnet.base.org";
pub const BASE_CHAIN_ID: u64 = 8453;
pub const GPV2_SETTLEMENT: &str = "0x9008d19f58aabd9ed0d60971565aa8510560ab41";
pub const GPV2_VAULT_RELAYER: &str = "0xc92e8bdf79f0507f65a392b0ab4667716bfe0110";
const PAPER_WALLET_ID: &str = "paper-wallet";
const PAPER_WALLET_ADDRESS: &str = "0x00000000000000000000000000000000000a11ce";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Where trades go: in-process paper collaborators, or the real services.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Mock,
    Live,
}

impl ExecutionMode {
    pub fn parse(key: &'static str, raw: Option<String>, default_mode: ExecutionMode) -> Result<Self, ConfigError> {
        match raw.as_deref().map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") => Ok(default_mode),
            Some("mock") | Some("paper") => Ok(ExecutionMode::Mock),
            Some("live") => Ok(ExecutionMode::Live),
            Some(other) => Err(invalid(key, other, "expected mock|live")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Mock => "mock",
            ExecutionMode::Live => "live",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PrivySettings {
    pub api_url: String,
    pub app_id: String,
    pub app_secret: String,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub mode: ExecutionMode,

    // http / metrics
    pub http_port: u16,
    pub metrics_port: Option<u16>,
    pub http_timeout: Duration,

    // chain + order book
    pub chain_id: u64,
    pub rpc_url: String,
    pub cow_api_url: String,
    pub cow_app_code: String,
    pub settlement: Address,
    pub vault_relayer: Address,

    // signer
    pub privy: Option<PrivySettings>,
    pub identity: SignerIdentity,

    // policies
    pub slippage_bps: u32,
    pub approval: ApprovalPolicy,
    pub confirmation: ConfirmationPolicy,
    pub remainder: RemainderPolicy,
    pub failure: FailurePolicy,
    pub batch_deadline: Option<Duration>,

    // files
    pub record_file: Option<String>,
    pub token_list_file: Option<String>,

    // paper venue (mock mode)
    pub mock_balance: Amount,
    pub mock_latency: Duration,
}

impl Settings {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            chain_id: self.chain_id,
            settlement: self.settlement,
            slippage_bps: self.slippage_bps,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            remainder: self.remainder,
            failure: self.failure,
            batch_deadline: self.batch_deadline,
            spender: self.vault_relayer,
        }
    }
}

struct Source<F: Fn(&str) -> Option<String>>(F);

impl<F: Fn(&str) -> Option<String>> Source<F> {
    fn opt(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.opt(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|e: T::Err| invalid(key, &v, e.to_string())),
        }
    }

    fn choice<T: Copy>(
        &self,
        key: &'static str,
        default: T,
        options: &[(&str, T)],
    ) -> Result<T, ConfigError> {
        let Some(v) = self.opt(key) else {
            return Ok(default);
        };
        let lower = v.to_ascii_lowercase();
        options
            .iter()
            .find(|(name, _)| *name == lower)
            .map(|(_, t)| *t)
            .ok_or_else(|| {
                let names: Vec<&str> = options.iter().map(|(n, _)| *n).collect();
                invalid(key, &v, format!("expected {}", names.join("|")))
            })
    }
}

pub fn load() -> Result<Settings, ConfigError> {
    // .env is optional
    let _ = dotenv();
    load_from(|k| env::var(k).ok())
}

pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Settings, ConfigError> {
    let src = Source(lookup);
    let mode = ExecutionMode::parse("EXECUTION_MODE", src.opt("EXECUTION_MODE"), ExecutionMode::Mock)?;

    // ===== Ports / timeouts =====
    let http_port = src.parsed("HTTP_PORT", 3000u16)?;
    let metrics_port = match src.opt("METRICS_PORT") {
        None => None,
        Some(v) => Some(v.parse().map_err(|_| invalid("METRICS_PORT", &v, "not a port"))?),
    };
    let http_timeout = Duration::from_secs(src.parsed("HTTP_TIMEOUT_SECS", 15u64)?);

    // ===== Chain / CoW =====
    let chain_id = src.parsed("CHAIN_ID", BASE_CHAIN_ID)?;
    let rpc_url = http_url(&src, "RPC_URL", DEFAULT_RPC_URL)?;
    let cow_api_url = http_url(&src, "COW_API_URL", DEFAULT_COW_API_URL)?;
    let cow_app_code = src.string("COW_APP_CODE", "basket_swap");
    let settlement = address(&src, "SETTLEMENT_CONTRACT", GPV2_SETTLEMENT)?;
    let vault_relayer = address(&src, "VAULT_RELAYER", GPV2_VAULT_RELAYER)?;

    // ===== Signer =====
    let privy = match (src.opt("PRIVY_APP_ID"), src.opt("PRIVY_APP_SECRET")) {
        (Some(app_id), Some(app_secret)) => Some(PrivySettings {
            api_url: http_url(&src, "PRIVY_API_URL", DEFAULT_PRIVY_API_URL)?,
            app_id,
            app_secret,
        }),
        _ => None,
    };
    let identity = match mode {
        ExecutionMode::Live => {
            if privy.is_none() {
                return Err(ConfigError::Missing("PRIVY_APP_ID/PRIVY_APP_SECRET"));
            }
            let wallet_id = src
                .opt("AGENT_WALLET_ID")
                .ok_or(ConfigError::Missing("AGENT_WALLET_ID"))?;
            let raw = src
                .opt("AGENT_WALLET_ADDRESS")
                .ok_or(ConfigError::Missing("AGENT_WALLET_ADDRESS"))?;
            let address = raw
                .parse()
                .map_err(|e: crate::domain::AddressParseError| {
                    invalid("AGENT_WALLET_ADDRESS", &raw, e.to_string())
                })?;
            SignerIdentity { wallet_id, address }
        }
        ExecutionMode::Mock => SignerIdentity {
            wallet_id: src.string("AGENT_WALLET_ID", PAPER_WALLET_ID),
            address: address(&src, "AGENT_WALLET_ADDRESS", PAPER_WALLET_ADDRESS)?,
        },
    };

    // ===== Policies =====
    let slippage_bps = src.parsed("SLIPPAGE_BPS", 50u32)?;
    if slippage_bps >= 10_000 {
        return Err(invalid("SLIPPAGE_BPS", &slippage_bps.to_string(), "must be below 10000"));
    }
    let approval = src.choice(
        "APPROVAL_POLICY",
        ApprovalPolicy::Unlimited,
        &[("unlimited", ApprovalPolicy::Unlimited), ("exact", ApprovalPolicy::Exact)],
    )?;
    let wait_for_receipt = src.choice("APPROVAL_CONFIRMATION", false, &[("none", false), ("wait", true)])?;
    let confirmation = if wait_for_receipt {
        ConfirmationPolicy::WaitForReceipt {
            timeout: Duration::from_secs(src.parsed("APPROVAL_TIMEOUT_SECS", 120u64)?),
            poll_interval: Duration::from_millis(src.parsed("APPROVAL_POLL_MS", 2_000u64)?.max(1)),
        }
    } else {
        ConfirmationPolicy::FireAndForget
    };
    let remainder = src.choice(
        "REMAINDER_POLICY",
        RemainderPolicy::Strand,
        &[("strand", RemainderPolicy::Strand), ("last", RemainderPolicy::AssignToLast)],
    )?;
    let failure = src.choice(
        "FAILURE_POLICY",
        FailurePolicy::StopOnFailure,
        &[("stop", FailurePolicy::StopOnFailure), ("continue", FailurePolicy::ContinueOnFailure)],
    )?;
    // 0 disables the deadline
    let batch_deadline = match src.parsed("BATCH_DEADLINE_SECS", 300u64)? {
        0 => None,
        s => Some(Duration::from_secs(s)),
    };

    Ok(Settings {
        mode,
        http_port,
        metrics_port,
        http_timeout,
        chain_id,
        rpc_url,
        cow_api_url,
        cow_app_code,
        settlement,
        vault_relayer,
        privy,
        identity,
        slippage_bps,
        approval,
        confirmation,
        remainder,
        failure,
        batch_deadline,
        record_file: src.opt("RECORD_FILE"),
        token_list_file: src.opt("TOKEN_LIST_FILE"),
        mock_balance: src.parsed("MOCK_USDC_BALANCE", 1_000_000_000_000u128)?,
        mock_latency: Duration::from_millis(src.parsed("MOCK_LATENCY_MS", 25u64)?),
    })
}

fn http_url<F: Fn(&str) -> Option<String>>(
    src: &Source<F>,
    key: &'static str,
    default: &str,
) -> Result<String, ConfigError> {
    let raw = src.string(key, default);
    let parsed = Url::parse(&raw).map_err(|e| invalid(key, &raw, e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(raw),
        other => Err(invalid(key, &raw, format!("unsupported scheme {other}"))),
    }
}

fn address<F: Fn(&str) -> Option<String>>(
    src: &Source<F>,
    key: &'static str,
    default: &str,
) -> Result<Address, ConfigError> {
    let raw = src.string(key, default);
    raw.parse()
        .map_err(|e: crate::domain::AddressParseError| invalid(key, &raw, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        load_from(move |k| map.get(k).cloned())
    }

    #[test]
    fn defaults_run_in_mock_mode() {
        let s = from(&[]).unwrap();
        assert_eq!(s.mode, ExecutionMode::Mock);
        assert_eq!(s.http_port, 3000);
        assert_eq!(s.chain_id, 8453);
        assert_eq!(s.slippage_bps, 50);
        assert_eq!(s.approval, ApprovalPolicy::Unlimited);
        assert_eq!(s.confirmation, ConfirmationPolicy::FireAndForget);
        assert_eq!(s.remainder, RemainderPolicy::Strand);
        assert_eq!(s.failure, FailurePolicy::StopOnFailure);
        assert_eq!(s.vault_relayer.to_string(), GPV2_VAULT_RELAYER);
        assert_eq!(s.identity.wallet_id, PAPER_WALLET_ID);
        assert!(s.privy.is_none());
    }

    #[test]
    fn live_mode_requires_signer_secrets() {
        let err = from(&[("EXECUTION_MODE", "live")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("PRIVY_APP_ID/PRIVY_APP_SECRET"));

        let err = from(&[
            ("EXECUTION_MODE", "live"),
            ("PRIVY_APP_ID", "app"),
            ("PRIVY_APP_SECRET", "secret"),
            ("AGENT_WALLET_ID", "w1"),
        ])
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing("AGENT_WALLET_ADDRESS"));

        let ok = from(&[
            ("EXECUTION_MODE", "LIVE"),
            ("PRIVY_APP_ID", "app"),
            ("PRIVY_APP_SECRET", "secret"),
            ("AGENT_WALLET_ID", "w1"),
            ("AGENT_WALLET_ADDRESS", "0x1111111111111111111111111111111111111111"),
        ])
        .unwrap();
        assert_eq!(ok.mode, ExecutionMode::Live);
        assert_eq!(ok.privy.unwrap().api_url, DEFAULT_PRIVY_API_URL);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            from(&[("EXECUTION_MODE", "binance")]),
            Err(ConfigError::Invalid { key: "EXECUTION_MODE", .. })
        ));
        assert!(matches!(
            from(&[("APPROVAL_POLICY", "sometimes")]),
            Err(ConfigError::Invalid { key: "APPROVAL_POLICY", .. })
        ));
        assert!(matches!(
            from(&[("SLIPPAGE_BPS", "10000")]),
            Err(ConfigError::Invalid { key: "SLIPPAGE_BPS", .. })
        ));
        assert!(matches!(
            from(&[("VAULT_RELAYER", "0x12")]),
            Err(ConfigError::Invalid { key: "VAULT_RELAYER", .. })
        ));
        assert!(matches!(
            from(&[("COW_API_URL", "ftp://api.cow.fi/base")]),
            Err(ConfigError::Invalid { key: "COW_API_URL", .. })
        ));
        assert!(matches!(
            from(&[("RPC_URL", "not a url")]),
            Err(ConfigError::Invalid { key: "RPC_URL", .. })
        ));
    }

    #[test]
    fn policies_and_deadline_parse() {
        let s = from(&[
            ("APPROVAL_POLICY", "exact"),
            ("APPROVAL_CONFIRMATION", "wait"),
            ("APPROVAL_TIMEOUT_SECS", "30"),
            ("REMAINDER_POLICY", "last"),
            ("FAILURE_POLICY", "continue"),
            ("BATCH_DEADLINE_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(s.approval, ApprovalPolicy::Exact);
        assert_eq!(
            s.confirmation,
            ConfirmationPolicy::WaitForReceipt {
                timeout: Duration::from_secs(30),
                poll_interval: Duration::from_millis(2_000),
            }
        );
        assert_eq!(s.remainder, RemainderPolicy::AssignToLast);
        assert_eq!(s.failure, FailurePolicy::ContinueOnFailure);
        assert_eq!(s.batch_deadline, None);
    }
}
