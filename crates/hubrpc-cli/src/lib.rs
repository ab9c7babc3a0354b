//! # hubrpc CLI
//!
//! Command-line interface for running hubrpc roles and issuing one-shot
//! requests against them.
//!
//! ## Key Commands
//!
//! - `hubrpc registry`: start a service registry
//! - `hubrpc topics`: start a topic server
//! - `hubrpc provider`: serve the demo `add` method, optionally registered
//! - `hubrpc call`: make one RPC call, directly or through discovery
//! - `hubrpc publish` / `hubrpc subscribe`: topic client commands
//!
//! Shared pieces (the demo service and flag parsers) live here so they can
//! be tested without the binary.

use hubrpc_client::LoadBalanceStrategy;
use hubrpc_common::{ForwardStrategy, RpcError};
use hubrpc_server::{ServiceDescribe, ValueType};
use serde_json::json;

/// The demo `add(num1, num2)` method served by `hubrpc provider`.
pub fn add_service() -> Result<ServiceDescribe, RpcError> {
    ServiceDescribe::builder("add")
        .param("num1", ValueType::Integral)
        .param("num2", ValueType::Integral)
        .returns(ValueType::Integral)
        .handler(|params| {
            let num1 = params["num1"].as_i64().unwrap_or_default();
            let num2 = params["num2"].as_i64().unwrap_or_default();
            let sum = num1
                .checked_add(num2)
                .ok_or_else(|| anyhow::anyhow!("add overflowed"))?;
            Ok(json!(sum))
        })
        .build()
}

/// Parses a `--strategy` value for `hubrpc publish`.
pub fn parse_forward_strategy(value: &str) -> Result<ForwardStrategy, String> {
    match value.to_ascii_lowercase().as_str() {
        "broadcast" => Ok(ForwardStrategy::Broadcast),
        "round-robin" | "roundrobin" => Ok(ForwardStrategy::RoundRobin),
        "fanout" => Ok(ForwardStrategy::Fanout),
        "source-hash" | "sourcehash" => Ok(ForwardStrategy::SourceHash),
        "priority" => Ok(ForwardStrategy::Priority),
        "redundant" => Ok(ForwardStrategy::Redundant),
        other => Err(format!(
            "unknown forward strategy '{}' (expected broadcast, round-robin, fanout, source-hash, priority or redundant)",
            other
        )),
    }
}

/// Parses a `--strategy` value for `hubrpc call --discover`.
pub fn parse_load_balance_strategy(value: &str) -> Result<LoadBalanceStrategy, String> {
    match value.to_ascii_lowercase().as_str() {
        "round-robin" | "roundrobin" => Ok(LoadBalanceStrategy::RoundRobin),
        "random" => Ok(LoadBalanceStrategy::Random),
        "source-hash" | "sourcehash" => Ok(LoadBalanceStrategy::SourceHash),
        "lowest-load" | "lowestload" => Ok(LoadBalanceStrategy::LowestLoad),
        other => Err(format!(
            "unknown load balance strategy '{}' (expected round-robin, random, source-hash or lowest-load)",
            other
        )),
    }
}
