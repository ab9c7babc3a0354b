//! # hubrpc CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Start a registry and a topic server
//! hubrpc registry -b 127.0.0.1:8080
//! hubrpc topics -b 127.0.0.1:8081
//!
//! # Serve the demo `add` method and register it
//! hubrpc provider -b 127.0.0.1:9001 --registry 127.0.0.1:8080
//!
//! # Call it directly or through discovery (outputs raw JSON)
//! hubrpc call 127.0.0.1:9001 add -a '{"num1": 2, "num2": 3}'
//! hubrpc call 127.0.0.1:8080 add --discover -a '{"num1": 2, "num2": 3}'
//!
//! # Topics
//! hubrpc subscribe 127.0.0.1:8081 news --create
//! hubrpc publish 127.0.0.1:8081 news hello --strategy fanout --fanout 2
//! ```

use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use hubrpc_cli::{add_service, parse_forward_strategy, parse_load_balance_strategy};
use hubrpc_client::{
    DiscoveryConfig, LoadBalanceStrategy, PublishOptions, RpcClient, RpcClientConfig,
    SubscribeOptions, TopicClient,
};
use hubrpc_common::{ForwardStrategy, HeartbeatConfig, HostInfo};
use hubrpc_server::{
    RegistryServer, RegistryServerConfig, RpcServer, RpcServerConfig, TopicServer,
    TopicServerConfig,
};

#[derive(FromArgs)]
/// hubrpc - RPC with service discovery and topic publish/subscribe
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Registry(RegistryArgs),
    Topics(TopicsArgs),
    Provider(ProviderArgs),
    Call(CallArgs),
    Publish(PublishArgs),
    Subscribe(SubscribeArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "registry")]
/// start a service registry
struct RegistryArgs {
    /// address to bind the registry to
    #[argh(option, short = 'b', default = "\"127.0.0.1:8080\".into()")]
    bind: String,

    /// seconds between heartbeat sweeps
    #[argh(option, long = "check-interval", default = "5")]
    check_interval_secs: u64,

    /// seconds without a heartbeat before a provider is evicted
    #[argh(option, long = "idle-timeout", default = "15")]
    idle_timeout_secs: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "topics")]
/// start a topic server
struct TopicsArgs {
    /// address to bind the topic server to
    #[argh(option, short = 'b', default = "\"127.0.0.1:8081\".into()")]
    bind: String,
}

/// Arguments for the demo provider.
///
/// The provider serves `add(num1, num2)`. With `--registry` it registers
/// the method under `--access-addr` (or the bound address) and keeps it
/// alive with load reports and heartbeats.
#[derive(FromArgs)]
#[argh(subcommand, name = "provider")]
/// serve the demo add method
struct ProviderArgs {
    /// address to bind the RPC server to
    #[argh(option, short = 'b', default = "\"127.0.0.1:9001\".into()")]
    bind: String,

    /// registry to register with
    #[argh(option, short = 'r', long = "registry")]
    registry: Option<String>,

    /// address announced to the registry, as ip:port
    #[argh(option, long = "access-addr")]
    access_addr: Option<String>,

    /// load announced with the registration
    #[argh(option, long = "load", default = "10")]
    load: u32,
}

/// Arguments for a single RPC call.
///
/// Outputs the raw JSON result to stdout so it composes with `jq`. Errors
/// go to stderr with a non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call an RPC method
struct CallArgs {
    /// server address, or the registry address with --discover
    #[argh(positional)]
    address: String,

    /// name of the method to call
    #[argh(positional)]
    method: String,

    /// JSON object of named parameters
    #[argh(option, short = 'a', long = "args", default = "\"{}\".into()")]
    args: String,

    /// resolve the provider through the registry at the address
    #[argh(switch, long = "discover")]
    discover: bool,

    /// load balancing strategy with --discover: round-robin, random,
    /// source-hash or lowest-load
    #[argh(option, long = "strategy", from_str_fn(parse_load_balance_strategy), default = "LoadBalanceStrategy::RoundRobin")]
    strategy: LoadBalanceStrategy,

    /// key for the source-hash strategy
    #[argh(option, long = "hash-key", default = "String::new()")]
    hash_key: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "publish")]
/// publish a message to a topic
struct PublishArgs {
    /// topic server address
    #[argh(positional)]
    address: String,

    /// topic name
    #[argh(positional)]
    topic: String,

    /// message text
    #[argh(positional)]
    message: String,

    /// forwarding strategy: broadcast, round-robin, fanout, source-hash,
    /// priority or redundant
    #[argh(option, long = "strategy", from_str_fn(parse_forward_strategy), default = "ForwardStrategy::Broadcast")]
    strategy: ForwardStrategy,

    /// subscriber count for fanout
    #[argh(option, long = "fanout", default = "0")]
    fanout: u32,

    /// shard key for source-hash
    #[argh(option, long = "shard-key", default = "String::new()")]
    shard_key: String,

    /// copies for redundant
    #[argh(option, long = "redundant", default = "0")]
    redundant: u32,

    /// message priority, sent only when positive
    #[argh(option, long = "priority", default = "0")]
    priority: i32,

    /// required subscriber tag for priority, repeatable
    #[argh(option, long = "tag")]
    tags: Vec<String>,

    /// create the topic before publishing
    #[argh(switch, long = "create")]
    create: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "subscribe")]
/// subscribe to a topic and print its messages
struct SubscribeArgs {
    /// topic server address
    #[argh(positional)]
    address: String,

    /// topic name
    #[argh(positional)]
    topic: String,

    /// priority for priority forwarding
    #[argh(option, long = "priority", default = "0")]
    priority: i32,

    /// subscriber tag, repeatable
    #[argh(option, long = "tag")]
    tags: Vec<String>,

    /// create the topic before subscribing
    #[argh(switch, long = "create")]
    create: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep stdout clean for one-shot commands
    if !matches!(cli.command, Commands::Call(_) | Commands::Publish(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Registry(args) => run_registry(args).await,
        Commands::Topics(args) => run_topics(args).await,
        Commands::Provider(args) => run_provider(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Publish(args) => run_publish(args).await,
        Commands::Subscribe(args) => run_subscribe(args).await,
    }
}

async fn run_registry(args: RegistryArgs) -> Result<()> {
    let config = RegistryServerConfig {
        bind_addr: args.bind,
        heartbeat: HeartbeatConfig {
            check_interval: Duration::from_secs(args.check_interval_secs),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            ..HeartbeatConfig::default()
        },
    };
    let server = RegistryServer::bind(config).await?;
    tracing::info!("Registry listening on {}", server.local_addr()?);
    server.run().await?;
    Ok(())
}

async fn run_topics(args: TopicsArgs) -> Result<()> {
    let server = TopicServer::bind(TopicServerConfig { bind_addr: args.bind }).await?;
    tracing::info!("Topic server listening on {}", server.local_addr()?);
    server.run().await?;
    Ok(())
}

async fn run_provider(args: ProviderArgs) -> Result<()> {
    let access_addr = args.access_addr.as_deref().map(parse_host).transpose()?;
    let config = RpcServerConfig {
        bind_addr: args.bind,
        access_addr,
        registry_addr: args.registry,
        initial_load: args.load,
        ..RpcServerConfig::default()
    };
    let server = RpcServer::bind(config).await?;
    server.register_method(add_service()?).await?;
    tracing::info!("Provider listening on {}", server.local_addr()?);
    server.run().await?;
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    let params: serde_json::Value = serde_json::from_str(&args.args)
        .map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;

    let client = if args.discover {
        let config = RpcClientConfig {
            strategy: args.strategy,
            hash_key: args.hash_key,
            discovery: DiscoveryConfig::default(),
        };
        RpcClient::with_discovery(&args.address, config).await?
    } else {
        RpcClient::connect(&args.address).await?
    };
    let result = client.call(&args.method, params).await?;

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

async fn run_publish(args: PublishArgs) -> Result<()> {
    let client = TopicClient::connect(&args.address).await?;
    if args.create {
        client.create(&args.topic).await?;
    }
    let options = PublishOptions::new(args.strategy)
        .fanout(args.fanout)
        .shard_key(args.shard_key)
        .tags(args.tags)
        .priority(args.priority)
        .redundant(args.redundant);
    client.publish(&args.topic, &args.message, options).await?;
    Ok(())
}

async fn run_subscribe(args: SubscribeArgs) -> Result<()> {
    let client = TopicClient::connect(&args.address).await?;
    if args.create {
        client.create(&args.topic).await?;
    }
    let options = SubscribeOptions {
        priority: args.priority,
        tags: args.tags,
    };
    client
        .subscribe(&args.topic, options, |topic, message| {
            println!("{}: {}", topic, message);
        })
        .await?;
    tracing::info!("Subscribed to {}, press Ctrl-C to stop", args.topic);

    tokio::signal::ctrl_c().await?;
    if let Err(e) = client.cancel(&args.topic).await {
        tracing::warn!("Failed to unsubscribe: {}", e);
    }
    Ok(())
}

fn parse_host(addr: &str) -> Result<HostInfo> {
    let (ip, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid access address '{}': expected ip:port", addr))?;
    let port = port
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid port in access address '{}': {}", addr, e))?;
    Ok(HostInfo::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_registry_defaults() {
        let args: Cli = Cli::from_args(&["hubrpc"], &["registry"]).unwrap();
        match args.command {
            Commands::Registry(RegistryArgs { bind, check_interval_secs, idle_timeout_secs }) => {
                assert_eq!(bind, "127.0.0.1:8080");
                assert_eq!(check_interval_secs, 5);
                assert_eq!(idle_timeout_secs, 15);
            }
            _ => panic!("Expected Registry command"),
        }
    }

    #[test]
    fn test_cli_parse_provider_with_registry() {
        let args: Cli = Cli::from_args(&["hubrpc"], &[
            "provider",
            "-b", "0.0.0.0:9001",
            "--registry", "127.0.0.1:8080",
            "--access-addr", "10.0.0.5:9001",
        ]).unwrap();
        match args.command {
            Commands::Provider(ProviderArgs { bind, registry, access_addr, load }) => {
                assert_eq!(bind, "0.0.0.0:9001");
                assert_eq!(registry, Some("127.0.0.1:8080".to_string()));
                assert_eq!(access_addr, Some("10.0.0.5:9001".to_string()));
                assert_eq!(load, 10); // default
            }
            _ => panic!("Expected Provider command"),
        }
    }

    #[test]
    fn test_cli_parse_call_with_discovery() {
        let args: Cli = Cli::from_args(&["hubrpc"], &[
            "call", "127.0.0.1:8080", "add",
            "-a", r#"{"num1": 1, "num2": 2}"#,
            "--discover",
            "--strategy", "lowest-load",
        ]).unwrap();
        match args.command {
            Commands::Call(CallArgs { address, method, args, discover, strategy, hash_key }) => {
                assert_eq!(address, "127.0.0.1:8080");
                assert_eq!(method, "add");
                assert_eq!(args, r#"{"num1": 1, "num2": 2}"#);
                assert!(discover);
                assert_eq!(strategy, LoadBalanceStrategy::LowestLoad);
                assert!(hash_key.is_empty());
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_defaults() {
        let args: Cli = Cli::from_args(&["hubrpc"], &["call", "127.0.0.1:9001", "add"]).unwrap();
        match args.command {
            Commands::Call(CallArgs { args, discover, strategy, .. }) => {
                assert_eq!(args, "{}");
                assert!(!discover);
                assert_eq!(strategy, LoadBalanceStrategy::RoundRobin);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_publish_strategy_flags() {
        let args: Cli = Cli::from_args(&["hubrpc"], &[
            "publish", "127.0.0.1:8081", "news", "hello",
            "--strategy", "priority",
            "--tag", "vip",
            "--tag", "eu",
        ]).unwrap();
        match args.command {
            Commands::Publish(PublishArgs { topic, message, strategy, tags, fanout, create, .. }) => {
                assert_eq!(topic, "news");
                assert_eq!(message, "hello");
                assert_eq!(strategy, ForwardStrategy::Priority);
                assert_eq!(tags, vec!["vip".to_string(), "eu".to_string()]);
                assert_eq!(fanout, 0);
                assert!(!create);
            }
            _ => panic!("Expected Publish command"),
        }
    }

    #[test]
    fn test_cli_parse_publish_priority() {
        let args: Cli = Cli::from_args(&["hubrpc"], &[
            "publish", "127.0.0.1:8081", "news", "urgent",
            "--strategy", "priority",
            "--priority", "7",
        ]).unwrap();
        match args.command {
            Commands::Publish(PublishArgs { strategy, priority, .. }) => {
                assert_eq!(strategy, ForwardStrategy::Priority);
                assert_eq!(priority, 7);
            }
            _ => panic!("Expected Publish command"),
        }

        let args: Cli = Cli::from_args(&["hubrpc"], &[
            "publish", "127.0.0.1:8081", "news", "plain",
        ]).unwrap();
        match args.command {
            Commands::Publish(PublishArgs { priority, .. }) => assert_eq!(priority, 0),
            _ => panic!("Expected Publish command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_strategy() {
        let result = Cli::from_args(&["hubrpc"], &[
            "publish", "127.0.0.1:8081", "news", "hello", "--strategy", "gossip",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_subscribe() {
        let args: Cli = Cli::from_args(&["hubrpc"], &[
            "subscribe", "127.0.0.1:8081", "news", "--priority", "5", "--create",
        ]).unwrap();
        match args.command {
            Commands::Subscribe(SubscribeArgs { topic, priority, tags, create, .. }) => {
                assert_eq!(topic, "news");
                assert_eq!(priority, 5);
                assert!(tags.is_empty());
                assert!(create);
            }
            _ => panic!("Expected Subscribe command"),
        }
    }

    #[test]
    fn test_parse_host() {
        assert_eq!(parse_host("10.0.0.5:9001").unwrap(), HostInfo::new("10.0.0.5", 9001));
        assert!(parse_host("10.0.0.5").is_err());
        assert!(parse_host("10.0.0.5:http").is_err());
    }
}
