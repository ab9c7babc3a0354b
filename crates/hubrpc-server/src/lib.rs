//! hubrpc Server
//!
//! This crate provides the three server roles of hubrpc:
//!
//! - **RPC server** ([`RpcServer`]): dispatches requests to registered
//!   [`ServiceDescribe`]s and, when pointed at a registry, registers them
//!   and keeps them alive with load reports and heartbeats
//! - **Registry** ([`RegistryServer`]): tracks providers per method, answers
//!   discovery, pushes online/offline notifications and evicts providers
//!   whose heartbeats stop
//! - **Topic server** ([`TopicServer`]): topic lifecycle, subscriptions and
//!   strategy-driven message forwarding
//!
//! The engines ([`RpcRouter`], [`RegistryService`], [`TopicManager`]) are
//! transport-agnostic and can be driven directly with any
//! [`Connection`](hubrpc_common::transport::Connection).

pub mod registry;
pub mod router;
pub mod server;
pub mod topic;

pub use registry::{DiscovererManager, Provider, ProviderManager, RegistryService};
pub use router::{CallError, RpcRouter, ServiceDescribe, ServiceDescribeBuilder, ServiceHandler, ValueType};
pub use server::{
    LoadSource, RegistryServer, RegistryServerConfig, RpcServer, RpcServerConfig, TopicServer,
    TopicServerConfig,
};
pub use topic::{Subscriber, Topic, TopicManager};
