//! hubrpc Client
//!
//! Client-side roles of the hubrpc runtime:
//!
//! - **RPC**: [`RpcClient`] calls methods on a fixed server or on providers
//!   found through the registry
//! - **Registry**: [`RegistryClient`] registers provided methods and keeps
//!   them alive; [`DiscoveryClient`] looks methods up and caches providers
//! - **Topics**: [`TopicClient`] creates, subscribes to and publishes on
//!   topics
//!
//! Every call is available awaited, as a future, or with a callback.

pub mod caller;
pub mod client;
pub mod health_checker;
pub mod load_balancer;
pub mod registry;
pub mod topic;

pub use caller::RpcCaller;
pub use client::{DiscoveryClient, RegistryClient, RpcClient, RpcClientConfig, TopicClient};
pub use health_checker::{DiscoveryConfig, HealthChecker};
pub use load_balancer::{LoadBalanceStrategy, MethodHost};
pub use registry::{Discover, OfflineCallback, Provider};
pub use topic::{PublishOptions, SubscribeOptions, TopicCallback, TopicManager};
