use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hubrpc_common::protocol::error::Result;
use hubrpc_common::sync::lock;
use hubrpc_common::transport::ConnectionRef;
use hubrpc_common::{
    ForwardStrategy, Requestor, RpcError, TopicOpType, TopicRequest, TopicResponse,
};
use tracing::{debug, warn};

/// Receives `(topic, message)` for every push on a subscribed topic.
pub type TopicCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// How a subscriber describes itself to priority forwarding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub priority: i32,
    pub tags: Vec<String>,
}

/// Forwarding parameters for a publish.
///
/// Fields left at their defaults are not sent.
///
/// # Example
///
/// ```
/// use hubrpc_client::topic::PublishOptions;
/// use hubrpc_common::ForwardStrategy;
///
/// let options = PublishOptions::new(ForwardStrategy::Fanout).fanout(3);
/// assert_eq!(options.strategy, ForwardStrategy::Fanout);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub strategy: ForwardStrategy,
    pub fanout: u32,
    pub shard_key: String,
    pub priority: i32,
    pub tags: Vec<String>,
    pub redundant: u32,
}

impl PublishOptions {
    pub fn new(strategy: ForwardStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn fanout(mut self, limit: u32) -> Self {
        self.fanout = limit;
        self
    }

    pub fn shard_key(mut self, key: impl Into<String>) -> Self {
        self.shard_key = key.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn redundant(mut self, count: u32) -> Self {
        self.redundant = count;
        self
    }

    fn apply(self, request: &mut TopicRequest) {
        request.forward_strategy = self.strategy;
        if self.fanout > 0 {
            request.fanout = Some(self.fanout);
        }
        if !self.shard_key.is_empty() {
            request.shard_key = Some(self.shard_key);
        }
        if self.priority > 0 {
            request.priority = Some(self.priority);
        }
        if !self.tags.is_empty() {
            request.tags = self.tags;
        }
        if self.redundant > 1 {
            request.redundant = Some(self.redundant);
        }
    }
}

/// Topic operations from the client side.
///
/// Every operation waits for the server's [`TopicResponse`]. Pushes for
/// subscribed topics arrive through [`on_publish`](Self::on_publish).
pub struct TopicManager {
    requestor: Arc<Requestor>,
    callbacks: Mutex<HashMap<String, TopicCallback>>,
}

impl TopicManager {
    pub fn new(requestor: Arc<Requestor>) -> Self {
        Self {
            requestor,
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(&self, conn: &ConnectionRef, topic: &str) -> Result<()> {
        self.request(conn, TopicRequest::new(topic, TopicOpType::Create)).await
    }

    pub async fn remove(&self, conn: &ConnectionRef, topic: &str) -> Result<()> {
        self.request(conn, TopicRequest::new(topic, TopicOpType::Remove)).await
    }

    /// Subscribes to `topic`; `callback` runs for every message pushed to it.
    ///
    /// The callback is installed before the request goes out so no push can
    /// be missed, and uninstalled again if the server refuses.
    pub async fn subscribe<F>(
        &self,
        conn: &ConnectionRef,
        topic: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        lock(&self.callbacks).insert(topic.to_string(), Arc::new(callback));

        let mut request = TopicRequest::new(topic, TopicOpType::Subscribe);
        if options.priority > 0 {
            request.priority = Some(options.priority);
        }
        request.tags = options.tags;

        let result = self.request(conn, request).await;
        if result.is_err() {
            lock(&self.callbacks).remove(topic);
        }
        result
    }

    /// Unsubscribes from `topic` and drops its callback.
    pub async fn cancel(&self, conn: &ConnectionRef, topic: &str) -> Result<()> {
        lock(&self.callbacks).remove(topic);
        self.request(conn, TopicRequest::new(topic, TopicOpType::Unsubscribe)).await
    }

    pub async fn publish(
        &self,
        conn: &ConnectionRef,
        topic: &str,
        message: &str,
        options: PublishOptions,
    ) -> Result<()> {
        let mut request = TopicRequest::publish(topic, message);
        options.apply(&mut request);
        self.request(conn, request).await
    }

    /// Delivers a server push to the topic's callback.
    pub fn on_publish(&self, request: TopicRequest) {
        if request.optype != TopicOpType::Publish {
            warn!(topic = %request.topic, optype = ?request.optype, "ignoring non-publish topic push");
            return;
        }

        let callback = lock(&self.callbacks).get(&request.topic).cloned();
        match callback {
            Some(callback) => callback(&request.topic, request.message.as_deref().unwrap_or_default()),
            None => debug!(topic = %request.topic, "push for topic without callback"),
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        lock(&self.callbacks).contains_key(topic)
    }

    async fn request(&self, conn: &ConnectionRef, request: TopicRequest) -> Result<()> {
        let topic = request.topic.clone();
        let optype = request.optype;
        let response = TopicResponse::try_from(self.requestor.send(conn, request.into()).await?)?;
        if !response.rcode.is_success() {
            warn!(topic = %topic, ?optype, reason = response.rcode.reason(), "topic request failed");
            return Err(RpcError::Remote(response.rcode));
        }
        debug!(topic = %topic, ?optype, "topic request succeeded");
        Ok(())
    }
}
