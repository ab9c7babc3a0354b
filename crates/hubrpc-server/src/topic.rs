//! Server-side topic engine.
//!
//! Topics hold their subscribers; subscribers hold the names of the topics
//! they belong to. Both sides are indexed under one [`TopicManager`] lock
//! so that removal from one side never leaves a dangling entry on the
//! other.
//!
//! Publishing snapshots the topic's subscribers, picks recipients with the
//! request's [`ForwardStrategy`], and sends after every lock is released.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hubrpc_common::sync::lock;
use hubrpc_common::transport::{ConnectionId, ConnectionRef};
use hubrpc_common::{ForwardStrategy, Message, RespCode, TopicOpType, TopicRequest, TopicResponse};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct SubscriberState {
    priority: i32,
    tags: HashSet<String>,
    topics: HashSet<String>,
}

/// A connection subscribed to at least one topic.
#[derive(Debug)]
pub struct Subscriber {
    conn: ConnectionRef,
    state: Mutex<SubscriberState>,
}

impl Subscriber {
    fn new(conn: ConnectionRef) -> Self {
        Self {
            conn,
            state: Mutex::new(SubscriberState::default()),
        }
    }

    pub fn conn(&self) -> &ConnectionRef {
        &self.conn
    }

    pub fn priority(&self) -> i32 {
        lock(&self.state).priority
    }

    pub fn topics(&self) -> Vec<String> {
        lock(&self.state).topics.iter().cloned().collect()
    }

    fn has_tags(&self, required: &[String]) -> bool {
        let state = lock(&self.state);
        required.iter().all(|tag| state.tags.contains(tag))
    }
}

struct TopicState {
    subscribers: BTreeMap<ConnectionId, Arc<Subscriber>>,
    cursor: usize,
    rng: StdRng,
}

/// A named topic and its subscribers.
pub struct Topic {
    name: String,
    state: Mutex<TopicState>,
}

impl Topic {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(TopicState {
                subscribers: BTreeMap::new(),
                cursor: 0,
                rng: StdRng::from_os_rng(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    /// Forwards `request` to the subscribers its strategy selects. Returns
    /// how many sends succeeded.
    fn push_message(&self, request: &TopicRequest, priority_cursor: &AtomicUsize) -> usize {
        let snapshot: Vec<Arc<Subscriber>> = lock(&self.state).subscribers.values().cloned().collect();
        let targets = self.select_targets(request, snapshot, priority_cursor);

        let message: Message = request.clone().into();
        let mut delivered = 0;
        for subscriber in &targets {
            match subscriber.conn.send(&message) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(topic = %self.name, conn = subscriber.conn.id(), error = %e, "forward failed"),
            }
        }
        debug!(
            topic = %self.name,
            strategy = ?request.forward_strategy,
            delivered,
            "message forwarded"
        );
        delivered
    }

    fn select_targets(
        &self,
        request: &TopicRequest,
        mut subscribers: Vec<Arc<Subscriber>>,
        priority_cursor: &AtomicUsize,
    ) -> Vec<Arc<Subscriber>> {
        let len = subscribers.len();
        if len == 0 {
            return subscribers;
        }

        match request.forward_strategy {
            ForwardStrategy::Broadcast => subscribers,
            ForwardStrategy::RoundRobin => {
                let index = {
                    let mut state = lock(&self.state);
                    let index = state.cursor % len;
                    state.cursor = (index + 1) % len;
                    index
                };
                vec![subscribers.swap_remove(index)]
            }
            ForwardStrategy::Fanout => {
                let limit = request.fanout.unwrap_or_default() as usize;
                if limit == 0 || limit >= len {
                    return subscribers;
                }
                subscribers.shuffle(&mut lock(&self.state).rng);
                subscribers.truncate(limit);
                subscribers
            }
            ForwardStrategy::SourceHash => match request.shard_key.as_deref() {
                Some(key) if !key.is_empty() => {
                    let index = (hash_key(key) % len as u64) as usize;
                    vec![subscribers.swap_remove(index)]
                }
                _ => {
                    warn!(topic = %self.name, "source-hash publish without shard key, dropping");
                    Vec::new()
                }
            },
            ForwardStrategy::Priority => {
                let mut candidates: Vec<Arc<Subscriber>> = Vec::new();
                let mut max_priority = i32::MIN;
                for subscriber in subscribers.iter().filter(|s| s.has_tags(&request.tags)) {
                    let priority = subscriber.priority();
                    if priority > max_priority {
                        max_priority = priority;
                        candidates.clear();
                    }
                    if priority == max_priority {
                        candidates.push(subscriber.clone());
                    }
                }
                if candidates.is_empty() {
                    return subscribers;
                }
                let index = priority_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                vec![candidates.swap_remove(index)]
            }
            ForwardStrategy::Redundant => {
                let count = request.redundant.unwrap_or_default() as usize;
                if count <= 1 {
                    return subscribers;
                }
                subscribers.shuffle(&mut lock(&self.state).rng);
                subscribers.truncate(count.min(len));
                subscribers
            }
        }
    }
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[derive(Default)]
struct TopicIndex {
    topics: HashMap<String, Arc<Topic>>,
    subscribers: HashMap<ConnectionId, Arc<Subscriber>>,
}

impl TopicIndex {
    /// Drops `subscriber`'s back-reference to `topic`, forgetting the
    /// subscriber once it belongs to no topic.
    fn detach(&mut self, subscriber: &Arc<Subscriber>, topic: &str) {
        let now_empty = {
            let mut state = lock(&subscriber.state);
            state.topics.remove(topic);
            state.topics.is_empty()
        };
        let conn = subscriber.conn.id();
        if now_empty
            && self
                .subscribers
                .get(&conn)
                .is_some_and(|indexed| Arc::ptr_eq(indexed, subscriber))
        {
            self.subscribers.remove(&conn);
        }
    }
}

/// Topic registry and request handler.
///
/// The priority strategy's tie-break cursor is shared by every topic of
/// one manager.
#[derive(Default)]
pub struct TopicManager {
    index: Mutex<TopicIndex>,
    priority_cursor: AtomicUsize,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `name`; an existing topic is left untouched.
    pub fn create(&self, name: &str) {
        let mut index = lock(&self.index);
        if index.topics.contains_key(name) {
            info!(topic = name, "topic already exists");
            return;
        }
        index.topics.insert(name.to_string(), Arc::new(Topic::new(name)));
        info!(topic = name, "topic created");
    }

    /// Deletes `name` and detaches it from all of its subscribers.
    pub fn remove(&self, name: &str) {
        let mut index = lock(&self.index);
        let Some(topic) = index.topics.remove(name) else {
            debug!(topic = name, "remove of unknown topic");
            return;
        };
        let subscribers = std::mem::take(&mut lock(&topic.state).subscribers);
        for subscriber in subscribers.values() {
            index.detach(subscriber, name);
        }
        info!(topic = name, detached = subscribers.len(), "topic removed");
    }

    /// Subscribes `conn` to `name`, setting its priority and tags. Returns
    /// false if the topic does not exist.
    pub fn subscribe(&self, conn: &ConnectionRef, name: &str, priority: i32, tags: &[String]) -> bool {
        let mut index = lock(&self.index);
        let Some(topic) = index.topics.get(name).cloned() else {
            return false;
        };
        let subscriber = index
            .subscribers
            .entry(conn.id())
            .or_insert_with(|| Arc::new(Subscriber::new(conn.clone())))
            .clone();

        {
            let mut state = lock(&subscriber.state);
            state.priority = priority;
            state.tags = tags.iter().cloned().collect();
            state.topics.insert(name.to_string());
        }
        lock(&topic.state).subscribers.insert(conn.id(), subscriber);
        debug!(topic = name, conn = conn.id(), priority, "subscribed");
        true
    }

    /// Unsubscribes `conn` from `name`. Unknown topics or subscribers are
    /// ignored.
    pub fn unsubscribe(&self, conn: ConnectionId, name: &str) {
        let mut index = lock(&self.index);
        if let Some(topic) = index.topics.get(name) {
            lock(&topic.state).subscribers.remove(&conn);
        }
        if let Some(subscriber) = index.subscribers.get(&conn).cloned() {
            index.detach(&subscriber, name);
        }
        debug!(topic = name, conn, "unsubscribed");
    }

    /// Forwards a publish. Returns the number of deliveries, or `None` if
    /// the topic does not exist.
    pub fn publish(&self, request: &TopicRequest) -> Option<usize> {
        let topic = lock(&self.index).topics.get(&request.topic).cloned()?;
        Some(topic.push_message(request, &self.priority_cursor))
    }

    /// Builds the response to `request` from `conn`, applying its effects.
    pub fn handle(&self, conn: &ConnectionRef, request: &TopicRequest) -> TopicResponse {
        let rcode = match request.optype {
            TopicOpType::Create => {
                self.create(&request.topic);
                RespCode::Success
            }
            TopicOpType::Remove => {
                self.remove(&request.topic);
                RespCode::Success
            }
            TopicOpType::Subscribe => {
                let priority = request.priority.unwrap_or_default();
                if self.subscribe(conn, &request.topic, priority, &request.tags) {
                    RespCode::Success
                } else {
                    RespCode::TopicNotFound
                }
            }
            TopicOpType::Unsubscribe => {
                self.unsubscribe(conn.id(), &request.topic);
                RespCode::Success
            }
            TopicOpType::Publish => match self.publish(request) {
                Some(_) => RespCode::Success,
                None => RespCode::TopicNotFound,
            },
        };

        if !rcode.is_success() {
            warn!(topic = %request.topic, optype = ?request.optype, reason = rcode.reason(), "topic request failed");
        }
        TopicResponse::new(request.id.clone(), rcode)
    }

    /// Answers `request` on `conn`.
    pub fn on_topic_request(&self, conn: &ConnectionRef, request: TopicRequest) {
        let response = self.handle(conn, &request);
        if let Err(e) = conn.send(&response.into()) {
            warn!(conn = conn.id(), topic = %request.topic, error = %e, "failed to send topic response");
        }
    }

    /// Unlinks `conn`'s subscriber from every topic it belonged to.
    pub fn on_connection_closed(&self, conn: &ConnectionRef) {
        let mut index = lock(&self.index);
        let Some(subscriber) = index.subscribers.remove(&conn.id()) else {
            return;
        };
        for name in subscriber.topics() {
            if let Some(topic) = index.topics.get(&name) {
                lock(&topic.state).subscribers.remove(&conn.id());
            }
        }
        debug!(conn = conn.id(), "subscriber disconnected");
    }

    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        lock(&self.index).topics.get(name).cloned()
    }

    pub fn subscriber(&self, conn: ConnectionId) -> Option<Arc<Subscriber>> {
        lock(&self.index).subscribers.get(&conn).cloned()
    }
}
