//! Exchanges and bindings
//!
//! An `Exchange` is an immutable routing node. The `BindingTable` records
//! which queues are bound to which exchange and under which pattern, and
//! resolves the target queues of a publish. Resolution is read-only and
//! returns a sorted set, so the same table and key always give the same
//! targets in the same order.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::broker::topic::TopicPattern;
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes by `*`/`#` pattern match on the routing key.
    Topic,
    /// Routes to every bound queue, patterns ignored.
    Fanout,
    /// Routes to queues whose binding key equals the routing key.
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Direct => "direct",
        };
        f.write_str(name)
    }
}

impl FromStr for ExchangeKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "topic" => Ok(ExchangeKind::Topic),
            "fanout" => Ok(ExchangeKind::Fanout),
            "direct" => Ok(ExchangeKind::Direct),
            other => Err(BrokerError::PreconditionFailed(format!(
                "unknown exchange kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub pattern: String,
}

#[derive(Debug, Clone)]
enum Filter {
    All,
    Exact,
    Topic(TopicPattern),
}

#[derive(Debug, Clone)]
struct Bound {
    queue: String,
    pattern: String,
    filter: Filter,
}

impl Bound {
    fn accepts(&self, routing_key: &str) -> bool {
        match &self.filter {
            Filter::All => true,
            Filter::Exact => self.pattern == routing_key,
            Filter::Topic(pattern) => pattern.matches(routing_key),
        }
    }
}

#[derive(Debug, Default)]
pub struct BindingTable {
    by_exchange: HashMap<String, Vec<Bound>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding. Returns `false` when the same triple already exists.
    ///
    /// Topic patterns are compiled here; a malformed one fails with
    /// `InvalidPattern` and leaves the table untouched.
    pub fn insert(&mut self, exchange: &Exchange, queue: &str, pattern: &str) -> Result<bool> {
        let filter = match exchange.kind {
            ExchangeKind::Fanout => Filter::All,
            ExchangeKind::Direct => Filter::Exact,
            ExchangeKind::Topic => Filter::Topic(TopicPattern::parse(pattern)?),
        };

        let bound = self.by_exchange.entry(exchange.name.clone()).or_default();
        if bound
            .iter()
            .any(|b| b.queue == queue && b.pattern == pattern)
        {
            return Ok(false);
        }
        bound.push(Bound {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
            filter,
        });
        Ok(true)
    }

    /// Remove one binding. Returns `false` when it did not exist.
    pub fn remove(&mut self, exchange: &str, queue: &str, pattern: &str) -> bool {
        let Some(bound) = self.by_exchange.get_mut(exchange) else {
            return false;
        };
        let before = bound.len();
        bound.retain(|b| !(b.queue == queue && b.pattern == pattern));
        let removed = bound.len() != before;
        if bound.is_empty() {
            self.by_exchange.remove(exchange);
        }
        removed
    }

    /// Remove every binding that targets `queue`. Returns how many went.
    pub fn remove_queue(&mut self, queue: &str) -> usize {
        let mut removed = 0;
        self.by_exchange.retain(|_, bound| {
            let before = bound.len();
            bound.retain(|b| b.queue != queue);
            removed += before - bound.len();
            !bound.is_empty()
        });
        removed
    }

    /// Queues that should receive a message published to `exchange` with
    /// `routing_key`. An empty set means the message is unroutable.
    pub fn resolve(&self, exchange: &Exchange, routing_key: &str) -> BTreeSet<String> {
        self.by_exchange
            .get(&exchange.name)
            .map(|bound| {
                bound
                    .iter()
                    .filter(|b| b.accepts(routing_key))
                    .map(|b| b.queue.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All bindings of `exchange`, sorted.
    pub fn bindings(&self, exchange: &str) -> Vec<Binding> {
        let mut bindings: Vec<Binding> = self
            .by_exchange
            .get(exchange)
            .map(|bound| {
                bound
                    .iter()
                    .map(|b| Binding {
                        exchange: exchange.to_string(),
                        queue: b.queue.clone(),
                        pattern: b.pattern.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        bindings.sort();
        bindings
    }

    pub fn len(&self) -> usize {
        self.by_exchange.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_exchange.is_empty()
    }
}
