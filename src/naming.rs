// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange and Queue Naming
//!
//! Every exchange and queue the client declares gets its name from here. Names are
//! derived from the message type's registered identity, an optional schema version,
//! and for handler-scoped queues the identity of the handler itself, so the same
//! subscription always lands on the same queue across restarts.

use std::{
    any::TypeId,
    collections::HashMap,
    fmt,
    sync::{PoisonError, RwLock},
};

/// Prefix shared by dead-letter exchanges and queues
pub const DEAD_LETTER_PREFIX: &str = "dead-letter-";
/// Prefix of the exchange dead-letter replay publishes to
pub const REPUBLISH_PREFIX: &str = "republish-";

/// Static identity of a payload type.
///
/// `NAME` should be fully qualified (e.g. `shop.orders.OrderCreated`) so two types
/// never collide. Bump `VERSION` on breaking schema changes: the new shape then
/// routes through its own exchange and queues.
///
/// ```
/// use rabbitmq_pubsub::naming::MessageType;
///
/// struct OrderCreated;
///
/// impl MessageType for OrderCreated {
///     const NAME: &'static str = "shop.OrderCreated";
///     const VERSION: Option<&'static str> = Some("2");
/// }
/// ```
pub trait MessageType: 'static {
    const NAME: &'static str;
    const VERSION: Option<&'static str> = None;
}

/// Identity of the handler behind a subscription.
///
/// Supplied by the caller; `owner` is the declaring component and `method` the
/// handling function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId {
    pub owner: String,
    pub method: String,
}

impl HandlerId {
    pub fn new(owner: &str, method: &str) -> Self {
        HandlerId {
            owner: owner.to_owned(),
            method: method.to_owned(),
        }
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.method)
    }
}

/// Derives names and memoizes type wire-names.
///
/// The cache is owned by the resolver, and so by the client instance. Concurrent
/// first resolutions of the same type race on the write lock and the loser keeps
/// the already inserted value.
#[derive(Debug, Default)]
pub struct NameResolver {
    type_names: RwLock<HashMap<TypeId, String>>,
}

impl NameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the wire-name of `T`: `NAME`, or `NAME[VERSION]` when versioned.
    pub fn type_name<T: MessageType>(&self) -> String {
        let id = TypeId::of::<T>();

        if let Some(name) = self
            .type_names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return name.clone();
        }

        self.type_names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| match T::VERSION {
                Some(version) => format!("{}[{}]", T::NAME, version),
                None => T::NAME.to_owned(),
            })
            .clone()
    }

    pub fn exchange_name<T: MessageType>(&self) -> String {
        self.type_name::<T>()
    }

    /// Name of the queue shared by every consumer of `T` (competing consumers).
    pub fn queue_name<T: MessageType>(&self) -> String {
        self.type_name::<T>()
    }

    /// Name of the private queue of one handler: `{owner}.{method}[{type wire-name}]`.
    pub fn scoped_queue_name<T: MessageType>(&self, handler: &HandlerId) -> String {
        format!("{}[{}]", handler, self.type_name::<T>())
    }

    /// Name of a queue private to one process instance of the handler.
    pub fn node_queue_name<T: MessageType>(&self, handler: &HandlerId, node: &str) -> String {
        format!("{}[{}]", self.scoped_queue_name::<T>(handler), node)
    }

    /// Number of memoized type names.
    pub fn cached(&self) -> usize {
        self.type_names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub fn dead_letter_name(name: &str) -> String {
    format!("{}{}", DEAD_LETTER_PREFIX, name)
}

/// Inverse of [`dead_letter_name`]. Names without the prefix are returned unchanged.
pub fn undo_dead_letter_name(dead_letter_name: &str) -> String {
    dead_letter_name
        .strip_prefix(DEAD_LETTER_PREFIX)
        .unwrap_or(dead_letter_name)
        .to_owned()
}

pub fn is_dead_letter_name(name: &str) -> bool {
    name.starts_with(DEAD_LETTER_PREFIX)
}

/// Exchange that dead-letter replay publishes to for the given dead-letter queue.
pub fn republish_exchange_name(dead_letter_queue: &str) -> String {
    format!("{}{}", REPUBLISH_PREFIX, dead_letter_queue)
}
