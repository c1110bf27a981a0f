//! Channel tokens used to route events to subsets of handlers.
//!
//! A channel is either the `"*"` wildcard, an opaque string tag, or a
//! manager instance used for direct targeting. Targeted channels bypass the
//! string comparison entirely and resolve against the target manager's own
//! handler buckets.

use std::fmt;

use crate::manager::Manager;

/// A routing token supplied to `fire`.
#[derive(Clone)]
pub enum Channel {
    /// The `"*"` wildcard: deliver to every channel.
    Any,
    /// An opaque string tag.
    Name(String),
    /// Direct targeting of a specific manager instance.
    Target(Manager),
}

impl Channel {
    /// Convenience constructor for a named channel.
    pub fn name(name: impl Into<String>) -> Self {
        Channel::Name(name.into())
    }

    /// Hashable projection used as a handler-cache key component.
    pub fn key(&self) -> ChannelKey {
        match self {
            Channel::Any => ChannelKey::Any,
            Channel::Name(name) => ChannelKey::Name(name.clone()),
            Channel::Target(manager) => ChannelKey::Target(manager.id()),
        }
    }

    /// The string form a handler's `channel` metadata is compared against,
    /// if this token has one.
    pub(crate) fn as_str(&self) -> Option<&str> {
        match self {
            Channel::Any => Some("*"),
            Channel::Name(name) => Some(name.as_str()),
            Channel::Target(_) => None,
        }
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        if name == "*" {
            Channel::Any
        } else {
            Channel::Name(name.to_string())
        }
    }
}

impl From<String> for Channel {
    fn from(name: String) -> Self {
        Channel::from(name.as_str())
    }
}

impl From<&Manager> for Channel {
    fn from(manager: &Manager) -> Self {
        Channel::Target(manager.clone())
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Any => write!(f, "*"),
            Channel::Name(name) => write!(f, "{name}"),
            Channel::Target(manager) => write!(f, "<target {}>", manager.id()),
        }
    }
}

/// Owned, hashable channel identity (targets keyed by manager id).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    /// Wildcard.
    Any,
    /// Named channel.
    Name(String),
    /// Targeted manager, by id.
    Target(u64),
}
