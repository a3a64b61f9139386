//! Per-connection channel subscription table.
//!
//! A channel is created `Pending` by the first subscribe, moves to
//! `Subscribed` when its `#subscribe` negotiation succeeds, and falls back to
//! `Pending` whenever the connection drops. Removal (unsubscribe, kick-out,
//! failed negotiation) takes it out of the table entirely.
//!
//! At most one negotiation is in flight per channel: its call id is recorded
//! in the entry, and only a result carrying that id may change the entry.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::envelope::SubscribeRequest;
use tether_core::ids::CallId;

/// Subscription state of one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelState {
    /// Waiting for (re)negotiation.
    Pending,
    /// Confirmed by the server.
    Subscribed,
    /// Removed from the table.
    Unsubscribed,
}

impl ChannelState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options a channel is subscribed with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubscribeOptions {
    /// Only negotiate while authenticated.
    pub wait_for_auth: bool,
    /// Allow the negotiation (and the server's publications) to be batched.
    pub batch: bool,
    /// Resubscription order: higher first.
    pub priority: i32,
    /// Opaque data handed to the server's subscribe middleware.
    pub data: Option<Value>,
}

#[derive(Debug)]
struct Entry {
    state: ChannelState,
    options: SubscribeOptions,
    pending_call: Option<CallId>,
    seq: u64,
}

/// A channel removed from the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedChannel {
    /// State the channel was in.
    pub state: ChannelState,
    /// Negotiation that was in flight, which the caller must cancel.
    pub pending_call: Option<CallId>,
}

/// Channel table of one client.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Entry>,
    next_seq: u64,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `name` as pending, or replace the options of an existing
    /// channel. Returns `true` when the channel was created.
    pub fn subscribe(&mut self, name: &str, options: SubscribeOptions) -> bool {
        if let Some(entry) = self.channels.get_mut(name) {
            entry.options = options;
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let _ = self.channels.insert(
            name.to_string(),
            Entry {
                state: ChannelState::Pending,
                options,
                pending_call: None,
                seq,
            },
        );
        true
    }

    /// State of `name`, `None` when it is not in the table.
    pub fn state(&self, name: &str) -> Option<ChannelState> {
        self.channels.get(name).map(|e| e.state)
    }

    /// Options of `name`.
    pub fn options(&self, name: &str) -> Option<&SubscribeOptions> {
        self.channels.get(name).map(|e| &e.options)
    }

    /// Whether `name` is subscribed (or pending, with `include_pending`).
    pub fn is_subscribed(&self, name: &str, include_pending: bool) -> bool {
        match self.state(name) {
            Some(ChannelState::Subscribed) => true,
            Some(ChannelState::Pending) => include_pending,
            _ => false,
        }
    }

    /// Whether `name` has a negotiation in flight.
    pub fn is_negotiating(&self, name: &str) -> bool {
        self.channels
            .get(name)
            .is_some_and(|e| e.pending_call.is_some())
    }

    /// Names of subscribed channels (plus pending ones, with
    /// `include_pending`), in subscription order.
    pub fn names(&self, include_pending: bool) -> Vec<String> {
        let mut entries: Vec<_> = self
            .channels
            .iter()
            .filter(|(_, e)| {
                e.state == ChannelState::Subscribed
                    || (include_pending && e.state == ChannelState::Pending)
            })
            .collect();
        entries.sort_by_key(|(_, e)| e.seq);
        entries.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Pending channels without a negotiation in flight, highest priority
    /// first; equal priorities keep subscription order.
    pub fn pending_in_priority_order(&self) -> Vec<String> {
        let mut entries: Vec<_> = self
            .channels
            .iter()
            .filter(|(_, e)| e.state == ChannelState::Pending && e.pending_call.is_none())
            .collect();
        entries.sort_by_key(|(_, e)| (Reverse(e.options.priority), e.seq));
        entries.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// `#subscribe` payload for `name`.
    pub fn request(&self, name: &str) -> Option<SubscribeRequest> {
        self.channels.get(name).map(|e| SubscribeRequest {
            channel: name.to_string(),
            wait_for_auth: e.options.wait_for_auth,
            batch: e.options.batch,
            data: e.options.data.clone(),
        })
    }

    /// Record the in-flight negotiation of `name`.
    ///
    /// Returns `false` (and records nothing) when one is already in flight.
    pub fn mark_negotiating(&mut self, name: &str, cid: CallId) -> bool {
        match self.channels.get_mut(name) {
            Some(entry) if entry.pending_call.is_none() => {
                entry.pending_call = Some(cid);
                true
            }
            _ => false,
        }
    }

    /// Whether `cid` is the negotiation currently in flight for `name`.
    pub fn owns_negotiation(&self, name: &str, cid: CallId) -> bool {
        self.channels
            .get(name)
            .is_some_and(|e| e.pending_call == Some(cid))
    }

    /// Apply a successful negotiation. Returns the previous state when the
    /// channel actually transitioned.
    pub fn on_success(&mut self, name: &str) -> Option<ChannelState> {
        let entry = self.channels.get_mut(name)?;
        entry.pending_call = None;
        if entry.state == ChannelState::Subscribed {
            return None;
        }
        let old = entry.state;
        entry.state = ChannelState::Subscribed;
        Some(old)
    }

    /// Forget the in-flight negotiation of `name`, leaving it pending.
    pub fn clear_negotiation(&mut self, name: &str) {
        if let Some(entry) = self.channels.get_mut(name) {
            entry.pending_call = None;
        }
    }

    /// Remove `name` from the table.
    pub fn remove(&mut self, name: &str) -> Option<RemovedChannel> {
        self.channels.remove(name).map(|e| RemovedChannel {
            state: e.state,
            pending_call: e.pending_call,
        })
    }

    /// Connection lost: clear every negotiation and move subscribed
    /// channels back to pending. Returns the channels that were subscribed,
    /// in subscription order.
    pub fn suspend_all(&mut self) -> Vec<String> {
        let mut suspended: Vec<_> = self
            .channels
            .iter_mut()
            .filter_map(|(name, entry)| {
                entry.pending_call = None;
                (entry.state == ChannelState::Subscribed).then(|| {
                    entry.state = ChannelState::Pending;
                    (entry.seq, name.clone())
                })
            })
            .collect();
        suspended.sort_unstable();
        suspended.into_iter().map(|(_, name)| name).collect()
    }

    /// Number of channels in the table.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
