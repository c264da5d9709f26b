//! Turn-based transcript assembly.
//!
//! Text deltas accumulate per speaker and are committed to the
//! [`ConversationLog`] only when a turn completes.

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

const LOG_EVENTS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    pub fn label(self) -> &'static str {
        match self {
            Speaker::User => "You",
            Speaker::Agent => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptItem {
    pub speaker: Speaker,
    pub text: String,
    pub committed: bool,
}

/// Append-only record of committed utterances, in commit order.
///
/// Clones share the same log. Observers either take a [`snapshot`] or
/// [`subscribe`] to appends.
///
/// [`snapshot`]: ConversationLog::snapshot
/// [`subscribe`]: ConversationLog::subscribe
#[derive(Clone)]
pub struct ConversationLog {
    items: Arc<RwLock<Vec<TranscriptItem>>>,
    events: broadcast::Sender<TranscriptItem>,
}

impl Default for ConversationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLog {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(LOG_EVENTS_CAPACITY);
        Self {
            items: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    pub fn snapshot(&self) -> Vec<TranscriptItem> {
        self.items
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptItem> {
        self.events.subscribe()
    }

    fn append(&self, item: TranscriptItem) {
        self.items
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(item.clone());
        // 没有订阅者时忽略
        let _ = self.events.send(item);
    }
}

pub struct TranscriptAggregator {
    user: String,
    agent: String,
    log: ConversationLog,
}

impl TranscriptAggregator {
    pub fn new(log: ConversationLog) -> Self {
        Self {
            user: String::new(),
            agent: String::new(),
            log,
        }
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn push_input(&mut self, text: &str) {
        self.user.push_str(text);
    }

    pub fn push_output(&mut self, text: &str) {
        self.agent.push_str(text);
    }

    /// Uncommitted text for a speaker.
    #[cfg(test)]
    pub fn pending(&self, speaker: Speaker) -> TranscriptItem {
        let text = match speaker {
            Speaker::User => &self.user,
            Speaker::Agent => &self.agent,
        };
        TranscriptItem {
            speaker,
            text: text.clone(),
            committed: false,
        }
    }

    /// Commit both buffers, user first, skipping blank ones. Returns the
    /// number of items appended.
    pub fn turn_complete(&mut self) -> usize {
        let mut appended = 0;
        for (speaker, buf) in [
            (Speaker::User, std::mem::take(&mut self.user)),
            (Speaker::Agent, std::mem::take(&mut self.agent)),
        ] {
            if buf.trim().is_empty() {
                continue;
            }
            self.log.append(TranscriptItem {
                speaker,
                text: buf,
                committed: true,
            });
            appended += 1;
        }
        appended
    }

    /// The agent's utterance was abandoned; the user's is kept.
    pub fn interrupt(&mut self) {
        self.agent.clear();
    }

    pub fn reset(&mut self) {
        self.user.clear();
        self.agent.clear();
    }
}
