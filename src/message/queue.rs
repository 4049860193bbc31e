use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::throttle::Throttle;
use super::throttle_config::{ThrottleConfig, ThrottleRules};
use super::types::{Dest, DestType, Message};
use crate::constants::queue::DESTINATION_COOLDOWN;

/// Tunables for a [`Queue`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Rules counted per destination.
    pub per_destination: Arc<dyn ThrottleConfig>,
    /// Rules counted per destination type.
    pub global: Arc<dyn ThrottleConfig>,
    pub cooldown: Duration,
    /// Fixed shuffle seed; `None` seeds from OS entropy.
    pub seed: Option<u64>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            per_destination: Arc::new(ThrottleRules::per_destination_defaults()),
            global: Arc::new(ThrottleRules::global_defaults()),
            cooldown: DESTINATION_COOLDOWN,
            seed: None,
        }
    }
}

/// Per-cycle working set of pending and recently sent messages.
///
/// Safe to share between the per-type send workers; every operation takes a
/// single internal lock.
#[derive(Debug)]
pub struct Queue {
    inner: Mutex<QueueState>,
}

#[derive(Debug)]
struct QueueState {
    now: DateTime<Utc>,
    cooldown: chrono::Duration,
    sent: Vec<Message>,
    pending: HashMap<DestType, Vec<Message>>,
    service_sent: HashMap<String, DateTime<Utc>>,
    user_sent: HashMap<String, DateTime<Utc>>,
    dest_sent: HashMap<Dest, DateTime<Utc>>,
    per_destination: Throttle,
    global: Throttle,
    rng: StdRng,
}

impl Queue {
    pub fn new(msgs: Vec<Message>, now: DateTime<Utc>) -> Self {
        Self::with_options(msgs, now, QueueOptions::default())
    }

    pub fn with_options(msgs: Vec<Message>, now: DateTime<Utc>, opts: QueueOptions) -> Self {
        let rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let cooldown =
            chrono::Duration::from_std(opts.cooldown).unwrap_or_else(|_| chrono::Duration::zero());

        let mut state = QueueState {
            now,
            cooldown,
            sent: Vec::with_capacity(msgs.len()),
            pending: HashMap::new(),
            service_sent: HashMap::new(),
            user_sent: HashMap::new(),
            dest_sent: HashMap::new(),
            per_destination: Throttle::new(opts.per_destination, now, false),
            global: Throttle::new(opts.global, now, true),
            rng,
        };

        for msg in msgs {
            if msg.is_pending() {
                state
                    .pending
                    .entry(msg.dest.dest_type)
                    .or_default()
                    .push(msg);
            } else {
                state.add_sent(msg);
            }
        }

        Self {
            inner: Mutex::new(state),
        }
    }

    /// Pop the highest priority eligible message of `dest_type` and record it as sent.
    pub fn next_by_type(&self, dest_type: DestType) -> Option<Message> {
        let mut state = self.inner.lock();
        state.filter_pending(dest_type);
        state.sort_pending(dest_type);

        let pending = state.pending.get_mut(&dest_type)?;
        if pending.is_empty() {
            return None;
        }
        let next = pending.remove(0);
        state.add_sent(next.clone());
        Some(next)
    }

    /// Messages of `dest_type` sent within `window` of the snapshot time,
    /// including those handed out by this queue.
    pub fn sent_by_type(&self, dest_type: DestType, window: Duration) -> usize {
        let state = self.inner.lock();
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| state.now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        state
            .sent
            .iter()
            .filter(|m| m.dest.dest_type == dest_type)
            .filter(|m| m.sent_at.is_some_and(|at| at > cutoff))
            .count()
    }

    /// Destination types that still have pending messages, in a stable order.
    pub fn types(&self) -> Vec<DestType> {
        let state = self.inner.lock();
        let mut types: Vec<DestType> = state
            .pending
            .iter()
            .filter(|(_, msgs)| !msgs.is_empty())
            .map(|(t, _)| *t)
            .collect();
        types.sort();
        types
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.values().map(Vec::len).sum()
    }
}

impl QueueState {
    fn add_sent(&mut self, mut msg: Message) {
        let sent_at = *msg.sent_at.get_or_insert(self.now);

        // An empty ID is "no user/service", not a shared one.
        if !msg.service_id.is_empty() {
            record_latest(&mut self.service_sent, &msg.service_id, sent_at);
        }
        if !msg.user_id.is_empty() {
            record_latest(&mut self.user_sent, &msg.user_id, sent_at);
        }
        let dest = msg.dest.redacted(false);
        let latest = self.dest_sent.entry(dest).or_insert(sent_at);
        if sent_at > *latest {
            *latest = sent_at;
        }

        self.per_destination.record(&msg);
        self.global.record(&msg);
        self.sent.push(msg);
    }

    /// Drop pending messages whose destination is cooling down or throttled.
    fn filter_pending(&mut self, dest_type: DestType) {
        let Some(mut pending) = self.pending.remove(&dest_type) else {
            return;
        };

        let cutoff = self.now - self.cooldown;
        pending.retain(|msg| {
            let recently_sent = self
                .dest_sent
                .get(&msg.dest.redacted(false))
                .is_some_and(|at| *at > cutoff);
            !recently_sent
                && !self.per_destination.in_cooldown(msg)
                && !self.global.in_cooldown(msg)
        });

        self.pending.insert(dest_type, pending);
    }

    fn sort_pending(&mut self, dest_type: DestType) {
        let Some(mut pending) = self.pending.remove(&dest_type) else {
            return;
        };

        pending.shuffle(&mut self.rng);
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending.sort_by(|a, b| {
            a.message_type
                .priority()
                .cmp(&b.message_type.priority())
                .then_with(|| {
                    last_sent(&self.user_sent, &a.user_id)
                        .cmp(&last_sent(&self.user_sent, &b.user_id))
                })
                .then_with(|| {
                    last_sent(&self.service_sent, &a.service_id)
                        .cmp(&last_sent(&self.service_sent, &b.service_id))
                })
        });

        self.pending.insert(dest_type, pending);
    }
}

fn record_latest(map: &mut HashMap<String, DateTime<Utc>>, key: &str, at: DateTime<Utc>) {
    match map.get_mut(key) {
        Some(latest) if *latest >= at => {}
        Some(latest) => *latest = at,
        None => {
            map.insert(key.to_string(), at);
        }
    }
}

/// `None` (never notified) orders before any timestamp.
fn last_sent(map: &HashMap<String, DateTime<Utc>>, key: &str) -> Option<DateTime<Utc>> {
    if key.is_empty() {
        return None;
    }
    map.get(key).copied()
}
