use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::throttle_config::ThrottleConfig;
use super::types::{Dest, Message};

/// Sliding send counter for one queue snapshot.
///
/// Built fresh per cycle: every already-sent message is [`record`](Self::record)ed,
/// after which [`in_cooldown`](Self::in_cooldown) answers whether a pending
/// message's destination has used up any of its rules.
#[derive(Debug)]
pub struct Throttle {
    cfg: Arc<dyn ThrottleConfig>,
    now: DateTime<Utc>,
    ignore_id: bool,
    counts: HashMap<(Dest, Duration), usize>,
    cooldown: HashSet<Dest>,
}

impl Throttle {
    /// With `ignore_id` set, every destination of a type shares one counter.
    pub fn new(cfg: Arc<dyn ThrottleConfig>, now: DateTime<Utc>, ignore_id: bool) -> Self {
        Self {
            cfg,
            now,
            ignore_id,
            counts: HashMap::new(),
            cooldown: HashSet::new(),
        }
    }

    /// Count a sent message against every rule that applies to it.
    ///
    /// A message without `sent_at` is being sent right now and counts as sent at `now`.
    pub fn record(&mut self, msg: &Message) {
        let key = msg.dest.redacted(self.ignore_id);
        let sent_at = msg.sent_at.unwrap_or(self.now);
        let elapsed = self.now.signed_duration_since(sent_at);

        for rule in self.cfg.rules(msg) {
            let within = match chrono::Duration::from_std(rule.per) {
                Ok(per) => elapsed < per,
                Err(_) => true,
            };
            if !within {
                continue;
            }

            let count = self.counts.entry((key.clone(), rule.per)).or_default();
            *count += 1;
            if *count >= rule.count {
                self.cooldown.insert(key.clone());
            }
        }
    }

    pub fn in_cooldown(&self, msg: &Message) -> bool {
        self.cooldown.contains(&msg.dest.redacted(self.ignore_id))
    }
}
