//! Layered throttle rule sets.
//!
//! Rules added at the root apply to every message. Scoped builders restrict
//! additional rules to message types and/or destination types; a message
//! gets the union of every rule set whose filters match it.

use std::fmt::Debug;
use std::time::Duration;

use super::types::{DestType, Message, MessageType};

/// At most `count` messages to one destination within any trailing `per` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThrottleRule {
    pub count: usize,
    pub per: Duration,
    /// The limit should be spread evenly over the window. Documentation hint only.
    pub smooth: bool,
}

impl ThrottleRule {
    pub const fn new(count: usize, per: Duration) -> Self {
        Self {
            count,
            per,
            smooth: false,
        }
    }

    pub const fn smooth(count: usize, per: Duration) -> Self {
        Self {
            count,
            per,
            smooth: true,
        }
    }
}

/// Source of throttle rules for a message.
pub trait ThrottleConfig: Debug + Send + Sync {
    fn rules(&self, msg: &Message) -> Vec<ThrottleRule>;

    /// Longest window of any rule; sent history older than this is irrelevant.
    fn max_duration(&self) -> Duration;
}

#[derive(Debug, Clone, PartialEq)]
struct RuleSet {
    /// `None` matches any message type.
    msg_types: Option<Vec<MessageType>>,
    /// `None` matches any destination type.
    dest_types: Option<Vec<DestType>>,
    rules: Vec<ThrottleRule>,
}

impl RuleSet {
    fn matches(&self, msg: &Message) -> bool {
        let msg_ok = self
            .msg_types
            .as_ref()
            .map_or(true, |types| types.contains(&msg.message_type));
        let dest_ok = self
            .dest_types
            .as_ref()
            .map_or(true, |types| types.contains(&msg.dest.dest_type));
        msg_ok && dest_ok
    }
}

/// Built, immutable rule sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThrottleRules {
    sets: Vec<RuleSet>,
}

impl ThrottleRules {
    /// No rules at all; nothing is ever throttled.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Limits applied to each individual destination.
    pub fn per_destination_defaults() -> Self {
        let mut b = ThrottleConfigBuilder::new();
        b.add_rules([ThrottleRule::new(1, Duration::from_secs(60))]);
        b.with_dest_types(&[DestType::Voice, DestType::Sms]).add_rules([
            ThrottleRule::new(3, Duration::from_secs(15 * 60)),
            ThrottleRule::smooth(7, Duration::from_secs(60 * 60)),
            ThrottleRule::smooth(15, Duration::from_secs(3 * 60 * 60)),
        ]);
        b.build()
    }

    /// Limits applied to a destination type as a whole.
    pub fn global_defaults() -> Self {
        let mut b = ThrottleConfigBuilder::new();
        b.with_dest_types(&[DestType::Voice, DestType::Sms])
            .add_rules([ThrottleRule::new(5, Duration::from_secs(5))]);
        b.build()
    }
}

impl ThrottleConfig for ThrottleRules {
    fn rules(&self, msg: &Message) -> Vec<ThrottleRule> {
        self.sets
            .iter()
            .filter(|set| set.matches(msg))
            .flat_map(|set| set.rules.iter().copied())
            .collect()
    }

    fn max_duration(&self) -> Duration {
        self.sets
            .iter()
            .flat_map(|set| set.rules.iter().map(|r| r.per))
            .max()
            .unwrap_or_default()
    }
}

/// Builder for [`ThrottleRules`].
#[derive(Debug, Clone, Default)]
pub struct ThrottleConfigBuilder {
    sets: Vec<RuleSet>,
}

impl ThrottleConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules applying to every message.
    pub fn add_rules(&mut self, rules: impl IntoIterator<Item = ThrottleRule>) -> &mut Self {
        self.push(None, None, rules);
        self
    }

    pub fn with_dest_types(&mut self, types: &[DestType]) -> ScopedThrottleBuilder<'_> {
        ScopedThrottleBuilder {
            root: self,
            msg_types: None,
            dest_types: Some(types.to_vec()),
        }
    }

    pub fn with_msg_types(&mut self, types: &[MessageType]) -> ScopedThrottleBuilder<'_> {
        ScopedThrottleBuilder {
            root: self,
            msg_types: Some(types.to_vec()),
            dest_types: None,
        }
    }

    pub fn build(&self) -> ThrottleRules {
        ThrottleRules {
            sets: self.sets.clone(),
        }
    }

    fn push(
        &mut self,
        msg_types: Option<Vec<MessageType>>,
        dest_types: Option<Vec<DestType>>,
        rules: impl IntoIterator<Item = ThrottleRule>,
    ) {
        let rules: Vec<ThrottleRule> = rules.into_iter().collect();
        if rules.is_empty() {
            return;
        }
        self.sets.push(RuleSet {
            msg_types,
            dest_types,
            rules,
        });
    }
}

/// Builder scoped to a subset of message and destination types.
///
/// Narrowing an already-scoped dimension intersects the type lists.
#[derive(Debug)]
pub struct ScopedThrottleBuilder<'a> {
    root: &'a mut ThrottleConfigBuilder,
    msg_types: Option<Vec<MessageType>>,
    dest_types: Option<Vec<DestType>>,
}

impl<'a> ScopedThrottleBuilder<'a> {
    pub fn with_dest_types(mut self, types: &[DestType]) -> Self {
        self.dest_types = Some(narrow(self.dest_types.take(), types));
        self
    }

    pub fn with_msg_types(mut self, types: &[MessageType]) -> Self {
        self.msg_types = Some(narrow(self.msg_types.take(), types));
        self
    }

    pub fn add_rules(&mut self, rules: impl IntoIterator<Item = ThrottleRule>) -> &mut Self {
        self.root
            .push(self.msg_types.clone(), self.dest_types.clone(), rules);
        self
    }
}

fn narrow<T: PartialEq + Copy>(current: Option<Vec<T>>, types: &[T]) -> Vec<T> {
    match current {
        None => types.to_vec(),
        Some(existing) => existing
            .into_iter()
            .filter(|t| types.contains(t))
            .collect(),
    }
}
