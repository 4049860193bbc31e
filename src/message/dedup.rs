//! Collapsing of redundant pending messages.
//!
//! Every pass is idempotent: running it again on its own output reports nothing.
//! Sent messages are history and are never reported for merge or deletion.

use std::collections::HashMap;

use super::types::{Dest, Message, MessageType};

/// A reduced batch plus the IDs that should be removed from the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deduped {
    pub messages: Vec<Message>,
    pub stale_ids: Vec<String>,
}

/// Merge duplicate alert notifications to the same destination for the same alert.
///
/// Within each (destination, alert) group the parent is the earliest sent
/// message if there is one, otherwise the earliest created pending message.
/// `on_duplicates(parent_id, duplicate_ids)` is called once per group with
/// anything to merge, and the duplicates are dropped from the returned batch.
pub fn dedup_alerts<F>(msgs: Vec<Message>, mut on_duplicates: F) -> Vec<Message>
where
    F: FnMut(&str, &[String]),
{
    let mut groups: HashMap<(Dest, i64), Vec<usize>> = HashMap::new();
    for (idx, msg) in msgs.iter().enumerate() {
        if msg.message_type != MessageType::AlertNotification {
            continue;
        }
        groups
            .entry((msg.dest.redacted(false), msg.alert_id))
            .or_default()
            .push(idx);
    }

    let mut drop = vec![false; msgs.len()];
    let mut merges: Vec<(usize, Vec<usize>)> = Vec::new();
    for mut members in groups.into_values() {
        if members.len() < 2 {
            continue;
        }
        members.sort_by_key(|&idx| (msgs[idx].is_pending(), msgs[idx].created_at));
        let parent = members[0];
        let duplicates: Vec<usize> = members[1..]
            .iter()
            .copied()
            .filter(|&idx| msgs[idx].is_pending())
            .collect();
        if duplicates.is_empty() {
            continue;
        }
        for &idx in &duplicates {
            drop[idx] = true;
        }
        merges.push((parent, duplicates));
    }

    // report in input order so callers see a stable sequence
    merges.sort_by_key(|(parent, _)| *parent);
    for (parent, duplicates) in merges {
        let ids: Vec<String> = duplicates.iter().map(|&idx| msgs[idx].id.clone()).collect();
        on_duplicates(&msgs[parent].id, &ids);
    }

    msgs.into_iter()
        .zip(drop)
        .filter_map(|(msg, dropped)| (!dropped).then_some(msg))
        .collect()
}

/// Keep only the newest pending status update per (alert, destination).
pub fn dedup_status_messages(msgs: Vec<Message>) -> Deduped {
    keep_newest_pending(msgs, |msg| {
        (msg.message_type == MessageType::AlertStatusUpdate)
            .then(|| GroupKey::Alert(msg.alert_id, msg.dest.redacted(false)))
    })
}

/// Keep only the newest pending on-call notification per (schedule, destination).
pub fn dedup_on_call_notifications(msgs: Vec<Message>) -> Deduped {
    keep_newest_pending(msgs, |msg| {
        (msg.message_type == MessageType::ScheduleOnCallNotification)
            .then(|| GroupKey::Schedule(msg.schedule_id.clone(), msg.dest.redacted(false)))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Alert(i64, Dest),
    Schedule(String, Dest),
}

fn keep_newest_pending<K>(msgs: Vec<Message>, key: K) -> Deduped
where
    K: Fn(&Message) -> Option<GroupKey>,
{
    let mut newest: HashMap<GroupKey, usize> = HashMap::new();
    let mut stale = vec![false; msgs.len()];

    for (idx, msg) in msgs.iter().enumerate() {
        if msg.is_sent() {
            continue;
        }
        let Some(group) = key(msg) else {
            continue;
        };
        match newest.get(&group).copied() {
            None => {
                newest.insert(group, idx);
            }
            Some(current) if is_newer(msg, &msgs[current]) => {
                stale[current] = true;
                newest.insert(group, idx);
            }
            Some(_) => stale[idx] = true,
        }
    }

    let mut out = Deduped::default();
    for (msg, is_stale) in msgs.into_iter().zip(stale) {
        if is_stale {
            out.stale_ids.push(msg.id);
        } else {
            out.messages.push(msg);
        }
    }
    out
}

/// Creation time decides; the alert log entry breaks ties.
fn is_newer(a: &Message, b: &Message) -> bool {
    (a.created_at, a.alert_log_id) > (b.created_at, b.alert_log_id)
}
