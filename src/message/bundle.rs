//! Folding of several pending messages to one destination into a single
//! bundle message.

use std::collections::{BTreeSet, HashMap};

use super::types::{Dest, Message, MessageType};

/// Replace each group of more than one pending alert notification sharing a
/// (destination, service) with a single alert bundle.
///
/// The bundle gets a fresh ID from `new_id`, the earliest creation time of
/// its members, and no alert ID. `on_bundle(bundle, member_ids)` is called
/// for every bundle created; the members are dropped from the result.
pub fn bundle_alert_messages<N, F>(msgs: Vec<Message>, mut new_id: N, mut on_bundle: F) -> Vec<Message>
where
    N: FnMut() -> String,
    F: FnMut(&Message, &[String]),
{
    let (mut out, groups) = partition(msgs, |msg| {
        (msg.is_pending() && msg.message_type.is_alert())
            .then(|| (msg.dest.redacted(false), msg.service_id.clone()))
    });

    for members in groups {
        if members.len() == 1 {
            out.extend(members);
            continue;
        }

        let first = &members[0];
        let mut bundle = Message::new(
            new_id(),
            MessageType::AlertNotificationBundle,
            first.dest.clone(),
            earliest(&members),
        );
        bundle.service_id = first.service_id.clone();
        bundle.user_id = first.user_id.clone();

        let ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
        on_bundle(&bundle, &ids);
        out.push(bundle);
    }

    out
}

/// Replace each group of more than one pending status update to the same
/// destination with a single status bundle.
///
/// The bundle takes its alert and log IDs from the member with the latest
/// alert log entry and references every distinct alert its members cover.
pub fn bundle_status_messages<N, F>(msgs: Vec<Message>, mut new_id: N, mut on_bundle: F) -> Vec<Message>
where
    N: FnMut() -> String,
    F: FnMut(&Message, &[String]),
{
    let (mut out, groups) = partition(msgs, |msg| {
        (msg.is_pending() && msg.message_type.is_status_update())
            .then(|| (msg.dest.redacted(false), String::new()))
    });

    for mut members in groups {
        if members.len() == 1 {
            out.extend(members);
            continue;
        }
        members.sort_by(|a, b| b.alert_log_id.cmp(&a.alert_log_id));

        let latest = &members[0];
        let mut bundle = Message::new(
            new_id(),
            MessageType::AlertStatusUpdateBundle,
            latest.dest.clone(),
            earliest(&members),
        );
        bundle.alert_id = latest.alert_id;
        bundle.alert_log_id = latest.alert_log_id;
        bundle.user_id = latest.user_id.clone();

        let alert_ids: BTreeSet<i64> = members
            .iter()
            .flat_map(|m| {
                if m.message_type == MessageType::AlertStatusUpdateBundle {
                    m.status_alert_ids.clone()
                } else {
                    vec![m.alert_id]
                }
            })
            .collect();
        bundle.status_count = alert_ids.len();
        bundle.status_alert_ids = alert_ids.into_iter().collect();

        let ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
        on_bundle(&bundle, &ids);
        out.push(bundle);
    }

    out
}

/// Split `msgs` into untouched messages and groups keyed by `key`, groups in
/// order of first appearance.
fn partition<K>(msgs: Vec<Message>, key: K) -> (Vec<Message>, Vec<Vec<Message>>)
where
    K: Fn(&Message) -> Option<(Dest, String)>,
{
    let mut rest = Vec::new();
    let mut index: HashMap<(Dest, String), usize> = HashMap::new();
    let mut groups: Vec<Vec<Message>> = Vec::new();

    for msg in msgs {
        match key(&msg) {
            None => rest.push(msg),
            Some(k) => {
                let slot = *index.entry(k).or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
                groups[slot].push(msg);
            }
        }
    }

    (rest, groups)
}

fn earliest(members: &[Message]) -> chrono::DateTime<chrono::Utc> {
    members
        .iter()
        .map(|m| m.created_at)
        .min()
        .unwrap_or_else(chrono::Utc::now)
}
