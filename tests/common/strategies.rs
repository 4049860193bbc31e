#![allow(dead_code)]

use proptest::prelude::*;

use paging_core::message::{DestType, Message, MessageType};

use super::builders::MessageBuilder;

/// Any message type the queue may see pending.
pub fn message_type_strategy() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::AlertNotification),
        Just(MessageType::AlertNotificationBundle),
        Just(MessageType::VerificationMessage),
        Just(MessageType::TestNotification),
        Just(MessageType::AlertStatusUpdate),
        Just(MessageType::AlertStatusUpdateBundle),
        Just(MessageType::ScheduleOnCallNotification),
    ]
}

/// Pending email messages with distinct creation times and destinations,
/// and no user or service, so only type priority and age decide order.
pub fn distinct_pending_strategy() -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(message_type_strategy(), 1..40)
        .prop_flat_map(|types| {
            let n = types.len();
            (Just(types), Just((0..n as i64).collect::<Vec<_>>()).prop_shuffle())
        })
        .prop_map(|(types, offsets)| {
            types
                .into_iter()
                .zip(offsets)
                .enumerate()
                .map(|(idx, (message_type, offset))| {
                    MessageBuilder::new(&format!("msg-{idx}"), message_type)
                        .dest(DestType::Email, &format!("dest-{idx}"))
                        .created_secs(offset * 7)
                        .build()
                })
                .collect()
        })
}

/// Alert notifications drawn from a small pool of destinations and alerts so
/// duplicates are common. Some are already sent.
pub fn alert_batch_strategy() -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec((0..3usize, 1..4i64, 0..600i64, prop::bool::weighted(0.2)), 0..30).prop_map(
        |specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(idx, (dest, alert_id, created, sent))| {
                    let b = MessageBuilder::alert(&format!("alert-{idx}"), alert_id)
                        .dest(DestType::Sms, &format!("dest-{dest}"))
                        .created_secs(created);
                    if sent {
                        let at = super::builders::base_time() + chrono::Duration::seconds(created + 1);
                        b.sent_at(at).build()
                    } else {
                        b.build()
                    }
                })
                .collect()
        },
    )
}
