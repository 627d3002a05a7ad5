use super::*;
use chrono::TimeZone;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

#[derive(Default)]
struct RecordingSink {
    requests: Mutex<Vec<ClientRequest>>,
    offline: AtomicBool,
}

impl RecordingSink {
    fn take(&self) -> Vec<ClientRequest> {
        std::mem::take(&mut *self.requests.lock().expect("sink lock"))
    }

    fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    fn go_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }
}

impl CommandSink for RecordingSink {
    fn submit(&self, request: ClientRequest) -> Result<(), ChannelError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChannelError::Disconnected);
        }
        self.requests.lock().expect("sink lock").push(request);
        Ok(())
    }
}

fn local() -> LocalIdentity {
    LocalIdentity {
        user_id: UserId::new("me"),
        email: "me@example.com".to_string(),
        username: "me".to_string(),
    }
}

fn contact(user_id: &str) -> Contact {
    Contact {
        user_id: UserId::new(user_id),
        email: format!("{user_id}@example.com"),
        username: user_id.to_string(),
        online: true,
        unread_count: 0,
        latest_timestamp: None,
    }
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0)
        .single()
        .expect("valid time")
}

fn incoming(id: &str, minute: u32) -> MessagePayload {
    MessagePayload {
        id: MessageId::new(id),
        content: format!("body of {id}"),
        from_self: false,
        timestamp: at(minute),
        read_time: None,
    }
}

fn outgoing(id: &str, minute: u32) -> MessagePayload {
    MessagePayload {
        from_self: true,
        ..incoming(id, minute)
    }
}

fn setup() -> (ConversationSync, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let sync = ConversationSync::new(local(), SyncSettings::default(), sink.clone());
    (sync, sink)
}

fn history_request(request: &ClientRequest) -> (RequestId, UserId, u32, u32) {
    match request {
        ClientRequest::MessagesHistorical {
            request_id,
            peer_id,
            page,
            page_size,
        } => (*request_id, peer_id.clone(), *page, *page_size),
        other => panic!("expected history request, got {other:?}"),
    }
}

fn ids(sync: &ConversationSync) -> Vec<String> {
    sync.messages()
        .iter()
        .map(|m| m.id.as_ref().map_or("-".to_string(), |id| id.to_string()))
        .collect()
}

/// Selects `peer` and answers page 1 with `page`, returning the sink's
/// leftover requests (read receipts) after the response.
fn open_with_page(
    sync: &mut ConversationSync,
    sink: &RecordingSink,
    peer: &str,
    page: Vec<MessagePayload>,
    next_page: Option<u32>,
) -> Vec<ClientRequest> {
    sync.select_peer(contact(peer));
    let requests = sink.take();
    assert_eq!(requests.len(), 1);
    let (request_id, _, _, _) = history_request(&requests[0]);
    sync.apply_history(request_id, page, next_page)
        .expect("first page");
    sink.take()
}

#[test]
fn selecting_a_peer_requests_the_first_page() {
    let (mut sync, sink) = setup();
    assert_eq!(sync.phase(), SyncPhase::Idle);

    sync.select_peer(contact("bob"));

    assert_eq!(sync.phase(), SyncPhase::Loading);
    let requests = sink.take();
    let (_, peer_id, page, page_size) = history_request(&requests[0]);
    assert_eq!(peer_id, UserId::new("bob"));
    assert_eq!(page, 1);
    assert_eq!(page_size, DEFAULT_PAGE_SIZE);
    assert_eq!(sync.pending_requests(), 1);
}

#[test]
fn first_page_makes_timeline_ready_and_batches_read_receipts() {
    let (mut sync, sink) = setup();
    let mut already_read = incoming("m2", 2);
    already_read.read_time = Some(at(3));

    let leftover = open_with_page(
        &mut sync,
        &sink,
        "bob",
        vec![incoming("m1", 1), already_read, outgoing("m3", 4), incoming("m4", 5)],
        Some(2),
    );

    assert_eq!(sync.phase(), SyncPhase::Ready);
    assert_eq!(sync.next_page(), Some(2));
    assert_eq!(ids(&sync), vec!["m1", "m2", "m3", "m4"]);
    assert_eq!(
        leftover,
        vec![ClientRequest::MessagesRead {
            message_ids: vec![MessageId::new("m1"), MessageId::new("m4")]
        }]
    );
    assert!(sync.drain_effects().contains(&SyncEffect::Timeline(
        TimelineChange::Prepended {
            count: 4,
            first_page: true
        }
    )));
}

#[test]
fn optimistic_send_is_confirmed_in_place() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", vec![incoming("m0", 0)], None);

    let key = sync.send("hi").expect("sent");
    assert_eq!(sync.messages().len(), 2);
    let optimistic = sync.messages().last().expect("optimistic entry");
    assert!(optimistic.from_self);
    assert!(optimistic.id.is_none());
    assert_eq!(optimistic.delivery(), Delivery::Pending);
    assert_eq!(
        sink.take(),
        vec![ClientRequest::PrivateMessage {
            client_key: key.clone(),
            receiver_id: UserId::new("bob"),
            content: "hi".to_string(),
        }]
    );

    sync.confirm_send(key, MessageId::new("m1"), at(7))
        .expect("confirm");

    assert_eq!(sync.messages().len(), 2);
    let confirmed: Vec<&Message> = sync
        .messages()
        .iter()
        .filter(|m| m.id == Some(MessageId::new("m1")))
        .collect();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].timestamp, Some(at(7)));
    assert_eq!(confirmed[0].delivery(), Delivery::Sent { at: at(7) });
    assert_eq!(sync.pending_requests(), 0);
}

#[test]
fn send_is_a_no_op_without_peer_or_content() {
    let (mut sync, sink) = setup();
    assert!(sync.send("hello").is_none());

    open_with_page(&mut sync, &sink, "bob", Vec::new(), None);
    assert!(sync.send("").is_none());
    assert!(sync.messages().is_empty());
    assert!(sink.take().is_empty());
}

#[test]
fn send_without_connection_stays_unconfirmed() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", Vec::new(), None);
    sink.go_offline();

    let key = sync.send("lost").expect("optimistic entry still created");

    assert_eq!(sync.messages()[0].delivery(), Delivery::Pending);
    assert_eq!(sync.pending_requests(), 0);
    assert!(sync
        .drain_effects()
        .iter()
        .any(|effect| matches!(effect, SyncEffect::RequestFailed { kind: "private_message", .. })));
    assert!(sync
        .confirm_send(key, MessageId::new("late"), at(1))
        .expect_err("no pending entry")
        .is_stale());
}

#[test]
fn older_pages_are_prepended_in_chronological_order() {
    let (mut sync, sink) = setup();
    open_with_page(
        &mut sync,
        &sink,
        "bob",
        vec![outgoing("m3", 3), outgoing("m4", 4)],
        Some(2),
    );
    sync.drain_effects();

    assert!(sync.load_older());
    assert_eq!(sync.phase(), SyncPhase::LoadingOlder);
    let requests = sink.take();
    let (request_id, _, page, _) = history_request(&requests[0]);
    assert_eq!(page, 2);

    sync.apply_history(request_id, vec![incoming("m1", 1), incoming("m2", 2)], None)
        .expect("older page");

    assert_eq!(ids(&sync), vec!["m1", "m2", "m3", "m4"]);
    assert_eq!(sync.phase(), SyncPhase::Ready);
    assert_eq!(sync.next_page(), None);
    assert_eq!(
        sink.take(),
        vec![ClientRequest::MessagesRead {
            message_ids: vec![MessageId::new("m1"), MessageId::new("m2")]
        }]
    );
    assert_eq!(
        sync.drain_effects(),
        vec![SyncEffect::Timeline(TimelineChange::Prepended {
            count: 2,
            first_page: false
        })]
    );
    assert!(!sync.load_older(), "no cursor left");
}

#[test]
fn concurrent_older_page_requests_do_not_duplicate_messages() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", vec![outgoing("m3", 3)], Some(2));

    assert!(sync.load_older());
    assert!(!sync.load_older(), "second request suppressed while in flight");
    let requests = sink.take();
    assert_eq!(requests.len(), 1);
    let (request_id, _, _, _) = history_request(&requests[0]);

    sync.apply_history(request_id, vec![outgoing("m1", 1), outgoing("m2", 2)], Some(2))
        .expect("older page");
    assert!(sync
        .apply_history(request_id, vec![outgoing("m1", 1), outgoing("m2", 2)], Some(3))
        .expect_err("replayed response")
        .is_stale());

    assert_eq!(ids(&sync), vec!["m1", "m2", "m3"]);
    assert_eq!(sync.next_page(), None, "delivered page is not requested again");
}

#[test]
fn overlapping_pages_are_deduplicated_by_id() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", vec![outgoing("m2", 2), outgoing("m3", 3)], Some(2));

    assert!(sync.load_older());
    let requests = sink.take();
    let (request_id, _, _, _) = history_request(&requests[0]);
    sync.apply_history(request_id, vec![outgoing("m1", 1), outgoing("m2", 2)], None)
        .expect("older page");

    assert_eq!(ids(&sync), vec!["m1", "m2", "m3"]);
}

#[test]
fn switching_conversations_clears_the_timeline_and_drops_late_pages() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "alice", vec![incoming("a1", 1)], None);

    sync.select_peer(contact("bob"));
    let bob_request = sink.take();
    let (bob_request_id, _, _, _) = history_request(&bob_request[0]);
    assert!(sync.messages().is_empty());

    sync.select_peer(contact("alice"));
    assert!(sync.messages().is_empty());
    let alice_request = sink.take();
    let (alice_request_id, _, _, _) = history_request(&alice_request[0]);

    let late = sync
        .apply_history(bob_request_id, vec![incoming("b1", 1)], None)
        .expect_err("bob's page is stale");
    assert!(late.is_stale());
    assert!(sync.messages().is_empty());
    assert_eq!(sync.phase(), SyncPhase::Loading);

    sync.apply_history(alice_request_id, vec![incoming("a1", 1)], None)
        .expect("alice page");
    assert_eq!(ids(&sync), vec!["a1"]);
}

#[test]
fn switching_cancels_pending_send_confirmations() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "alice", Vec::new(), None);
    let key = sync.send("to alice").expect("sent");

    sync.select_peer(contact("bob"));

    assert_eq!(sync.pending_requests(), 1, "only bob's history request");
    assert!(sync
        .confirm_send(key, MessageId::new("m9"), at(9))
        .expect_err("cancelled")
        .is_stale());
    assert!(sync.messages().is_empty());
}

#[test]
fn deselect_returns_to_idle() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "alice", vec![incoming("a1", 1)], Some(2));

    sync.deselect();

    assert_eq!(sync.phase(), SyncPhase::Idle);
    assert!(sync.active_peer().is_none());
    assert!(sync.messages().is_empty());
    assert!(!sync.load_older());
}

#[test]
fn messages_from_the_active_peer_are_appended_and_marked_read() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", vec![outgoing("m1", 1)], None);

    sync.receive(InboundMessage {
        id: MessageId::new("m2"),
        from: UserId::new("bob"),
        content: "hey".to_string(),
        timestamp: at(2),
        read_time: None,
    });

    assert_eq!(ids(&sync), vec!["m1", "m2"]);
    assert!(!sync.messages()[1].from_self);
    assert_eq!(
        sink.take(),
        vec![ClientRequest::MessagesRead {
            message_ids: vec![MessageId::new("m2")]
        }]
    );
    assert!(sync.notification().is_none());
}

#[test]
fn out_of_focus_message_raises_truncated_notification() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", vec![incoming("b1", 1)], None);
    sync.drain_effects();
    let before = sync.messages().to_vec();
    let long_content = "x".repeat(150);

    sync.receive(InboundMessage {
        id: MessageId::new("c1"),
        from: UserId::new("carol"),
        content: long_content,
        timestamp: at(2),
        read_time: None,
    });

    assert_eq!(sync.messages(), before.as_slice());
    assert!(sink.take().is_empty(), "no read receipt for carol's message");
    let notification = sync.notification().expect("notification").clone();
    assert_eq!(notification.from, UserId::new("carol"));
    assert!(notification.preview.ends_with("..."));
    assert_eq!(notification.preview.chars().count(), 103);
    assert_eq!(
        sync.drain_effects(),
        vec![
            SyncEffect::Notification(notification),
            SyncEffect::AudibleAlert
        ]
    );

    assert!(sync.dismiss_notification());
    assert!(sync.notification().is_none());
    assert!(!sync.dismiss_notification());
}

#[test]
fn message_without_active_conversation_notifies() {
    let (mut sync, _sink) = setup();

    sync.receive(InboundMessage {
        id: MessageId::new("c1"),
        from: UserId::new("carol"),
        content: "short".to_string(),
        timestamp: at(2),
        read_time: None,
    });

    assert_eq!(
        sync.notification(),
        Some(&Notification {
            from: UserId::new("carol"),
            preview: "short".to_string()
        })
    );
}

#[test]
fn read_receipt_marks_only_listed_messages() {
    let (mut sync, sink) = setup();
    open_with_page(
        &mut sync,
        &sink,
        "bob",
        vec![outgoing("m1", 1), outgoing("m2", 2)],
        None,
    );

    let updated = sync.apply_read_receipt(
        &[MessageId::new("m1"), MessageId::new("unknown")],
        at(5),
        &UserId::new("bob"),
    );

    assert_eq!(updated, 1);
    assert_eq!(sync.messages()[0].read_time, Some(at(5)));
    assert_eq!(sync.messages()[1].read_time, None);
    assert_eq!(sync.messages()[0].delivery(), Delivery::Read { at: at(5) });
}

#[test]
fn read_receipts_from_unrelated_users_are_ignored() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", vec![incoming("m1", 1)], None);

    assert_eq!(
        sync.apply_read_receipt(&[MessageId::new("m1")], at(5), &UserId::new("carol")),
        0
    );
    assert_eq!(sync.messages()[0].read_time, None);

    assert_eq!(
        sync.apply_read_receipt(&[MessageId::new("m1")], at(6), &UserId::new("me")),
        1,
        "own read from another session counts"
    );
    assert_eq!(sync.messages()[0].read_time, Some(at(6)));
}

#[test]
fn read_time_never_precedes_send_time() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", vec![outgoing("m1", 10)], None);

    sync.apply_read_receipt(&[MessageId::new("m1")], at(4), &UserId::new("bob"));

    assert_eq!(sync.messages()[0].read_time, Some(at(10)));
}

#[test]
fn read_receipts_are_not_requested_twice() {
    let (mut sync, sink) = setup();
    let leftover = open_with_page(&mut sync, &sink, "bob", vec![incoming("m2", 2)], Some(2));
    assert_eq!(leftover.len(), 1);

    sync.receive(InboundMessage {
        id: MessageId::new("m2"),
        from: UserId::new("bob"),
        content: "replayed".to_string(),
        timestamp: at(2),
        read_time: None,
    });
    assert!(sink.take().is_empty());

    assert!(sync.load_older());
    let requests = sink.take();
    let (request_id, _, _, _) = history_request(&requests[0]);
    sync.apply_history(request_id, vec![incoming("m1", 1), incoming("m2", 2)], None)
        .expect("older page");
    assert_eq!(
        sink.take(),
        vec![ClientRequest::MessagesRead {
            message_ids: vec![MessageId::new("m1")]
        }]
    );
}

#[test]
fn resync_restarts_the_active_conversation() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", vec![incoming("m1", 1)], Some(2));

    sync.resync();

    assert_eq!(sync.phase(), SyncPhase::Loading);
    assert!(sync.messages().is_empty());
    let requests = sink.take();
    let (_, peer_id, page, _) = history_request(&requests[0]);
    assert_eq!(peer_id, UserId::new("bob"));
    assert_eq!(page, 1);
}

#[test]
fn preview_truncation_counts_characters() {
    assert_eq!(truncate_preview("hello", 5), "hello");
    assert_eq!(truncate_preview("hello!", 5), "hello...");
    assert_eq!(truncate_preview("héllö wörld", 4), "héll...");
}

fn from_bob(id: &str, minute: u32) -> InboundMessage {
    InboundMessage {
        id: MessageId::new(id),
        from: UserId::new("bob"),
        content: format!("body of {id}"),
        timestamp: at(minute),
        read_time: None,
    }
}

fn resync_with_page(
    sync: &mut ConversationSync,
    sink: &RecordingSink,
    page: Vec<MessagePayload>,
) {
    sync.resync();
    let requests = sink.take();
    let (request_id, _, _, _) = history_request(&requests[0]);
    sync.apply_history(request_id, page, None)
        .expect("first page after resync");
}

#[test]
fn unsent_message_survives_resync_as_pending() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", vec![incoming("m1", 1)], None);
    sink.go_offline();
    sync.send("lost while offline").expect("optimistic entry");
    sink.go_online();

    sync.resync();
    assert_eq!(sync.messages().len(), 1, "kept while the page loads");
    let requests = sink.take();
    let (request_id, _, _, _) = history_request(&requests[0]);
    sync.apply_history(request_id, vec![incoming("m1", 1)], None)
        .expect("first page");

    let timeline: Vec<(&str, Delivery)> = sync
        .messages()
        .iter()
        .map(|m| (m.content.as_str(), m.delivery()))
        .collect();
    assert_eq!(
        timeline,
        vec![
            ("body of m1", Delivery::Sent { at: at(1) }),
            ("lost while offline", Delivery::Pending),
        ]
    );
}

#[test]
fn late_ack_after_resync_merges_with_delivered_copy() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", Vec::new(), None);
    let key = sync.send("hello").expect("sent");
    sink.take();

    let mut delivered = outgoing("m5", 5);
    delivered.content = "hello".to_string();
    resync_with_page(&mut sync, &sink, vec![delivered]);
    assert_eq!(ids(&sync), vec!["m5", "-"]);

    sync.confirm_send(key, MessageId::new("m5"), at(5))
        .expect("ack still correlated");
    assert_eq!(ids(&sync), vec!["m5"]);
    assert_eq!(sync.pending_requests(), 0);
}

#[test]
fn late_ack_after_resync_confirms_in_place() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", vec![incoming("m1", 1)], None);
    let key = sync.send("still in flight").expect("sent");
    sink.take();

    resync_with_page(&mut sync, &sink, vec![incoming("m1", 1)]);
    sync.confirm_send(key, MessageId::new("m2"), at(2))
        .expect("ack still correlated");

    assert_eq!(ids(&sync), vec!["m1", "m2"]);
    assert_eq!(sync.messages()[1].delivery(), Delivery::Sent { at: at(2) });
}

#[test]
fn read_receipt_lost_offline_goes_out_with_next_batch() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", Vec::new(), None);
    sink.go_offline();
    sync.receive(from_bob("m1", 1));
    sink.go_online();

    sync.receive(from_bob("m2", 2));

    assert_eq!(
        sink.take(),
        vec![ClientRequest::MessagesRead {
            message_ids: vec![MessageId::new("m1"), MessageId::new("m2")]
        }]
    );
    sync.receive(from_bob("m3", 3));
    assert_eq!(
        sink.take(),
        vec![ClientRequest::MessagesRead {
            message_ids: vec![MessageId::new("m3")]
        }]
    );
}

#[test]
fn ack_for_message_already_delivered_by_history_drops_optimistic_copy() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", vec![incoming("m4", 4)], Some(2));
    let key = sync.send("hi").expect("sent");
    sink.take();

    assert!(sync.load_older());
    let requests = sink.take();
    let (request_id, _, _, _) = history_request(&requests[0]);
    sync.apply_history(request_id, vec![outgoing("m7", 7)], None)
        .expect("older page");
    assert_eq!(ids(&sync), vec!["m7", "m4", "-"]);
    sync.drain_effects();

    sync.confirm_send(key, MessageId::new("m7"), at(7))
        .expect("confirm");

    assert_eq!(ids(&sync), vec!["m7", "m4"]);
    assert_eq!(
        sync.drain_effects(),
        vec![SyncEffect::Timeline(TimelineChange::Updated { count: 1 })]
    );
}

#[test]
fn own_echo_is_neither_appended_nor_notified() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", Vec::new(), None);
    sync.drain_effects();

    sync.receive(InboundMessage {
        id: MessageId::new("m1"),
        from: UserId::new("me"),
        content: "echo".to_string(),
        timestamp: at(1),
        read_time: None,
    });

    assert!(sync.messages().is_empty());
    assert!(sync.notification().is_none());
    assert!(sync.drain_effects().is_empty());
    assert!(sink.take().is_empty());
}

#[test]
fn duplicated_correlation_key_is_rejected() {
    let (mut sync, sink) = setup();
    open_with_page(&mut sync, &sink, "bob", Vec::new(), None);
    let key = sync.send("twice").expect("sent");
    let copy = sync.messages()[0].clone();
    sync.active
        .as_mut()
        .expect("active conversation")
        .messages
        .push(copy);

    let err = sync
        .confirm_send(key.clone(), MessageId::new("m1"), at(1))
        .expect_err("ambiguous");

    assert!(matches!(
        err,
        SyncError::AmbiguousCorrelationKey { count: 2, key: ref found } if found == &key
    ));
    assert!(!err.is_stale());
    assert!(sync.messages().iter().all(|m| m.id.is_none()));
}
