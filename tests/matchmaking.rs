use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pairchat::config::Config;
use pairchat::db::{self, MessageRepository, ParticipantRepository};
use pairchat::realtime::{Hub, ServerEvent};
use pairchat::rooms::{
    ChatService, LeaveOutcome, PairingStatus, SessionId, SessionState, UserId,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn user(id: &str) -> UserId {
    UserId::parse(id).unwrap()
}

async fn service() -> (Arc<ChatService>, Hub) {
    let hub = Hub::new();
    let pool = db::memory().await.unwrap();
    let chat = Arc::new(ChatService::new(pool, hub.clone(), &Config::default()));
    (chat, hub)
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Occupant count per session, read back from the registry.
async fn occupancy(chat: &ChatService, users: &[UserId]) -> HashMap<SessionId, usize> {
    let mut sessions = HashMap::new();
    for u in users {
        let id = chat
            .registry()
            .session_of(u)
            .unwrap_or_else(|| panic!("{} was not placed", u));
        if !sessions.contains_key(&id) {
            let view = chat.registry().snapshot(id).await.unwrap();
            assert!(view.occupants.len() <= 2);
            if view.occupants.len() == 2 {
                assert_eq!(view.state, SessionState::Active);
            }
            sessions.insert(id, view.occupants.len());
        }
    }
    sessions
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_place_everyone_exactly_once() {
    let (chat, _hub) = service().await;
    let users: Vec<UserId> = (0..24).map(|i| user(&format!("visitor-{i}"))).collect();

    let handles: Vec<_> = users
        .iter()
        .cloned()
        .map(|u| {
            let chat = chat.clone();
            tokio::spawn(async move { chat.start(&u).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let sessions = occupancy(&chat, &users).await;
    assert_eq!(sessions.values().sum::<usize>(), users.len());
    assert!(sessions.values().filter(|&&n| n == 1).count() <= 1);

    // storage agrees: one participant row per user
    for u in &users {
        let row = ParticipantRepository::get_by_user(chat.registry().db(), u.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.session_id, chat.registry().session_of(u).unwrap().to_string());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_by_one_user_never_self_pair() {
    let (chat, _hub) = service().await;
    let me = user("solo");

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let chat = chat.clone();
            let me = me.clone();
            tokio::spawn(async move { chat.start(&me).await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert!(results.iter().all(|r| r == &results[0]));
    assert_eq!(results[0].status, PairingStatus::Searching);
    assert_eq!(results[0].partner_id, None);
    assert_eq!(chat.registry().live_sessions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn three_concurrent_starts_form_one_pair_and_one_waiting() {
    let (chat, _hub) = service().await;
    let users = vec![user("u1"), user("u2"), user("u3")];

    let handles: Vec<_> = users
        .iter()
        .cloned()
        .map(|u| {
            let chat = chat.clone();
            tokio::spawn(async move { chat.start(&u).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut sizes: Vec<usize> = occupancy(&chat, &users).await.into_values().collect();
    sizes.sort();
    assert_eq!(sizes, vec![1, 2]);
}

#[tokio::test]
async fn second_user_pairs_and_first_is_notified() {
    let (chat, hub) = service().await;
    let (_, mut u1_rx) = hub.connect(&user("u1"));

    let first = chat.start(&user("u1")).await.unwrap();
    assert_eq!(first.partner_id, None);
    assert_eq!(first.status, PairingStatus::Searching);

    let second = chat.start(&user("u2")).await.unwrap();
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(second.partner_id, Some(user("u1")));
    assert_eq!(second.status, PairingStatus::Chatting);

    let events = drain(&mut u1_rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::ParticipantJoined { session_id, user_id }
            if *session_id == first.session_id && *user_id == user("u2")
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::MessageCreated { message } if message.is_system
    )));
}

#[tokio::test]
async fn leaving_partner_requeues_and_third_user_claims() {
    let (chat, hub) = service().await;
    let x = chat.start(&user("u1")).await.unwrap().session_id;
    chat.start(&user("u2")).await.unwrap();
    let (_, mut u1_rx) = hub.connect(&user("u1"));

    assert_eq!(chat.leave(x, &user("u2")).await.unwrap(), LeaveOutcome::Requeued);

    let events = drain(&mut u1_rx);
    assert!(matches!(
        events.first(),
        Some(ServerEvent::ParticipantLeft { user_id, .. }) if *user_id == user("u2")
    ));

    let view = chat.session_view(x, &user("u1")).await.unwrap();
    assert_eq!(view.state, SessionState::Waiting);
    assert_eq!(view.occupants, vec![user("u1")]);

    let third = chat.start(&user("u3")).await.unwrap();
    assert_eq!(third.session_id, x);
    assert_eq!(third.partner_id, Some(user("u1")));
}

#[tokio::test]
async fn leave_outside_a_session_is_a_noop() {
    let (chat, _hub) = service().await;
    let x = chat.start(&user("u1")).await.unwrap().session_id;

    assert_eq!(chat.leave(x, &user("stranger")).await.unwrap(), LeaveOutcome::NotMember);
    assert_eq!(
        chat.leave(SessionId::now_v7(), &user("u1")).await.unwrap(),
        LeaveOutcome::NotMember
    );
    assert_eq!(chat.registry().session_of(&user("u1")), Some(x));
}

#[tokio::test]
async fn last_leave_ends_session_and_drops_messages() {
    let (chat, _hub) = service().await;
    let x = chat.start(&user("u1")).await.unwrap().session_id;
    chat.start(&user("u2")).await.unwrap();
    chat.send_message(x, &user("u1"), "hello").await.unwrap();

    chat.leave(x, &user("u2")).await.unwrap();
    assert_eq!(chat.leave(x, &user("u1")).await.unwrap(), LeaveOutcome::Ended);

    let count = MessageRepository::count_for_session(chat.registry().db(), &x.to_string())
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert!(chat.history(x, &user("u1")).await.is_err());
    assert!(chat.send_message(x, &user("u1"), "anyone?").await.is_err());
}

#[tokio::test]
async fn next_finds_a_different_partner() {
    let (chat, _hub) = service().await;
    let x = chat.start(&user("u1")).await.unwrap().session_id;
    chat.start(&user("u2")).await.unwrap();

    // u2 skips u1; nobody else is waiting so u2 gets a fresh session
    let skipped = chat.next(&user("u2"), Some(x)).await.unwrap();
    assert_ne!(skipped.session_id, x);
    assert_eq!(skipped.status, PairingStatus::Searching);

    // u3 claims the oldest waiting session, which is u1's
    let third = chat.start(&user("u3")).await.unwrap();
    assert_eq!(third.session_id, x);
}

#[tokio::test]
async fn disconnect_behaves_like_leave() {
    let (chat, hub) = service().await;
    let x = chat.start(&user("u1")).await.unwrap().session_id;
    chat.start(&user("u2")).await.unwrap();
    let (_, mut u2_rx) = hub.connect(&user("u2"));

    assert_eq!(chat.disconnect(&user("u1")).await.unwrap(), LeaveOutcome::Requeued);
    assert!(drain(&mut u2_rx)
        .iter()
        .any(|e| matches!(e, ServerEvent::ParticipantLeft { .. })));

    assert_eq!(chat.disconnect(&user("u1")).await.unwrap(), LeaveOutcome::NotMember);
    assert_eq!(chat.registry().session_of(&user("u2")), Some(x));
}

#[tokio::test]
async fn signals_reach_only_the_partner() {
    let (chat, hub) = service().await;
    let x = chat.start(&user("u1")).await.unwrap().session_id;
    chat.start(&user("u2")).await.unwrap();
    let (_, mut u1_rx) = hub.connect(&user("u1"));
    let (_, mut u2_rx) = hub.connect(&user("u2"));

    for sdp in ["first", "second", "third"] {
        let raw = serde_json::json!({"type": "offer", "to": "u2", "session_id": x, "sdp": sdp});
        chat.relay_signal(&user("u1"), raw).await.unwrap();
    }

    let received: Vec<String> = drain(&mut u2_rx)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::Signal { envelope } => Some(serde_json::to_value(&envelope).unwrap()),
            _ => None,
        })
        .map(|v| v["sdp"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(received, vec!["first", "second", "third"]);
    assert!(drain(&mut u1_rx)
        .iter()
        .all(|e| !matches!(e, ServerEvent::Signal { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn polling_reader_never_makes_a_requester_skip_the_waiting_session() {
    let (chat, _hub) = service().await;
    let x = chat.start(&user("u1")).await.unwrap().session_id;

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let chat = chat.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            while !stop.load(Ordering::Relaxed) {
                let _ = chat.session_view(x, &user("u1")).await;
                let _ = chat.history(x, &user("u1")).await;
                tokio::task::yield_now().await;
            }
        })
    };

    for i in 0..60 {
        let visitor = user(&format!("p{i}"));
        let pairing = chat.start(&visitor).await.unwrap();
        assert_eq!(pairing.session_id, x, "p{i} opened its own session");
        assert_eq!(pairing.partner_id, Some(user("u1")));
        assert_eq!(chat.leave(x, &visitor).await.unwrap(), LeaveOutcome::Requeued);
    }

    stop.store(true, Ordering::Relaxed);
    reader.await.unwrap();
    assert_eq!(chat.registry().live_sessions(), 1);
}
