use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use remoterm_core::connections::ConnectionErrorKind;
use remoterm_core::core::SessionState;
use remoterm_core::protocol::Message;
use remoterm_core::{RemoteTerminal, SessionError};
use tokio::time::{timeout, Duration};

mod common;
use common::fake_backend::{FakeBackend, HOME};
use common::{init_logs, profile, test_config};

async fn connected_client() -> (RemoteTerminal, FakeBackend) {
    init_logs();
    let backend = FakeBackend::new();
    let client = RemoteTerminal::with_connector(Arc::new(backend.clone()), &test_config())
        .expect("client should build");
    client
        .connect(profile("box"))
        .await
        .expect("connect should succeed");
    (client, backend)
}

#[tokio::test]
async fn connect_create_pwd_close() {
    let (client, backend) = connected_client().await;
    assert!(client.connection().state().is_connected());
    let sessions = client.sessions();

    let target = profile("box");
    let id = sessions
        .create_session(Some(&target))
        .await
        .expect("backend acks the session");
    assert_eq!(sessions.session_state(&id), Some(SessionState::Running));
    assert_eq!(sessions.session_ids(), vec![id.clone()]);

    let mut output = sessions.subscribe(&id).expect("session exists");
    sessions
        .send_terminal_data(&id, "pwd\n")
        .await
        .expect("send should succeed");

    let chunk = timeout(Duration::from_secs(2), output.recv())
        .await
        .expect("timeout waiting for terminal output")
        .expect("output stream closed unexpectedly");
    assert_eq!(chunk, format!("{HOME}\n"));
    assert_eq!(sessions.get_session_messages(&id), vec![format!("{HOME}\n")]);

    let inputs = backend.sent_of_type("terminal_input");
    assert_eq!(
        inputs,
        vec![Message::TerminalInput {
            session_id: id.clone(),
            data: "pwd\n".into()
        }]
    );

    sessions.close_session(&id).await.expect("close should succeed");
    assert!(sessions.get_session_messages(&id).is_empty());
    assert_eq!(sessions.session_state(&id), None);
    let end = timeout(Duration::from_secs(2), output.recv())
        .await
        .expect("stream should end after close");
    assert_eq!(end, None);

    client.shutdown().await;
    assert!(!client.sessions().transport().is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_never_see_each_others_output() {
    let (client, _backend) = connected_client().await;
    let sessions = client.sessions().clone();
    let a = sessions.create_session(None).await.expect("session a");
    let b = sessions.create_session(None).await.expect("session b");
    let mut rx_a = sessions.subscribe(&a).expect("a exists");
    let mut rx_b = sessions.subscribe(&b).expect("b exists");

    const N: usize = 200;
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let pauses_a: Vec<u8> = (0..N).map(|_| rng.gen_range(0..4)).collect();
    let pauses_b: Vec<u8> = (0..N).map(|_| rng.gen_range(0..4)).collect();

    let spawn_sender = |id: String, tag: &'static str, pauses: Vec<u8>| {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            for (i, pause) in pauses.into_iter().enumerate() {
                for _ in 0..pause {
                    tokio::task::yield_now().await;
                }
                sessions
                    .send_terminal_data(&id, &format!("{tag}-{i}"))
                    .await
                    .expect("send should succeed");
            }
        })
    };
    let task_a = spawn_sender(a.clone(), "a", pauses_a);
    let task_b = spawn_sender(b.clone(), "b", pauses_b);
    task_a.await.expect("sender a panicked");
    task_b.await.expect("sender b panicked");

    for (rx, tag) in [(&mut rx_a, "a"), (&mut rx_b, "b")] {
        for i in 0..N {
            let chunk = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timeout waiting for output")
                .expect("stream closed");
            assert_eq!(chunk, format!("{tag}-{i}"), "wrong or reordered output");
        }
        assert!(rx.try_recv().is_err(), "no extra output for session {tag}");
    }
}

#[tokio::test]
async fn closing_twice_is_a_no_op() {
    let (client, backend) = connected_client().await;
    let sessions = client.sessions();
    let id = sessions.create_session(None).await.expect("create");

    sessions.close_session(&id).await.expect("first close");
    sessions.close_session(&id).await.expect("second close is fine");
    sessions.close_session("never-existed").await.expect("unknown id is fine");

    assert_eq!(backend.sent_of_type("session_close").len(), 1);
    assert!(sessions.session_ids().is_empty());
}

#[tokio::test]
async fn rejected_creation_leaves_no_session() {
    let (client, backend) = connected_client().await;
    backend.reject_creates(true);

    match client.sessions().create_session(None).await {
        Err(SessionError::Rejected { reason, .. }) => assert_eq!(reason, "host unreachable"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(client.sessions().session_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_creation_times_out_and_is_withdrawn() {
    let (client, backend) = connected_client().await;
    backend.ignore_creates(true);

    let id = match client.sessions().create_session(None).await {
        Err(SessionError::Timeout(id)) => id,
        other => panic!("expected a timeout, got {other:?}"),
    };
    assert!(client.sessions().session_ids().is_empty());
    assert_eq!(
        backend.sent_of_type("session_close"),
        vec![Message::SessionClose { session_id: id }]
    );
}

#[tokio::test]
async fn bad_frames_are_dropped_without_disturbing_sessions() {
    let (client, backend) = connected_client().await;
    let sessions = client.sessions();
    let id = sessions.create_session(None).await.expect("create");
    let mut rx = sessions.subscribe(&id).expect("exists");

    backend.inject_raw(b"definitely not json".to_vec());
    backend.inject_raw(br#"{"type":"telepathy","session_id":"x"}"#.to_vec());
    backend.inject(Message::TerminalOutput {
        session_id: "ghost".into(),
        data: "boo".into(),
    });
    backend.inject(Message::TerminalOutput {
        session_id: id.clone(),
        data: "still here".into(),
    });

    let chunk = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timeout waiting for output")
        .expect("stream closed");
    assert_eq!(chunk, "still here");
    assert_eq!(sessions.session_state(&id), Some(SessionState::Running));
}

#[tokio::test]
async fn backend_can_fail_and_close_sessions() {
    let (client, backend) = connected_client().await;
    let sessions = client.sessions();
    let a = sessions.create_session(None).await.expect("create a");
    let b = sessions.create_session(None).await.expect("create b");
    let mut rx_a = sessions.subscribe(&a).expect("a exists");
    let mut rx_b = sessions.subscribe(&b).expect("b exists");

    backend.inject(Message::Error {
        session_id: a.clone(),
        data: "shell crashed".into(),
    });
    // frames are routed in order, so once this arrives the error was handled
    backend.inject(Message::TerminalOutput {
        session_id: b.clone(),
        data: "marker".into(),
    });
    let marker = timeout(Duration::from_secs(2), rx_b.recv())
        .await
        .expect("timeout waiting for marker")
        .expect("stream closed");
    assert_eq!(marker, "marker");
    assert_eq!(sessions.session_state(&a), Some(SessionState::Error));
    assert!(matches!(
        sessions.send_terminal_data(&a, "ls").await,
        Err(SessionError::SessionNotRunning {
            state: SessionState::Error,
            ..
        })
    ));

    backend.inject(Message::SessionClose {
        session_id: a.clone(),
    });
    let end = timeout(Duration::from_secs(2), rx_a.recv())
        .await
        .expect("stream should end when the backend closes the session");
    assert_eq!(end, None);
    assert_eq!(sessions.session_ids(), vec![b]);
}

#[tokio::test]
async fn control_and_resize_reach_the_backend() {
    let (client, backend) = connected_client().await;
    let sessions = client.sessions();
    let id = sessions.create_session(None).await.expect("create");

    sessions
        .send_terminal_control(&id, "SIGINT")
        .await
        .expect("control should succeed");
    sessions
        .resize_terminal(&id, 120, 40)
        .await
        .expect("resize should succeed");
    assert!(matches!(
        sessions.resize_terminal(&id, 0, 40).await,
        Err(SessionError::InvalidSize { cols: 0, rows: 40 })
    ));
    assert!(matches!(
        sessions.send_terminal_data("nope", "ls").await,
        Err(SessionError::UnknownSession(_))
    ));

    assert_eq!(
        backend.sent_of_type("terminal_control"),
        vec![Message::TerminalControl {
            session_id: id.clone(),
            data: "SIGINT".into()
        }]
    );
    assert_eq!(
        backend.sent_of_type("terminal_resize"),
        vec![Message::TerminalResize {
            session_id: id,
            cols: 120,
            rows: 40
        }]
    );
}

#[tokio::test]
async fn nothing_is_sent_without_a_connection() {
    init_logs();
    let backend = FakeBackend::new();
    let client = RemoteTerminal::with_connector(Arc::new(backend.clone()), &test_config())
        .expect("client should build");

    match client.sessions().create_session(None).await {
        Err(SessionError::Transport(e)) => assert_eq!(e.kind, ConnectionErrorKind::NotConnected),
        other => panic!("expected NotConnected, got {other:?}"),
    }
    let err = client
        .sessions()
        .transport()
        .send(b"{}".to_vec())
        .await
        .expect_err("send must fail fast");
    assert_eq!(err.kind, ConnectionErrorKind::NotConnected);
    assert!(client.sessions().session_ids().is_empty());
    assert_eq!(backend.opens(), 0);
}

#[tokio::test]
async fn a_new_session_is_announced_once() {
    let (client, backend) = connected_client().await;
    let sessions = client.sessions();
    let id = sessions.create_session(None).await.expect("create");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.sent_of_type("session_create").len(), 1);
    assert_eq!(sessions.session_state(&id), Some(SessionState::Running));
}
