mod test_support;

use sshproxy::auth::AuthResult;
use sshproxy::error::{AgentError, ConfigurationError, SessionError};
use sshproxy::ssh::cipher::CipherSuite;
use sshproxy::ssh::registry::ServiceKind;
use sshproxy::ssh::session::{NO_AGENT_MESSAGE, PERMISSION_DENIED_MESSAGE};
use sshproxy::ssh::SessionState;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_support::*;

fn connected_agent() -> Arc<AgentState> {
    AgentState::new(AgentBehavior::Connects)
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_reaches_active_with_agent_and_shell() {
    let auth = AuthState::new(AuthResult::Success, true);
    let agent = connected_agent();
    let transport = TransportState::cooperative().with_agent(agent.clone()).shared();
    let proxy = proxy(auth.clone());
    let mut session = session(&proxy, &transport);

    session.start().await.unwrap();

    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.name(), "198.51.100.20:53211->203.0.113.5:22");
    assert_eq!(session.context().registry().kind(), ServiceKind::Shell);
    assert!(session.context().registry().is_ready());
    assert!(session.agent().is_some());
    assert_eq!(agent.connects(), 1);
    assert_eq!(auth.calls(), 1);
    assert!(auth.saw_agent.load(Ordering::SeqCst));
    assert_eq!(auth.saw_user.lock().unwrap().as_deref(), Some("alice"));
    assert!(transport.is_active());
    assert_eq!(transport.server_keys.load(Ordering::SeqCst), 1);
    assert_eq!(*transport.subsystems.lock().unwrap(), vec!["sftp".to_string()]);
    assert!(transport.channel.messages().is_empty());
}

#[tokio::test]
async fn scp_exec_resolves_scp() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative()
        .with_agent(connected_agent())
        .with_request(ClientRequest::Exec("scp -t /srv/upload".into()))
        .shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    session.start().await.unwrap();

    let registry = session.context().registry();
    assert_eq!(registry.kind(), ServiceKind::Scp);
    assert_eq!(registry.scp_command().as_deref(), Some("scp -t /srv/upload"));
}

#[tokio::test]
async fn sftp_subsystem_resolves_sftp() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative()
        .with_agent(connected_agent())
        .with_request(ClientRequest::Subsystem("sftp".into()))
        .shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    session.start().await.unwrap();
    assert_eq!(session.context().registry().kind(), ServiceKind::Sftp);
}

#[tokio::test]
async fn agent_not_requested_by_policy_is_still_declined() {
    let auth = AuthState::new(AuthResult::Success, false);
    let agent = connected_agent();
    let transport = TransportState::cooperative().with_agent(agent.clone()).shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    // Without an agent the session is refused even when the policy does not
    // ask for forwarding; the bridge is never even created.
    let err = session.start().await.unwrap_err();
    assert!(matches!(err, SessionError::AgentForwardingDeclined));
    assert_eq!(agent.connects(), 0);
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn authenticator_failure_sends_permission_denied_once() {
    let auth = AuthState::new(AuthResult::Failure, true);
    let agent = connected_agent();
    let transport = TransportState::cooperative().with_agent(agent.clone()).shared();
    let proxy = proxy(auth.clone());
    let mut session = session(&proxy, &transport);

    let err = session.start().await.unwrap_err();

    assert!(matches!(err, SessionError::Authentication(_)));
    assert_eq!(session.state(), SessionState::AuthRejected);
    assert_eq!(
        transport.channel.messages(),
        vec![PERMISSION_DENIED_MESSAGE.to_string()]
    );
    assert_eq!(auth.calls(), 1);
}

#[tokio::test]
async fn connected_agent_released_after_auth_failure() {
    let auth = AuthState::new(AuthResult::Failure, true);
    let agent = connected_agent();
    let transport = TransportState::cooperative().with_agent(agent.clone()).shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    assert!(session.start().await.is_err());
    assert_eq!(agent.closes(), 0);

    session.close();
    assert_eq!(agent.closes(), 1);
    assert!(!transport.is_active());
}

#[tokio::test]
async fn missing_agent_sends_notice_and_keeps_transport() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative().shared();
    let proxy = proxy(auth.clone());
    let mut session = session(&proxy, &transport);

    let err = session.start().await.unwrap_err();

    assert!(matches!(err, SessionError::AgentForwardingDeclined));
    assert_eq!(session.state(), SessionState::AgentDeclined);
    assert_eq!(transport.channel.messages(), vec![NO_AGENT_MESSAGE.to_string()]);
    assert_eq!(transport.closes(), 0);
    assert!(transport.is_active());
    assert_eq!(auth.calls(), 0);
}

#[tokio::test]
async fn unresolved_service_closes_transport_without_readiness() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative()
        .with_agent(connected_agent())
        .with_request(ClientRequest::Nothing)
        .shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    let err = session.start().await.unwrap_err();

    assert!(matches!(err, SessionError::UnresolvedService));
    assert_eq!(session.state(), SessionState::ServiceUnresolved);
    assert_eq!(transport.closes(), 1);
    assert!(!transport.is_active());
    assert!(!session.context().registry().is_ready());
    assert_eq!(session.context().registry().kind(), ServiceKind::Unset);
}

#[tokio::test]
async fn unknown_subsystem_leaves_service_unresolved() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative()
        .with_agent(connected_agent())
        .with_request(ClientRequest::Subsystem("netconf".into()))
        .shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, SessionError::UnresolvedService));
}

// ---------------------------------------------------------------------------
// Pre-bound service client
// ---------------------------------------------------------------------------

#[tokio::test]
async fn prebound_client_skips_agent_and_authentication() {
    let auth = AuthState::new(AuthResult::Failure, true);
    let agent = connected_agent();
    let transport = TransportState::cooperative()
        .with_agent(agent.clone())
        .with_request(ClientRequest::Nothing)
        .shared();
    let proxy = proxy(auth.clone());
    let mut session = session(&proxy, &transport);
    let client = Arc::new(MockServiceClient::default());
    assert!(session.context().registry().bind_client(client.clone()).is_none());

    session.start().await.unwrap();

    assert!(session.context().registry().is_ready());
    assert_eq!(auth.calls(), 0);
    assert_eq!(agent.connects(), 0);

    session.close();
    assert_eq!(client.closes.load(Ordering::SeqCst), 1);
    assert!(!session.context().registry().has_client());
}

// ---------------------------------------------------------------------------
// Agent bridge failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_connect_failure_closes_everything() {
    let auth = AuthState::new(AuthResult::Success, true);
    let agent = AgentState::new(AgentBehavior::Fails);
    let transport = TransportState::cooperative().with_agent(agent.clone()).shared();
    let proxy = proxy(auth.clone());
    let mut session = session(&proxy, &transport);

    let err = session.start().await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::AgentForwarding(AgentError::ChannelRefused(_))
    ));
    assert_eq!(agent.closes(), 1);
    assert!(!transport.is_active());
    assert!(session.is_closed());
    assert_eq!(auth.calls(), 0);

    session.close();
    assert_eq!(agent.closes(), 1);
}

#[tokio::test]
async fn stalled_agent_connect_times_out() {
    let auth = AuthState::new(AuthResult::Success, true);
    let agent = AgentState::new(AgentBehavior::Stalls);
    let transport = TransportState::cooperative().with_agent(agent.clone()).shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    let started = Instant::now();
    let err = session.start().await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::AgentForwarding(AgentError::Timeout(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(agent.closes(), 1);
}

// ---------------------------------------------------------------------------
// Channel accept and authentication waits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_while_polling_fails_within_one_interval() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative().silent().shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    let stopper = proxy.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        stopper.shutdown();
    });

    let started = Instant::now();
    let err = session.start().await.unwrap_err();

    assert!(matches!(err, SessionError::ChannelAccept));
    assert_eq!(session.state(), SessionState::ChannelFailed);
    assert!(started.elapsed() < Duration::from_millis(80 + 50 * 4));
    assert!(!transport.is_active());
    assert_eq!(transport.closes(), 1);
}

#[tokio::test]
async fn already_stopped_proxy_fails_first_poll() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative()
        .with_agent(connected_agent())
        .shared();
    let proxy = proxy(auth);
    proxy.shutdown();
    let mut session = session(&proxy, &transport);

    // A channel is available but the running flag is checked after the poll.
    let err = session.start().await.unwrap_err();
    assert!(matches!(err, SessionError::ChannelAccept));
    assert!(!transport.is_active());
}

#[tokio::test]
async fn request_close_interrupts_channel_wait() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative().silent().shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    let context = session.context().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        context.request_close();
    });

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, SessionError::ChannelAccept));
    assert!(proxy.running());
}

#[tokio::test]
async fn transport_death_before_auth_fails() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative().dies_before_auth().shared();
    let proxy = proxy(auth.clone());
    let mut session = session(&proxy, &transport);

    let err = session.start().await.unwrap_err();

    assert!(matches!(err, SessionError::Authentication(_)));
    assert_eq!(session.state(), SessionState::AuthFailed);
    assert_eq!(auth.calls(), 0);
}

#[tokio::test]
async fn auth_timeout_closes_transport() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative().never_authenticates().shared();
    let mut settings = fast_settings();
    settings.auth_timeout = Some(Duration::from_millis(100));
    let proxy = proxy_with(auth, settings);
    let mut session = session(&proxy, &transport);

    let err = session.start().await.unwrap_err();

    assert!(matches!(err, SessionError::Authentication(_)));
    assert_eq!(session.state(), SessionState::AuthFailed);
    assert!(!transport.is_active());
}

#[tokio::test]
async fn shutdown_interrupts_unbounded_auth_wait() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative().never_authenticates().shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    let stopper = proxy.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.shutdown();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), session.start()).await;
    assert!(matches!(result, Ok(Err(SessionError::Authentication(_)))));
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cipher_override_applied_before_start() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative()
        .with_agent(connected_agent())
        .shared();
    let mut settings = fast_settings();
    settings.ciphers = Some(CipherSuite::new(["aes256-gcm@openssh.com", "aes128-ctr"]).unwrap());
    let proxy = proxy_with(auth, settings);
    let mut session = session(&proxy, &transport);

    session.start().await.unwrap();

    assert_eq!(
        transport.ciphers.lock().unwrap().clone(),
        Some(vec![
            "aes256-gcm@openssh.com".to_string(),
            "aes128-ctr".to_string()
        ])
    );
}

#[tokio::test]
async fn unsupported_cipher_fails_before_handshake() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative().shared();
    let mut settings = fast_settings();
    settings.ciphers = Some(CipherSuite::new(["aes128-ctr", "rot13"]).unwrap());
    let proxy = proxy_with(auth, settings);
    let mut session = session(&proxy, &transport);

    let err = session.start().await.unwrap_err();

    match err {
        SessionError::Configuration(e) => {
            assert_eq!(e, ConfigurationError::UnsupportedCipher("rot13".into()))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.state(), SessionState::Created);
    assert_eq!(transport.starts(), 0);
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_close_after_every_outcome_is_harmless() {
    let cases: Vec<(AuthResult, Option<AgentBehavior>, ClientRequest)> = vec![
        (AuthResult::Success, Some(AgentBehavior::Connects), ClientRequest::Shell),
        (AuthResult::Failure, Some(AgentBehavior::Connects), ClientRequest::Shell),
        (AuthResult::Success, Some(AgentBehavior::Fails), ClientRequest::Shell),
        (AuthResult::Success, None, ClientRequest::Shell),
        (AuthResult::Success, Some(AgentBehavior::Connects), ClientRequest::Nothing),
    ];

    for (result, agent_behavior, request) in cases {
        let auth = AuthState::new(result, true);
        let agent = agent_behavior.map(AgentState::new);
        let mut state = TransportState::cooperative().with_request(request);
        if let Some(agent) = &agent {
            state = state.with_agent(agent.clone());
        }
        let transport = state.shared();
        let proxy = proxy(auth);
        let mut session = session(&proxy, &transport);

        let _ = session.start().await;
        session.close();
        session.close();
        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(!transport.is_active());
        assert!(transport.closes() <= 1);
        if let Some(agent) = &agent {
            assert!(agent.closes() <= 1);
            assert_eq!(agent.closes(), agent.connects().min(1));
        }
        drop(session);
        if let Some(agent) = &agent {
            assert!(agent.closes() <= 1);
        }
    }
}

#[tokio::test]
async fn close_before_start_is_harmless() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative().shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    session.close();
    session.close();

    assert_eq!(transport.closes(), 0);
    assert!(session.context().is_cancelled());
}

#[tokio::test]
async fn second_start_is_rejected() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative()
        .with_agent(connected_agent())
        .shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);

    session.start().await.unwrap();
    let err = session.start().await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyStarted));
    assert_eq!(transport.starts(), 1);
}

#[tokio::test]
async fn close_cancels_service_tasks() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative()
        .with_agent(connected_agent())
        .shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);
    session.start().await.unwrap();

    let context = session.context().clone();
    let watcher = tokio::spawn(async move { context.cancelled().await });
    session.close();

    tokio::time::timeout(Duration::from_secs(1), watcher)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn proxy_shutdown_cancels_active_session() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative()
        .with_agent(connected_agent())
        .shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);
    session.start().await.unwrap();

    proxy.shutdown();
    tokio::time::timeout(Duration::from_secs(1), session.wait_finished())
        .await
        .unwrap();
    assert!(session.context().is_cancelled());
}

#[tokio::test]
async fn wait_finished_returns_when_transport_ends() {
    let auth = AuthState::new(AuthResult::Success, true);
    let transport = TransportState::cooperative()
        .with_agent(connected_agent())
        .shared();
    let proxy = proxy(auth);
    let mut session = session(&proxy, &transport);
    session.start().await.unwrap();

    transport.active.store(false, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(1), session.wait_finished())
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spawned_connection_task_releases_session() {
    use sshproxy::server::serve_connection;

    let auth = AuthState::new(AuthResult::Success, true);
    let agent = connected_agent();
    let transport = TransportState::cooperative().with_agent(agent.clone()).shared();
    let proxy = proxy(auth);

    let task = tokio::spawn(serve_connection(
        proxy.clone(),
        Box::new(MockConnection(transport.clone())),
        "c0ffee00".to_string(),
        client_addr(),
        local_addr(),
    ));

    let deadline = Instant::now() + Duration::from_secs(2);
    while agent.connects() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(agent.connects(), 1);
    assert_eq!(proxy.active_sessions(), 1);

    transport.active.store(false, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(proxy.active_sessions(), 0);
    assert_eq!(agent.closes(), 1);
}
