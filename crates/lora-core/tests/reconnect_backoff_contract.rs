//! Contract Test: Bounded Reconnects and Deterministic Stop
//!
//! Verifies that a provider outage cannot spin forever and that a
//! requested stop is final.
//!
//! Constraints verified:
//! - Reconnects are bounded by max_reconnect_attempts, then the binding
//!   stops with RetriesExhausted
//! - Delay grows linearly with the attempt number
//! - A session the broker accepted resets the attempt counter
//! - stop() is idempotent and no reconnect fires after it
//! - stop() closes a live session

mod common;

use common::*;
use lora_core::binding::{BrokerBinding, ConnectionState, StopReason};
use lora_core::config::BindingConfig;
use lora_core::traits::{ConnectOptions, MessageHandler};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct NullHandler;

impl MessageHandler for NullHandler {
    fn handle_message(&self, _topic: &str, _payload: &[u8]) {}
}

fn binding_over(transport: &ControlledTransport, max_reconnect_attempts: usize) -> BrokerBinding {
    BrokerBinding::new(
        "ari_ioe_app_demo1",
        ConnectOptions {
            host: "eu.thethings.network".to_string(),
            port: 1883,
            scheme: "mqtt".to_string(),
            username: Some("ari_ioe_app_demo1".to_string()),
            password: Some("pwd1".to_string()),
            client_id: "lora-agent-test".to_string(),
            keep_alive: Duration::from_secs(30),
        },
        Arc::new(ControlledTransport::sharing_counters_with(transport)),
        Arc::new(NullHandler),
        BindingConfig {
            max_reconnect_attempts,
            reconnect_delay_ms: 20,
            ..BindingConfig::default()
        },
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn exhausted_retries_stop_the_binding() {
    let transport = ControlledTransport::new();
    transport.refuse_all_connects(true);
    let binding = binding_over(&transport, 3);

    let started = Instant::now();
    binding.start();

    let stopped = wait_until(Duration::from_secs(3), || {
        binding.state() == ConnectionState::Stopped(StopReason::RetriesExhausted)
    })
    .await;
    assert!(stopped, "binding kept retrying: {:?}", binding.state());

    // First attempt plus three retries
    assert_eq!(transport.connect_count(), 4);

    // 20ms + 40ms + 60ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(120));

    // Nothing more happens once the budget is spent
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.connect_count(), 4);
}

#[tokio::test]
async fn accepted_session_resets_the_attempt_counter() {
    let transport = ControlledTransport::new();
    transport.refuse_next_connects(2);
    let binding = binding_over(&transport, 2);
    binding.start();

    assert!(
        wait_until(Duration::from_secs(2), || binding.state() == ConnectionState::Connected).await
    );
    assert_eq!(transport.connect_count(), 3);

    // Two failures are already spent; without a reset this drop would
    // exceed the budget
    transport.drop_session();
    assert!(
        wait_until(Duration::from_secs(2), || {
            transport.session_count() == 2 && binding.state() == ConnectionState::Connected
        })
        .await,
        "binding did not recover: {:?}",
        binding.state()
    );

    binding.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_cancels_pending_reconnects() {
    let transport = ControlledTransport::new();
    transport.refuse_all_connects(true);
    let binding = binding_over(&transport, 10);
    binding.start();

    assert!(
        wait_until(Duration::from_secs(1), || {
            matches!(binding.state(), ConnectionState::Reconnecting { .. })
        })
        .await
    );

    binding.stop().await;
    assert_eq!(binding.state(), ConnectionState::Stopped(StopReason::Requested));
    let attempts = transport.connect_count();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.connect_count(), attempts, "reconnect fired after stop");

    binding.stop().await;
    assert_eq!(binding.state(), ConnectionState::Stopped(StopReason::Requested));

    // A stopped binding cannot be restarted
    binding.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.connect_count(), attempts);
}

#[tokio::test]
async fn stop_closes_a_live_session() {
    let transport = ControlledTransport::new();
    let binding = binding_over(&transport, 3);
    binding.start();

    assert!(
        wait_until(Duration::from_secs(1), || binding.state() == ConnectionState::Connected).await
    );

    binding.stop().await;
    assert!(transport.calls().contains(&Call::Disconnect { session: 0 }));
    assert_eq!(binding.state(), ConnectionState::Stopped(StopReason::Requested));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn state_transitions_are_observable() {
    let transport = ControlledTransport::manual();
    let binding = binding_over(&transport, 3);
    let mut states = binding.watch_state();
    assert_eq!(*states.borrow(), ConnectionState::Disconnected);

    binding.start();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);

    assert!(wait_until(Duration::from_secs(1), || transport.session_count() == 1).await);
    transport.emit(lora_core::traits::TransportEvent::Connected);
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    binding.stop().await;
    assert_eq!(*states.borrow_and_update(), ConnectionState::Stopped(StopReason::Requested));
}
