#![allow(dead_code)]

pub mod fake_backend;

use std::sync::Arc;

use log::LevelFilter;
use remoterm_core::core::ConnectionState;
use remoterm_core::storage::{AuthMethod, ConnectionProfile};
use remoterm_core::ClientConfig;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

pub fn init_logs() {
    //   Logs will appear only when you run with `-- --nocapture`
    //   or when the test fails.
    let _ = env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.backend.url = "ws://fake.invalid/terminal".into();
    config
}

pub fn profile(name: &str) -> ConnectionProfile {
    ConnectionProfile::new(
        name,
        format!("{name}.example.org"),
        22,
        "dev",
        AuthMethod::Password {
            password: "s3cret".into(),
        },
    )
}

/// Wait for the first transition matching `pred`, skipping the others.
pub async fn wait_for(
    transitions: &mut broadcast::Receiver<Arc<ConnectionState>>,
    within: Duration,
    pred: impl Fn(&ConnectionState) -> bool,
) -> Arc<ConnectionState> {
    timeout(within, async {
        loop {
            match transitions.recv().await {
                Ok(state) if pred(&state) => return state,
                Ok(_) => continue,
                Err(e) => panic!("transition stream failed: {e}"),
            }
        }
    })
    .await
    .expect("timeout waiting for a state transition")
}
