//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::time::Duration;

use omnibus::{AnyValue, ObjectBuilder, Session, SessionConfig, Url};

pub fn configure_tracing() {
    use std::sync::OnceLock;
    static TRACING_INIT: OnceLock<()> = OnceLock::new();
    TRACING_INIT.get_or_init(|| {
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::builder()
                        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                        .from_env_lossy(),
                )
                .with_test_writer()
                .finish(),
        );
    });
}

pub fn any_loopback() -> Url {
    Url::parse("tcp://127.0.0.1:0").expect("static url")
}

/// A standalone session (embedded directory) listening on an ephemeral
/// loopback port, plus the endpoint clients connect to.
pub async fn standalone(machine_id: &str) -> (Session, Url) {
    configure_tracing();
    let config = SessionConfig::builder().machine_id(machine_id).build();
    let session: Session = Session::new(config).expect("create session");
    let endpoints = session
        .listen_standalone(&any_loopback())
        .await
        .expect("listen standalone");
    let endpoint = endpoints.first().expect("one endpoint").clone();
    (session, endpoint)
}

/// A client session connected to `endpoint`.
pub async fn client(machine_id: &str, endpoint: &Url) -> Session {
    configure_tracing();
    let config = SessionConfig::builder().machine_id(machine_id).build();
    let session: Session = Session::new(config).expect("create session");
    session.connect(endpoint).await.expect("connect");
    session
}

/// An object with `reply(s) → s` echoing its argument.
pub fn echo_object() -> omnibus::types::AnyObject {
    let mut builder = ObjectBuilder::new();
    builder
        .advertise_method("reply", "(s)", "s", |mut args, _ctx| {
            Ok(args.pop().unwrap_or(AnyValue::Void))
        })
        .expect("advertise reply");
    builder.build()
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
