//! End-to-end messaging scenarios over real loopback sockets.

mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use omnibus::directory::SERVICE_DIRECTORY_ID;
use omnibus::{
    AnyValue, Error, ObjectBuilder, Promise, SessionConfig, SignalSubscriber, Url,
};

use helpers::{client, echo_object, standalone, wait_until};

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn echo_round_trip() {
    let (server, endpoint) = standalone("machine-a").await;
    server
        .register_service("echo", echo_object())
        .await
        .expect("register echo");

    let session = client("machine-a", &endpoint).await;
    let echo = session.service("echo").await.expect("resolve echo");
    let answer = echo
        .call("reply", vec![AnyValue::str("ok")])
        .await
        .expect("call reply");
    assert_eq!(answer, AnyValue::str("ok"));

    // No in-flight entries linger on either end after the reply.
    assert_eq!(echo.pending_count(), 0);
    let bound = server.bound_object(2).expect("bound echo");
    assert!(
        wait_until(Duration::from_secs(2), || bound.total_inflight_count() == 0).await,
        "server kept an in-flight entry after replying"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn duplicate_name_is_rejected_over_the_wire() {
    let (server, endpoint) = standalone("machine-a").await;
    server
        .register_service("svc1", echo_object())
        .await
        .expect("register svc1");

    let session = client("machine-a", &endpoint).await;
    session
        .listen(&helpers::any_loopback())
        .await
        .expect("listen");
    let err = session
        .register_service("svc1", echo_object())
        .await
        .expect_err("second registration must fail");
    assert!(
        err.to_string().contains("already registered"),
        "unexpected error: {}",
        err
    );

    // The first registration stays resolvable.
    let info = session.service("svc1").await.expect("svc1 still resolves");
    assert_eq!(info.service(), 2);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cancel_before_reply_yields_canceled() {
    let (server, endpoint) = standalone("machine-a").await;

    // sleep(ms) returns an inner future that honours cancellation; it
    // completes only when cancelled or after the full delay.
    let mut builder = ObjectBuilder::new();
    builder
        .advertise_method("sleep", "(I)", "v", move |args, _ctx| {
            let ms = args.first().and_then(AnyValue::as_u32).unwrap_or(0);
            let promise = Promise::<AnyValue>::with_cancel_handler(|p| {
                p.set_canceled();
            });
            let done = promise.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(u64::from(ms)));
                done.set_value(AnyValue::Void);
            });
            Ok(AnyValue::Future(promise.future()))
        })
        .expect("advertise sleep");
    server
        .register_service("sleeper", builder.build())
        .await
        .expect("register sleeper");

    let session = client("machine-a", &endpoint).await;
    let sleeper = session.service("sleeper").await.expect("resolve sleeper");

    let call = sleeper.call("sleep", vec![AnyValue::uint32(1000)]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    call.cancel();

    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(Duration::from_millis(500), call.clone())
        .await
        .expect("cancellation reply must not take the full second");
    assert!(matches!(outcome, Err(Error::Canceled)), "{:?}", outcome);
    assert!(started.elapsed() < Duration::from_millis(400));

    let bound = server.bound_object(2).expect("bound sleeper");
    assert!(
        wait_until(Duration::from_secs(2), || bound.total_inflight_count() == 0).await,
        "server kept the cancelled call in flight"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn signal_bridge_delivers_and_unsubscribes() {
    let (server, endpoint) = standalone("machine-a").await;

    let mut builder = ObjectBuilder::new();
    let (_, fire) = builder.advertise_signal("fire", "(i)").expect("advertise fire");
    server
        .register_service("emitter", builder.build())
        .await
        .expect("register emitter");

    let session = client("machine-a", &endpoint).await;
    let emitter = session.service("emitter").await.expect("resolve emitter");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let link = emitter
        .subscribe(
            "fire",
            SignalSubscriber::callback(move |args| {
                if let Some(v) = args.first().and_then(AnyValue::as_i64) {
                    sink.lock().unwrap().push(v);
                }
            }),
        )
        .await
        .expect("subscribe");

    fire.emit(vec![AnyValue::int32(42)]);
    assert!(
        wait_until(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await,
        "event never arrived"
    );
    assert_eq!(*seen.lock().unwrap(), vec![42]);

    emitter
        .unsubscribe("fire", link)
        .await
        .expect("unsubscribe");
    let bound = server.bound_object(2).expect("bound emitter");
    assert!(
        wait_until(Duration::from_secs(2), || bound.total_link_count() == 0).await,
        "server kept the signal link after unregisterEvent"
    );

    fire.emit(vec![AnyValue::int32(43)]);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(*seen.lock().unwrap(), vec![42], "event after unsubscribe");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn localhost_endpoint_is_preferred_on_same_machine() {
    let (server, endpoint) = standalone("machine-a").await;
    server
        .register_service("echo", echo_object())
        .await
        .expect("register echo");

    // Make the directory advertise an unroutable public address alongside
    // the real loopback endpoint.
    let directory = server.directory().expect("standalone directory");
    let mut info = directory.service("echo").expect("echo info");
    let loopback = info.endpoints.first().expect("loopback endpoint").clone();
    info.endpoints = vec![
        Url::parse("tcp://10.255.0.1:5555").expect("static url"),
        loopback.clone(),
    ];
    directory.update_service_info(&info).expect("update info");

    // Same machine id: only the loopback endpoint may be attempted, so the
    // call succeeds fast instead of hanging on the bogus address.
    let session = client("machine-a", &endpoint).await;
    let echo = tokio::time::timeout(Duration::from_secs(2), session.service("echo"))
        .await
        .expect("resolution must not try 10.255.0.1")
        .expect("resolve echo");
    let answer = echo
        .call("reply", vec![AnyValue::str("local")])
        .await
        .expect("call over loopback");
    assert_eq!(answer, AnyValue::str("local"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn socket_disconnect_cleans_up_links_calls_and_services() {
    let (server, endpoint) = standalone("machine-a").await;

    // Service with three signals and a method that never replies on its own.
    let mut builder = ObjectBuilder::new();
    builder.advertise_signal("s1", "(i)").expect("signal s1");
    builder.advertise_signal("s2", "(i)").expect("signal s2");
    builder.advertise_signal("s3", "(i)").expect("signal s3");
    builder
        .advertise_method("hang", "()", "v", |_args, _ctx| {
            let promise = Promise::<AnyValue>::with_cancel_handler(|p| {
                p.set_canceled();
            });
            Ok(AnyValue::Future(promise.future()))
        })
        .expect("advertise hang");
    server
        .register_service("chatty", builder.build())
        .await
        .expect("register chatty");

    // Watch for serviceRemoved of the client-owned service.
    let removed = Arc::new(Mutex::new(Vec::new()));
    let sink = removed.clone();
    let directory = server.directory().expect("standalone directory");
    directory
        .service_removed
        .connect(SignalSubscriber::callback(move |args| {
            if let Some(name) = args.get(1).and_then(|v| v.as_str()) {
                sink.lock().unwrap().push(name.to_string());
            }
        }))
        .expect("watch serviceRemoved");

    let session = client("machine-b", &endpoint).await;
    session
        .listen(&helpers::any_loopback())
        .await
        .expect("listen");
    session
        .register_service("client-owned", echo_object())
        .await
        .expect("register client-owned");

    let chatty = session.service("chatty").await.expect("resolve chatty");
    for signal in ["s1", "s2", "s3"] {
        chatty
            .subscribe(signal, SignalSubscriber::callback(|_| {}))
            .await
            .expect("subscribe");
    }
    let _call_a = chatty.call("hang", vec![]);
    let _call_b = chatty.call("hang", vec![]);

    let bound = server.bound_object(2).expect("bound chatty");
    assert!(
        wait_until(Duration::from_secs(2), || {
            bound.total_link_count() == 3 && bound.total_inflight_count() == 2
        })
        .await,
        "expected 3 links and 2 in-flight calls, got {} / {}",
        bound.total_link_count(),
        bound.total_inflight_count()
    );

    // Drop every connection of the client at once.
    session.close();
    drop(session);

    assert!(
        wait_until(Duration::from_secs(3), || {
            bound.total_link_count() == 0 && bound.total_inflight_count() == 0
        })
        .await,
        "disconnect left links/calls behind: {} / {}",
        bound.total_link_count(),
        bound.total_inflight_count()
    );
    assert!(
        wait_until(Duration::from_secs(3), || {
            removed.lock().unwrap().contains(&"client-owned".to_string())
        })
        .await,
        "directory never unregistered the client's service"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn directory_is_resolvable_as_a_service() {
    let (server, endpoint) = standalone("machine-a").await;
    server
        .register_service("echo", echo_object())
        .await
        .expect("register echo");

    let session = client("machine-a", &endpoint).await;
    let services = session.services().await.expect("services()");
    let names: Vec<_> = services.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"ServiceDirectory"));
    assert!(names.contains(&"echo"));
    assert!(services
        .iter()
        .any(|s| s.service_id == SERVICE_DIRECTORY_ID));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn hidden_services_are_not_announced_over_the_wire() {
    let (server, endpoint) = standalone("machine-a").await;
    let directory = server.directory().expect("standalone directory");
    let announced = Arc::new(AtomicUsize::new(0));
    let counter = announced.clone();
    directory
        .service_added
        .connect(SignalSubscriber::callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("watch serviceAdded");

    let session = client("machine-a", &endpoint).await;
    session
        .listen(&helpers::any_loopback())
        .await
        .expect("listen");
    session
        .register_service("_internal", echo_object())
        .await
        .expect("register hidden");
    session
        .register_service("public", echo_object())
        .await
        .expect("register public");

    assert!(
        wait_until(Duration::from_secs(2), || {
            announced.load(Ordering::SeqCst) == 1
        })
        .await,
        "expected exactly one announcement, got {}",
        announced.load(Ordering::SeqCst)
    );
    // Hidden services still resolve by name.
    assert!(session.service("_internal").await.is_ok());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn properties_are_readable_writable_and_emit() {
    let (server, endpoint) = standalone("machine-a").await;

    let mut builder = ObjectBuilder::new();
    let (_, property) = builder
        .advertise_property("volume", "i", AnyValue::int32(10))
        .expect("advertise volume");
    server
        .register_service("mixer", builder.build())
        .await
        .expect("register mixer");

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    property
        .signal()
        .connect(SignalSubscriber::callback(move |args| {
            if let Some(v) = args.first().and_then(AnyValue::as_i64) {
                sink.lock().unwrap().push(v);
            }
        }))
        .expect("watch property");

    let session = client("machine-a", &endpoint).await;
    let mixer = session.service("mixer").await.expect("resolve mixer");

    let value = mixer.property("volume").await.expect("read volume");
    assert_eq!(value.as_i64(), Some(10));

    mixer
        .set_property("volume", AnyValue::int32(42))
        .await
        .expect("write volume");
    assert_eq!(
        mixer.property("volume").await.expect("re-read").as_i64(),
        Some(42)
    );
    assert_eq!(*changes.lock().unwrap(), vec![42]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn error_reply_for_unknown_method() {
    let (server, endpoint) = standalone("machine-a").await;
    server
        .register_service("echo", echo_object())
        .await
        .expect("register echo");

    let session = client("machine-a", &endpoint).await;
    let echo = session.service("echo").await.expect("resolve echo");
    let err = echo
        .call("does-not-exist", vec![])
        .await
        .expect_err("unknown method must fail");
    assert!(
        err.to_string().contains("does-not-exist"),
        "unexpected error: {}",
        err
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn peer_without_cancel_capability_gets_error_text() {
    let (server, endpoint) = standalone("machine-a").await;

    let mut builder = ObjectBuilder::new();
    builder
        .advertise_method("hang", "()", "v", |_args, _ctx| {
            let promise = Promise::<AnyValue>::with_cancel_handler(|p| {
                p.set_canceled();
            });
            Ok(AnyValue::Future(promise.future()))
        })
        .expect("advertise hang");
    server
        .register_service("sleeper", builder.build())
        .await
        .expect("register sleeper");

    // This client refuses the RemoteCancelableCalls capability, so the
    // cancellation comes back as the fixed error text, which the client
    // maps back to Error::Canceled.
    helpers::configure_tracing();
    let config = SessionConfig::builder()
        .machine_id("machine-a")
        .capability("RemoteCancelableCalls", false)
        .build();
    let session: omnibus::Session = omnibus::Session::new(config).expect("create session");
    session.connect(&endpoint).await.expect("connect");

    let sleeper = session.service("sleeper").await.expect("resolve sleeper");
    let call = sleeper.call("hang", vec![]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    call.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(2), call.clone())
        .await
        .expect("reply must arrive");
    assert!(matches!(outcome, Err(Error::Canceled)), "{:?}", outcome);
}
