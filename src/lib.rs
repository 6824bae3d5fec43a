//! # omnibus
//!
//! An async distributed object-messaging runtime for tokio.
//!
//! Processes host named **services**; each service exposes typed objects
//! whose methods, signals and properties remote peers drive over a framed
//! socket protocol. A process-wide **service directory** maps names to
//! endpoints, a **socket cache** races connection attempts across a
//! machine's endpoints, and every object gets actor-style serial execution
//! through a **strand** over a shared worker pool.
//!
//! ## Server example
//!
//! ```rust,ignore
//! use omnibus::{AnyValue, ObjectBuilder, Session, SessionConfig, Url};
//!
//! #[tokio::main]
//! async fn main() -> omnibus::Result<()> {
//!     let session: Session = Session::new(SessionConfig::default())?;
//!     session
//!         .listen_standalone(&Url::parse("tcp://127.0.0.1:9559")?)
//!         .await?;
//!
//!     let mut builder = ObjectBuilder::new();
//!     builder.advertise_method("reply", "(s)", "s", |mut args, _ctx| {
//!         Ok(args.pop().unwrap_or(AnyValue::Void))
//!     })?;
//!     session.register_service("echo", builder.build()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Client example
//!
//! ```rust,ignore
//! use omnibus::{AnyValue, Session, SessionConfig, Url};
//!
//! #[tokio::main]
//! async fn main() -> omnibus::Result<()> {
//!     let session: Session = Session::new(SessionConfig::default())?;
//!     session.connect(&Url::parse("tcp://127.0.0.1:9559")?).await?;
//!
//!     let echo = session.service("echo").await?;
//!     let answer = echo.call("reply", vec![AnyValue::str("ok")]).await?;
//!     assert_eq!(answer.as_str(), Some("ok"));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! inbound bytes ─► TransportSocket (frames) ─► Session (route by service)
//!     ─► BoundObject (decode, convert, invoke) ─► Future
//!     ─► reply adapter ─► serialized socket writer ─► outbound bytes
//! ```
//!
//! | Layer | Types |
//! |-------|-------|
//! | scheduling | [`Executor`], [`Strand`], [`PeriodicTask`] |
//! | values | [`Promise`], [`Future`], [`Signal`] |
//! | types | [`AnyValue`], [`Signature`], [`MetaObject`], [`ObjectBuilder`] |
//! | wire | [`wire::Message`], [`transport::TransportSocket`] |
//! | services | [`BoundObject`], [`ServiceDirectory`], [`Session`], [`RemoteObject`] |
//!
//! Reserved identifiers: service id 1 is the directory, object id 1 is a
//! service's main object, action ids below 80 address the bound-object
//! self-interface, 80–99 are reserved for manageable operations, user
//! members start at 100.

pub mod bound_object;
pub mod config;
pub mod directory;
pub mod error;
pub mod future;
pub mod net;
pub mod object_host;
pub mod remote_object;
pub mod runtime;
pub mod session;
pub mod signal;
pub mod socket_cache;
pub mod transport;
pub mod types;
pub mod url;
pub mod wire;

pub use bound_object::BoundObject;
pub use config::{SessionConfig, SessionConfigBuilder};
pub use directory::{ServiceDirectory, ServiceInfo};
pub use error::{Error, Result};
pub use future::{Future, FutureState, Promise};
pub use object_host::ObjectHost;
pub use remote_object::RemoteObject;
pub use runtime::{Executor, PeriodicTask, Strand};
pub use session::Session;
pub use signal::{CallType, Signal, SignalLink, SignalSubscriber};
pub use socket_cache::SocketCache;
pub use types::{AnyValue, MetaObject, ObjectBuilder, Signature};
pub use url::Url;

use std::sync::OnceLock;

/// The stable identifier of this host, used to prefer loopback endpoints
/// for same-machine connections.
///
/// Resolution order: `OMNIBUS_MACHINE_ID`, then `HOSTNAME`, then a random
/// id generated once per process. Initialised lazily; no teardown needed.
/// Sessions may override it through
/// [`SessionConfig::machine_id`](config::SessionConfig).
pub fn machine_id() -> String {
    static MACHINE_ID: OnceLock<String> = OnceLock::new();
    MACHINE_ID
        .get_or_init(|| {
            if let Ok(id) = std::env::var("OMNIBUS_MACHINE_ID") {
                if !id.is_empty() {
                    return id;
                }
            }
            if let Ok(host) = std::env::var("HOSTNAME") {
                if !host.is_empty() {
                    return host;
                }
            }
            // One random id per process lifetime.
            use std::collections::hash_map::RandomState;
            use std::hash::{BuildHasher, Hasher};
            let mut hasher = RandomState::new().build_hasher();
            hasher.write_u32(std::process::id());
            format!("machine-{:016x}", hasher.finish())
        })
        .clone()
}
