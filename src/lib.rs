//! Chaseapp core: the event-driven background layer of the chase tracker.
//!
//! - [`bus`]: durable publish/subscribe with `*`/`>` subject wildcards,
//!   at-least-once delivery and manual acknowledgement.
//! - [`worker`]: a supervised task manager and the background workers.
//! - [`ratelimit`]: per-client token buckets.
//! - [`cache`]: a small TTL cache.
//! - [`geo`]: DBSCAN clustering and minimum bounding rectangles.
//!
//! [`service::Background`] wires the workers together at boot.

pub mod bus;
pub mod cache;
pub mod config;
mod error;
pub mod event;
pub mod feeds;
pub mod geo;
pub mod model;
pub mod ratelimit;
pub mod scraper;
pub mod search;
pub mod service;
pub mod store;
pub mod webhook;
pub mod worker;

pub use bus::{EventBus, EventHandler, Subscription};
pub use config::AppConfig;
pub use error::Error;
pub use event::{Envelope, Event, Subject, SubjectPattern};
pub use service::{Background, Deps, Health};
pub use worker::{Manager, RestartPolicy};

pub type Result<T = ()> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::bus::{EventBus, EventHandler, Subscription};
    pub use crate::error::Error as ChaseError;
    pub use crate::event::{Event, subjects};
    pub use crate::worker::{Manager, RestartPolicy, run_interval};
}
