//! In-process job progress broadcasting.
//!
//! `bus` holds the transport-agnostic contract, `topic_bus` the keyed,
//! cached, drop-on-full implementation, and `job_pubsub` its instantiation
//! for job states.

pub mod bus;
pub mod job_pubsub;
pub mod topic_bus;

pub use bus::{KeyedBus, PubSubError, Subscription};
pub use job_pubsub::{JobPubSub, JobSubscription};
pub use topic_bus::{SUBSCRIBER_BUFFER, TopicBus};
