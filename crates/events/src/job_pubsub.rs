//! Job progress broadcaster: a [`TopicBus`] keyed by job id carrying [`State`].

use cms_core::JobId;
use cms_job::{Job, State};

use crate::bus::{PubSubError, Subscription};
use crate::topic_bus::TopicBus;

/// Process-wide job state broadcaster.
///
/// Construct once at startup and share it (`Arc<JobPubSub>`) between job
/// runners and observers.
pub type JobPubSub = TopicBus<JobId, State>;

/// Live feed of one job's states.
pub type JobSubscription = Subscription<State>;

impl TopicBus<JobId, State> {
    /// Broadcast the current state of `job`.
    pub fn publish_job(&self, job: &Job) -> Result<(), PubSubError> {
        self.publish(&job.id(), job.state())
    }
}
