//! Topic-to-handler routing shared by both transports.
//!
//! The router is built once at startup and never mutated afterwards. The log
//! dispatch loop and the webhook endpoints both end in [`TopicRouter::dispatch`],
//! so handler code does not know which transport delivered the event.

use crate::bus::{EventHandler, HandlerError, TransportError, TransportResult};
use crate::types::{Event, Topic};
use std::fmt;
use std::sync::Arc;

/// Result of routing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The topic's handler completed
    Handled,
    /// No handler is registered for the topic
    Unrouted,
}

/// Immutable mapping from topic to exactly one handler.
#[derive(Clone)]
pub struct TopicRouter {
    routes: Vec<(Topic, Arc<dyn EventHandler>)>,
}

impl fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRouter")
            .field("topics", &self.topics())
            .finish()
    }
}

impl TopicRouter {
    /// Start building a router.
    pub fn builder() -> TopicRouterBuilder {
        TopicRouterBuilder::default()
    }

    /// Routed topics in registration order.
    pub fn topics(&self) -> Vec<Topic> {
        self.routes.iter().map(|(topic, _)| *topic).collect()
    }

    /// Whether `topic` has a handler.
    pub fn routes(&self, topic: Topic) -> bool {
        self.handler(topic).is_some()
    }

    /// Handler registered for `topic`.
    pub fn handler(&self, topic: Topic) -> Option<&Arc<dyn EventHandler>> {
        self.routes
            .iter()
            .find(|(routed, _)| *routed == topic)
            .map(|(_, handler)| handler)
    }

    /// Invoke the handler for the event's topic.
    pub async fn dispatch(&self, event: &Event) -> Result<DispatchOutcome, HandlerError> {
        let Some(handler) = self.handler(event.topic) else {
            tracing::debug!(topic = %event.topic, event_id = %event.id, "No handler for topic");
            return Ok(DispatchOutcome::Unrouted);
        };

        tracing::debug!(topic = %event.topic, event_id = %event.id, "Dispatching event");
        handler.handle(event).await?;
        Ok(DispatchOutcome::Handled)
    }
}

/// Builder for [`TopicRouter`].
#[derive(Default)]
pub struct TopicRouterBuilder {
    routes: Vec<(Topic, Arc<dyn EventHandler>)>,
    duplicates: Vec<Topic>,
}

impl TopicRouterBuilder {
    /// Route `topic` to `handler`.
    pub fn route(mut self, topic: Topic, handler: Arc<dyn EventHandler>) -> Self {
        if self.routes.iter().any(|(routed, _)| *routed == topic) {
            self.duplicates.push(topic);
        } else {
            self.routes.push((topic, handler));
        }
        self
    }

    /// Finish the router.
    ///
    /// Fails if a topic was routed more than once.
    pub fn build(self) -> TransportResult<TopicRouter> {
        if let Some(topic) = self.duplicates.first() {
            return Err(TransportError::ConfigurationError(format!(
                "topic {topic} has more than one handler"
            )));
        }
        Ok(TopicRouter {
            routes: self.routes,
        })
    }
}
