//! NATS transport for bus messages and control requests.
//!
//! A [`Destination`] maps onto a NATS subject named after the destination.
//! Broadcast destinations use a plain subscription. Point-to-point
//! destinations use a queue group so that each request reaches exactly
//! one engine instance.

use async_nats::{Client, Subject, Subscriber};
use async_trait::async_trait;
use daqflow_core::control::{InboundControl, ReplyHandle};
use daqflow_core::publisher::{EventPublisher, PublishError};
use daqflow_types::{BusMessage, ControlResponse, Destination, Discipline};
use futures::{Stream, StreamExt};
use tracing::{debug, info};

use crate::error::EngineError;

/// Queue group shared by competing engine instances.
pub const QUEUE_GROUP: &str = "daqflow";

/// The NATS subject carrying a destination's traffic.
pub fn subject_for(destination: &Destination) -> String {
    destination.name().to_owned()
}

/// Connect to the NATS server at `url`.
///
/// # Errors
///
/// Returns [`EngineError::Nats`] if the connection cannot be established.
pub async fn connect(url: &str) -> Result<Client, EngineError> {
    let client = async_nats::connect(url).await.map_err(|e| EngineError::Nats {
        message: format!("failed to connect to {url}: {e}"),
    })?;
    info!(url, "Connected to NATS");
    Ok(client)
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Whether a message must reach the server before `publish` returns.
///
/// `Client::publish` only queues into the client buffer. The end of a run
/// and the terminal status reports are flushed so that a lost connection
/// surfaces as a transport error the caller's retry policy can act on.
pub const fn requires_flush(message: &BusMessage) -> bool {
    matches!(
        message,
        BusMessage::EndRun(_)
            | BusMessage::WorkflowCompleted(_)
            | BusMessage::WorkflowStopped(_)
            | BusMessage::WorkflowFailed(_)
    )
}

/// Publishes bus messages as JSON on the destination's subject.
#[derive(Clone)]
pub struct NatsPublisher {
    client: Client,
}

impl NatsPublisher {
    /// Wrap an existing connection.
    pub const fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventPublisher for NatsPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        message: &BusMessage,
    ) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(message)?;
        self.client
            .publish(subject_for(destination), payload.into())
            .await
            .map_err(|e| PublishError::Transport {
                message: format!("publish to {destination} failed: {e}"),
            })?;
        if requires_flush(message) {
            self.client
                .flush()
                .await
                .map_err(|e| PublishError::Transport {
                    message: format!("flush after {} to {destination} failed: {e}", message.msg_type()),
                })?;
        }
        debug!(
            destination = %destination,
            msg_type = message.msg_type(),
            "Published bus message"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Control subscription
// ---------------------------------------------------------------------------

/// Answers a control request on the requester's reply subject.
struct NatsReply {
    client: Client,
    subject: Subject,
}

#[async_trait]
impl ReplyHandle for NatsReply {
    async fn reply(self: Box<Self>, response: &ControlResponse) -> Result<(), PublishError> {
        let Self { client, subject } = *self;
        let payload = serde_json::to_vec(response)?;
        client
            .publish(subject, payload.into())
            .await
            .map_err(|e| PublishError::Transport {
                message: format!("reply publish failed: {e}"),
            })?;
        client.flush().await.map_err(|e| PublishError::Transport {
            message: format!("reply flush failed: {e}"),
        })
    }
}

/// Subscribe to the control destination.
///
/// # Errors
///
/// Returns [`EngineError::Nats`] if the subscription is refused.
pub async fn subscribe_control(
    client: &Client,
    destination: &Destination,
) -> Result<Subscriber, EngineError> {
    let subject = subject_for(destination);
    let result = match destination.discipline() {
        Discipline::PointToPoint => {
            client
                .queue_subscribe(subject.clone(), QUEUE_GROUP.to_owned())
                .await
        }
        Discipline::Broadcast => client.subscribe(subject.clone()).await,
    };
    let subscriber = result.map_err(|e| EngineError::Nats {
        message: format!("failed to subscribe to {subject}: {e}"),
    })?;
    info!(subject, discipline = ?destination.discipline(), "Subscribed to control requests");
    Ok(subscriber)
}

/// Turn a control subscription into the listener's inbound stream.
///
/// Messages without a reply subject are still dispatched; their response
/// is only logged.
pub fn control_stream(
    client: Client,
    subscriber: Subscriber,
) -> impl Stream<Item = InboundControl> + Unpin + Send + 'static {
    subscriber.map(move |message| InboundControl {
        payload: message.payload.to_vec(),
        reply: message.reply.map(|subject| {
            Box::new(NatsReply {
                client: client.clone(),
                subject,
            }) as Box<dyn ReplyHandle>
        }),
    })
}
