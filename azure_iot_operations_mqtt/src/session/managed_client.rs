// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Internal implementation of [`SessionManagedClient`] and [`SessionPubReceiver`].

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::control_packet::{
    Publish, PublishProperties, QoS, SubscribeProperties, UnsubscribeProperties,
};
use crate::error::ClientError;
use crate::interface::{AckToken, CompletionToken, ManagedClient, MqttPubSub, PubReceiver};
use crate::session::receiver::{PublishReceiverManager, PublishRx};
use crate::topic::{TopicFilter, TopicParseError};

/// An MQTT client that has it's connection state externally managed by a [`Session`](super::Session).
/// Can be used to send messages and create receivers for incoming messages.
#[derive(Clone)]
pub struct SessionManagedClient<PS>
where
    PS: MqttPubSub + Clone + Send + Sync,
{
    /// Client ID of the `Session` that manages this client
    pub(crate) client_id: String,
    /// `PubSub` for sending outgoing MQTT messages
    pub(crate) pub_sub: PS,
    /// Manager for incoming publishes dispatched by the `Session`
    pub(crate) receiver_manager: Arc<Mutex<PublishReceiverManager>>,
}

impl<PS> ManagedClient for SessionManagedClient<PS>
where
    PS: MqttPubSub + Clone + Send + Sync,
{
    type PubReceiver = SessionPubReceiver;

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn create_filtered_pub_receiver(
        &self,
        topic_filter: &str,
    ) -> Result<SessionPubReceiver, TopicParseError> {
        let topic_filter = TopicFilter::from_str(topic_filter)?;
        let rx = self
            .receiver_manager
            .lock()
            .unwrap()
            .create_filtered_receiver(&topic_filter);
        Ok(SessionPubReceiver::new(rx))
    }

    fn create_unfiltered_pub_receiver(&self) -> SessionPubReceiver {
        let rx = self
            .receiver_manager
            .lock()
            .unwrap()
            .create_unfiltered_receiver();
        SessionPubReceiver::new(rx)
    }
}

#[async_trait]
impl<PS> MqttPubSub for SessionManagedClient<PS>
where
    PS: MqttPubSub + Clone + Send + Sync,
{
    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub.publish(topic, qos, retain, payload).await
    }

    async fn publish_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub
            .publish_with_properties(topic, qos, retain, payload, properties)
            .await
    }

    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub.subscribe(topic, qos).await
    }

    async fn subscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        properties: SubscribeProperties,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub
            .subscribe_with_properties(topic, qos, properties)
            .await
    }

    async fn unsubscribe(
        &self,
        topic: impl Into<String> + Send,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub.unsubscribe(topic).await
    }

    async fn unsubscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        properties: UnsubscribeProperties,
    ) -> Result<CompletionToken, ClientError> {
        self.pub_sub
            .unsubscribe_with_properties(topic, properties)
            .await
    }
}

/// Receive incoming MQTT messages dispatched by a [`Session`](super::Session).
///
/// Publishes with Quality of Service 1 or 2 are accompanied by an [`AckToken`] that must be used
/// (or dropped) to acknowledge the publish. Dropping the [`AckToken`] without explicitly calling
/// [`AckToken::ack`] will still acknowledge the publish, but without the ability to await
/// completion of the acknowledgement.
pub struct SessionPubReceiver {
    pub_rx: PublishRx,
}

impl SessionPubReceiver {
    fn new(pub_rx: PublishRx) -> Self {
        Self { pub_rx }
    }
}

#[async_trait]
impl PubReceiver for SessionPubReceiver {
    async fn recv(&mut self) -> Option<Publish> {
        let (publish, ack_token) = self.pub_rx.recv().await?;
        if let Some(ack_token) = ack_token {
            // Auto-ack, but don't block on completion.
            tokio::spawn(async move {
                match ack_token.ack().await {
                    Ok(ct) => {
                        if let Err(e) = ct.await {
                            log::error!("Auto-ack completion failed: {e:?}");
                        }
                    }
                    Err(e) => {
                        log::error!(
                            "Auto-ack failed. Publish may be redelivered. Reason: {e:?}"
                        );
                    }
                }
            });
        }
        Some(publish)
    }

    async fn recv_manual_ack(&mut self) -> Option<(Publish, Option<AckToken>)> {
        self.pub_rx.recv().await
    }

    fn close(&mut self) {
        self.pub_rx.close();
    }
}
