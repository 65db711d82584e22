// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tooling for sending/receiving publishes to/on multiple receivers which can be distributed in async contexts.

mod ordered_acker;
mod plenary_ack;

use std::collections::HashMap;
use std::string::FromUtf8Error;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::control_packet::{Publish, QoS};
use crate::error::AckError;
use crate::interface::{CompletionToken, MqttAck};
use crate::session::receiver::{
    ordered_acker::{OrderedAcker, PkidAckQueue, PkidError},
    plenary_ack::{PlenaryAck, PlenaryAckMember},
};
use crate::topic::{TopicFilter, TopicName, TopicParseError};

/// Token that can be used to acknowledge a received MQTT publish.
#[derive(Debug)]
pub struct AckToken(PlenaryAckMember);

impl AckToken {
    /// Acknowledge the received Publish message and return a [`CompletionToken`] for the completion
    /// of the acknowledgement process.
    ///
    /// # Errors
    /// Returns an [`AckError`] if the Publish message could not be acknowledged.
    pub async fn ack(self) -> Result<CompletionToken, AckError> {
        self.0.ack().await
    }
}

// NOTE: We need to use unbounded channels, because there is no way to know how many
// publishes may be in-flight. The MQTT client can specify a receive_maximum, yes,
// but that only applies to QoS1 and QoS2. There is no limit on QoS0.
// See 3.1.2.11.3 in the MQTT 5.0 spec.
pub type PublishTx = UnboundedSender<(Publish, Option<AckToken>)>;
pub type PublishRx = UnboundedReceiver<(Publish, Option<AckToken>)>;

// NOTE: These errors should never happen in correct usage.
// - Invalid publish topics should not happen, since we shouldn't be receiving Publishes from the
// broker that are invalid.
// - Invalid publish PKIDs should not happen, as PKIDs should not be re-used until the previous
// PKID has been acked.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("could not get topic from publish: {0}")]
    InvalidPublishTopic(#[from] InvalidPublish),
    #[error("packet ID for publish invalid: {0}")]
    InvalidPublishPkid(#[from] PkidError),
}

// NOTE: if/when Publish is reimplemented, this logic should probably move there.
#[derive(Error, Debug)]
pub enum InvalidPublish {
    #[error("invalid UTF-8")]
    TopicNameUtf8(#[from] FromUtf8Error),
    #[error("invalid topic: {0}")]
    TopicNameFormat(#[from] TopicParseError),
}

#[derive(Default)]
pub struct PublishReceiverManager {
    filtered_txs: HashMap<TopicFilter, Vec<PublishTx>>,
    unfiltered_txs: Vec<PublishTx>,
}

impl PublishReceiverManager {
    /// Create a new [`PublishRx`] that will receive dispatched [`Publish`]es that match the
    /// provided topic filter for as long as it is open.
    ///
    /// Multiple receivers can be created for the same topic filter, or with overlapping wildcard
    /// topic filters. Each receiver will receive all publishes that match the topic filter.
    ///
    /// # Arguments
    /// * `topic_filter` - The topic filter to match incoming publishes against
    pub fn create_filtered_receiver(&mut self, topic_filter: &TopicFilter) -> PublishRx {
        // NOTE: We prune the filtered txs before registering any more to ensure that closed
        // txs (or entire vectors of txs) don't stick around in the HashMap indefinitely, making
        // dispatching more expensive. We also do cleanup during a dispatch, but since dispatching
        // only looks at the elements of vectors that are relevant to a given dispatch (i.e. lazy pruning),
        // we still need to do a full pruning when registering new tx filters.
        self.prune_filtered_txs();

        let (tx, rx) = unbounded_channel();
        match self.filtered_txs.get_mut(topic_filter) {
            // If the topic filter is already in use, add to the associated vector
            Some(v) => {
                v.push(tx);
                // Otherwise, create a new vector and add
            }
            _ => {
                self.filtered_txs.insert(topic_filter.clone(), vec![tx]);
            }
        }

        rx
    }

    /// Create a new [`PublishRx`] that will receive all dispatched [`Publish`]es that do not
    /// match the topic filters for any other filtered [`PublishRx`]s, for as long as it
    /// is open.
    ///
    /// Multiple unfiltered receivers can be created, and each will receive all publishes that are
    /// not matched by any filtered receiver.
    pub fn create_unfiltered_receiver(&mut self) -> PublishRx {
        // NOTE: unlike when creating a filtered receiver, we don't need to prune the
        // vector of any closed unfiltered txs here. Since there's not a HashMap, the lazy cleanup
        // during dispatch is sufficient.

        let (tx, rx) = unbounded_channel();
        self.unfiltered_txs.push(tx);
        rx
    }

    /// Remove any closed filter receivers.
    ///
    /// Call this before any register
    /// Note that the runtime is O(c * m) and not O(n * m) as it may seem.
    /// (c = capacity, m = max number of duplicate listeners on a filter, n = number of filters).
    fn prune_filtered_txs(&mut self) {
        self.filtered_txs.retain(|_, v| {
            v.retain(|tx| !tx.is_closed());
            !v.is_empty()
        });
    }
}

/// Manager for creating and dispatching messages to [`PublishRx`]s.
pub struct IncomingPublishDispatcher<A>
where
    A: MqttAck + Clone + Send + Sync + 'static,
{
    acker: OrderedAcker<A>,
    pkid_ack_queue: Arc<Mutex<PkidAckQueue>>,
    receiver_manager: Arc<Mutex<PublishReceiverManager>>,
}

impl<A> IncomingPublishDispatcher<A>
where
    A: MqttAck + Clone + Send + Sync + 'static,
{
    /// Create a new [`IncomingPublishDispatcher`] with the provided acker.
    ///
    /// # Arguments
    /// * `acker` - The acker to use for acknowledging incoming publishes
    pub fn new(acker: A) -> Self {
        let pkid_ack_queue = Arc::new(Mutex::new(PkidAckQueue::default()));
        let acker = OrderedAcker::new(acker, pkid_ack_queue.clone());
        Self {
            acker,
            pkid_ack_queue,
            receiver_manager: Arc::new(Mutex::new(PublishReceiverManager::default())),
        }
    }

    // Get a shared reference to the [`PublishReceiverManager`] for this dispatcher.
    pub fn get_receiver_manager(&self) -> Arc<Mutex<PublishReceiverManager>> {
        self.receiver_manager.clone()
    }

    /// Dispatch a [`Publish`] to all relevant receivers.
    ///
    /// The [`Publish`] will be sent to any filtered receivers that correspond to the topic name.
    /// If no filtered receivers that match the [`Publish`] topic name are present, the [`Publish`]
    /// will be sent to all unfiltered receivers.
    ///
    /// Returns the number of receivers that the [`Publish`] was dispatched to.
    ///
    /// Note that once a publish is successfully dispatched (even to 0 receivers), the
    /// [`IncomingPublishDispatcher`] has taken responsibility for acknowledging the publish.
    ///
    /// # Arguments
    /// * `publish` - The [`Publish`] to dispatch to receivers
    ///
    /// # Errors
    /// Returns a [`DispatchError`] if the dispatch fails.
    pub fn dispatch_publish(&mut self, publish: &Publish) -> Result<usize, DispatchError> {
        let topic_name = extract_publish_topic_name(publish)?;

        // Check if the incoming publish is a duplicate of a publish that is already in the
        // PKID queue.
        if publish.dup && self.pkid_ack_queue.lock().unwrap().contains(publish.pkid) {
            // NOTE: A client is required to treat received duplicates as a new application message
            // as per MQTTv5 spec 4.3.2. However, this is only true when a publish with the same PKID
            // has previously been acked, because it then becomes impossible to tell if this duplicate
            // was a redelivery of the previous message, or a redelivery of another message with the
            // same PKID that was lost.
            //
            // In this case, if we have that same PKID in the queue, we know that the duplicate
            // is for the same publish we are still waiting to ack, because the PKID would not
            // be available for re-use by the broker until that publish was acked.
            // As per MQTTv5 spec 4.3.2-5, we only must treat duplicates as new application
            // messages if we have not yet acked.
            // Thus, we can safely discard the duplicate without dispatching.
            // In fact, this is necessary for the correct acking of publishes that were
            // previously dispatched to the receivers.

            log::debug!(
                "Duplicate PUB received for PUB already owned (PKID {}). Discarding",
                publish.pkid
            );
            return Ok(0);
        }

        // Prepare the PlenaryAck for distributed acking
        let plenary_ack = {
            if publish.qos == QoS::AtMostOnce {
                None
            } else {
                // Insert the PKID into the PKID queue for ordered acking
                self.pkid_ack_queue.lock().unwrap().insert(publish.pkid)?;
                // Create an acking future for use with a PlenaryAck
                let ack_f = {
                    let acker = self.acker.clone();
                    let publish = publish.clone();
                    async move {
                        let result = acker.ordered_ack(&publish).await;
                        if result.is_ok() {
                            log::debug!("Sent ACK for PKID {}", publish.pkid);
                        } else {
                            // NOTE: can't get the error out of the option enum since we must
                            // return it to the caller.
                            log::error!("ACK failed for PKID {}", publish.pkid);
                        }
                        result
                    }
                };
                Some(PlenaryAck::new(ack_f))
            }
        };

        // Dispatch the publish to all relevant receivers
        let mut num_dispatches = 0;
        // First, dispatch to all filtered receivers that match the topic name
        num_dispatches += self.dispatch_filtered(&topic_name, publish, plenary_ack.as_ref());
        // Then, if no filters matched, dispatch to all unfiltered receivers (if present)
        if num_dispatches == 0 {
            num_dispatches += self.dispatch_unfiltered(publish, plenary_ack.as_ref());
        }

        log::debug!(
            "Dispatched PUB with PKID {} to {num_dispatches} receivers.",
            publish.pkid
        );

        // Once all dispatches have been made, commence the plenary ack
        if let Some(plenary_ack) = plenary_ack {
            plenary_ack.commence();
        }

        Ok(num_dispatches)
    }

    /// Dispatch to filtered receivers
    fn dispatch_filtered(
        &mut self,
        topic_name: &TopicName,
        publish: &Publish,
        plenary_ack: Option<&PlenaryAck>,
    ) -> usize {
        let mut num_dispatches = 0;
        let mut closed = vec![]; // (topic filter, position in vector)

        let mut receiver_manager = self.receiver_manager.lock().unwrap();

        let filtered = receiver_manager
            .filtered_txs
            .iter()
            .filter(|(topic_filter, _)| topic_filter.matches_topic_name(topic_name));
        for (topic_filter, v) in filtered {
            for (pos, tx) in v.iter().enumerate() {
                // Send the publish to the receiver, along with an ack token
                // If the receiver is closed, add it to the list of closed receivers to remove after iteration.
                // NOTE: Removing closed receivers must be done dynamically because the awaitable send allows
                // for a channel to be closed sometime during the execution of this loop. You cannot simply
                // use .prune() before the loop.
                match tx.send((publish.clone(), create_ack_token(plenary_ack))) {
                    Ok(()) => num_dispatches += 1,
                    Err(_) => closed.push((topic_filter.clone(), pos)),
                }
            }
        }

        // Remove any closed receivers.
        // NOTE: Do this in reverse order to avoid index issues.
        for (topic_filter, pos) in closed.iter().rev() {
            if let Some(v) = receiver_manager.filtered_txs.get_mut(topic_filter) {
                v.remove(*pos);
                if v.is_empty() {
                    receiver_manager.filtered_txs.remove(topic_filter);
                }
            }
        }

        num_dispatches
    }

    /// Dispatch to unfiltered receivers
    fn dispatch_unfiltered(
        &mut self,
        publish: &Publish,
        plenary_ack: Option<&PlenaryAck>,
    ) -> usize {
        let mut num_dispatches = 0;
        let mut closed = vec![];

        let mut receiver_manager = self.receiver_manager.lock().unwrap();

        for (pos, tx) in receiver_manager.unfiltered_txs.iter().enumerate() {
            // Send the publish to the receiver, along with an ack token
            // If the receiver is closed, add it to the list of closed receivers to remove after iteration.
            // NOTE: Removing closed receivers must be done dynamically because the awaitable send allows
            // for a channel to be closed sometime during the execution of this loop
            match tx.send((publish.clone(), create_ack_token(plenary_ack))) {
                Ok(()) => num_dispatches += 1,
                Err(_) => closed.push(pos),
            }
        }

        // Remove any closed receivers.
        // NOTE: Do this in reverse order to avoid index issues.
        for pos in closed.iter().rev() {
            receiver_manager.unfiltered_txs.remove(*pos);
        }

        num_dispatches
    }
}

fn extract_publish_topic_name(publish: &Publish) -> Result<TopicName, InvalidPublish> {
    Ok(TopicName::from_string(String::from_utf8(
        publish.topic.to_vec(),
    )?)?)
}

fn create_ack_token(plenary_ack: Option<&PlenaryAck>) -> Option<AckToken> {
    plenary_ack.map(|plenary_ack| AckToken(plenary_ack.create_member()))
}
