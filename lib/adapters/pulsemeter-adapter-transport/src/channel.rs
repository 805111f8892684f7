use std::collections::{BTreeMap, VecDeque};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use pulsemeter_ports::{Delivery, DeliveryTag, EventTransport};

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Delivery>,
    unacked: BTreeMap<DeliveryTag, Vec<u8>>,
    acked: Vec<DeliveryTag>,
    next_tag: DeliveryTag,
    connected: bool,
    closed: bool,
    failing_connects: u32,
    drop_connection: bool,
    connects: u32,
}

/// In-process broker with at-least-once semantics.
///
/// Messages handed out but not acknowledged are redelivered, in their
/// original order, after the connection drops.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    state: Mutex<State>,
    notify: Notify,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> DeliveryTag {
        let tag = {
            let mut state = self.state.lock();
            state.next_tag += 1;
            let tag = state.next_tag;
            state.pending.push_back(Delivery::new(tag, payload));
            tag
        };
        self.notify.notify_one();
        tag
    }

    pub fn publish_json<T: Serialize>(&self, message: &T) -> Result<DeliveryTag> {
        let payload = serde_json::to_vec(message).context("failed to encode message")?;
        Ok(self.publish(payload))
    }

    /// End the stream once everything published has been delivered.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().failing_connects = n;
    }

    /// Drop the connection at the next receive.
    pub fn drop_connection(&self) {
        self.state.lock().drop_connection = true;
        self.notify.notify_one();
    }

    pub fn acked(&self) -> Vec<DeliveryTag> {
        self.state.lock().acked.clone()
    }

    pub fn unacked(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }
}

#[async_trait]
impl EventTransport for ChannelTransport {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            bail!("broker refused connection");
        }
        state.connected = true;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Delivery>> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.connected {
                    bail!("not connected");
                }
                if state.drop_connection {
                    state.drop_connection = false;
                    state.connected = false;
                    let redeliver: Vec<Delivery> = std::mem::take(&mut state.unacked)
                        .into_iter()
                        .map(|(tag, payload)| Delivery::new(tag, payload))
                        .collect();
                    for delivery in redeliver.into_iter().rev() {
                        state.pending.push_front(delivery);
                    }
                    bail!("connection reset by broker");
                }
                if let Some(delivery) = state.pending.pop_front() {
                    state.unacked.insert(delivery.tag, delivery.payload.clone());
                    return Ok(Some(delivery));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            self.notify.notified().await;
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.state.lock();
        if state.unacked.remove(&tag).is_none() {
            bail!("unknown delivery tag {tag}");
        }
        state.acked.push(tag);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().connected = false;
        Ok(())
    }
}
