//! MQTT streaming transport for a service bridged onto a broker.
//!
//! Frames are published to `{prefix}/frames` and results arrive on
//! `{prefix}/detections`. A reader thread drives the rumqttc connection; the
//! session counts as established once the broker's CONNACK arrives.

use anyhow::{anyhow, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Event, Incoming, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::tls::{build_transport, TlsMaterials};
use super::{Connector, EventSink, ServiceEndpoint, Session, TransportEvent};
use crate::detect::{parse_detection_event, FrameMessage};

const REQUEST_CAPACITY: usize = 10;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Detection results carry an annotated frame; rumqttc's 10 KiB default is too small.
const MAX_PACKET_BYTES: u32 = 8 * 1024 * 1024;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct MqttConnector {
    topic_prefix: String,
    client_id: String,
    tls: TlsMaterials,
}

impl MqttConnector {
    pub fn new(topic_prefix: &str, client_id: &str, tls: TlsMaterials) -> Self {
        Self {
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            tls,
        }
    }

    pub fn frames_topic(&self) -> String {
        format!("{}/frames", self.topic_prefix)
    }

    pub fn detections_topic(&self) -> String {
        format!("{}/detections", self.topic_prefix)
    }
}

impl Connector for MqttConnector {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn connect(
        &self,
        endpoint: &ServiceEndpoint,
        timeout: Duration,
        sink: EventSink,
    ) -> Result<Box<dyn Session>> {
        let broker = &endpoint.broker;
        let mut options = MqttOptions::new(&self.client_id, &broker.host, broker.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        options.set_max_packet_size(Some(MAX_PACKET_BYTES));
        options.set_transport(build_transport(broker, &self.tls)?);

        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);
        let detections_topic = self.detections_topic();
        let closing = Arc::new(AtomicBool::new(false));
        let reader_alive = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

        let reader = {
            let closing = closing.clone();
            let reader_alive = reader_alive.clone();
            let topic = detections_topic.clone();
            std::thread::Builder::new()
                .name("mqtt-session".to_string())
                .spawn(move || {
                    let mut ready_tx = Some(ready_tx);
                    for event in connection.iter() {
                        match event {
                            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                                if let Some(tx) = ready_tx.take() {
                                    let _ = tx.send(Ok(()));
                                }
                            }
                            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                                if publish.topic.as_ref() != topic.as_bytes() {
                                    continue;
                                }
                                match parse_detection_event(&publish.payload) {
                                    Ok(Some(result)) => sink(TransportEvent::Detection(result)),
                                    Ok(None) => {}
                                    Err(e) => {
                                        if !closing.load(Ordering::SeqCst) {
                                            sink(TransportEvent::Failed(e.to_string()));
                                        }
                                        break;
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                if closing.load(Ordering::SeqCst) {
                                    break;
                                }
                                match ready_tx.take() {
                                    Some(tx) => {
                                        let _ = tx.send(Err(e.to_string()));
                                    }
                                    None => sink(TransportEvent::Failed(format!(
                                        "mqtt connection error: {}",
                                        e
                                    ))),
                                }
                                break;
                            }
                        }
                    }
                    reader_alive.store(false, Ordering::SeqCst);
                })
                .map_err(|e| anyhow!("spawn mqtt reader: {}", e))?
        };

        match ready_rx.recv_timeout(timeout) {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                let _ = reader.join();
                return Err(anyhow!("connect to broker {}: {}", broker, message));
            }
            Err(_) => {
                // Reader exits on its next connection error once `closing` is set.
                closing.store(true, Ordering::SeqCst);
                let _ = client.try_disconnect();
                return Err(anyhow!(
                    "connect to broker {} timed out after {}ms",
                    broker,
                    timeout.as_millis()
                ));
            }
        }

        if let Err(e) = client.subscribe(&detections_topic, QoS::AtMostOnce) {
            closing.store(true, Ordering::SeqCst);
            let _ = client.try_disconnect();
            let _ = reader.join();
            return Err(anyhow!("subscribe to {}: {}", detections_topic, e));
        }
        log::debug!(
            "mqtt transport ready: broker={} frames={} detections={}",
            broker,
            self.frames_topic(),
            detections_topic
        );

        Ok(Box::new(MqttSession {
            client,
            frames_topic: self.frames_topic(),
            closing,
            reader_alive,
            reader: Some(reader),
        }))
    }
}

struct MqttSession {
    client: Client,
    frames_topic: String,
    closing: Arc<AtomicBool>,
    reader_alive: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Session for MqttSession {
    fn transport(&self) -> &'static str {
        "mqtt"
    }

    fn send_frame(&mut self, frame: &FrameMessage) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(anyhow!("mqtt session closed"));
        }
        let payload = frame.to_json()?;
        match self
            .client
            .try_publish(&self.frames_topic, QoS::AtMostOnce, false, payload)
        {
            Ok(()) => Ok(()),
            Err(e) if self.reader_alive.load(Ordering::SeqCst) => {
                // Request queue full: drop this frame rather than queue behind it.
                log::debug!("mqtt frame dropped: {}", e);
                Ok(())
            }
            Err(e) => Err(anyhow!("publish frame to {}: {}", self.frames_topic, e)),
        }
    }

    fn close(&mut self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(reader) = self.reader.take() else {
            return;
        };
        // A failure reported by the reader closes the session on that thread,
        // and the reader is the only consumer of the request queue.
        if reader.thread().id() == std::thread::current().id() {
            let _ = self.client.try_disconnect();
            return;
        }
        if self.queue_disconnect(DISCONNECT_GRACE) {
            let _ = reader.join();
        } else {
            log::warn!("mqtt request queue stuck; detaching session reader");
        }
    }
}

impl MqttSession {
    /// Queue a DISCONNECT without blocking on a full request queue. Returns
    /// false if the queue stayed full for `grace`.
    fn queue_disconnect(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            match self.client.try_disconnect() {
                Ok(()) => return true,
                // Request queue already dropped by the exiting reader.
                Err(_) if !self.reader_alive.load(Ordering::SeqCst) => return true,
                Err(_) if Instant::now() >= deadline => return false,
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.close();
    }
}
