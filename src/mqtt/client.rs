use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnAck, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    SubscribeFilter, TlsConfiguration, Transport,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::{DeviceConfig, SessionSettings};

use super::subscriptions::{SubscribeReply, Subscriptions};
use super::{Connector, DriverTask, MqttMessage, Session, SessionError};

struct SubscribeRequest {
    topic: String,
    handler: mpsc::Sender<MqttMessage>,
    reply: SubscribeReply,
}

/// Opens mutually authenticated MQTT sessions, one per device.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    settings: SessionSettings,
}

impl MqttConnector {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }

    /// Connection options for `device`, including its TLS client identity read from disk.
    pub fn options(&self, device: &DeviceConfig) -> Result<MqttOptions, SessionError> {
        let certs = &self.settings.certs;
        let tls = TlsConfiguration::Simple {
            ca: read_pem(&certs.root_ca)?,
            alpn: None,
            client_auth: Some((read_pem(&certs.certificate)?, read_pem(&certs.private_key)?)),
        };

        let client_id = self.settings.client_id(device);
        let mut mqttopts = MqttOptions::new(client_id, &device.endpoint, self.settings.port);
        mqttopts
            .set_keep_alive(self.settings.keep_alive)
            .set_clean_session(false)
            .set_transport(Transport::Tls(tls));
        Ok(mqttopts)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, SessionError> {
    std::fs::read(path).map_err(|source| SessionError::Certificate {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl Connector for MqttConnector {
    type Session = MqttSession;

    /// Connects and waits for the broker's CONNACK. The returned driver must be polled
    /// for the session to make progress.
    async fn connect(
        &self,
        device: &DeviceConfig,
    ) -> Result<(MqttSession, DriverTask), SessionError> {
        let mqttopts = self.options(device)?;
        let client_id = mqttopts.client_id();
        let (client, mut eventloop) = AsyncClient::new(mqttopts, self.settings.request_capacity);

        info!("Connecting to {} with client ID {}", device.endpoint, client_id);
        let handshake = await_connack(&mut eventloop);
        let ack = match tokio::time::timeout(self.settings.connect_timeout, handshake).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(source)) => {
                warn!("Connection failed with error: {}", source);
                return Err(SessionError::Connect {
                    endpoint: device.endpoint.clone(),
                    source,
                });
            }
            Err(_) => {
                warn!("Connection to {} timed out", device.endpoint);
                return Err(SessionError::ConnectTimeout {
                    endpoint: device.endpoint.clone(),
                    timeout: self.settings.connect_timeout,
                });
            }
        };
        info!(
            "Connection successful with return code: {:?} session present: {}",
            ack.code, ack.session_present
        );

        let (session, driver) = start_session(&device.uuid, client, eventloop, &self.settings);
        Ok((session, Box::pin(driver.run())))
    }
}

/// Pairs a connected client with the driver that owns its event loop.
fn start_session(
    uuid: &str,
    client: AsyncClient,
    eventloop: EventLoop,
    settings: &SessionSettings,
) -> (MqttSession, SessionDriver) {
    let (request_tx, request_rx) = mpsc::channel(32);
    let driver = SessionDriver {
        uuid: uuid.to_string(),
        client: client.clone(),
        eventloop,
        requests: request_rx,
        subscriptions: Subscriptions::new(),
        settings: settings.clone(),
        connected: true,
    };

    let session = MqttSession {
        client,
        requests: request_tx,
        ack_timeout: settings.connect_timeout,
    };
    (session, driver)
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<ConnAck, ConnectionError> {
    loop {
        if let Event::Incoming(Incoming::ConnAck(ack)) = eventloop.poll().await? {
            return Ok(ack);
        }
    }
}

/// Handle to an established session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MqttSession {
    client: AsyncClient,
    requests: mpsc::Sender<SubscribeRequest>,
    ack_timeout: Duration,
}

#[async_trait]
impl Session for MqttSession {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        self.client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }

    /// Gives up with `Interrupted` when no SUBACK arrives within the connect timeout.
    async fn subscribe(
        &self,
        topic: &str,
        handler: mpsc::Sender<MqttMessage>,
    ) -> Result<QoS, SessionError> {
        info!("Subscribing to topic '{}'...", topic);
        let (reply, outcome) = oneshot::channel();
        let request = SubscribeRequest {
            topic: topic.to_string(),
            handler,
            reply,
        };
        self.requests.send(request).await.map_err(|_| SessionError::DriverStopped)?;
        match tokio::time::timeout(self.ack_timeout, outcome).await {
            Ok(outcome) => outcome.map_err(|_| SessionError::DriverStopped)?,
            Err(_) => {
                warn!("No acknowledgement for '{}' after {:?}", topic, self.ack_timeout);
                Err(SessionError::Interrupted)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.client.disconnect().await?;
        Ok(())
    }
}

/// Drives one session's event loop: reports connection lifecycle, pairs SUBACKs with
/// their requests, routes incoming publishes and restores subscriptions the broker lost.
struct SessionDriver {
    uuid: String,
    client: AsyncClient,
    eventloop: EventLoop,
    requests: mpsc::Receiver<SubscribeRequest>,
    subscriptions: Subscriptions,
    settings: SessionSettings,
    connected: bool,
}

impl SessionDriver {
    async fn run(mut self) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(ack))) => self.on_connack(ack),
                        Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                            let settled =
                                self.subscriptions.acknowledge(ack.pkid, &ack.return_codes);
                            if let Err(e) = settled {
                                error!("Device {}: {}", self.uuid, e);
                                return Err(e);
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            self.subscriptions.dispatch(&publish)
                        }
                        Ok(Event::Incoming(Incoming::Disconnect))
                        | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                            info!("Device {}: connection closed", self.uuid);
                            return Ok(());
                        }
                        Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                            self.subscriptions.bind(pkid)
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if self.connected {
                                warn!("Device {}: connection interrupted. error: {}", self.uuid, e);
                                self.connected = false;
                                self.subscriptions.interrupted();
                            } else {
                                warn!("Device {}: connection failed with error: {}", self.uuid, e);
                            }
                            tokio::time::sleep(self.settings.reconnect_delay).await;
                        }
                    }
                }
                Some(request) = self.requests.recv() => self.on_subscribe_request(request),
            }
        }
    }

    fn on_connack(&mut self, ack: ConnAck) {
        info!(
            "Device {}: connection successful with return code: {:?} session present: {}",
            self.uuid, ack.code, ack.session_present
        );
        if !self.connected {
            info!(
                "Device {}: connection resumed. return_code: {:?} session_present: {}",
                self.uuid, ack.code, ack.session_present
            );
        }
        self.connected = true;

        if !Subscriptions::resubscribe_needed(ack.code, ack.session_present) {
            return;
        }
        self.subscriptions.supersede_pending();
        let topics = self.subscriptions.topics();
        if topics.is_empty() {
            return;
        }

        info!(
            "Device {}: session did not persist. Resubscribing to existing topics...",
            self.uuid
        );
        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtLeastOnce));
        match self.client.try_subscribe_many(filters) {
            Ok(()) => self.subscriptions.queue_resubscribe(topics),
            Err(e) => warn!("Device {}: failed to request resubscribe: {}", self.uuid, e),
        }
    }

    fn on_subscribe_request(&mut self, request: SubscribeRequest) {
        self.subscriptions.track(&request.topic, request.handler);
        match self.client.try_subscribe(&request.topic, QoS::AtLeastOnce) {
            Ok(()) => self.subscriptions.queue_subscribe(&request.topic, request.reply),
            Err(e) => {
                self.subscriptions.untrack(&request.topic);
                let _ = request.reply.send(Err(e.into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertPaths;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const GRANTED: u8 = 0x01;
    const REJECTED: u8 = 0x80;

    fn settings(certs_dir: &Path) -> SessionSettings {
        SessionSettings {
            port: 8883,
            keep_alive: Duration::from_secs(30),
            client_id_prefix: "telebrella-".to_string(),
            connect_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(10),
            request_capacity: 10,
            certs: CertPaths {
                certificate: certs_dir.join("app-cert.pem.crt"),
                private_key: certs_dir.join("app-private.pem.key"),
                root_ca: certs_dir.join("AmazonRootCA1.pem"),
            },
        }
    }

    fn device() -> DeviceConfig {
        DeviceConfig {
            uuid: "a1".to_string(),
            endpoint: "abc-ats.iot.eu-west-1.amazonaws.com".to_string(),
            cmd_topic: "telebrella/a1/cmd".to_string(),
            fdbk_topic: "telebrella/a1/fdbk".to_string(),
        }
    }

    fn certs_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("telebrella-certs-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Reads one MQTT packet, returning its first header byte and its body.
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.unwrap();
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            length |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    /// Accepts the next client and answers its CONNECT.
    async fn accept(listener: &TcpListener, session_present: bool) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await;
        assert_eq!(header, 0x10);
        stream.write_all(&[0x20, 0x02, u8::from(session_present), 0x00]).await.unwrap();
        stream
    }

    /// Reads a SUBSCRIBE and returns its packet id and topic filters.
    async fn read_subscribe(stream: &mut TcpStream) -> (u16, Vec<String>) {
        let (header, body) = read_packet(stream).await;
        assert_eq!(header, 0x82);
        let pkid = u16::from_be_bytes([body[0], body[1]]);
        let mut topics = Vec::new();
        let mut rest = &body[2..];
        while !rest.is_empty() {
            let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
            topics.push(String::from_utf8(rest[2..2 + len].to_vec()).unwrap());
            // Skip the requested QoS byte.
            rest = &rest[3 + len..];
        }
        (pkid, topics)
    }

    async fn write_suback(stream: &mut TcpStream, pkid: u16, codes: &[u8]) {
        let mut packet = vec![0x90, 2 + codes.len() as u8];
        packet.extend_from_slice(&pkid.to_be_bytes());
        packet.extend_from_slice(codes);
        stream.write_all(&packet).await.unwrap();
    }

    /// Grants `count` single-topic subscriptions on `stream`.
    async fn grant(stream: &mut TcpStream, count: usize) {
        for _ in 0..count {
            let (pkid, _) = read_subscribe(stream).await;
            write_suback(stream, pkid, &[GRANTED]).await;
        }
    }

    /// Connects a plain TCP session to the broker on `port` and starts its driver.
    async fn local_session(
        port: u16,
        ack_timeout: Duration,
    ) -> (MqttSession, JoinHandle<Result<(), SessionError>>) {
        let mut mqttopts = MqttOptions::new("telebrella-a1", "127.0.0.1", port);
        mqttopts.set_keep_alive(Duration::from_secs(60)).set_clean_session(false);
        let (client, mut eventloop) = AsyncClient::new(mqttopts, 10);
        await_connack(&mut eventloop).await.unwrap();

        let mut settings = settings(Path::new("unused"));
        settings.connect_timeout = ack_timeout;
        let (session, driver) = start_session("a1", client, eventloop, &settings);
        (session, tokio::spawn(driver.run()))
    }

    #[test]
    fn options_describe_a_persistent_tls_session() {
        let dir = certs_dir("complete");
        let pem = "-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n";
        for file in ["app-cert.pem.crt", "app-private.pem.key", "AmazonRootCA1.pem"] {
            std::fs::write(dir.join(file), pem).unwrap();
        }
        let connector = MqttConnector::new(settings(&dir));

        let mqttopts = connector.options(&device()).unwrap();

        assert_eq!(mqttopts.client_id(), "telebrella-a1");
        assert_eq!(
            mqttopts.broker_address(),
            ("abc-ats.iot.eu-west-1.amazonaws.com".to_string(), 8883)
        );
        assert_eq!(mqttopts.keep_alive(), Duration::from_secs(30));
        assert!(!mqttopts.clean_session());
        assert!(matches!(mqttopts.transport(), Transport::Tls(_)));
    }

    #[test]
    fn options_report_missing_certificate_material() {
        let dir = certs_dir("missing");
        std::fs::write(dir.join("AmazonRootCA1.pem"), "ca").unwrap();
        let connector = MqttConnector::new(settings(&dir));

        match connector.options(&device()) {
            Err(SessionError::Certificate { path, .. }) => {
                assert_eq!(path, dir.join("app-cert.pem.crt"))
            }
            other => panic!("Expected a certificate error, found {other:?}"),
        }
    }

    #[tokio::test]
    async fn lost_session_is_restored_with_one_subscribe_for_every_topic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let mut first = accept(&listener, false).await;
            grant(&mut first, 2).await;
            drop(first);

            let mut second = accept(&listener, false).await;
            let (pkid, topics) = read_subscribe(&mut second).await;
            write_suback(&mut second, pkid, &vec![GRANTED; topics.len()]).await;
            (topics, second)
        });

        let (session, driver) = local_session(port, Duration::from_secs(5)).await;
        let (tx, _rx) = mpsc::channel(4);
        session.subscribe("telebrella/a1/fdbk", tx.clone()).await.unwrap();
        session.subscribe("telebrella/b2/fdbk", tx).await.unwrap();

        let (topics, _connection) = timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
        assert_eq!(
            topics,
            vec!["telebrella/a1/fdbk".to_string(), "telebrella/b2/fdbk".to_string()]
        );
        assert!(!driver.is_finished());
        driver.abort();
    }

    #[tokio::test]
    async fn rejected_resubscribe_stops_the_driver() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let mut first = accept(&listener, false).await;
            grant(&mut first, 1).await;
            drop(first);

            let mut second = accept(&listener, false).await;
            let (pkid, topics) = read_subscribe(&mut second).await;
            write_suback(&mut second, pkid, &vec![REJECTED; topics.len()]).await;
            second
        });

        let (session, driver) = local_session(port, Duration::from_secs(5)).await;
        let (tx, _rx) = mpsc::channel(4);
        session.subscribe("telebrella/a1/fdbk", tx).await.unwrap();

        let exit = timeout(Duration::from_secs(5), driver).await.unwrap().unwrap();
        assert!(matches!(
            exit,
            Err(SessionError::ResubscribeRejected(topic)) if topic == "telebrella/a1/fdbk"
        ));
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn resumed_session_keeps_its_subscriptions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let mut first = accept(&listener, false).await;
            grant(&mut first, 1).await;
            drop(first);

            let mut second = accept(&listener, true).await;
            let quiet = timeout(Duration::from_millis(300), read_packet(&mut second)).await;
            (quiet.is_err(), second)
        });

        let (session, driver) = local_session(port, Duration::from_secs(5)).await;
        let (tx, _rx) = mpsc::channel(4);
        session.subscribe("telebrella/a1/fdbk", tx).await.unwrap();

        let (quiet, _connection) = timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
        assert!(quiet, "client sent a packet after the session was resumed");
        assert!(!driver.is_finished());
        driver.abort();
    }

    #[tokio::test]
    async fn subscribe_gives_up_while_the_broker_stays_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Later connections are queued by the listener but never answered.
        let broker = tokio::spawn(async move {
            drop(accept(&listener, false).await);
            listener
        });

        let (session, driver) = local_session(port, Duration::from_millis(500)).await;
        let _listener = broker.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (tx, _rx) = mpsc::channel(4);
        let outcome = timeout(Duration::from_secs(5), session.subscribe("telebrella/a1/fdbk", tx))
            .await
            .expect("subscribe must not wait forever");
        assert!(matches!(outcome, Err(SessionError::Interrupted)));
        driver.abort();
    }
}
