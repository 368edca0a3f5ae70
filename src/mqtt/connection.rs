/// Broker connection built on the rumqttc client and event loop
use futures_util::future::{BoxFuture, FutureExt};
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS};
use tokio::time::{timeout, Duration};

use super::{Transport, TransportError};

pub const DEFAULT_PORT: u16 = 1883;
/// Discovery documents are the largest messages we send
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Requests queued between the client handle and the event loop
const REQUEST_CAPACITY: usize = 10;
/// Upper bound on events drained by one `service` call
const SERVICE_BUDGET: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub max_packet_size: usize,
}

impl BrokerOptions {
    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true)
            .set_max_packet_size(self.max_packet_size, self.max_packet_size);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// Client handle and the event loop that owns its socket
struct Link {
    client: AsyncClient,
    eventloop: EventLoop,
}

pub struct MqttConnection {
    options: BrokerOptions,
    link: Option<Link>,
}

impl MqttConnection {
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            options,
            link: None,
        }
    }

    /// Fresh client and event loop, polled until the broker acknowledges
    async fn open(&mut self) -> Result<Link, TransportError> {
        let (client, mut eventloop) =
            AsyncClient::new(self.options.mqtt_options(), REQUEST_CAPACITY);

        let handshake = async {
            loop {
                if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
                    debug!("CONNACK {:?}", ack.code);
                    return Ok::<_, TransportError>(());
                }
            }
        };
        timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| TransportError::Timeout("connect"))??;

        Ok(Link { client, eventloop })
    }

    /// Poll until the queued publish has been flushed; any failure drops the link
    async fn flush_publish(&mut self) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        let flushed = async {
            loop {
                if let Event::Outgoing(Outgoing::Publish(_)) = link.eventloop.poll().await? {
                    return Ok::<_, TransportError>(());
                }
            }
        };
        match timeout(WRITE_TIMEOUT, flushed).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.link = None;
                Err(e)
            }
            Err(_) => {
                self.link = None;
                Err(TransportError::Timeout("publish"))
            }
        }
    }
}

impl Transport for MqttConnection {
    fn connect(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            self.link = None;
            let link = self.open().await?;
            info!(
                "Connected to MQTT broker {}:{} as {}",
                self.options.host, self.options.port, self.options.client_id
            );
            self.link = Some(link);
            Ok(())
        }
        .boxed()
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: &'a [u8],
        retain: bool,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;

            // The event loop drops the whole connection on an oversized packet
            let size = Publish::new(topic, QoS::AtMostOnce, payload).size();
            if size > self.options.max_packet_size {
                return Err(TransportError::PayloadTooLarge {
                    size,
                    limit: self.options.max_packet_size,
                });
            }

            link.client
                .try_publish(topic, QoS::AtMostOnce, retain, payload)?;
            self.flush_publish().await
        }
        .boxed()
    }

    fn service(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            let Some(link) = self.link.as_mut() else {
                return Ok(());
            };
            // Only events that are already due: pings, acks and broker closes
            for _ in 0..SERVICE_BUDGET {
                match link.eventloop.poll().now_or_never() {
                    None => break,
                    Some(Ok(event)) => debug!("MQTT event {:?}", event),
                    Some(Err(e)) => {
                        self.link = None;
                        return Err(e.into());
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn disconnect(&mut self) -> BoxFuture<'_, ()> {
        async move {
            let Some(mut link) = self.link.take() else {
                return;
            };
            if let Err(e) = link.client.try_disconnect() {
                error!("Failed to queue DISCONNECT: {}", e);
                return;
            }
            let sent = async {
                loop {
                    match link.eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                        Ok(_) => {}
                        Err(e) => return Err(e),
                    }
                }
            };
            match timeout(WRITE_TIMEOUT, sent).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Failed to send DISCONNECT: {}", e),
                Err(_) => error!("Timed out sending DISCONNECT"),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::ConnectionError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    fn options(port: u16) -> BrokerOptions {
        BrokerOptions {
            host: "127.0.0.1".into(),
            port,
            client_id: "air-sensor".into(),
            username: Some("ha".into()),
            password: Some("pw".into()),
            keep_alive: Duration::from_secs(15),
            max_packet_size: 64,
        }
    }

    /// Single-byte remaining length is enough for the packets in these tests
    async fn read_packet(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.unwrap();
        let mut body = vec![0u8; header[1] as usize];
        stream.read_exact(&mut body).await.unwrap();
        let mut packet = header.to_vec();
        packet.extend(body);
        packet
    }

    async fn accept_session(listener: TcpListener) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let connect = read_packet(&mut socket).await;
        assert_eq!(connect[0], 0x10);
        socket.write_all(&CONNACK).await.unwrap();
        socket
    }

    #[test]
    fn broker_options_map_onto_client_options() {
        let mqtt = options(1884).mqtt_options();
        assert_eq!(mqtt.broker_address(), ("127.0.0.1".to_string(), 1884));
        assert_eq!(mqtt.client_id(), "air-sensor");
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(15));
        assert_eq!(
            mqtt.credentials(),
            Some(("ha".to_string(), "pw".to_string()))
        );
        assert_eq!(mqtt.max_packet_size(), 64);
    }

    #[tokio::test]
    async fn connects_publishes_and_detects_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let mut socket = accept_session(listener).await;
            let publish = read_packet(&mut socket).await;
            let mut expected = vec![0x30, 13, 0, 7];
            expected.extend_from_slice(b"t/state1.00");
            assert_eq!(publish, expected);
            // socket dropped here: broker goes away
        });

        let mut conn = MqttConnection::new(options(port));
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        conn.publish("t/state", b"1.00", false).await.unwrap();
        broker.await.unwrap();

        // The close may take a moment to surface
        let mut result = Ok(());
        for _ in 0..50 {
            result = conn.service().await;
            if result.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(result, Err(TransportError::Connection(_))));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn retained_flag_is_carried_in_the_header() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let mut socket = accept_session(listener).await;
            read_packet(&mut socket).await
        });

        let mut conn = MqttConnection::new(options(port));
        conn.connect().await.unwrap();
        conn.publish("t/config", b"{}", true).await.unwrap();
        let publish = broker.await.unwrap();
        assert_eq!(publish[0], 0x31);
    }

    #[tokio::test]
    async fn refused_connection_reports_return_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_packet(&mut socket).await;
            socket.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
        });

        let mut conn = MqttConnection::new(options(port));
        assert!(matches!(
            conn.connect().await,
            Err(TransportError::Connection(
                ConnectionError::ConnectionRefused(rumqttc::ConnectReturnCode::NotAuthorized)
            ))
        ));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn oversized_publish_is_rejected_without_disconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(accept_session(listener));

        let mut conn = MqttConnection::new(options(port));
        conn.connect().await.unwrap();
        let payload = vec![b'x'; 100];
        assert!(matches!(
            conn.publish("t", &payload, true).await,
            Err(TransportError::PayloadTooLarge { limit: 64, .. })
        ));
        assert!(conn.is_connected());
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn publish_while_disconnected_fails_fast() {
        let mut conn = MqttConnection::new(options(1));
        assert!(matches!(
            conn.publish("t", b"1", false).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn disconnect_sends_disconnect_packet() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let mut socket = accept_session(listener).await;
            read_packet(&mut socket).await
        });

        let mut conn = MqttConnection::new(options(port));
        conn.connect().await.unwrap();
        conn.disconnect().await;
        assert!(!conn.is_connected());
        assert_eq!(broker.await.unwrap(), vec![0xE0, 0x00]);
    }
}
