//! OpenRGB SDK client over TCP

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::error::ClientError;
use crate::protocol::{self, packet, PacketHeader, HEADER_LEN};
use crate::{DeviceClient, DeviceId, DeviceInfo, Rgb};

/// Default delay after an acknowledged (non-fast) write
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Connection to an OpenRGB server
pub struct OpenRgbClient {
    addr: String,
    stream: Mutex<TcpStream>,
    settle_delay: Duration,
}

impl OpenRgbClient {
    /// Connect and announce the client name
    pub async fn connect(host: &str, port: u16, client_name: &str) -> Result<Self, ClientError> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let client = Self {
            addr,
            stream: Mutex::new(stream),
            settle_delay: DEFAULT_SETTLE_DELAY,
        };
        client
            .send(0, packet::SET_CLIENT_NAME, &protocol::client_name_payload(client_name))
            .await?;
        info!("Connected to OpenRGB at {} as '{}'", client.addr, client_name);
        Ok(client)
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn send(&self, device: DeviceId, id: u32, payload: &[u8]) -> Result<(), ClientError> {
        let packet = protocol::encode_packet(device, id, payload)?;
        let mut stream = self.stream.lock().await;
        stream.write_all(&packet).await?;
        trace!(device, id, len = payload.len(), "Sent packet");
        Ok(())
    }

    /// Send a request and wait for the reply with the same packet id.
    ///
    /// Unsolicited packets (device list updates) arriving in between are skipped.
    async fn request(
        &self,
        device: DeviceId,
        id: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let packet = protocol::encode_packet(device, id, payload)?;
        let mut stream = self.stream.lock().await;
        stream.write_all(&packet).await?;

        loop {
            let mut raw = [0u8; HEADER_LEN];
            read_exact(&mut stream, &mut raw).await?;
            let header = PacketHeader::decode(&raw)?;
            let mut body = vec![0u8; header.size()];
            read_exact(&mut stream, &mut body).await?;
            if header.id() == id {
                return Ok(body);
            }
            if header.id() == packet::DEVICE_LIST_UPDATED {
                info!("OpenRGB reports a changed device list; restart to pick it up");
            } else {
                debug!(id = header.id(), "Skipping unexpected packet");
            }
        }
    }

    async fn settle(&self, fast: bool) {
        if !fast && !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }
}

async fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), ClientError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ClientError::Disconnected),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DeviceClient for OpenRgbClient {
    async fn devices(&self) -> Result<Vec<DeviceInfo>, ClientError> {
        let reply = self.request(0, packet::REQUEST_CONTROLLER_COUNT, &[]).await?;
        let count = protocol::parse_controller_count(&reply)?;
        let mut devices = Vec::with_capacity(count as usize);
        for id in 0..count {
            let data = self
                .request(id, packet::REQUEST_CONTROLLER_DATA, &[])
                .await?;
            let info = protocol::parse_controller_data(id, &data)?;
            debug!(
                id,
                name = %info.name,
                leds = info.led_count(),
                zones = info.zones.len(),
                "Found device"
            );
            devices.push(info);
        }
        Ok(devices)
    }

    async fn update_leds(
        &self,
        device: DeviceId,
        colors: &[Rgb],
        fast: bool,
    ) -> Result<(), ClientError> {
        let payload = protocol::update_leds_payload(colors)?;
        self.send(device, packet::UPDATE_LEDS, &payload).await?;
        self.settle(fast).await;
        Ok(())
    }

    async fn set_led(
        &self,
        device: DeviceId,
        index: usize,
        color: Rgb,
        fast: bool,
    ) -> Result<(), ClientError> {
        let payload = protocol::update_single_led_payload(index, color)?;
        self.send(device, packet::UPDATE_SINGLE_LED, &payload).await?;
        self.settle(fast).await;
        Ok(())
    }

    async fn set_zone(
        &self,
        device: DeviceId,
        zone: usize,
        color: Rgb,
        fast: bool,
    ) -> Result<(), ClientError> {
        // The zone size is not known here, so ask for the controller layout first.
        let data = self
            .request(device, packet::REQUEST_CONTROLLER_DATA, &[])
            .await?;
        let info = protocol::parse_controller_data(device, &data)?;
        let len = info
            .zones
            .get(zone)
            .map(|z| z.len)
            .ok_or(ClientError::UnknownZone { device, zone })?;
        let zone_index = u32::try_from(zone).map_err(|_| ClientError::UnknownZone { device, zone })?;
        let payload = protocol::update_zone_payload(zone_index, &vec![color; len])?;
        self.send(device, packet::UPDATE_ZONE_LEDS, &payload).await?;
        self.settle(fast).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::controller_blob;
    use tokio::net::TcpListener;

    async fn read_packet(stream: &mut TcpStream) -> (PacketHeader, Vec<u8>) {
        let mut raw = [0u8; HEADER_LEN];
        stream.read_exact(&mut raw).await.unwrap();
        let header = PacketHeader::decode(&raw).unwrap();
        let mut body = vec![0u8; header.size()];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    async fn write_packet(stream: &mut TcpStream, device: u32, id: u32, payload: &[u8]) {
        let packet = protocol::encode_packet(device, id, payload).unwrap();
        stream.write_all(&packet).await.unwrap();
    }

    #[tokio::test]
    async fn enumerates_devices_and_writes_leds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let (header, body) = read_packet(&mut stream).await;
            assert_eq!(header.id(), packet::SET_CLIENT_NAME);
            assert_eq!(body, b"test\0");

            let (header, _) = read_packet(&mut stream).await;
            assert_eq!(header.id(), packet::REQUEST_CONTROLLER_COUNT);
            // An unsolicited notification the client must skip
            write_packet(&mut stream, 0, packet::DEVICE_LIST_UPDATED, &[]).await;
            write_packet(&mut stream, 0, packet::REQUEST_CONTROLLER_COUNT, &1u32.to_le_bytes()).await;

            let (header, _) = read_packet(&mut stream).await;
            assert_eq!(header.id(), packet::REQUEST_CONTROLLER_DATA);
            let blob = controller_blob("Desk strip", &[Rgb::BLACK; 5]);
            write_packet(&mut stream, 0, packet::REQUEST_CONTROLLER_DATA, &blob).await;

            let (header, body) = read_packet(&mut stream).await;
            assert_eq!(header.id(), packet::UPDATE_LEDS);
            body
        });

        let client = OpenRgbClient::connect("127.0.0.1", port, "test")
            .await
            .unwrap()
            .with_settle_delay(Duration::ZERO);
        let devices = client.devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Desk strip");
        assert_eq!(devices[0].led_count(), 5);

        client
            .update_leds(0, &[Rgb::new(255, 0, 0); 5], true)
            .await
            .unwrap();
        let body = server.await.unwrap();
        assert_eq!(&body[4..6], &5u16.to_le_bytes());
        assert_eq!(&body[6..10], &[255, 0, 0, 0]);
    }

    #[tokio::test]
    async fn connect_failure_names_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = OpenRgbClient::connect("127.0.0.1", port, "test")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Connect { addr, .. } if addr.ends_with(&port.to_string())));
    }
}
