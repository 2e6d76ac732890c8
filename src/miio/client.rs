use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::DeviceError;

use super::{Property, PurifierDevice};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const PORT: u16 = 54321;
const HEADER_LEN: usize = 32;
const MAGIC: [u8; 2] = [0x21, 0x31];
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Session values learned from the hello handshake.
#[derive(Debug, Clone, Copy)]
struct Handshake {
    device_id: u32,
    stamp: u32,
}

/// Basic identity reported by `miIO.info`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub model: String,
    pub firmware: String,
    pub device_id: u32,
}

/// Local-network client for the purifier.
///
/// Every call opens a fresh socket and performs the hello handshake, so a
/// device reboot between cycles needs no special handling.
pub struct MiioClient {
    addr: SocketAddr,
    token: [u8; 16],
    key: [u8; 16],
    iv: [u8; 16],
    next_id: AtomicU32,
}

impl MiioClient {
    pub fn new(ip: IpAddr, token: [u8; 16]) -> Self {
        let key: [u8; 16] = Md5::digest(token).into();
        let mut hasher = Md5::new();
        hasher.update(key);
        hasher.update(token);
        let iv: [u8; 16] = hasher.finalize().into();

        Self {
            addr: SocketAddr::new(ip, PORT),
            token,
            key,
            iv,
            next_id: AtomicU32::new(1),
        }
    }

    pub async fn info(&self) -> Result<DeviceInfo, DeviceError> {
        let (result, device_id) = self.call("miIO.info", json!([])).await?;
        Ok(DeviceInfo {
            model: result
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            firmware: result
                .get("fw_ver")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            device_id,
        })
    }

    /// Send one RPC and return its `result` plus the device id from the handshake.
    async fn call(&self, method: &str, params: Value) -> Result<(Value, u32), DeviceError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(self.addr).await?;

        let handshake = self.hello(&socket).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({ "id": id, "method": method, "params": params });
        debug!("miIO -> {}: {}", self.addr, request);

        let packet = self.encode(handshake, request.to_string().as_bytes());
        socket.send(&packet).await?;
        let reply = recv(&socket).await?;
        let response = self.decode(&reply)?;
        debug!("miIO <- {}: {}", self.addr, response);

        if response.get("id").and_then(Value::as_u64) != Some(u64::from(id)) {
            return Err(DeviceError::Protocol(format!(
                "reply id mismatch (sent {id}): {response}"
            )));
        }
        if let Some(error) = response.get("error") {
            return Err(DeviceError::Rpc(error.to_string()));
        }
        let result = response
            .get("result")
            .cloned()
            .ok_or_else(|| DeviceError::Protocol(format!("reply without result: {response}")))?;
        Ok((result, handshake.device_id))
    }

    async fn hello(&self, socket: &UdpSocket) -> Result<Handshake, DeviceError> {
        let mut hello = [0xffu8; HEADER_LEN];
        hello[..2].copy_from_slice(&MAGIC);
        hello[2..4].copy_from_slice(&(HEADER_LEN as u16).to_be_bytes());
        socket.send(&hello).await?;

        let reply = recv(socket).await?;
        parse_header(&reply)
    }

    fn encode(&self, handshake: Handshake, payload: &[u8]) -> Vec<u8> {
        let encrypted = Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(payload);
        let len = (HEADER_LEN + encrypted.len()) as u16;
        let stamp = handshake.stamp.wrapping_add(1);

        let mut packet = Vec::with_capacity(len as usize);
        packet.extend_from_slice(&MAGIC);
        packet.extend_from_slice(&len.to_be_bytes());
        packet.extend_from_slice(&[0u8; 4]);
        packet.extend_from_slice(&handshake.device_id.to_be_bytes());
        packet.extend_from_slice(&stamp.to_be_bytes());
        // checksum is computed with the token in its place
        packet.extend_from_slice(&self.token);
        packet.extend_from_slice(&encrypted);

        let checksum = Md5::digest(&packet);
        packet[16..HEADER_LEN].copy_from_slice(&checksum);
        packet
    }

    fn decode(&self, packet: &[u8]) -> Result<Value, DeviceError> {
        parse_header(packet)?;
        let body = &packet[HEADER_LEN..];
        if body.is_empty() {
            return Err(DeviceError::Protocol("empty reply body".into()));
        }
        let plain = Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|e| DeviceError::Protocol(format!("decrypt failed: {e}")))?;
        // some firmwares terminate the JSON with NUL
        let end = plain.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        serde_json::from_slice(&plain[..end])
            .map_err(|e| DeviceError::Protocol(format!("invalid JSON reply: {e}")))
    }
}

impl PurifierDevice for MiioClient {
    async fn get_properties(&self, properties: &[Property]) -> Result<Vec<Value>, DeviceError> {
        let params: Vec<Value> = properties
            .iter()
            .map(|p| {
                json!({
                    "did": format!("{}-{}", p.siid, p.piid),
                    "siid": p.siid,
                    "piid": p.piid,
                })
            })
            .collect();
        let (result, _) = self.call("get_properties", Value::Array(params)).await?;
        let entries = result
            .as_array()
            .ok_or_else(|| DeviceError::Protocol(format!("get_properties result: {result}")))?;

        properties
            .iter()
            .map(|p| {
                let entry = entries
                    .iter()
                    .find(|e| property_of(e) == Some(*p))
                    .ok_or_else(|| {
                        DeviceError::Protocol(format!("no value for {}/{}", p.siid, p.piid))
                    })?;
                check_code(entry, *p)?;
                Ok(entry.get("value").cloned().unwrap_or(Value::Null))
            })
            .collect()
    }

    async fn set_properties(&self, values: &[(Property, Value)]) -> Result<(), DeviceError> {
        let params: Vec<Value> = values
            .iter()
            .map(|(p, v)| {
                json!({
                    "did": format!("{}-{}", p.siid, p.piid),
                    "siid": p.siid,
                    "piid": p.piid,
                    "value": v,
                })
            })
            .collect();
        let (result, _) = self.call("set_properties", Value::Array(params)).await?;
        if let Some(entries) = result.as_array() {
            for entry in entries {
                if let Some(property) = property_of(entry) {
                    check_code(entry, property)?;
                }
            }
        }
        Ok(())
    }
}

async fn recv(socket: &UdpSocket) -> Result<Vec<u8>, DeviceError> {
    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(REPLY_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| DeviceError::Timeout(REPLY_TIMEOUT.as_millis() as u64))??;
    buf.truncate(n);
    Ok(buf)
}

fn parse_header(packet: &[u8]) -> Result<Handshake, DeviceError> {
    if packet.len() < HEADER_LEN || packet[..2] != MAGIC {
        return Err(DeviceError::Protocol(format!(
            "bad header ({} bytes)",
            packet.len()
        )));
    }
    let declared = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if declared != packet.len() {
        return Err(DeviceError::Protocol(format!(
            "length field {declared} does not match {} received",
            packet.len()
        )));
    }
    Ok(Handshake {
        device_id: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        stamp: u32::from_be_bytes([packet[12], packet[13], packet[14], packet[15]]),
    })
}

fn property_of(entry: &Value) -> Option<Property> {
    Some(Property {
        siid: u32::try_from(entry.get("siid")?.as_u64()?).ok()?,
        piid: u32::try_from(entry.get("piid")?.as_u64()?).ok()?,
    })
}

fn check_code(entry: &Value, property: Property) -> Result<(), DeviceError> {
    match entry.get("code").and_then(Value::as_i64) {
        Some(0) | None => Ok(()),
        Some(code) => Err(DeviceError::Property {
            siid: property.siid,
            piid: property.piid,
            code,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MiioClient {
        MiioClient::new("127.0.0.1".parse().unwrap(), [0x11; 16])
    }

    #[test]
    fn encode_then_decode_reply() {
        let client = client();
        let handshake = Handshake {
            device_id: 0x0102_0304,
            stamp: 99,
        };
        let packet = client.encode(handshake, br#"{"id":7,"result":["ok"]}"#);

        assert_eq!(&packet[..2], &MAGIC);
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]) as usize, packet.len());
        let header = parse_header(&packet).unwrap();
        assert_eq!(header.device_id, 0x0102_0304);
        assert_eq!(header.stamp, 100);

        let value = client.decode(&packet).unwrap();
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn checksum_covers_token_and_body() {
        let client = client();
        let handshake = Handshake {
            device_id: 1,
            stamp: 1,
        };
        let packet = client.encode(handshake, b"{}");
        let mut check = packet.clone();
        check[16..HEADER_LEN].copy_from_slice(&[0x11; 16]);
        assert_eq!(&packet[16..HEADER_LEN], Md5::digest(&check).as_slice());
    }

    #[test]
    fn truncated_packet_is_rejected() {
        assert!(matches!(
            parse_header(&[0x21, 0x31, 0x00]),
            Err(DeviceError::Protocol(_))
        ));
    }

    #[test]
    fn nonzero_property_code_is_an_error() {
        let entry = json!({ "siid": 2, "piid": 5, "code": -4004 });
        let err = check_code(&entry, Property::SPEED).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Property {
                siid: 2,
                piid: 5,
                code: -4004
            }
        ));
    }

    #[tokio::test]
    async fn get_properties_against_local_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();
        let mut client = client();
        client.addr = SocketAddr::new("127.0.0.1".parse().unwrap(), port);
        let device = MiioClient::new(client.addr.ip(), [0x11; 16]);

        let server = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            // hello
            let (_, peer) = responder.recv_from(&mut buf).await.unwrap();
            let mut reply = [0u8; HEADER_LEN];
            reply[..2].copy_from_slice(&MAGIC);
            reply[2..4].copy_from_slice(&(HEADER_LEN as u16).to_be_bytes());
            reply[8..12].copy_from_slice(&42u32.to_be_bytes());
            reply[12..16].copy_from_slice(&1000u32.to_be_bytes());
            responder.send_to(&reply, peer).await.unwrap();

            // request
            let (n, peer) = responder.recv_from(&mut buf).await.unwrap();
            let request = device.decode(&buf[..n]).unwrap();
            let id = request["id"].as_u64().unwrap();
            let body = json!({
                "id": id,
                "result": [
                    { "siid": 2, "piid": 1, "code": 0, "value": true },
                    { "siid": 2, "piid": 4, "code": 0, "value": 3 },
                    { "siid": 2, "piid": 5, "code": 0, "value": 2 }
                ]
            });
            let packet = device.encode(
                Handshake {
                    device_id: 42,
                    stamp: 1000,
                },
                body.to_string().as_bytes(),
            );
            responder.send_to(&packet, peer).await.unwrap();
        });

        let values = client
            .get_properties(&[Property::POWER, Property::MODE, Property::SPEED])
            .await
            .unwrap();
        assert_eq!(values, vec![json!(true), json!(3), json!(2)]);
        server.await.unwrap();
    }
}
