use bytes::{BufMut, Bytes, BytesMut};

use crate::encoding::{read_binary, read_string, read_u16, read_u8, write_bytes, write_string};
use crate::error::{MqttError, Result};
use crate::types::QoS;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_WILL: u8 = 0x04;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

/// MQTT CONNECT packet.
///
/// Carries the session-opening parameters: client identifier, clean
/// session flag, keep-alive interval in seconds, and optional
/// credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectPacket {
    pub(crate) fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        write_string(PROTOCOL_NAME, buf)?;
        buf.put_u8(PROTOCOL_LEVEL);

        let mut flags = 0u8;
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        buf.put_u8(flags);
        buf.put_u16(self.keep_alive);

        write_string(&self.client_id, buf)?;
        if let Some(username) = &self.username {
            write_string(username, buf)?;
        }
        if let Some(password) = &self.password {
            write_bytes(password.as_bytes(), buf)?;
        }
        Ok(())
    }

    pub(crate) fn decode_body(body: &mut Bytes) -> Result<Self> {
        let protocol_name = read_string(body)?;
        if protocol_name != PROTOCOL_NAME {
            return Err(MqttError::MalformedPacket(format!(
                "unexpected protocol name: {protocol_name}"
            )));
        }
        let level = read_u8(body)?;
        if level != PROTOCOL_LEVEL {
            return Err(MqttError::MalformedPacket(format!(
                "unsupported protocol level: {level}"
            )));
        }

        let flags = read_u8(body)?;
        if flags & 0x01 != 0 {
            return Err(MqttError::MalformedPacket(
                "CONNECT reserved flag bit set".to_string(),
            ));
        }
        let clean_session = flags & FLAG_CLEAN_SESSION != 0;
        let will_flag = flags & FLAG_WILL != 0;
        let will_qos = (flags >> 3) & 0x03;
        if !will_flag && (will_qos != 0 || flags & FLAG_WILL_RETAIN != 0) {
            return Err(MqttError::MalformedPacket(
                "will QoS/retain set without will flag".to_string(),
            ));
        }

        let keep_alive = read_u16(body)?;
        let client_id = read_string(body)?;

        // Will payloads are parsed for framing but not retained; this
        // engine never registers a will.
        if will_flag {
            QoS::try_from(will_qos)
                .map_err(|_| MqttError::MalformedPacket(format!("invalid will QoS: {will_qos}")))?;
            let _will_topic = read_string(body)?;
            let _will_message = read_binary(body)?;
        }

        let username = if flags & FLAG_USERNAME != 0 {
            Some(read_string(body)?)
        } else {
            None
        };
        let password = if flags & FLAG_PASSWORD != 0 {
            let raw = read_binary(body)?;
            Some(String::from_utf8_lossy(&raw).into_owned())
        } else {
            None
        };

        Ok(Self {
            client_id,
            clean_session,
            keep_alive,
            username,
            password,
        })
    }
}
