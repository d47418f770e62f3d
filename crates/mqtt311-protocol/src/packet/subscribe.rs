use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::encoding::{read_string, read_u16, read_u8, write_string};
use crate::error::{MqttError, Result};
use crate::types::QoS;

/// SUBACK return code marking a filter the broker refused.
pub const SUBACK_FAILURE: u8 = 0x80;

/// One requested subscription inside a SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub filter: String,
    pub qos: QoS,
}

/// MQTT SUBSCRIBE packet: a batch of topic filters with requested `QoS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<TopicFilter>,
}

impl SubscribePacket {
    pub(crate) fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        if self.filters.is_empty() {
            return Err(MqttError::ProtocolError(
                "SUBSCRIBE requires at least one topic filter".to_string(),
            ));
        }
        buf.put_u16(self.packet_id);
        for entry in &self.filters {
            write_string(&entry.filter, buf)?;
            buf.put_u8(entry.qos.as_u8());
        }
        Ok(())
    }

    pub(crate) fn decode_body(body: &mut Bytes) -> Result<Self> {
        let packet_id = read_u16(body)?;
        let mut filters = Vec::new();
        while body.has_remaining() {
            let filter = read_string(body)?;
            let qos_byte = read_u8(body)?;
            if qos_byte & !0x03 != 0 {
                return Err(MqttError::MalformedPacket(format!(
                    "SUBSCRIBE reserved QoS bits set: {qos_byte:#04x}"
                )));
            }
            let qos = QoS::try_from(qos_byte).map_err(|_| {
                MqttError::MalformedPacket(format!("invalid SUBSCRIBE QoS: {qos_byte}"))
            })?;
            filters.push(TopicFilter { filter, qos });
        }
        if filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE with empty filter list".to_string(),
            ));
        }
        Ok(Self { packet_id, filters })
    }
}

/// MQTT SUBACK packet: one return code per requested filter, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    /// `0x00`–`0x02` grant that `QoS`; `0x80` marks failure.
    pub return_codes: Vec<u8>,
}

impl SubAckPacket {
    /// The granted `QoS` for a return code, or `None` for a failure.
    #[must_use]
    pub fn granted_qos(code: u8) -> Option<QoS> {
        QoS::try_from(code).ok()
    }

    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.packet_id);
        buf.put_slice(&self.return_codes);
    }

    pub(crate) fn decode_body(body: &mut Bytes) -> Result<Self> {
        let packet_id = read_u16(body)?;
        let return_codes: Vec<u8> = body.split_to(body.len()).to_vec();
        if return_codes.is_empty() {
            return Err(MqttError::MalformedPacket(
                "SUBACK with no return codes".to_string(),
            ));
        }
        for &code in &return_codes {
            if code > 2 && code != SUBACK_FAILURE {
                return Err(MqttError::MalformedPacket(format!(
                    "invalid SUBACK return code: {code:#04x}"
                )));
            }
        }
        Ok(Self {
            packet_id,
            return_codes,
        })
    }
}
