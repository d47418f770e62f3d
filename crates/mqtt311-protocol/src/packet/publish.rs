use bytes::{BufMut, Bytes, BytesMut};

use crate::encoding::{read_string, read_u16, write_string};
use crate::error::{MqttError, Result};
use crate::types::QoS;

/// MQTT PUBLISH packet, used in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Marks a retransmission of an unacknowledged `QoS` > 0 publish.
    pub dup: bool,
    /// Present exactly when `qos` > 0.
    pub packet_id: Option<u16>,
}

impl PublishPacket {
    /// Flag nibble for the fixed header: `dup | qos | retain`.
    pub(crate) fn flags(&self) -> u8 {
        let mut flags = self.qos.as_u8() << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }
        flags
    }

    pub(crate) fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        if self.qos != QoS::AtMostOnce && self.packet_id.is_none() {
            return Err(MqttError::ProtocolError(
                "QoS > 0 PUBLISH requires a packet identifier".to_string(),
            ));
        }
        write_string(&self.topic, buf)?;
        if let Some(packet_id) = self.packet_id {
            buf.put_u16(packet_id);
        }
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub(crate) fn decode_body(flags: u8, body: &mut Bytes) -> Result<Self> {
        let dup = flags & 0x08 != 0;
        let retain = flags & 0x01 != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::try_from(qos_bits)
            .map_err(|_| MqttError::MalformedPacket(format!("invalid PUBLISH QoS: {qos_bits}")))?;
        if dup && qos == QoS::AtMostOnce {
            return Err(MqttError::MalformedPacket(
                "DUP set on QoS 0 PUBLISH".to_string(),
            ));
        }

        let topic = read_string(body)?;
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(read_u16(body)?)
        };
        let payload = body.split_to(body.len());

        Ok(Self {
            topic,
            payload,
            qos,
            retain,
            dup,
            packet_id,
        })
    }
}
