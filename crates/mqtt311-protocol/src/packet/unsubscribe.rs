use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::encoding::{read_string, read_u16, write_string};
use crate::error::{MqttError, Result};

/// MQTT UNSUBSCRIBE packet: a batch of filters to drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

impl UnsubscribePacket {
    pub(crate) fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        if self.filters.is_empty() {
            return Err(MqttError::ProtocolError(
                "UNSUBSCRIBE requires at least one topic filter".to_string(),
            ));
        }
        buf.put_u16(self.packet_id);
        for filter in &self.filters {
            write_string(filter, buf)?;
        }
        Ok(())
    }

    pub(crate) fn decode_body(body: &mut Bytes) -> Result<Self> {
        let packet_id = read_u16(body)?;
        let mut filters = Vec::new();
        while body.has_remaining() {
            filters.push(read_string(body)?);
        }
        if filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "UNSUBSCRIBE with empty filter list".to_string(),
            ));
        }
        Ok(Self { packet_id, filters })
    }
}

/// MQTT UNSUBACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub packet_id: u16,
}

impl UnsubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }

    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.packet_id);
    }

    pub(crate) fn decode_body(body: &mut Bytes) -> Result<Self> {
        Ok(Self {
            packet_id: read_u16(body)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsubscribe_round_trip() {
        let packet = UnsubscribePacket {
            packet_id: 12,
            filters: vec!["sensors/+".to_string(), "status".to_string()],
        };
        let mut buf = BytesMut::new();
        packet.encode_body(&mut buf).unwrap();
        assert_eq!(
            UnsubscribePacket::decode_body(&mut buf.freeze()).unwrap(),
            packet
        );
    }

    #[test]
    fn unsubscribe_empty_batch_rejected() {
        let packet = UnsubscribePacket {
            packet_id: 1,
            filters: vec![],
        };
        let mut buf = BytesMut::new();
        assert!(packet.encode_body(&mut buf).is_err());
    }

    #[test]
    fn unsuback_round_trip() {
        let packet = UnsubAckPacket::new(12);
        let mut buf = BytesMut::new();
        packet.encode_body(&mut buf);
        assert_eq!(UnsubAckPacket::decode_body(&mut buf.freeze()).unwrap(), packet);
    }
}
