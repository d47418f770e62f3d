use bytes::{BufMut, Bytes, BytesMut};

use crate::encoding::read_u8;
use crate::error::{MqttError, Result};
use crate::types::ConnectReturnCode;

/// MQTT CONNACK packet: the broker's verdict on a CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAckPacket {
    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self.session_present));
        buf.put_u8(self.return_code.as_u8());
    }

    pub(crate) fn decode_body(body: &mut Bytes) -> Result<Self> {
        let ack_flags = read_u8(body)?;
        if ack_flags & !0x01 != 0 {
            return Err(MqttError::MalformedPacket(format!(
                "CONNACK reserved flags set: {ack_flags:#04x}"
            )));
        }
        let return_code = ConnectReturnCode::try_from(read_u8(body)?)?;
        // A refused connection must not claim a resumed session.
        let session_present = ack_flags & 0x01 != 0;
        if session_present && !return_code.is_accepted() {
            return Err(MqttError::MalformedPacket(
                "CONNACK session present with non-zero return code".to_string(),
            ));
        }
        Ok(Self {
            session_present,
            return_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for (session_present, return_code) in [
            (false, ConnectReturnCode::Accepted),
            (true, ConnectReturnCode::Accepted),
            (false, ConnectReturnCode::NotAuthorized),
        ] {
            let packet = ConnAckPacket {
                session_present,
                return_code,
            };
            let mut buf = BytesMut::new();
            packet.encode_body(&mut buf);
            assert_eq!(ConnAckPacket::decode_body(&mut buf.freeze()).unwrap(), packet);
        }
    }

    #[test]
    fn rejects_session_present_on_refusal() {
        let mut bytes = Bytes::from_static(&[0x01, 0x05]);
        assert!(ConnAckPacket::decode_body(&mut bytes).is_err());
    }

    #[test]
    fn rejects_reserved_ack_flags() {
        let mut bytes = Bytes::from_static(&[0x02, 0x00]);
        assert!(ConnAckPacket::decode_body(&mut bytes).is_err());
    }
}
