//! Packet framing: fixed header assembly on encode, incremental frame
//! extraction on decode.
//!
//! [`PacketDecoder`] is the streaming entry point used by a transport
//! reader: bytes go in via [`PacketDecoder::feed`] in whatever chunks the
//! socket produces, complete packets come out of
//! [`PacketDecoder::next_packet`]. Malformed bodies inside a complete
//! frame are skipped (the boundary is known), while a corrupt
//! remaining-length encoding poisons the stream and surfaces as the fatal
//! [`MqttError::ProtocolError`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoding::{self, decode_remaining_length};
use crate::error::{MqttError, Result};
use crate::packet::{
    ConnAckPacket, ConnectPacket, FixedHeader, Packet, PacketType, PubAckPacket, PubCompPacket,
    PubRecPacket, PubRelPacket, PublishPacket, SubAckPacket, SubscribePacket, UnsubAckPacket,
    UnsubscribePacket,
};

/// Flag nibble required on SUBSCRIBE, UNSUBSCRIBE, and PUBREL.
const FLAGS_QOS1_RESERVED: u8 = 0x02;

/// Encode a packet, fixed header included, appending to `buf`.
///
/// Fails only on caller-constructed invalid values: strings over 65535
/// bytes, a body pushing the remaining length past its four-byte limit,
/// or a `QoS` > 0 PUBLISH missing its packet identifier.
pub fn encode_packet(packet: &Packet, buf: &mut BytesMut) -> Result<()> {
    let mut body = BytesMut::new();
    let flags = match packet {
        Packet::Connect(p) => {
            p.encode_body(&mut body)?;
            0
        }
        Packet::ConnAck(p) => {
            p.encode_body(&mut body);
            0
        }
        Packet::Publish(p) => {
            p.encode_body(&mut body)?;
            p.flags()
        }
        Packet::PubAck(p) => {
            p.encode_body(&mut body);
            0
        }
        Packet::PubRec(p) => {
            p.encode_body(&mut body);
            0
        }
        Packet::PubRel(p) => {
            p.encode_body(&mut body);
            FLAGS_QOS1_RESERVED
        }
        Packet::PubComp(p) => {
            p.encode_body(&mut body);
            0
        }
        Packet::Subscribe(p) => {
            p.encode_body(&mut body)?;
            FLAGS_QOS1_RESERVED
        }
        Packet::SubAck(p) => {
            p.encode_body(&mut body);
            0
        }
        Packet::Unsubscribe(p) => {
            p.encode_body(&mut body)?;
            FLAGS_QOS1_RESERVED
        }
        Packet::UnsubAck(p) => {
            p.encode_body(&mut body);
            0
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    };

    buf.put_u8((packet.packet_type().as_u8() << 4) | flags);
    encoding::encode_remaining_length(body.len(), buf)?;
    buf.extend_from_slice(&body);
    Ok(())
}

/// Decode one packet from the start of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` for a complete packet and
/// `Ok(None)` when more bytes are needed.
pub fn decode_packet(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    let Some((header, total_len)) = peek_frame(buf)? else {
        return Ok(None);
    };
    let body_start = total_len - header.remaining_length;
    let mut body = Bytes::copy_from_slice(&buf[body_start..total_len]);
    let packet = decode_body(header, &mut body)?;
    Ok(Some((packet, total_len)))
}

/// Parse the fixed header and report the full frame length, without
/// touching the body. `Ok(None)` means the header itself is incomplete.
fn peek_frame(buf: &[u8]) -> Result<Option<(FixedHeader, usize)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let Some((remaining_length, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };
    let total_len = 1 + len_bytes + remaining_length;
    if buf.len() < total_len {
        return Ok(None);
    }
    let packet_type = PacketType::try_from(first >> 4)
        .map_err(|_| MqttError::MalformedPacket(format!("reserved packet type {}", first >> 4)))?;
    Ok(Some((
        FixedHeader {
            packet_type,
            flags: first & 0x0F,
            remaining_length,
        },
        total_len,
    )))
}

fn decode_body(header: FixedHeader, body: &mut Bytes) -> Result<Packet> {
    match header.packet_type {
        PacketType::Publish => {}
        PacketType::Subscribe | PacketType::Unsubscribe | PacketType::PubRel => {
            if header.flags != FLAGS_QOS1_RESERVED {
                return Err(MqttError::MalformedPacket(format!(
                    "{:?} fixed header flags must be 0x02, got {:#04x}",
                    header.packet_type, header.flags
                )));
            }
        }
        _ => {
            if header.flags != 0 {
                return Err(MqttError::MalformedPacket(format!(
                    "{:?} fixed header flags must be zero, got {:#04x}",
                    header.packet_type, header.flags
                )));
            }
        }
    }

    let packet = match header.packet_type {
        PacketType::Connect => Packet::Connect(ConnectPacket::decode_body(body)?),
        PacketType::ConnAck => Packet::ConnAck(ConnAckPacket::decode_body(body)?),
        PacketType::Publish => Packet::Publish(PublishPacket::decode_body(header.flags, body)?),
        PacketType::PubAck => Packet::PubAck(PubAckPacket::decode_body(body)?),
        PacketType::PubRec => Packet::PubRec(PubRecPacket::decode_body(body)?),
        PacketType::PubRel => Packet::PubRel(PubRelPacket::decode_body(body)?),
        PacketType::PubComp => Packet::PubComp(PubCompPacket::decode_body(body)?),
        PacketType::Subscribe => Packet::Subscribe(SubscribePacket::decode_body(body)?),
        PacketType::SubAck => Packet::SubAck(SubAckPacket::decode_body(body)?),
        PacketType::Unsubscribe => Packet::Unsubscribe(UnsubscribePacket::decode_body(body)?),
        PacketType::UnsubAck => Packet::UnsubAck(UnsubAckPacket::decode_body(body)?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };
    Ok(packet)
}

/// Incremental packet decoder for a byte stream.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: BytesMut,
}

impl PacketDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete packet, if one is buffered.
    ///
    /// `Ok(None)` means an incomplete trailer is buffered and more bytes
    /// are needed. A [`MqttError::MalformedPacket`] error consumes exactly
    /// the offending frame, so decoding can continue with the next call; a
    /// [`MqttError::ProtocolError`] means framing is lost and the stream
    /// must be abandoned.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        let Some((header, total_len)) = peek_frame(&self.buf).map_err(|err| {
            // A bad packet type is recoverable: the frame length is known,
            // drop the frame before surfacing the error.
            if let MqttError::MalformedPacket(_) = &err {
                if let Ok(Some((length, len_bytes))) = decode_remaining_length(&self.buf[1..]) {
                    let total = 1 + len_bytes + length;
                    if self.buf.len() >= total {
                        let _ = self.buf.split_to(total);
                    }
                }
            }
            err
        })?
        else {
            return Ok(None);
        };

        let frame = self.buf.split_to(total_len).freeze();
        let mut body = frame.slice(total_len - header.remaining_length..);
        decode_body(header, &mut body).map(Some)
    }

    /// Bytes currently buffered but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes (used when a session is torn down).
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectReturnCode, QoS};
    use proptest::prelude::*;

    fn sample_packets() -> Vec<Packet> {
        vec![
            Packet::Connect(ConnectPacket {
                client_id: "probe".to_string(),
                clean_session: true,
                keep_alive: 30,
                username: Some("user".to_string()),
                password: Some("secret".to_string()),
            }),
            Packet::ConnAck(ConnAckPacket {
                session_present: false,
                return_code: ConnectReturnCode::Accepted,
            }),
            Packet::Publish(PublishPacket {
                topic: "sensors/accel".to_string(),
                payload: Bytes::from_static(b"x: 0.1"),
                qos: QoS::AtLeastOnce,
                retain: true,
                dup: false,
                packet_id: Some(3),
            }),
            Packet::PubAck(PubAckPacket::new(3)),
            Packet::PubRec(PubRecPacket::new(4)),
            Packet::PubRel(PubRelPacket::new(4)),
            Packet::PubComp(PubCompPacket::new(4)),
            Packet::Subscribe(SubscribePacket {
                packet_id: 5,
                filters: vec![crate::packet::TopicFilter {
                    filter: "sensors/+".to_string(),
                    qos: QoS::ExactlyOnce,
                }],
            }),
            Packet::SubAck(SubAckPacket {
                packet_id: 5,
                return_codes: vec![2],
            }),
            Packet::Unsubscribe(UnsubscribePacket {
                packet_id: 6,
                filters: vec!["sensors/+".to_string()],
            }),
            Packet::UnsubAck(UnsubAckPacket::new(6)),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
        ]
    }

    #[test]
    fn round_trip_every_packet_kind() {
        for packet in sample_packets() {
            let mut buf = BytesMut::new();
            encode_packet(&packet, &mut buf).unwrap();
            let (decoded, consumed) = decode_packet(&buf).unwrap().unwrap();
            assert_eq!(consumed, buf.len(), "consumed all of {packet:?}");
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn decode_needs_more_data() {
        let mut buf = BytesMut::new();
        encode_packet(
            &Packet::Publish(PublishPacket {
                topic: "a/b".to_string(),
                payload: Bytes::from_static(&[0; 300]),
                qos: QoS::AtMostOnce,
                retain: false,
                dup: false,
                packet_id: None,
            }),
            &mut buf,
        )
        .unwrap();

        for cut in 0..buf.len() {
            assert!(
                decode_packet(&buf[..cut]).unwrap().is_none(),
                "prefix of {cut} bytes must be incomplete"
            );
        }
        assert!(decode_packet(&buf).unwrap().is_some());
    }

    #[test]
    fn decoder_handles_packets_split_across_feeds() {
        let packets = sample_packets();
        let mut wire = BytesMut::new();
        for packet in &packets {
            encode_packet(packet, &mut wire).unwrap();
        }

        let mut decoder = PacketDecoder::new();
        let mut decoded = Vec::new();
        for chunk in wire.chunks(3) {
            decoder.feed(chunk);
            while let Some(packet) = decoder.next_packet().unwrap() {
                decoded.push(packet);
            }
        }
        assert_eq!(decoded, packets);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_skips_malformed_frame_and_recovers() {
        let mut decoder = PacketDecoder::new();
        // CONNACK with reserved ack flags set: complete frame, bad body.
        decoder.feed(&[0x20, 0x02, 0x04, 0x00]);
        let mut good = BytesMut::new();
        encode_packet(&Packet::PingResp, &mut good).unwrap();
        decoder.feed(&good);

        assert!(matches!(
            decoder.next_packet(),
            Err(MqttError::MalformedPacket(_))
        ));
        assert_eq!(decoder.next_packet().unwrap(), Some(Packet::PingResp));
    }

    #[test]
    fn decoder_skips_reserved_packet_type_frame() {
        let mut decoder = PacketDecoder::new();
        // Type nibble 15 is reserved; remaining length 2.
        decoder.feed(&[0xF0, 0x02, 0x00, 0x01]);
        let mut good = BytesMut::new();
        encode_packet(&Packet::PingReq, &mut good).unwrap();
        decoder.feed(&good);

        assert!(matches!(
            decoder.next_packet(),
            Err(MqttError::MalformedPacket(_))
        ));
        assert_eq!(decoder.next_packet().unwrap(), Some(Packet::PingReq));
    }

    #[test]
    fn decoder_reports_fatal_framing_error() {
        let mut decoder = PacketDecoder::new();
        decoder.feed(&[0x30, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert!(matches!(
            decoder.next_packet(),
            Err(MqttError::ProtocolError(_))
        ));
    }

    #[test]
    fn nonzero_flags_on_flagless_packet_rejected() {
        let mut decoder = PacketDecoder::new();
        // PINGREQ with flag bits set.
        decoder.feed(&[0xC1, 0x00]);
        assert!(matches!(
            decoder.next_packet(),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    fn arb_topic() -> impl Strategy<Value = String> {
        proptest::string::string_regex("[a-z]{1,8}(/[a-z]{1,8}){0,3}").unwrap()
    }

    fn arb_publish() -> impl Strategy<Value = Packet> {
        (
            arb_topic(),
            proptest::collection::vec(any::<u8>(), 0..64),
            0u8..=2,
            any::<bool>(),
            1u16..,
        )
            .prop_map(|(topic, payload, qos, retain, packet_id)| {
                let qos = QoS::try_from(qos).unwrap();
                Packet::Publish(PublishPacket {
                    topic,
                    payload: Bytes::from(payload),
                    qos,
                    retain,
                    dup: false,
                    packet_id: (qos != QoS::AtMostOnce).then_some(packet_id),
                })
            })
    }

    fn arb_packet() -> impl Strategy<Value = Packet> {
        prop_oneof![
            arb_publish(),
            (1u16..).prop_map(|id| Packet::PubAck(PubAckPacket::new(id))),
            (1u16..).prop_map(|id| Packet::PubRel(PubRelPacket::new(id))),
            (arb_topic(), 1u16.., 0u8..=2).prop_map(|(filter, id, qos)| {
                Packet::Subscribe(SubscribePacket {
                    packet_id: id,
                    filters: vec![crate::packet::TopicFilter {
                        filter,
                        qos: QoS::try_from(qos).unwrap(),
                    }],
                })
            }),
            Just(Packet::PingReq),
        ]
    }

    proptest! {
        #[test]
        fn prop_round_trip(packet in arb_packet()) {
            let mut buf = BytesMut::new();
            encode_packet(&packet, &mut buf).unwrap();
            let (decoded, consumed) = decode_packet(&buf).unwrap().unwrap();
            prop_assert_eq!(consumed, buf.len());
            prop_assert_eq!(decoded, packet);
        }

        #[test]
        fn prop_chunked_decode_matches_single_shot(
            packets in proptest::collection::vec(arb_packet(), 1..8),
            chunk_size in 1usize..32,
        ) {
            let mut wire = BytesMut::new();
            for packet in &packets {
                encode_packet(packet, &mut wire).unwrap();
            }

            let mut decoder = PacketDecoder::new();
            let mut decoded = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                decoder.feed(chunk);
                while let Some(packet) = decoder.next_packet().unwrap() {
                    decoded.push(packet);
                }
            }
            prop_assert_eq!(decoded, packets);
            prop_assert_eq!(decoder.buffered(), 0);
        }
    }
}
