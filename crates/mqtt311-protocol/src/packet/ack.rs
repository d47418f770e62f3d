//! The four fixed-size acknowledgement packets of the publish flows.
//!
//! PUBACK, PUBREC, PUBREL, and PUBCOMP share an identical two-byte body
//! (the packet identifier), so they are stamped out by one macro.

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoding::read_u16;
use crate::error::Result;

macro_rules! define_ack_packet {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
        }

        impl $name {
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
    };
}

define_ack_packet! {
    /// PUBACK: `QoS` 1 publish acknowledgement.
    PubAckPacket
}

define_ack_packet! {
    /// PUBREC: first broker response in the `QoS` 2 handshake.
    PubRecPacket
}

define_ack_packet! {
    /// PUBREL: sender's release in the `QoS` 2 handshake (flags 0b0010).
    PubRelPacket
}

define_ack_packet! {
    /// PUBCOMP: final leg of the `QoS` 2 handshake.
    PubCompPacket
}
