//! MSC packets (ETSI EN 300 401 section 5.3.2): fixed-address packets
//! carrying data group bytes through a packet-mode subchannel.
//!
//! Header layout carried here: 3 bytes of address(10) ‖ useful data
//! length(13) ‖ padding(1), then one byte of continuity index(2) ‖
//! first(1) ‖ last(1) ‖ reserved(4) ahead of the payload.

use bytes::BufMut;

#[derive(Clone, Debug)]
pub struct MscPacket {
    /// 10-bit packet address.
    pub address: u16,
    /// 13-bit useful data length (flags byte + payload).
    pub useful_data_length: u16,
    /// 2-bit continuity counter.
    pub continuity_index: u8,
    pub first: bool,
    pub last: bool,
    pub data: Vec<u8>,
}

impl MscPacket {
    pub fn encode(&self) -> Vec<u8> {
        let header =
            (u32::from(self.address & 0x03FF) << 14) | (u32::from(self.useful_data_length & 0x1FFF) << 1);
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.put_u8((header >> 16) as u8);
        out.put_u8((header >> 8) as u8);
        out.put_u8(header as u8);
        out.put_u8(
            ((self.continuity_index & 0x03) << 6)
                | (if self.first { 0x20 } else { 0 })
                | (if self.last { 0x10 } else { 0 }),
        );
        out.extend_from_slice(&self.data);
        // Zero padding up to the declared useful length.
        let target = 3 + usize::from(self.useful_data_length);
        out.resize(target.max(out.len()), 0);
        out
    }
}

/// Splits encoded data groups into packets, keeping the continuity index
/// running across groups.
pub struct MscPacketizer {
    address: u16,
    /// Useful bytes per packet (flags byte included).
    max_packet_size: usize,
    continuity: u8,
}

impl MscPacketizer {
    pub fn new(address: u16, max_packet_size: usize) -> Self {
        MscPacketizer { address, max_packet_size, continuity: 0 }
    }

    pub fn packetize(&mut self, group_bytes: &[u8]) -> Vec<MscPacket> {
        let mut packets = Vec::new();
        if group_bytes.is_empty() {
            return packets;
        }
        let chunk = self.max_packet_size - 1; // one byte for the flags
        let mut off = 0;
        while off < group_bytes.len() {
            let end = (off + chunk).min(group_bytes.len());
            let data = group_bytes[off..end].to_vec();
            packets.push(MscPacket {
                address: self.address,
                useful_data_length: (data.len() + 1) as u16,
                continuity_index: self.continuity,
                first: off == 0,
                last: end == group_bytes.len(),
                data,
            });
            self.continuity = (self.continuity + 1) % 4;
            off = end;
        }
        packets
    }
}
