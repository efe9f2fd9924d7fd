/// Ethernet frame followed by a minimal 20-byte IPv4-shaped header, padded
/// with zeros up to `total_len`.
pub fn frame(
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    ether_type: u16,
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    total_len: usize,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(total_len.max(34));
    buf.extend_from_slice(&dst_mac);
    buf.extend_from_slice(&src_mac);
    buf.extend_from_slice(&ether_type.to_be_bytes());
    let ip_len = (total_len.saturating_sub(14) as u16).to_be_bytes();
    buf.extend_from_slice(&[0x45, 0, ip_len[0], ip_len[1], 0, 0, 0, 0, 64, 6, 0, 0]);
    buf.extend_from_slice(&src_ip);
    buf.extend_from_slice(&dst_ip);
    buf.resize(total_len.max(buf.len()), 0);
    buf
}
