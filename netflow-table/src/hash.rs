use netflow_table_common::FlowKey;

/// Hash primitive used to place flows: folds one 32-bit word into a running value.
pub type HashFn = fn(data: u32, init: u32) -> u32;

// Reflected CRC-32C (Castagnoli) polynomial.
const CRC32C_POLY: u32 = 0x82F6_3B78;

/// CRC-32C of the four little-endian bytes of `data`, continuing from `init`.
///
/// No pre or post inversion, so results chain across calls.
pub fn crc32c_u32(data: u32, init: u32) -> u32 {
    let mut crc = init;
    for byte in data.to_le_bytes() {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// Folds the 5-tuple through `f` in placement order: protocol, source address,
/// destination address, source port, destination port. Starts from zero.
pub fn flow_hash(f: HashFn, key: &FlowKey) -> u32 {
    let mut idx = 0;
    idx = f(key.proto as u32, idx);
    idx = f(key.src_addr, idx);
    idx = f(key.dst_addr, idx);
    idx = f(key.src_port as u32, idx);
    f(key.dst_port as u32, idx)
}
