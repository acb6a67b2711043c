/// DNS 头部长度 / Fixed DNS header length.
pub const HEADER_LEN: usize = 12;

/// Upper bound on the wire-format name we are willing to collect.
pub const MAX_NAME_LEN: usize = 4096;

/// 解析名称时的最大迭代次数，防止压缩指针环
const MAX_NAME_STEPS: usize = 4096;

pub const QTYPE_TXT: u16 = 16;
pub const QCLASS_IN: u16 = 1;

#[inline]
pub fn read_txid(packet: &[u8]) -> Option<u16> {
    if packet.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

#[inline]
pub fn write_txid(packet: &mut [u8], txid: u16) {
    if packet.len() >= 2 {
        packet[..2].copy_from_slice(&txid.to_be_bytes());
    }
}

/// Byte 2 may only carry RD: no QR, opcode, AA or TC.
#[inline]
pub fn is_plain_query(packet: &[u8]) -> bool {
    packet.len() >= HEADER_LEN && packet[2] & 0xfe == 0
}

/// 单问题、RA/Z/RCODE 为零、其余计数为零
/// Header tail (RA/Z/RCODE, counts) of a query carrying exactly one question.
#[inline]
pub fn is_single_question(packet: &[u8]) -> bool {
    packet.len() >= HEADER_LEN && packet[3..HEADER_LEN] == [0, 0, 1, 0, 0, 0, 0, 0, 0]
}

#[inline]
pub fn recursion_desired(packet: &[u8]) -> bool {
    packet.len() > 2 && packet[2] & 0x01 != 0
}

/// 读取一个（可能被压缩的）名称，返回线格式名称与问题后续位置
///
/// Decompresses the name starting at `pos` into wire form: length-prefixed
/// labels ending with the zero root label. The returned position is the byte
/// just past the name as it sits in the packet, i.e. just past the first
/// compression pointer if one was followed.
pub fn get_name(packet: &[u8], mut pos: usize) -> Option<(Vec<u8>, usize)> {
    let mut name = Vec::with_capacity(256);
    let mut first_compress = None;
    let mut steps = 0usize;
    // bytes still owed to the current label
    let mut pending = 0u8;

    loop {
        let mut ch = *packet.get(pos)?;
        pos += 1;
        steps += 1;
        if steps >= MAX_NAME_STEPS {
            return None;
        }

        if pending > 0 {
            if name.len() >= MAX_NAME_LEN {
                return None;
            }
            name.push(ch);
            pending -= 1;
            continue;
        }

        while ch >= 0xc0 {
            let low = *packet.get(pos)?;
            pos += 1;
            first_compress.get_or_insert(pos);
            pos = (((ch - 0xc0) as usize) << 8) | low as usize;
            ch = *packet.get(pos)?;
            pos += 1;
            steps += 1;
            if steps >= MAX_NAME_STEPS {
                return None;
            }
        }

        // 0x40..0xc0 are reserved label types
        if ch >= 0x40 || name.len() >= MAX_NAME_LEN {
            return None;
        }
        name.push(ch);
        if ch == 0 {
            break;
        }
        pending = ch;
    }

    Some((name, first_compress.unwrap_or(pos)))
}

/// Type and class following a question name, if exactly four bytes remain.
pub fn question_tail(packet: &[u8], pos: usize) -> Option<(u16, u16)> {
    if packet.len().checked_sub(pos)? != 4 {
        return None;
    }
    let qtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
    let qclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);
    Some((qtype, qclass))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(id: u16, flags: u8) -> Vec<u8> {
        let mut p = id.to_be_bytes().to_vec();
        p.extend_from_slice(&[flags, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        p
    }

    #[test]
    fn reads_plain_name() {
        let mut p = header(0x1234, 0x01);
        p.extend_from_slice(b"\x03www\x07example\x03com\x00\x00\x10\x00\x01");
        let (name, pos) = get_name(&p, HEADER_LEN).unwrap();
        assert_eq!(name, b"\x03www\x07example\x03com\x00");
        assert_eq!(pos, p.len() - 4);
        assert_eq!(question_tail(&p, pos), Some((QTYPE_TXT, QCLASS_IN)));
    }

    #[test]
    fn follows_compression_pointer() {
        let mut p = header(1, 0);
        p.extend_from_slice(b"\x07example\x03com\x00");
        let second = p.len();
        p.extend_from_slice(b"\x03www\xc0\x0c\x00\x01\x00\x01");
        let (name, pos) = get_name(&p, second).unwrap();
        assert_eq!(name, b"\x03www\x07example\x03com\x00");
        // position just past the pointer, not past the target
        assert_eq!(pos, second + 6);
    }

    #[test]
    fn rejects_pointer_loop() {
        let mut p = header(1, 0);
        p.extend_from_slice(b"\xc0\x0c");
        assert!(get_name(&p, HEADER_LEN).is_none());
    }

    #[test]
    fn rejects_truncated_and_reserved_labels() {
        let mut p = header(1, 0);
        p.extend_from_slice(b"\x05abc");
        assert!(get_name(&p, HEADER_LEN).is_none());

        let mut p = header(1, 0);
        p.extend_from_slice(b"\x41abc\x00");
        assert!(get_name(&p, HEADER_LEN).is_none());

        let p = header(1, 0);
        assert!(get_name(&p, HEADER_LEN).is_none());
    }

    #[test]
    fn header_checks() {
        let q = header(7, 0x01);
        assert!(is_plain_query(&q));
        assert!(is_single_question(&q));
        assert!(recursion_desired(&q));
        assert_eq!(read_txid(&q), Some(7));

        // response bit
        assert!(!is_plain_query(&header(7, 0x81)));
        // truncated bit
        assert!(!is_plain_query(&header(7, 0x02)));

        let mut two = header(7, 0);
        two[5] = 2;
        assert!(!is_single_question(&two));
        assert!(!recursion_desired(&two));
    }

    #[test]
    fn write_txid_overwrites_first_two_bytes() {
        let mut q = header(0xaaaa, 0);
        write_txid(&mut q, 0x0102);
        assert_eq!(&q[..3], &[0x01, 0x02, 0x00]);
    }

    #[test]
    fn question_tail_requires_exactly_four_bytes() {
        let p = [0u8, 16, 0, 1, 0];
        assert_eq!(question_tail(&p, 0), None);
        assert_eq!(question_tail(&p, 1), Some((0x1000, 0x0100)));
        assert_eq!(question_tail(&p, 9), None);
    }
}
