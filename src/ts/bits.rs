//! TS/PES/PSI Bitstream Layer
//!
//! Field-level accessors for ISO 13818-1 structures: the 188-byte
//! transport packet with its adaptation field and PCR, PES headers with
//! PTS/DTS, and PSI section framing with CRC-32/MPEG-2. Writers operate
//! on `&mut [u8]` packets; the PES/PSI builders assemble into `BytesMut`.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_32_MPEG_2};

/// Transport packet size
pub const TS_SIZE: usize = 188;
/// Transport header size without adaptation field
pub const TS_HEADER_SIZE: usize = 4;
/// Header size with an empty adaptation field (length + flags)
pub const TS_HEADER_SIZE_AF: usize = 6;
/// Header size with an adaptation field carrying a PCR
pub const TS_HEADER_SIZE_PCR: usize = 12;
/// Sync byte
pub const TS_SYNC: u8 = 0x47;
/// Null (stuffing) PID
pub const PID_NULL: u16 = 0x1FFF;
/// PAT PID
pub const PID_PAT: u16 = 0;

/// PES start-code prefix + stream id + length
pub const PES_HEADER_SIZE: usize = 6;
/// PES header with flags but neither PTS nor DTS
pub const PES_HEADER_SIZE_NOPTS: usize = 9;
/// PES header with PTS
pub const PES_HEADER_SIZE_PTS: usize = 14;
/// PES header with PTS and DTS
pub const PES_HEADER_SIZE_PTSDTS: usize = 19;

/// MPEG video stream id base
pub const PES_STREAM_ID_VIDEO_MPEG: u8 = 0xE0;
/// MPEG audio stream id base
pub const PES_STREAM_ID_AUDIO_MPEG: u8 = 0xC0;
/// private_stream_1
pub const PES_STREAM_ID_PRIVATE_1: u8 = 0xBD;
/// private_stream_2: no flags, no timestamps
pub const PES_STREAM_ID_PRIVATE_2: u8 = 0xBF;

/// CRC used by PSI sections
pub const PSI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

// ---------------------------------------------------------------------------
// Transport packet header
// ---------------------------------------------------------------------------

/// Initialize a packet: sync byte, no flags, payload-only, CC 0
pub fn ts_init(pkt: &mut [u8]) {
    pkt[0] = TS_SYNC;
    pkt[1] = 0;
    pkt[2] = 0;
    pkt[3] = 0x10;
}

/// Whether the packet starts with the sync byte
pub fn ts_validate(pkt: &[u8]) -> bool {
    pkt.len() >= TS_HEADER_SIZE && pkt[0] == TS_SYNC
}

/// Set the packet identifier
pub fn ts_set_pid(pkt: &mut [u8], pid: u16) {
    pkt[1] = (pkt[1] & 0xE0) | ((pid >> 8) as u8 & 0x1F);
    pkt[2] = pid as u8;
}

/// The packet identifier
pub fn ts_get_pid(pkt: &[u8]) -> u16 {
    (u16::from(pkt[1] & 0x1F) << 8) | u16::from(pkt[2])
}

/// Set payload_unit_start_indicator
pub fn ts_set_unit_start(pkt: &mut [u8]) {
    pkt[1] |= 0x40;
}

/// payload_unit_start_indicator
pub fn ts_get_unit_start(pkt: &[u8]) -> bool {
    pkt[1] & 0x40 != 0
}

/// Set the continuity counter
pub fn ts_set_cc(pkt: &mut [u8], cc: u8) {
    pkt[3] = (pkt[3] & 0xF0) | (cc & 0x0F);
}

/// The continuity counter
pub fn ts_get_cc(pkt: &[u8]) -> u8 {
    pkt[3] & 0x0F
}

/// Mark the packet as carrying payload
pub fn ts_set_payload(pkt: &mut [u8]) {
    pkt[3] |= 0x10;
}

/// Remove the payload marker (adaptation-field-only packets)
pub fn ts_clear_payload(pkt: &mut [u8]) {
    pkt[3] &= !0x10;
}

/// Whether the packet carries payload
pub fn ts_has_payload(pkt: &[u8]) -> bool {
    pkt[3] & 0x10 != 0
}

/// Whether an adaptation field is present
pub fn ts_has_adaptation(pkt: &[u8]) -> bool {
    pkt[3] & 0x20 != 0
}

/// Adaptation field length byte (bytes following it)
pub fn ts_get_adaptation(pkt: &[u8]) -> u8 {
    pkt[4]
}

/// Install an adaptation field of `length` bytes after the length byte
///
/// Fills the field with stuffing (flags byte 0 when `length > 0`, 0xFF
/// beyond); PCR and indicator setters poke into it afterwards.
pub fn ts_set_adaptation(pkt: &mut [u8], length: u8) {
    pkt[3] |= 0x20;
    pkt[4] = length;
    if length > 0 {
        pkt[5] = 0;
        for byte in &mut pkt[6..5 + length as usize] {
            *byte = 0xFF;
        }
    }
}

/// Total header size including any adaptation field
pub fn ts_payload_offset(pkt: &[u8]) -> usize {
    if ts_has_adaptation(pkt) {
        TS_HEADER_SIZE + 1 + ts_get_adaptation(pkt) as usize
    } else {
        TS_HEADER_SIZE
    }
}

/// Set the discontinuity indicator (requires an adaptation field)
pub fn tsaf_set_discontinuity(pkt: &mut [u8]) {
    pkt[5] |= 0x80;
}

/// Discontinuity indicator
pub fn tsaf_has_discontinuity(pkt: &[u8]) -> bool {
    ts_has_adaptation(pkt) && ts_get_adaptation(pkt) > 0 && pkt[5] & 0x80 != 0
}

/// Set the random access indicator (requires an adaptation field)
pub fn tsaf_set_random(pkt: &mut [u8]) {
    pkt[5] |= 0x40;
}

/// Random access indicator
pub fn tsaf_has_random(pkt: &[u8]) -> bool {
    ts_has_adaptation(pkt) && ts_get_adaptation(pkt) > 0 && pkt[5] & 0x40 != 0
}

/// Whether the adaptation field carries a PCR
pub fn tsaf_has_pcr(pkt: &[u8]) -> bool {
    ts_has_adaptation(pkt) && ts_get_adaptation(pkt) > 0 && pkt[5] & 0x10 != 0
}

/// Write a PCR in 27 MHz ticks (33-bit base at 90 kHz x 300 + 9-bit
/// extension); the adaptation field must span the PCR bytes
pub fn tsaf_set_pcr(pkt: &mut [u8], pcr: u64) {
    let base = (pcr / 300) & 0x1_FFFF_FFFF;
    let ext = (pcr % 300) as u16;
    pkt[5] |= 0x10;
    pkt[6] = (base >> 25) as u8;
    pkt[7] = (base >> 17) as u8;
    pkt[8] = (base >> 9) as u8;
    pkt[9] = (base >> 1) as u8;
    pkt[10] = ((base as u8) << 7) | 0x7E | ((ext >> 8) as u8);
    pkt[11] = ext as u8;
}

/// Read the PCR back in 27 MHz ticks
pub fn tsaf_get_pcr(pkt: &[u8]) -> u64 {
    let base = (u64::from(pkt[6]) << 25)
        | (u64::from(pkt[7]) << 17)
        | (u64::from(pkt[8]) << 9)
        | (u64::from(pkt[9]) << 1)
        | u64::from(pkt[10] >> 7);
    let ext = (u64::from(pkt[10] & 0x01) << 8) | u64::from(pkt[11]);
    base * 300 + ext
}

/// Write a full null (stuffing) packet
pub fn ts_pad(pkt: &mut [u8]) {
    ts_init(pkt);
    ts_set_pid(pkt, PID_NULL);
    for byte in &mut pkt[TS_HEADER_SIZE..TS_SIZE] {
        *byte = 0xFF;
    }
}

// ---------------------------------------------------------------------------
// PES
// ---------------------------------------------------------------------------

/// Size of the PES header for a stream id and timestamp presence
pub fn pes_header_size(stream_id: u8, has_pts: bool, has_dts: bool) -> usize {
    if stream_id == PES_STREAM_ID_PRIVATE_2 {
        PES_HEADER_SIZE
    } else if has_dts {
        PES_HEADER_SIZE_PTSDTS
    } else if has_pts {
        PES_HEADER_SIZE_PTS
    } else {
        PES_HEADER_SIZE_NOPTS
    }
}

fn put_timestamp(out: &mut BytesMut, marker: u8, ts: u64) {
    let ts = ts & 0x1_FFFF_FFFF;
    out.put_u8((marker << 4) | ((ts >> 29) as u8 & 0x0E) | 0x01);
    out.put_u8((ts >> 22) as u8);
    out.put_u8(((ts >> 14) as u8 & 0xFE) | 0x01);
    out.put_u8((ts >> 7) as u8);
    out.put_u8(((ts << 1) as u8) | 0x01);
}

/// Build a PES header
///
/// `payload_size` is the ES byte count following the header;
/// `pts`/`dts` are 90 kHz values, DTS only together with PTS and only
/// when it differs. Oversized packets (video) get an unbounded length
/// field of 0.
pub fn pes_build_header(
    stream_id: u8,
    payload_size: usize,
    alignment: bool,
    pts: Option<u64>,
    dts: Option<u64>,
) -> BytesMut {
    let header_size = pes_header_size(stream_id, pts.is_some(), dts.is_some());
    let mut out = BytesMut::with_capacity(header_size);
    out.put_slice(&[0x00, 0x00, 0x01, stream_id]);
    let pes_length = header_size - PES_HEADER_SIZE + payload_size;
    if pes_length > usize::from(u16::MAX) {
        out.put_u16(0);
    } else {
        out.put_u16(pes_length as u16);
    }
    if stream_id == PES_STREAM_ID_PRIVATE_2 {
        return out;
    }
    out.put_u8(0x80 | if alignment { 0x04 } else { 0 });
    let flags = match (pts, dts) {
        (Some(_), Some(_)) => 0xC0,
        (Some(_), None) => 0x80,
        _ => 0x00,
    };
    out.put_u8(flags);
    out.put_u8((header_size - PES_HEADER_SIZE_NOPTS) as u8);
    match (pts, dts) {
        (Some(pts), Some(dts)) => {
            put_timestamp(&mut out, 0x03, pts);
            put_timestamp(&mut out, 0x01, dts);
        }
        (Some(pts), None) => put_timestamp(&mut out, 0x02, pts),
        _ => {}
    }
    debug_assert_eq!(out.len(), header_size);
    out
}

/// Whether bytes start with a PES start code
pub fn pes_validate(pes: &[u8]) -> bool {
    pes.len() >= PES_HEADER_SIZE && pes[0] == 0 && pes[1] == 0 && pes[2] == 1
}

/// PES stream id
pub fn pes_get_stream_id(pes: &[u8]) -> u8 {
    pes[3]
}

/// PES_packet_length field
pub fn pes_get_length(pes: &[u8]) -> u16 {
    (u16::from(pes[4]) << 8) | u16::from(pes[5])
}

/// data_alignment_indicator (flags-bearing stream ids only)
pub fn pes_get_alignment(pes: &[u8]) -> bool {
    pes[6] & 0x04 != 0
}

/// PES_header_data_length
pub fn pes_get_header_data_length(pes: &[u8]) -> u8 {
    pes[8]
}

/// Whether a PTS is present
pub fn pes_has_pts(pes: &[u8]) -> bool {
    pes[7] & 0x80 != 0
}

/// Whether a DTS is present
pub fn pes_has_dts(pes: &[u8]) -> bool {
    pes[7] & 0xC0 == 0xC0
}

fn get_timestamp(ts: &[u8]) -> u64 {
    (u64::from(ts[0] & 0x0E) << 29)
        | (u64::from(ts[1]) << 22)
        | (u64::from(ts[2] & 0xFE) << 14)
        | (u64::from(ts[3]) << 7)
        | u64::from(ts[4] >> 1)
}

/// The PTS in 90 kHz units
pub fn pes_get_pts(pes: &[u8]) -> u64 {
    get_timestamp(&pes[9..14])
}

/// The DTS in 90 kHz units
pub fn pes_get_dts(pes: &[u8]) -> u64 {
    get_timestamp(&pes[14..19])
}

// ---------------------------------------------------------------------------
// PSI
// ---------------------------------------------------------------------------

/// Build a PSI section: header, body, CRC
///
/// `table_id_ext` is the transport_stream_id (PAT) or program_number
/// (PMT). The section_syntax_indicator is set and the section is marked
/// current.
pub fn psi_build_section(table_id: u8, table_id_ext: u16, version: u8, body: &[u8]) -> BytesMut {
    // 5 header bytes after the length field, plus body, plus CRC.
    let section_length = 5 + body.len() + 4;
    let mut out = BytesMut::with_capacity(3 + section_length);
    out.put_u8(table_id);
    out.put_u8(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    out.put_u8(section_length as u8);
    out.put_u16(table_id_ext);
    out.put_u8(0xC1 | ((version & 0x1F) << 1));
    out.put_u8(0); // section_number
    out.put_u8(0); // last_section_number
    out.put_slice(body);
    let crc = PSI_CRC.checksum(&out);
    out.put_u32(crc);
    out
}

/// Whether a section's CRC matches
pub fn psi_check_crc(section: &[u8]) -> bool {
    if section.len() < 4 {
        return false;
    }
    let (body, crc) = section.split_at(section.len() - 4);
    PSI_CRC.checksum(body).to_be_bytes() == crc
}

/// Build a PAT section mapping program numbers to PMT PIDs
pub fn pat_build(tsid: u16, version: u8, programs: &[(u16, u16)]) -> BytesMut {
    let mut body = BytesMut::with_capacity(programs.len() * 4);
    for &(program, pid) in programs {
        body.put_u16(program);
        body.put_u16(0xE000 | (pid & 0x1FFF));
    }
    psi_build_section(0x00, tsid, version, &body)
}

/// One elementary stream entry of a PMT
#[derive(Debug, Clone, Copy)]
pub struct PmtEs {
    /// stream_type per ISO 13818-1 table 2-29
    pub stream_type: u8,
    /// Elementary PID
    pub pid: u16,
}

/// Build a PMT section for one program
pub fn pmt_build(program: u16, version: u8, pcr_pid: u16, es: &[PmtEs]) -> BytesMut {
    let mut body = BytesMut::with_capacity(4 + es.len() * 5);
    body.put_u16(0xE000 | (pcr_pid & 0x1FFF));
    body.put_u16(0xF000); // program_info_length 0
    for entry in es {
        body.put_u8(entry.stream_type);
        body.put_u16(0xE000 | (entry.pid & 0x1FFF));
        body.put_u16(0xF000); // ES_info_length 0
    }
    psi_build_section(0x02, program, version, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_roundtrip() {
        let mut pkt = [0u8; TS_SIZE];
        ts_init(&mut pkt);
        ts_set_pid(&mut pkt, 0x1ABC & 0x1FFF);
        ts_set_cc(&mut pkt, 13);
        ts_set_unit_start(&mut pkt);
        assert!(ts_validate(&pkt));
        assert_eq!(ts_get_pid(&pkt), 0x1ABC & 0x1FFF);
        assert_eq!(ts_get_cc(&pkt), 13);
        assert!(ts_get_unit_start(&pkt));
        assert!(ts_has_payload(&pkt));
        assert!(!ts_has_adaptation(&pkt));
    }

    #[test]
    fn pcr_roundtrip() {
        let mut pkt = [0u8; TS_SIZE];
        ts_init(&mut pkt);
        ts_set_adaptation(&mut pkt, 7);
        let pcr = 123_456_789_012 % (8_589_934_592 * 300);
        tsaf_set_pcr(&mut pkt, pcr);
        assert!(tsaf_has_pcr(&pkt));
        assert_eq!(tsaf_get_pcr(&pkt), pcr);
        assert_eq!(ts_payload_offset(&pkt), TS_HEADER_SIZE_PCR);
    }

    #[test]
    fn adaptation_flags() {
        let mut pkt = [0u8; TS_SIZE];
        ts_init(&mut pkt);
        ts_set_adaptation(&mut pkt, 1);
        tsaf_set_random(&mut pkt);
        tsaf_set_discontinuity(&mut pkt);
        assert!(tsaf_has_random(&pkt));
        assert!(tsaf_has_discontinuity(&pkt));
        assert_eq!(ts_payload_offset(&pkt), TS_HEADER_SIZE_AF);
    }

    #[test]
    fn pes_header_sizes() {
        assert_eq!(
            pes_build_header(PES_STREAM_ID_PRIVATE_2, 100, true, None, None).len(),
            PES_HEADER_SIZE
        );
        assert_eq!(
            pes_build_header(PES_STREAM_ID_AUDIO_MPEG, 100, true, Some(1000), None).len(),
            PES_HEADER_SIZE_PTS
        );
        assert_eq!(
            pes_build_header(PES_STREAM_ID_VIDEO_MPEG, 100, true, Some(1000), Some(900)).len(),
            PES_HEADER_SIZE_PTSDTS
        );
    }

    #[test]
    fn pes_timestamps_roundtrip() {
        let pts = 3 * 90_000u64;
        let dts = 2 * 90_000u64;
        let header = pes_build_header(PES_STREAM_ID_VIDEO_MPEG, 2206, true, Some(pts), Some(dts));
        assert!(pes_validate(&header));
        assert_eq!(pes_get_stream_id(&header), PES_STREAM_ID_VIDEO_MPEG);
        assert!(pes_has_pts(&header));
        assert!(pes_has_dts(&header));
        assert_eq!(pes_get_pts(&header), pts);
        assert_eq!(pes_get_dts(&header), dts);
        assert!(pes_get_alignment(&header));
        assert_eq!(
            usize::from(pes_get_length(&header)),
            2206 + PES_HEADER_SIZE_PTSDTS - PES_HEADER_SIZE
        );
    }

    #[test]
    fn pes_length_overflows_to_unbounded() {
        let header =
            pes_build_header(PES_STREAM_ID_VIDEO_MPEG, 100_000, false, Some(0), None);
        assert_eq!(pes_get_length(&header), 0);
    }

    #[test]
    fn pat_section_is_valid() {
        let section = pat_build(1, 0, &[(1, 0x1000)]);
        assert_eq!(section[0], 0x00);
        assert!(psi_check_crc(&section));
        // 3 header + 5 syntax + 4 entry + 4 crc
        assert_eq!(section.len(), 16);
    }

    #[test]
    fn pmt_section_is_valid() {
        let section = pmt_build(
            1,
            0,
            68,
            &[
                PmtEs { stream_type: 0x02, pid: 68 },
                PmtEs { stream_type: 0x04, pid: 69 },
            ],
        );
        assert_eq!(section[0], 0x02);
        assert!(psi_check_crc(&section));
    }

    #[test]
    fn null_packet_is_all_stuffing() {
        let mut pkt = [0u8; TS_SIZE];
        ts_pad(&mut pkt);
        assert_eq!(ts_get_pid(&pkt), PID_NULL);
        assert!(pkt[TS_HEADER_SIZE..].iter().all(|&b| b == 0xFF));
    }
}
