//! End-to-end frame generation: empty ensembles, a file-fed audio
//! subchannel, FIG cadence and label updates through the control
//! surface.

use std::io::Write;
use std::sync::{Arc, Mutex};

use dabmux::charset;
use dabmux::config;
use dabmux::mux::{FrameSink, Multiplexer, TickOutput};
use dabmux::remote::{audit::AuditLogger, auth::Authenticator, CommandProcessor};
use failure::Error;

const EMPTY_CONFIG: &str = r#"
ensemble:
  id: '0xCE15'
  ecc: '0xE1'
  transmission_mode: 'I'
  label: { text: 'Test', short: 'Test' }
  lto_auto: true
"#;

struct Capture(Arc<Mutex<Vec<Vec<u8>>>>);

impl FrameSink for Capture {
    fn send(&mut self, tick: &TickOutput<'_>) -> Result<(), Error> {
        self.0.lock().unwrap().push(tick.frame.to_vec());
        Ok(())
    }
}

fn collect_frames(yaml: &str, count: usize) -> Vec<Vec<u8>> {
    let cfg = config::load_str(yaml).unwrap();
    let mut mux = Multiplexer::new(cfg, false).unwrap();
    let frames = Arc::new(Mutex::new(vec![]));
    mux.add_sink(Box::new(Capture(Arc::clone(&frames))));
    for _ in 0..count {
        mux.tick().unwrap();
    }
    let collected = frames.lock().unwrap().clone();
    collected
}

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc ^ 0xFFFF
}

fn fsync_of(frame: &[u8]) -> u32 {
    (u32::from(frame[1]) << 16) | (u32::from(frame[2]) << 8) | u32::from(frame[3])
}

fn nst_of(frame: &[u8]) -> usize {
    usize::from(frame[5] & 0x7F)
}

fn fic_of(frame: &[u8]) -> &[u8] {
    let start = 8 + nst_of(frame) * 4 + 4;
    &frame[start..start + 96]
}

/// FIGs of one FIB as (type, extension, payload) tuples.
fn parse_figs(fib: &[u8]) -> Vec<(u8, u8, Vec<u8>)> {
    let mut figs = vec![];
    let mut off = 0;
    while off < 30 && fib[off] != 0xFF {
        let typ = fib[off] >> 5;
        let len = usize::from(fib[off] & 0x1F);
        let payload = fib[off + 1..off + 1 + len].to_vec();
        figs.push((typ, payload[0] & 0x1F, payload));
        off += 1 + len;
    }
    figs
}

#[test]
fn empty_ensemble_five_frames() {
    let frames = collect_frames(EMPTY_CONFIG, 5);
    assert_eq!(frames.len(), 5);

    let expected_fsync = [0xF8C549u32, 0x073AB6, 0xF8C549, 0x073AB6, 0xF8C549];
    for (n, frame) in frames.iter().enumerate() {
        assert_eq!(frame.len(), 6144, "frame {} size", n);
        assert_eq!(frame[0], 0xFF, "frame {} ERR", n);
        assert_eq!(fsync_of(frame), expected_fsync[n], "frame {} FSYNC", n);
        assert_eq!(frame[4], n as u8, "frame {} FCT", n);

        // No streams: FL = 3.
        assert_eq!(nst_of(frame), 0);
        let fl = (u16::from(frame[6] & 0x07) << 8) | u16::from(frame[7]);
        assert_eq!(fl, 3);

        // All three FIB CRCs validate; FIB 0 leads with a complete
        // FIG 0/0 carrying the EId.
        let fic = fic_of(frame);
        for fib in 0..3 {
            let body = &fic[fib * 32..fib * 32 + 30];
            let stored = u16::from_be_bytes([fic[fib * 32 + 30], fic[fib * 32 + 31]]);
            assert_eq!(stored, crc16(body), "frame {} FIB {} CRC", n, fib);
        }
        let figs = parse_figs(&fic[..30]);
        let (typ, ext, payload) = &figs[0];
        assert_eq!((*typ, *ext), (0, 0), "frame {} FIG 0/0", n);
        assert_eq!(&payload[1..3], &[0xCE, 0x15]);

        // EOH CRC over FC (+ no STC).
        let eoh_crc = u16::from_be_bytes([frame[10], frame[11]]);
        assert_eq!(eoh_crc, crc16(&frame[4..8]));

        // Empty MST: EOF CRC over zero bytes directly after the FIC.
        let eof = 12 + 96;
        assert_eq!(u16::from_be_bytes([frame[eof], frame[eof + 1]]), crc16(&[]));
        assert_eq!(&frame[eof + 2..eof + 4], &[0xFF, 0xFF]);
    }
}

#[test]
fn single_dab_subchannel_carries_input() {
    // Ten 24 ms frames of 128 kbps audio: 384 bytes each.
    let mut path = std::env::temp_dir();
    path.push(format!("dabmux-eti-input-{}.mp2", std::process::id()));
    let mut f = std::fs::File::create(&path).unwrap();
    let mut input = Vec::new();
    for n in 0..10u32 {
        let chunk: Vec<u8> = (0..384u32).map(|i| ((i + n * 7) % 251) as u8).collect();
        input.extend_from_slice(&chunk);
        f.write_all(&chunk).unwrap();
    }
    drop(f);

    let yaml = format!(
        r#"
ensemble:
  id: '0xCE15'
  ecc: '0xE1'
  label: {{ text: 'Test', short: 'Test' }}
subchannels:
  - uid: audio1
    id: 0
    type: audio
    bitrate: 128
    protection: {{ level: 2, shortform: true }}
    input: 'file://{}'
services:
  - uid: radio1
    id: '0x5001'
    label: {{ text: 'Radio One', short: 'Radio' }}
components:
  - uid: comp1
    service_id: '0x5001'
    subchannel_id: 0
"#,
        path.display()
    );
    let frames = collect_frames(&yaml, 2);

    let frame = &frames[0];
    assert_eq!(nst_of(frame), 1);
    // STC word: TPL ‖ SAd ‖ STL ‖ SCID. 128 kbps UEP level 2 is table
    // index 35 and 96 CU.
    let stc = u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]);
    assert_eq!(stc >> 26, 35, "TPL");
    assert_eq!((stc >> 16) & 0x3FF, 0, "SAd");
    assert_eq!((stc >> 6) & 0x3FF, 96, "STL");
    assert_eq!(stc & 0x3F, 0, "SCID");

    // MST starts after FC + STC + EOH + FIC and carries the input bytes.
    let mst = 8 + 4 + 4 + 96;
    assert_eq!(&frame[mst..mst + 384], &input[..384]);
    // Second frame continues the stream.
    assert_eq!(&frames[1][mst..mst + 384], &input[384..768]);

    std::fs::remove_file(path).unwrap();
}

#[test]
fn fig_0_0_complete_in_every_frame() {
    let frames = collect_frames(EMPTY_CONFIG, 10);
    let mut count = 0;
    for frame in &frames {
        let fic = fic_of(frame);
        let figs = parse_figs(&fic[..30]);
        assert_eq!((figs[0].0, figs[0].1), (0, 0));
        // Complete FIG 0/0: five payload bytes.
        assert_eq!(figs[0].2.len(), 5);
        count += 1;
    }
    assert_eq!(count, 10);
}

#[test]
fn label_update_reaches_fig_1_1() {
    let cfg = config::load_str(
        r#"
ensemble:
  id: '0xCE15'
  ecc: '0xE1'
  label: { text: 'Test', short: 'Test' }
subchannels:
  - uid: audio1
    id: 0
    type: audio
    bitrate: 64
    protection: { level: 2, shortform: true }
services:
  - uid: radio1
    id: '0x5001'
    label: { text: 'Radio One', short: 'Radio' }
components:
  - uid: comp1
    service_id: '0x5001'
    subchannel_id: 0
"#,
    )
    .unwrap();
    let mut mux = Multiplexer::new(cfg, false).unwrap();
    let frames = Arc::new(Mutex::new(vec![]));
    mux.add_sink(Box::new(Capture(Arc::clone(&frames))));

    // A frame with the original label goes out first.
    mux.tick().unwrap();

    let processor = CommandProcessor::new(
        mux.handle(),
        Authenticator::disabled(),
        AuditLogger::disabled(),
    );
    let resp = processor.execute(
        "zmq",
        "test",
        "set_service_label",
        &serde_json::json!({"service_uid": "radio1", "text": "New", "short_text": "New"}),
        None,
    );
    assert_eq!(resp["success"], true);

    // The next emitted FIG 1/1 (within the 1 s label interval) carries
    // the new 16-byte EBU Latin field and a 3-bit mask.
    for _ in 0..50 {
        mux.tick().unwrap();
    }
    let frames = frames.lock().unwrap();
    let mut seen_new = false;
    for frame in frames.iter().skip(1) {
        let fic = fic_of(frame);
        for fib in 0..3 {
            for (typ, ext, payload) in parse_figs(&fic[fib * 32..fib * 32 + 30]) {
                if typ == 1 && (payload[0] & 0x07) == 1 {
                    let _ = ext;
                    assert_eq!(&payload[1..3], &[0x50, 0x01]);
                    let text = charset::decode_label(&payload[3..19]);
                    let mask = u16::from_be_bytes([payload[19], payload[20]]);
                    if text.trim_end() == "New" {
                        assert_eq!(mask, 0xE000);
                        seen_new = true;
                    }
                }
            }
        }
    }
    assert!(seen_new, "no FIG 1/1 with the updated label observed");
}
