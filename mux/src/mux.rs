//! The multiplexer: one 6144-byte ETI frame every 24 ms from the current
//! ensemble state and input contents.
//!
//! The frame loop is the sole mutator of per-frame state (frame counter,
//! FIG scheduling, superframe buffers) and takes a short read lock on the
//! shared ensemble each tick; control-surface writers hold the write lock
//! only long enough to copy a field.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use failure::Error;
use log::{error, info, warn};
use parking_lot::RwLock;

use crate::config::Config;
use crate::dabplus::DabPlusInput;
use crate::ensemble::{DabEnsemble, SubchannelType};
use crate::eti::{EtiFrameBuilder, StreamSpec};
use crate::fic::FicScheduler;
use crate::fig::FigCtx;
use crate::input::{create_input, InputSource, InputUri};
use crate::mot::Carousel;
use crate::pad::dls::{DlsCharset, DlsEncoder};
use crate::pad::file_monitor::DlsFileMonitor;
use crate::pad::PadAssembler;
use crate::stats::{InputStatistics, InputStatusReport};
use crate::timestamp::FrameTimestamp;

/// Frame cadence.
pub const FRAME_DURATION: Duration = Duration::from_millis(24);
/// Input status snapshots are refreshed this many frames apart (~1 s).
const STATUS_REFRESH_FRAMES: u64 = 42;
/// Grace period for joining input threads at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared state the control surface operates on.
#[derive(Clone)]
pub struct MuxHandle {
    pub ensemble: Arc<RwLock<DabEnsemble>>,
    pub frame_count: Arc<AtomicU64>,
    pub started: Instant,
    pub input_status: Arc<Mutex<HashMap<String, InputStatusReport>>>,
    /// Carousels by component uid.
    pub carousels: Arc<Mutex<HashMap<String, Arc<Mutex<Carousel>>>>>,
    pub fic_undelivered: Arc<AtomicU64>,
}

/// Everything one tick produced; sinks consume what they need.
pub struct TickOutput<'a> {
    /// The assembled 6144-byte frame.
    pub frame: &'a [u8],
    pub fic: &'a [u8],
    /// (SubChId, SAd, TPL, payload) per stream, declaration order.
    pub streams: &'a [(u8, u16, u8, Vec<u8>)],
    pub frame_number: u64,
    pub fct: u8,
    /// Frame phase (frame number modulo 8).
    pub fp: u8,
    /// Mode identity.
    pub mid: u8,
    pub timestamp: FrameTimestamp,
    pub tist_enabled: bool,
}

/// A frame consumer: the ETI file writer or the EDI encoder.
pub trait FrameSink: Send {
    fn send(&mut self, tick: &TickOutput<'_>) -> Result<(), Error>;
    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

struct PadState {
    assembler: PadAssembler,
    monitor: Option<DlsFileMonitor>,
    /// Component whose dynamic label feeds this PAD stream.
    component_uid: Option<String>,
}

enum PipelineKind {
    Stream { input: Box<dyn InputSource>, pad: Option<PadState> },
    Packet { carousel: Arc<Mutex<Carousel>> },
    /// No input available: the subchannel carries zeros.
    Silent,
}

struct Pipeline {
    uid: String,
    scid: u8,
    sad: u16,
    tpl: u8,
    size_bytes: usize,
    kind: PipelineKind,
    stats: InputStatistics,
}

pub struct Multiplexer {
    handle: MuxHandle,
    pipelines: Vec<Pipeline>,
    fic: FicScheduler,
    builder: EtiFrameBuilder,
    timestamp: FrameTimestamp,
    tist_enabled: bool,
    frame_number: u64,
    mid: u8,
    sinks: Vec<Box<dyn FrameSink>>,
}

impl Multiplexer {
    pub fn new(config: Config, tist_enabled: bool) -> Result<Self, Error> {
        let ensemble = config.ensemble;
        let mid = ensemble.mode.mid();
        let builder = EtiFrameBuilder::new(ensemble.mode, ensemble.mnsc);

        let handle = MuxHandle {
            ensemble: Arc::new(RwLock::new(ensemble)),
            frame_count: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
            input_status: Arc::new(Mutex::new(HashMap::new())),
            carousels: Arc::new(Mutex::new(HashMap::new())),
            fic_undelivered: Arc::new(AtomicU64::new(0)),
        };

        let mut pipelines = Vec::new();
        {
            let ens = handle.ensemble.read();
            for sub in &ens.subchannels {
                pipelines.push(build_pipeline(&ens, sub, &handle)?);
            }
        }

        Ok(Multiplexer {
            handle,
            pipelines,
            fic: FicScheduler::new(),
            builder,
            timestamp: FrameTimestamp::now(),
            tist_enabled,
            frame_number: 0,
            mid,
            sinks: Vec::new(),
        })
    }

    pub fn handle(&self) -> MuxHandle {
        self.handle.clone()
    }

    pub fn add_sink(&mut self, sink: Box<dyn FrameSink>) {
        self.sinks.push(sink);
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Produces and dispatches exactly one frame.
    pub fn tick(&mut self) -> Result<(), Error> {
        let ensemble = self.handle.ensemble.read();
        let now_ms = self.frame_number * 24;

        // Subchannel payloads first; DAB+ superframe state advances here.
        let mut streams: Vec<(u8, u16, u8, Vec<u8>)> =
            Vec::with_capacity(self.pipelines.len());
        for pipeline in &mut self.pipelines {
            let data = pipeline.read_frame(&ensemble);
            streams.push((pipeline.scid, pipeline.sad, pipeline.tpl, data));
        }

        // Three FIBs from the FIG scheduler.
        let ctx = FigCtx {
            ensemble: &ensemble,
            cif_count: (self.frame_number & 0xFFFF_FFFF) as u32,
            now: chrono::Utc::now(),
        };
        let fic = self.fic.build_fic(&ctx, now_ms);
        self.handle
            .fic_undelivered
            .store(self.fic.undelivered(), Ordering::Relaxed);
        drop(ensemble);

        let specs: Vec<StreamSpec<'_>> = streams
            .iter()
            .map(|(scid, sad, tpl, data)| StreamSpec { scid: *scid, sad: *sad, tpl: *tpl, data })
            .collect();
        let tist = if self.tist_enabled { Some(self.timestamp.tist_ticks()) } else { None };
        let frame = self.builder.build(self.frame_number, &fic, &specs, tist);

        let tick = TickOutput {
            frame: &frame,
            fic: &fic,
            streams: &streams,
            frame_number: self.frame_number,
            fct: (self.frame_number % crate::eti::FCT_MODULUS) as u8,
            fp: (self.frame_number % 8) as u8,
            mid: self.mid,
            timestamp: self.timestamp,
            tist_enabled: self.tist_enabled,
        };
        for sink in &mut self.sinks {
            if let Err(e) = sink.send(&tick) {
                // Output errors never abort the frame loop.
                warn!("frame sink error: {}", e);
            }
        }

        if self.frame_number % STATUS_REFRESH_FRAMES == 0 {
            let mut map = self.handle.input_status.lock().expect("status lock");
            for pipeline in &mut self.pipelines {
                map.insert(pipeline.uid.clone(), pipeline.stats.report());
            }
        }

        self.frame_number += 1;
        self.handle.frame_count.store(self.frame_number, Ordering::Relaxed);
        self.timestamp.advance_frame();
        Ok(())
    }

    /// Runs the paced frame loop until `frames` are emitted (None for
    /// continuous operation) or the shutdown flag rises. Carousel
    /// watchers run alongside and stop with the loop.
    pub fn run(&mut self, frames: Option<u64>, shutdown: Arc<AtomicBool>) -> Result<(), Error> {
        let watcher = spawn_carousel_watcher(&self.handle, Arc::clone(&shutdown));

        let mut next = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            if let Some(limit) = frames {
                if self.frame_number >= limit {
                    break;
                }
            }
            self.tick()?;
            next += FRAME_DURATION;
            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            } else if now - next > Duration::from_secs(1) {
                warn!("frame loop fell {:?} behind, resynchronizing", now - next);
                next = now;
                self.timestamp = FrameTimestamp::now();
            }
        }

        self.close();
        shutdown.store(true, Ordering::SeqCst);
        if let Some(w) = watcher {
            let _ = w.join();
        }
        info!("multiplexer stopped after {} frame(s)", self.frame_number);
        Ok(())
    }

    /// Flushes sinks and closes all inputs.
    pub fn close(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                warn!("sink flush failed: {}", e);
            }
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for pipeline in &mut self.pipelines {
            if Instant::now() > deadline {
                warn!("shutdown grace period exceeded, abandoning input close");
                break;
            }
            if let PipelineKind::Stream { input, .. } = &mut pipeline.kind {
                input.close();
            }
        }
    }
}

impl Pipeline {
    /// The subchannel's bytes for this frame, always `size_bytes` long.
    fn read_frame(&mut self, ensemble: &DabEnsemble) -> Vec<u8> {
        let size = self.size_bytes;
        let mut data = match &mut self.kind {
            PipelineKind::Stream { input, pad } => {
                let underruns_before = input.underruns();
                let mut data = input.read_frame(size);
                if input.underruns() > underruns_before {
                    self.stats.notify_underrun();
                }
                self.stats.notify_buffer(input.buffered());
                if let Some(pad) = pad {
                    apply_pad(ensemble, pad, &mut data);
                }
                data
            }
            PipelineKind::Packet { carousel } => {
                let mut carousel = carousel.lock().expect("carousel lock");
                let data = carousel.fill_frame(size);
                self.stats.notify_buffer(data.len());
                data
            }
            PipelineKind::Silent => {
                self.stats.notify_underrun();
                vec![0u8; size]
            }
        };
        data.resize(size, 0);
        let peak = peak_level(&data);
        self.stats.notify_peak_levels(peak, peak);
        data
    }
}

/// Overwrites the trailing PAD field of an audio frame.
fn apply_pad(ensemble: &DabEnsemble, pad: &mut PadState, data: &mut [u8]) {
    // Remote-set dynamic labels win over the file monitor.
    let dynamic = pad
        .component_uid
        .as_ref()
        .and_then(|uid| ensemble.component(uid))
        .and_then(|c| c.dynamic_label.clone());
    match dynamic {
        Some(text) => pad.assembler.dls.set_label(&text),
        None => {
            if let Some(monitor) = &mut pad.monitor {
                if let Some(text) = monitor.update() {
                    pad.assembler.dls.set_label(&text);
                }
            }
        }
    }
    let bytes = pad.assembler.next_pad();
    let len = bytes.len().min(data.len());
    let start = data.len() - len;
    data[start..].copy_from_slice(&bytes[..len]);
}

/// A crude signal activity measure over the compressed frame: the peak
/// of the bytes read as 16-bit samples. Zero-filled frames score 0 and
/// trip the silence detector.
fn peak_level(data: &[u8]) -> i32 {
    data.chunks_exact(2)
        .map(|c| i32::from(i16::from_le_bytes([c[0], c[1]])).abs())
        .max()
        .unwrap_or(0)
}

fn build_pipeline(
    ensemble: &DabEnsemble,
    sub: &crate::ensemble::DabSubchannel,
    handle: &MuxHandle,
) -> Result<Pipeline, Error> {
    let size_bytes = sub.size_bytes()?;
    let component = ensemble
        .components
        .iter()
        .find(|c| c.subchannel_id == sub.id);

    let kind = if sub.typ == SubchannelType::Packet {
        match carousel_directory(&sub.input_uri) {
            Ok(dir) => {
                let address = component
                    .and_then(|c| c.packet.as_ref())
                    .map(|p| p.address)
                    .unwrap_or(0);
                match Carousel::new(std::path::Path::new(&dir), address, 96) {
                    Ok(carousel) => {
                        let carousel = Arc::new(Mutex::new(carousel));
                        if let Some(comp) = component {
                            handle
                                .carousels
                                .lock()
                                .expect("carousel registry lock")
                                .insert(comp.uid.clone(), Arc::clone(&carousel));
                        }
                        PipelineKind::Packet { carousel }
                    }
                    Err(e) => {
                        error!("subchannel {:?}: carousel unavailable: {}", sub.uid, e);
                        PipelineKind::Silent
                    }
                }
            }
            Err(e) => {
                error!("subchannel {:?}: {}", sub.uid, e);
                PipelineKind::Silent
            }
        }
    } else if sub.input_uri.is_empty() {
        info!("subchannel {:?} has no input, transmitting silence", sub.uid);
        PipelineKind::Silent
    } else {
        match create_input(&sub.input_uri, sub.bitrate) {
            Ok(raw) => {
                let mut input: Box<dyn InputSource> = if sub.typ == SubchannelType::DabPlusAudio {
                    Box::new(DabPlusInput::new(raw, sub.bitrate)?)
                } else {
                    raw
                };
                if let Err(e) = input.open() {
                    // Zero-fill mode; the loop keeps running and the input
                    // state reads NO_DATA.
                    error!("subchannel {:?}: input open failed: {}", sub.uid, e);
                }
                let pad = sub.pad.as_ref().map(|p| {
                    let (charset, monitor, label) = match &p.dls {
                        Some(dls) => (
                            if dls.charset == 0 { DlsCharset::EbuLatin } else { DlsCharset::Utf8 },
                            (!dls.input_path.is_empty()).then(|| {
                                DlsFileMonitor::new(
                                    &dls.input_path,
                                    Duration::from_millis(dls.poll_interval_ms),
                                )
                            }),
                            dls.label.clone(),
                        ),
                        None => (DlsCharset::Utf8, None, String::new()),
                    };
                    let mut dls = DlsEncoder::new(charset);
                    if !label.is_empty() {
                        dls.set_label(&label);
                    }
                    PadState {
                        assembler: PadAssembler::new(p.length, dls),
                        monitor,
                        component_uid: component.map(|c| c.uid.clone()),
                    }
                });
                PipelineKind::Stream { input, pad }
            }
            Err(e) => {
                error!("subchannel {:?}: {}", sub.uid, e);
                PipelineKind::Silent
            }
        }
    };

    Ok(Pipeline {
        uid: sub.uid.clone(),
        scid: sub.id,
        sad: sub.start_address,
        tpl: sub.tpl(),
        size_bytes,
        kind,
        stats: InputStatistics::new(&sub.uid),
    })
}

/// Packet subchannels take their carousel directory from the input URI.
fn carousel_directory(uri: &str) -> Result<String, Error> {
    if uri.is_empty() {
        failure::bail!("packet subchannel lacks a carousel directory");
    }
    match InputUri::parse(uri)? {
        InputUri::File { path, .. } => Ok(path),
        other => failure::bail!("packet subchannel input {:?} is not a directory", other),
    }
}

/// One watcher thread polls every carousel for directory changes;
/// rebuilds swap atomically under the carousel mutex.
fn spawn_carousel_watcher(
    handle: &MuxHandle,
    shutdown: Arc<AtomicBool>,
) -> Option<std::thread::JoinHandle<()>> {
    let carousels = Arc::clone(&handle.carousels);
    if carousels.lock().expect("carousel registry lock").is_empty() {
        return None;
    }
    std::thread::Builder::new()
        .name("carousel-watcher".to_owned())
        .spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                {
                    let registry = carousels.lock().expect("carousel registry lock");
                    for carousel in registry.values() {
                        carousel.lock().expect("carousel lock").poll_reload();
                    }
                }
                std::thread::sleep(Duration::from_millis(500));
            }
        })
        .ok()
}

/// Adapts the ETI file writer to the sink interface.
pub struct EtiFileFrameSink(pub crate::eti::EtiFileSink);

impl FrameSink for EtiFileFrameSink {
    fn send(&mut self, tick: &TickOutput<'_>) -> Result<(), Error> {
        self.0.write_frame(tick.frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    const EMPTY: &str = r#"
ensemble:
  id: '0xCE15'
  ecc: '0xE1'
  transmission_mode: 'I'
  label: { text: 'Test', short: 'Test' }
  lto_auto: true
"#;

    /// Collects emitted frames for inspection.
    struct Capture(Arc<Mutex<Vec<Vec<u8>>>>);

    impl FrameSink for Capture {
        fn send(&mut self, tick: &TickOutput<'_>) -> Result<(), Error> {
            self.0.lock().unwrap().push(tick.frame.to_vec());
            Ok(())
        }
    }

    #[test]
    fn empty_ensemble_ticks() {
        let cfg = config::load_str(EMPTY).unwrap();
        let mut mux = Multiplexer::new(cfg, false).unwrap();
        let frames = Arc::new(Mutex::new(vec![]));
        mux.add_sink(Box::new(Capture(Arc::clone(&frames))));
        for _ in 0..5 {
            mux.tick().unwrap();
        }
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(|f| f.len() == crate::eti::FRAME_SIZE));
        assert_eq!(mux.handle().frame_count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn run_honours_frame_limit() {
        let cfg = config::load_str(EMPTY).unwrap();
        let mut mux = Multiplexer::new(cfg, false).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        mux.run(Some(3), shutdown).unwrap();
        assert_eq!(mux.frame_number(), 3);
    }

    #[test]
    fn missing_input_runs_silent() {
        let yaml = r#"
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
    input: 'file:///nonexistent/input.mp2'
services:
  - uid: s1
    id: '0x5001'
    label: { text: 'One' }
"#;
        let cfg = config::load_str(yaml).unwrap();
        let mut mux = Multiplexer::new(cfg, false).unwrap();
        mux.tick().unwrap();
        // 42 ticks later the status map reports the input.
        for _ in 0..42 {
            mux.tick().unwrap();
        }
        let status = mux.handle().input_status.lock().unwrap().clone();
        let report = status.get("audio1").expect("status present");
        assert_eq!(report.state, crate::stats::InputState::NoData);
        assert!(report.underruns > 0);
    }
}
