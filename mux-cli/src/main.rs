//! DAB/DAB+ multiplexer command line front end: loads the YAML
//! configuration, wires the ETI file and EDI outputs, starts the control
//! surface and runs the 24 ms frame loop.
//!
//! Exit codes: 0 on success, 1 for configuration errors, 2 for runtime
//! I/O errors.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dabmux::config::{self, Config};
use dabmux::eti::{EtiFileSink, EtiFormat};
use dabmux::mux::{EtiFileFrameSink, FrameSink, Multiplexer, TickOutput};
use dabmux::remote::{audit::AuditLogger, auth::Authenticator, telnet::TelnetServer, CommandProcessor};
use edi::transport::{parse_edi_url, TcpClientTransport, TcpServerTransport, Transport, UdpTransport};
use edi::{EdiEncoder, EdiFrame, EdiStream};
use failure::Error;
use log::{error, info};
use once_cell::sync::Lazy;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "dabmux", about = "DAB/DAB+ ensemble multiplexer")]
struct Opts {
    /// Ensemble configuration file (YAML).
    #[structopt(short = "c", long, parse(from_os_str))]
    config: PathBuf,

    /// ETI output file.
    #[structopt(short = "o", long, parse(from_os_str))]
    output: Option<PathBuf>,

    /// ETI file format: raw, framed or streamed.
    #[structopt(short = "f", long, default_value = "raw")]
    format: EtiFormat,

    /// EDI destination (udp://host:port or tcp://host:port); may be
    /// given several times.
    #[structopt(long = "edi")]
    edi: Vec<String>,

    /// TCP role for tcp:// EDI destinations.
    #[structopt(long = "edi-tcp-mode", default_value = "client",
                possible_values = &["client", "server"])]
    edi_tcp_mode: String,

    /// Enable the PFT layer on EDI outputs.
    #[structopt(long)]
    pft: bool,

    /// PFT recoverable fragments (enables RS FEC when > 0).
    #[structopt(long = "pft-fec", default_value = "0")]
    pft_fec: u8,

    /// PFT fragment payload limit in bytes.
    #[structopt(long = "pft-fragment-size", default_value = "1400")]
    pft_fragment_size: usize,

    /// Emit TIST timestamps.
    #[structopt(long)]
    tist: bool,

    /// Stop after this many frames.
    #[structopt(short = "n", long)]
    frames: Option<u64>,

    /// Run until interrupted (the default when -n is absent).
    #[structopt(long)]
    continuous: bool,
}

static SHUTDOWN: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

extern "C" fn on_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

/// Returns a pretty-and-informative version of `e`.
fn prettify_failure(e: &failure::Error) -> String {
    use std::fmt::Write;
    let mut msg = e.to_string();
    for cause in e.iter_causes() {
        write!(&mut msg, "\ncaused by: {}", cause).unwrap();
    }
    msg
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    install_signal_handlers();
    let opts = Opts::from_args();

    let config = match config::load_file(&opts.config) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {}", prettify_failure(&e));
            std::process::exit(1);
        }
    };

    if let Err(e) = run(opts, config) {
        error!("runtime error: {}", prettify_failure(&e));
        std::process::exit(2);
    }
    info!("done");
}

fn run(opts: Opts, config: Config) -> Result<(), Error> {
    let remote_cfg = config.remote.clone();
    let mut mux = Multiplexer::new(config, opts.tist)?;

    // ETI file sink: explicit -o, or the default when no EDI output is
    // requested either.
    let output = match (&opts.output, opts.edi.is_empty()) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => Some(PathBuf::from("output.eti")),
        (None, false) => None,
    };
    if let Some(path) = output {
        info!("writing ETI ({:?}) to {:?}", opts.format, path);
        let sink = EtiFileSink::create(&path, opts.format)?;
        mux.add_sink(Box::new(EtiFileFrameSink(sink)));
    }

    if !opts.edi.is_empty() {
        let pft = if opts.pft || opts.pft_fec > 0 {
            Some(edi::pft::PftConfig {
                fec: opts.pft_fec > 0,
                fec_m: opts.pft_fec,
                max_fragment_size: opts.pft_fragment_size,
                ..edi::pft::PftConfig::default()
            })
        } else {
            None
        };
        let mut encoder = EdiEncoder::new(pft)?;
        for url in &opts.edi {
            let (tcp, host, port) = parse_edi_url(url)?;
            let transport: Box<dyn Transport> = if !tcp {
                Box::new(UdpTransport::new(&host, port, None)?)
            } else if opts.edi_tcp_mode == "server" {
                Box::new(TcpServerTransport::bind(&host, port)?)
            } else {
                Box::new(TcpClientTransport::new(&host, port))
            };
            info!("EDI output to {}", url);
            encoder.add_transport(transport);
        }
        mux.add_sink(Box::new(EdiFrameSink { encoder }));
    }

    // Control surface.
    let auth = match (&remote_cfg.password, &remote_cfg.password_hash) {
        (Some(pw), _) => Authenticator::with_password(pw),
        (None, Some(hash)) => Authenticator::with_hash(hash)?,
        (None, None) => Authenticator::disabled(),
    };
    let audit = match &remote_cfg.audit_log {
        Some(path) => AuditLogger::to_file(path),
        None => AuditLogger::disabled(),
    };
    let processor = Arc::new(CommandProcessor::new(mux.handle(), auth, audit));
    let mut control_threads = Vec::new();
    if let Some(port) = remote_cfg.telnet_port {
        control_threads.push(TelnetServer::spawn(
            port,
            Arc::clone(&processor),
            Arc::clone(&SHUTDOWN),
        )?);
    }
    #[cfg(feature = "zmq-remote")]
    {
        if let Some(endpoint) = &remote_cfg.zmq_endpoint {
            control_threads.push(dabmux::remote::zmq_server::ZmqServer::spawn(
                endpoint,
                Arc::clone(&processor),
                Arc::clone(&SHUTDOWN),
            )?);
        }
    }
    #[cfg(not(feature = "zmq-remote"))]
    {
        if remote_cfg.zmq_endpoint.is_some() {
            log::warn!("zmq endpoint configured but this build lacks the zmq-remote feature");
        }
    }

    let frames = if opts.continuous { None } else { opts.frames };
    mux.run(frames, Arc::clone(&SHUTDOWN))?;

    // Stop the control surface with the frame loop.
    SHUTDOWN.store(true, Ordering::SeqCst);
    for thread in control_threads {
        let _ = thread.join();
    }
    Ok(())
}

/// Adapts the EDI encoder to the multiplexer sink interface.
struct EdiFrameSink {
    encoder: EdiEncoder,
}

impl FrameSink for EdiFrameSink {
    fn send(&mut self, tick: &TickOutput<'_>) -> Result<(), Error> {
        let streams: Vec<EdiStream<'_>> = tick
            .streams
            .iter()
            .map(|(scid, sad, tpl, data)| EdiStream {
                scid: *scid,
                sad: *sad,
                tpl: *tpl,
                data,
            })
            .collect();
        self.encoder.send_frame(&EdiFrame {
            dlfc: (tick.frame_number & 0xFF_FFFF) as u32,
            fct: tick.fct,
            fp: tick.fp,
            mid: tick.mid,
            fic: tick.fic,
            streams: &streams,
            seconds: tick.timestamp.edi_seconds(),
            ticks: tick.timestamp.tist_ticks(),
            timestamp_valid: true,
        })
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.encoder.flush();
        self.encoder.report_errors();
        Ok(())
    }
}
