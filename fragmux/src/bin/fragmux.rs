//! fragmux command line.
//!
//! Runs the archive tile against shared-memory links, and carries the small
//! tools needed around it: creating the shared objects, signalling and
//! inspecting a tile through its cnc, a synthetic producer, and a capture
//! dump.
//!
//! # Usage
//!
//! ```sh
//! fragmux create cnc --path /arc-cnc
//! fragmux create mcache --path /in0-mcache --depth 1024
//! fragmux create dcache --path /in0-dcache --mtu 1500 --depth 1024
//! fragmux create fseq --path /in0-fseq
//!
//! fragmux run --cnc /arc-cnc --in-mcaches /in0-mcache --in-dcaches /in0-dcache \
//!     --in-fseqs /in0-fseq --pcap-path out.pcapng
//!
//! fragmux synth --mcache /in0-mcache --dcache /in0-dcache --fseq /in0-fseq --count 1000
//! fragmux signal --cnc /arc-cnc halt
//! fragmux dump out.pcapng
//! fragmux destroy /arc-cnc /in0-mcache /in0-dcache /in0-fseq
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use fragmux::archive::{
    ArchiveTile, CNC_DIAG_FRAG_CNT, CNC_DIAG_FRAG_SZ, CNC_DIAG_HOUSEKEEPING_CNT,
    CNC_DIAG_MALFORMED_CNT, CNC_DIAG_OVRNP_CNT, CNC_DIAG_OVRNR_CNT, CNC_DIAG_SINK_ERR_CNT,
    CNC_DIAG_TS_DROP_CNT, InputLink, TileConfig, TileError,
};
use fragmux::ipc::shmem::{self, Creator, Opener, ShmError, ShmPath, ShmRegion};
use fragmux::pcapng::{self, PcapngSink, SinkError};
use fragmux::producer::{FragPublisher, PublishError};
use fragmux::tango::mcache::{CTL_EOM, CTL_SOM};
use fragmux::tango::{Cnc, CncSignal, Dcache, Fseq, JoinError, Mcache, Timeout};
use fragmux::tempo::Tickcount;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Tile(#[from] TileError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error(
        "input lists differ in length: {mcaches} mcaches, {dcaches} dcaches, {fseqs} fseqs"
    )]
    LinkMismatch {
        mcaches: usize,
        dcaches: usize,
        fseqs: usize,
    },
    #[error("{what} parameters overflow the address space")]
    TooLarge { what: &'static str },
    #[error("cnc still {signal} after {timeout:?}")]
    Timeout {
        signal: CncSignal,
        timeout: Duration,
    },
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Archive frags from the given links until signalled to halt
    Run(RunArgs),
    /// Raise a signal on a cnc and wait for the tile to react
    Signal {
        #[arg(long)]
        cnc: ShmPath,
        /// halt, run, ack, boot, fail or a raw value
        signal: CncSignal,
        /// Milliseconds to wait for the tile to act on the signal
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
    /// Print a cnc's signal, heartbeat and counters
    Status {
        #[arg(long)]
        cnc: ShmPath,
    },
    /// Create and format a shared object
    Create {
        #[command(subcommand)]
        object: Object,
        /// Unlink a leftover object of the same name first
        #[arg(long, global = true)]
        force: bool,
    },
    /// Unlink shared objects
    Destroy { paths: Vec<ShmPath> },
    /// Publish synthetic frags into a link
    Synth(SynthArgs),
    /// Print the records of a capture
    Dump {
        path: PathBuf,
        /// Print at most this many records
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    cnc: ShmPath,
    #[arg(long, value_delimiter = ',')]
    in_mcaches: Vec<ShmPath>,
    #[arg(long, value_delimiter = ',')]
    in_dcaches: Vec<ShmPath>,
    #[arg(long, value_delimiter = ',')]
    in_fseqs: Vec<ShmPath>,
    #[arg(long)]
    pcap_path: PathBuf,
    /// Mcache whose sync word receives the count of archived frags
    #[arg(long)]
    mcache: Option<ShmPath>,
    /// Maximum producer credits (0 = shallowest input depth)
    #[arg(long, default_value_t = 0)]
    cr_max: u64,
    /// Housekeeping laziness in ns (<= 0 = derived from cr_max)
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    lazy: i64,
    /// Scheduling seed (default: the current tick)
    #[arg(long)]
    seed: Option<u64>,
    /// Pin the tile to this cpu
    #[arg(long)]
    cpu: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Object {
    Cnc {
        #[arg(long)]
        path: ShmPath,
    },
    Mcache {
        #[arg(long)]
        path: ShmPath,
        #[arg(long)]
        depth: u64,
        #[arg(long, default_value_t = 0)]
        seq0: u64,
    },
    Dcache {
        #[arg(long)]
        path: ShmPath,
        #[arg(long)]
        mtu: usize,
        /// Depth of the mcache paired with this dcache
        #[arg(long)]
        depth: u64,
        /// Frags a producer may hold beyond the ring depth
        #[arg(long, default_value_t = 1)]
        burst: u64,
    },
    Fseq {
        #[arg(long)]
        path: ShmPath,
        #[arg(long, default_value_t = 0)]
        seq0: u64,
    },
}

#[derive(clap::Args, Debug)]
struct SynthArgs {
    #[arg(long)]
    mcache: ShmPath,
    #[arg(long)]
    dcache: ShmPath,
    /// Consumer fseq to take credits from; without it the producer never waits
    #[arg(long)]
    fseq: Option<ShmPath>,
    /// Stop once this cnc leaves RUN
    #[arg(long)]
    cnc: Option<ShmPath>,
    /// Frags to publish (0 = until the cnc stops)
    #[arg(long, default_value_t = 0)]
    count: u64,
    #[arg(long, default_value_t = 10)]
    min_sz: usize,
    #[arg(long, default_value_t = 50)]
    max_sz: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() {
    fragmux::init_tracing();
    if let Err(e) = run(Args::parse()) {
        eprintln!("fragmux: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), CliError> {
    match args.command {
        Command::Run(args) => run_tile(args),
        Command::Signal {
            cnc,
            signal,
            timeout_ms,
        } => send_signal(cnc, signal, Duration::from_millis(timeout_ms)),
        Command::Status { cnc } => status(cnc),
        Command::Create { object, force } => create(object, force),
        Command::Destroy { paths } => {
            for path in &paths {
                shmem::unlink(path)?;
            }
            Ok(())
        }
        Command::Synth(args) => synth(args),
        Command::Dump { path, limit } => dump(path, limit),
    }
}

fn run_tile(args: RunArgs) -> Result<(), CliError> {
    let (mcaches, dcaches, fseqs) = (args.in_mcaches, args.in_dcaches, args.in_fseqs);
    if mcaches.len() != dcaches.len() || mcaches.len() != fseqs.len() {
        return Err(CliError::LinkMismatch {
            mcaches: mcaches.len(),
            dcaches: dcaches.len(),
            fseqs: fseqs.len(),
        });
    }

    let cnc = Cnc::join(ShmRegion::<Opener>::open(args.cnc)?)?;
    let mut links = Vec::with_capacity(mcaches.len());
    for ((mcache, dcache), fseq) in mcaches.into_iter().zip(dcaches).zip(fseqs) {
        links.push((
            Mcache::join(ShmRegion::<Opener>::open(mcache)?)?,
            Dcache::join(ShmRegion::<Opener>::open(dcache)?)?,
            Fseq::join(ShmRegion::<Opener>::open(fseq)?)?,
        ));
    }
    let out = args
        .mcache
        .map(|path| Ok::<_, CliError>(Mcache::join(ShmRegion::<Opener>::open(path)?)?))
        .transpose()?;

    let inputs: Vec<InputLink<'_>> = links
        .iter()
        .map(|(mcache, dcache, fseq)| InputLink {
            mcache,
            dcache,
            fseq,
        })
        .collect();

    let seed = args.seed.unwrap_or_else(|| Tickcount::new().now() as u64);
    let config = TileConfig::default()
        .with_cr_max(args.cr_max)
        .with_lazy(args.lazy)
        .with_seed(seed);

    if let Some(cpu) = args.cpu {
        if !core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
            eprintln!("fragmux: could not pin to cpu {cpu}; running unpinned");
        }
    }

    let sink = PcapngSink::create(&args.pcap_path)?;
    let mut tile = ArchiveTile::new(&cnc, &inputs, out.as_ref(), sink, &config)?;
    let stats = tile.run()?;

    eprintln!(
        "fragmux: halted after {} frags ({} bytes), {} overruns, {} torn reads",
        stats.frag_cnt, stats.frag_sz, stats.ovrnp_cnt, stats.ovrnr_cnt
    );
    Ok(())
}

fn send_signal(path: ShmPath, signal: CncSignal, timeout: Duration) -> Result<(), CliError> {
    let cnc = Cnc::join(ShmRegion::<Opener>::open(path)?)?;
    cnc.signal(signal);
    if signal == CncSignal::Run {
        return Ok(());
    }

    let found = cnc.wait(signal, Timeout::Duration(timeout));
    if found == signal {
        return Err(CliError::Timeout { signal, timeout });
    }
    println!("{found}");
    Ok(())
}

fn status(path: ShmPath) -> Result<(), CliError> {
    let cnc = Cnc::join(ShmRegion::<Opener>::open(path)?)?;
    let now = Tickcount::new().now();
    let heartbeat = cnc.heartbeat_query();

    println!("signal      {}", cnc.signal_query());
    println!(
        "heartbeat   {heartbeat} ({:.3} s ago)",
        now.wrapping_sub(heartbeat) as f64 / 1e9
    );
    for (name, slot) in [
        ("frag_cnt", CNC_DIAG_FRAG_CNT),
        ("frag_sz", CNC_DIAG_FRAG_SZ),
        ("ovrnp_cnt", CNC_DIAG_OVRNP_CNT),
        ("ovrnr_cnt", CNC_DIAG_OVRNR_CNT),
        ("malformed", CNC_DIAG_MALFORMED_CNT),
        ("ts_drop", CNC_DIAG_TS_DROP_CNT),
        ("sink_err", CNC_DIAG_SINK_ERR_CNT),
        ("housekeep", CNC_DIAG_HOUSEKEEPING_CNT),
    ] {
        println!(
            "{name:<11} {}",
            cnc.diag(slot).load(std::sync::atomic::Ordering::Relaxed)
        );
    }
    Ok(())
}

fn create(object: Object, force: bool) -> Result<(), CliError> {
    let (path, len) = match &object {
        Object::Cnc { path } => (path, Cnc::footprint()),
        Object::Fseq { path, .. } => (path, Fseq::footprint()),
        Object::Mcache { path, depth, .. } => (
            path,
            Mcache::footprint(*depth).ok_or(JoinError::BadDepth { depth: *depth })?,
        ),
        Object::Dcache {
            path,
            mtu,
            depth,
            burst,
        } => (
            path,
            Dcache::req_data_sz(*mtu, *depth, *burst)
                .and_then(Dcache::footprint)
                .ok_or(CliError::TooLarge { what: "dcache" })?,
        ),
    };
    if force {
        shmem::unlink(path)?;
    }

    let region = ShmRegion::<Creator>::create(path.clone(), len)?;
    let path = path.clone();
    let formatted = match object {
        Object::Cnc { .. } => Cnc::new(region.persist(), Tickcount::new().now()).map(drop),
        Object::Fseq { seq0, .. } => Fseq::new(region.persist(), seq0).map(drop),
        Object::Mcache { depth, seq0, .. } => {
            Mcache::new(region.persist(), depth, seq0).map(drop)
        }
        Object::Dcache {
            mtu, depth, burst, ..
        } => {
            let data_sz = Dcache::req_data_sz(mtu, depth, burst)
                .ok_or(CliError::TooLarge { what: "dcache" })?;
            Dcache::new(region.persist(), mtu, data_sz).map(drop)
        }
    };
    if let Err(err) = formatted {
        shmem::unlink(&path)?;
        return Err(err.into());
    }

    println!("{path} ({len} bytes)");
    Ok(())
}

fn synth(args: SynthArgs) -> Result<(), CliError> {
    let mcache = Mcache::join(ShmRegion::<Opener>::open(args.mcache)?)?;
    let dcache = Dcache::join(ShmRegion::<Opener>::open(args.dcache)?)?;
    let fseq = args
        .fseq
        .map(|path| Ok::<_, CliError>(Fseq::join(ShmRegion::<Opener>::open(path)?)?))
        .transpose()?;
    let cnc = args
        .cnc
        .map(|path| Ok::<_, CliError>(Cnc::join(ShmRegion::<Opener>::open(path)?)?))
        .transpose()?;

    let max_sz = args.max_sz.min(dcache.mtu());
    let min_sz = args.min_sz.min(max_sz);
    let clock = Tickcount::new();
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let mut publisher = FragPublisher::new(&mcache, &dcache);
    let mut payload = vec![0u8; max_sz];
    let mut published = 0u64;

    let running = |cnc: &Option<Cnc>| {
        cnc.as_ref()
            .is_none_or(|cnc| cnc.signal_query() == CncSignal::Run)
    };

    while args.count == 0 || published < args.count {
        if let Some(fseq) = &fseq {
            while publisher.cr_avail(fseq) == 0 {
                if !running(&cnc) {
                    break;
                }
                std::hint::spin_loop();
            }
        }
        if !running(&cnc) {
            break;
        }

        let sz = rng.gen_range(min_sz..=max_sz);
        let seq = publisher.seq();
        payload[..sz].fill(seq as u8);
        publisher.publish(
            &payload[..sz],
            seq,
            CTL_SOM | CTL_EOM,
            clock.now() as u64,
        )?;
        published += 1;
    }

    eprintln!("fragmux: published {published} frags");
    Ok(())
}

fn dump(path: PathBuf, limit: Option<usize>) -> Result<(), CliError> {
    let capture = pcapng::read_capture(BufReader::new(File::open(path)?))?;
    if let Some(shb) = &capture.shb {
        println!(
            "section     {} / {} / {}",
            shb.hardware, shb.os, shb.userappl
        );
    }
    println!("interfaces  {}", capture.interfaces.len());
    println!("records     {}", capture.records.len());

    let limit = limit.unwrap_or(usize::MAX);
    for record in capture.records.iter().take(limit) {
        let head: String = record
            .data
            .iter()
            .take(16)
            .map(|b| format!("{b:02x}"))
            .collect();
        println!("{:>20} {:>6} {head}", record.ts, record.data.len());
    }
    Ok(())
}
