//! pcapng capture files.
//!
//! The archive tile writes every frag it validates as one Enhanced Packet
//! Block. A capture is:
//!
//! ```text
//! ┌─────┬─────┬─────┬─────┬─────┐
//! │ SHB │ IDB │ EPB │ EPB │ ... │
//! └─────┴─────┴─────┴─────┴─────┘
//! ```
//!
//! Every block shares the same framing, little endian, padded to 4 bytes:
//!
//! ```text
//! ┌──────────┬──────────┬──────────────────────┬──────────┐
//! │ Type(4)  │ Len(4)   │ Body + options (pad) │ Len(4)   │
//! └──────────┴──────────┴──────────────────────┴──────────┘
//! ```
//!
//! - SHB: byte-order magic `0x1A2B3C4D`, version 1.0, unknown section
//!   length, options `shb_hardware` / `shb_os` / `shb_userappl`
//! - IDB: link type Ethernet, no snap limit, options `if_name` and
//!   `if_tsresol` = 9 (timestamps in nanoseconds)
//! - EPB: interface 0, 64-bit timestamp split high/low, captured and
//!   original length, packet bytes
//!
//! [`read_capture`] parses files written here back for tooling and tests.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

/// Block type of a Section Header Block.
pub const BLOCK_SHB: u32 = 0x0A0D_0D0A;
/// Block type of an Interface Description Block.
pub const BLOCK_IDB: u32 = 0x0000_0001;
/// Block type of an Enhanced Packet Block.
pub const BLOCK_EPB: u32 = 0x0000_0006;

/// Byte-order magic stored in every SHB.
pub const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;

/// Ethernet link type.
pub const LINKTYPE_ETHERNET: u16 = 1;

/// Nanosecond timestamp resolution (`10^-9`).
pub const TSRESOL_NANOS: u8 = 9;

const OPT_END: u16 = 0;
const OPT_SHB_HARDWARE: u16 = 2;
const OPT_SHB_OS: u16 = 3;
const OPT_SHB_USERAPPL: u16 = 4;
const OPT_IF_NAME: u16 = 2;
const OPT_IF_TSRESOL: u16 = 9;

/// Write buffer size for file sinks.
const SINK_BUF_SZ: usize = 1 << 20;

/// Errors raised by capture sinks and the capture reader.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("capture I/O failed: {0}")]
    Io(#[from] io::Error),
    /// A payload too large for a pcapng block.
    #[error("payload of {len} bytes does not fit a pcapng block")]
    TooLarge { len: usize },
    /// The sink was already closed.
    #[error("capture sink is closed")]
    Closed,
    /// The input is not a capture this module can read.
    #[error("malformed capture: {reason}")]
    Malformed { reason: &'static str },
}

/// Destination for validated frags.
///
/// Append failures are reported per record; the caller decides whether
/// they are fatal.
pub trait CaptureSink {
    /// Writes one record with timestamp `ts` (nanoseconds).
    ///
    /// # Errors
    ///
    /// Any failure to encode or write the record.
    fn append(&mut self, ts: i64, payload: &[u8]) -> Result<(), SinkError>;

    /// Flushes and releases the sink. Later appends fail with
    /// [`SinkError::Closed`].
    ///
    /// # Errors
    ///
    /// Any failure to flush buffered records.
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Section Header Block options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShbOptions {
    pub hardware: String,
    pub os: String,
    pub userappl: String,
}

impl Default for ShbOptions {
    fn default() -> Self {
        Self {
            hardware: std::env::consts::ARCH.to_owned(),
            os: std::env::consts::OS.to_owned(),
            userappl: "fragmux".to_owned(),
        }
    }
}

/// Interface Description Block options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdbOptions {
    pub name: String,
    pub tsresol: u8,
}

impl Default for IdbOptions {
    fn default() -> Self {
        Self {
            name: "fragmux0".to_owned(),
            tsresol: TSRESOL_NANOS,
        }
    }
}

/// Builds one block in a reusable buffer.
struct BlockWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> BlockWriter<'a> {
    fn new(buf: &'a mut Vec<u8>, block_type: u32) -> Self {
        buf.clear();
        let mut w = Self { buf };
        w.put_u32(block_type);
        w.put_u32(0); // patched by finish()
        w
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_padded(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        let pad = bytes.len().next_multiple_of(4) - bytes.len();
        self.buf.extend(std::iter::repeat_n(0, pad));
    }

    fn put_option(&mut self, code: u16, value: &[u8]) {
        self.put_u16(code);
        self.put_u16(value.len() as u16);
        self.put_padded(value);
    }

    fn put_str_option(&mut self, code: u16, value: &str) {
        let bytes = value.as_bytes();
        let len = bytes.len().min(u16::MAX as usize & !3);
        self.put_option(code, &bytes[..len]);
    }

    fn end_options(&mut self) {
        self.put_u16(OPT_END);
        self.put_u16(0);
    }

    /// Patches the leading length, appends the trailing one.
    fn finish(self) -> Result<&'a [u8], SinkError> {
        let total = self.buf.len() + 4;
        let total32 = u32::try_from(total).map_err(|_| SinkError::TooLarge { len: total })?;
        self.buf[4..8].copy_from_slice(&total32.to_le_bytes());
        self.buf.extend_from_slice(&total32.to_le_bytes());
        let block: &'a [u8] = self.buf;
        Ok(block)
    }
}

/// pcapng encoder over any byte stream.
pub struct PcapngWriter<W: Write> {
    out: W,
    block: Vec<u8>,
    closed: bool,
}

/// File-backed capture sink with a large write buffer.
pub type PcapngSink = PcapngWriter<BufWriter<File>>;

impl PcapngWriter<BufWriter<File>> {
    /// Creates (truncating) `path` and writes the section and interface
    /// headers with default options.
    ///
    /// # Errors
    ///
    /// Failure to create the file or write the headers.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let file = File::create(path)?;
        Self::new(
            BufWriter::with_capacity(SINK_BUF_SZ, file),
            &ShbOptions::default(),
            &IdbOptions::default(),
        )
    }
}

impl<W: Write> PcapngWriter<W> {
    /// Writes the SHB and a single Ethernet IDB to `out`.
    ///
    /// # Errors
    ///
    /// Failure to write the headers.
    pub fn new(out: W, shb: &ShbOptions, idb: &IdbOptions) -> Result<Self, SinkError> {
        let mut writer = Self {
            out,
            block: Vec::with_capacity(256),
            closed: false,
        };
        writer.write_shb(shb)?;
        writer.write_idb(idb)?;
        Ok(writer)
    }

    fn write_shb(&mut self, opts: &ShbOptions) -> Result<(), SinkError> {
        let mut w = BlockWriter::new(&mut self.block, BLOCK_SHB);
        w.put_u32(BYTE_ORDER_MAGIC);
        w.put_u16(1); // major
        w.put_u16(0); // minor
        w.put_u64(u64::MAX); // section length unknown
        w.put_str_option(OPT_SHB_HARDWARE, &opts.hardware);
        w.put_str_option(OPT_SHB_OS, &opts.os);
        w.put_str_option(OPT_SHB_USERAPPL, &opts.userappl);
        w.end_options();
        self.out.write_all(w.finish()?)?;
        Ok(())
    }

    fn write_idb(&mut self, opts: &IdbOptions) -> Result<(), SinkError> {
        let mut w = BlockWriter::new(&mut self.block, BLOCK_IDB);
        w.put_u16(LINKTYPE_ETHERNET);
        w.put_u16(0); // reserved
        w.put_u32(0); // snaplen: unlimited
        w.put_str_option(OPT_IF_NAME, &opts.name);
        w.put_option(OPT_IF_TSRESOL, &[opts.tsresol]);
        w.end_options();
        self.out.write_all(w.finish()?)?;
        Ok(())
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Returns a reference to the underlying stream.
    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

impl<W: Write> CaptureSink for PcapngWriter<W> {
    fn append(&mut self, ts: i64, payload: &[u8]) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        let len = u32::try_from(payload.len()).map_err(|_| SinkError::TooLarge {
            len: payload.len(),
        })?;

        let ts = ts as u64;
        let mut w = BlockWriter::new(&mut self.block, BLOCK_EPB);
        w.put_u32(0); // interface id
        w.put_u32((ts >> 32) as u32);
        w.put_u32(ts as u32);
        w.put_u32(len); // captured
        w.put_u32(len); // original
        w.put_padded(payload);
        self.out.write_all(w.finish()?)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.out.flush()?;
        Ok(())
    }
}

/// One packet read back from a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub interface: u32,
    pub ts: i64,
    pub data: Vec<u8>,
    pub orig_len: u32,
}

/// An interface described by an IDB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub linktype: u16,
    pub snaplen: u32,
    pub opts: IdbOptions,
}

/// Everything [`read_capture`] understands in a capture.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capture {
    pub shb: Option<ShbOptions>,
    pub interfaces: Vec<Interface>,
    pub records: Vec<Record>,
}

struct BlockReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> BlockReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SinkError> {
        if self.remaining() < n {
            return Err(SinkError::Malformed {
                reason: "truncated block",
            });
        }
        let bytes = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(bytes)
    }

    fn take_padded(&mut self, n: usize) -> Result<&'a [u8], SinkError> {
        let bytes = self.take(n)?;
        self.take(n.next_multiple_of(4) - n)?;
        Ok(bytes)
    }

    fn take_u16(&mut self) -> Result<u16, SinkError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, SinkError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Yields `(code, value)` pairs up to `opt_endofopt` or the end of the
    /// block body.
    fn options(&mut self, mut f: impl FnMut(u16, &'a [u8])) -> Result<(), SinkError> {
        while self.remaining() >= 4 {
            let code = self.take_u16()?;
            let len = self.take_u16()? as usize;
            if code == OPT_END {
                break;
            }
            f(code, self.take_padded(len)?);
        }
        Ok(())
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parses a little-endian capture.
///
/// Unknown block types are skipped. Only EPBs become records.
///
/// # Errors
///
/// I/O failures, a missing or big-endian SHB, or inconsistent block
/// lengths.
pub fn read_capture(mut input: impl Read) -> Result<Capture, SinkError> {
    let mut bytes = Vec::new();
    input.read_to_end(&mut bytes)?;

    let mut capture = Capture::default();
    let mut r = BlockReader::new(&bytes);
    while r.remaining() > 0 {
        let block_type = r.take_u32()?;
        let total = r.take_u32()? as usize;
        if total < 12 || total % 4 != 0 {
            return Err(SinkError::Malformed {
                reason: "bad block length",
            });
        }
        let body = r.take(total - 12)?;
        if r.take_u32()? as usize != total {
            return Err(SinkError::Malformed {
                reason: "trailing block length mismatch",
            });
        }

        let mut b = BlockReader::new(body);
        match block_type {
            BLOCK_SHB => {
                if b.take_u32()? != BYTE_ORDER_MAGIC {
                    return Err(SinkError::Malformed {
                        reason: "unsupported byte order",
                    });
                }
                let _version = b.take(4)?;
                let _section_len = b.take(8)?;
                let mut shb = ShbOptions {
                    hardware: String::new(),
                    os: String::new(),
                    userappl: String::new(),
                };
                b.options(|code, value| match code {
                    OPT_SHB_HARDWARE => shb.hardware = lossy(value),
                    OPT_SHB_OS => shb.os = lossy(value),
                    OPT_SHB_USERAPPL => shb.userappl = lossy(value),
                    _ => {}
                })?;
                capture.shb = Some(shb);
            }
            _ if capture.shb.is_none() => {
                return Err(SinkError::Malformed {
                    reason: "capture does not start with a section header",
                });
            }
            BLOCK_IDB => {
                let linktype = b.take_u16()?;
                let _reserved = b.take_u16()?;
                let snaplen = b.take_u32()?;
                let mut opts = IdbOptions {
                    name: String::new(),
                    tsresol: 6,
                };
                b.options(|code, value| match (code, value) {
                    (OPT_IF_NAME, _) => opts.name = lossy(value),
                    (OPT_IF_TSRESOL, [resol, ..]) => opts.tsresol = *resol,
                    _ => {}
                })?;
                capture.interfaces.push(Interface {
                    linktype,
                    snaplen,
                    opts,
                });
            }
            BLOCK_EPB => {
                let interface = b.take_u32()?;
                let ts_hi = b.take_u32()? as u64;
                let ts_lo = b.take_u32()? as u64;
                let cap_len = b.take_u32()? as usize;
                let orig_len = b.take_u32()?;
                let data = b.take_padded(cap_len)?.to_vec();
                capture.records.push(Record {
                    interface,
                    ts: ((ts_hi << 32) | ts_lo) as i64,
                    data,
                    orig_len,
                });
            }
            _ => {}
        }
    }

    Ok(capture)
}

/// Parses a capture and returns only its packet records.
///
/// # Errors
///
/// As [`read_capture`].
pub fn read_records(input: impl Read) -> Result<Vec<Record>, SinkError> {
    read_capture(input).map(|capture| capture.records)
}
