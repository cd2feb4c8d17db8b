//! SEG-Y trace files
//!
//! Shots are stored in a rev1 SEG-Y subset: a 3200-byte text header, a
//! 400-byte binary header and fixed-length traces, each a 240-byte header
//! followed by big-endian IEEE floats (format code 5). Coordinates are kept
//! as integers with a -1000 scalar (millimetre resolution). The field-record
//! number (`fldr`) carries the shot id.

use crate::errors::{FwiError, Result};
use crate::field::Field;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const TEXT_HEADER_LEN: usize = 3200;
const BINARY_HEADER_LEN: usize = 400;
const DATA_START: u64 = (TEXT_HEADER_LEN + BINARY_HEADER_LEN) as u64;
const TRACE_HEADER_LEN: usize = 240;
const FORMAT_IEEE_FLOAT: i16 = 5;

/// Scalar applied to coordinates and elevations on write
pub const COORD_SCALAR: i16 = -1000;

// Binary header offsets (relative to the start of the binary header)
const BIN_TRACES_PER_ENSEMBLE: usize = 12;
const BIN_INTERVAL: usize = 16;
const BIN_SAMPLES: usize = 20;
const BIN_FORMAT: usize = 24;
const BIN_REVISION: usize = 300;
const BIN_FIXED_LENGTH: usize = 302;

// Trace header offsets
const TR_TRACL: usize = 0;
const TR_TRACR: usize = 4;
const TR_FLDR: usize = 8;
const TR_TRACF: usize = 12;
const TR_GELEV: usize = 40;
const TR_SELEV: usize = 44;
const TR_SCALEL: usize = 68;
const TR_SCALCO: usize = 70;
const TR_SX: usize = 72;
const TR_SY: usize = 76;
const TR_GX: usize = 80;
const TR_GY: usize = 84;
const TR_NS: usize = 114;
const TR_DT: usize = 116;

/// Header-level description of one shot inside a trace file
#[derive(Debug, Clone, PartialEq)]
pub struct ShotHeader {
    /// File holding the shot
    pub path: PathBuf,
    /// Index of the first trace of the shot within the file
    pub trace_offset: usize,
    /// Number of consecutive traces belonging to the shot
    pub trace_count: usize,
    /// Source `(x, y, elevation)`
    pub source: [f32; 3],
    /// Receiver `(x, y, elevation)` per trace
    pub receivers: Vec<[f32; 3]>,
}

/// Samples of a contiguous block of traces
#[derive(Debug, Clone)]
pub struct TraceBlock {
    /// Samples shaped `[ns, trace_count]`
    pub samples: Field,
    /// Time of the last sample (ms)
    pub max_time: f32,
    /// Sample interval (ms)
    pub dt: f32,
}

#[derive(Debug, Clone, Copy)]
struct BinaryHeader {
    interval_us: u16,
    samples: u16,
}

impl BinaryHeader {
    fn trace_len(&self) -> usize {
        TRACE_HEADER_LEN + self.samples as usize * 4
    }
}

/// Split a 2D `[x, z]` or 3D `[x, y, z]` position into `(x, y, z)`.
fn split_position(position: &[f32]) -> Result<(f32, f32, f32)> {
    match *position {
        [x, z] => Ok((x, 0.0, z)),
        [x, y, z] => Ok((x, y, z)),
        _ => Err(FwiError::TraceFormat(format!(
            "positions must have 2 or 3 components, got {}",
            position.len()
        ))),
    }
}

fn scaled(value: f32) -> Result<i32> {
    let v = (value as f64 * COORD_SCALAR.unsigned_abs() as f64).round();
    if v < i32::MIN as f64 || v > i32::MAX as f64 {
        return Err(FwiError::TraceFormat(format!(
            "coordinate {} does not fit a scaled header field",
            value
        )));
    }
    Ok(v as i32)
}

fn unscale(value: i32, scalar: i16) -> f32 {
    let value = value as f64;
    let unscaled = match scalar {
        s if s < 0 => value / (s as f64).abs(),
        0 => value,
        s => value * s as f64,
    };
    unscaled as f32
}

fn put_i16(buf: &mut [u8], at: usize, v: i16) {
    buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_i32(buf: &mut [u8], at: usize, v: i32) {
    buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

fn get_i16(buf: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([buf[at], buf[at + 1]])
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn get_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn text_header(shot_id: u32, nrec: usize) -> Vec<u8> {
    let mut text = vec![b' '; TEXT_HEADER_LEN];
    let lines = [
        format!("C 1 SHOTFARM SYNTHETIC SHOT {}", shot_id),
        format!("C 2 TRACES {} FORMAT IEEE FLOAT", nrec),
        "C 3 COORDINATE SCALAR -1000".to_string(),
        "C40 END TEXTUAL HEADER".to_string(),
    ];
    for (row, line) in [0usize, 1, 2, 39].iter().zip(lines.iter()) {
        let start = row * 80;
        let bytes = line.as_bytes();
        let n = bytes.len().min(80);
        text[start..start + n].copy_from_slice(&bytes[..n]);
    }
    text
}

/// Write one shot gather to `path`.
///
/// `samples` is shaped `[nt, nrec]`, `dt` is in milliseconds and every
/// trace is tagged with `shot_id` as its field record.
pub fn write_traces(
    samples: &Field,
    source: &[f32],
    receivers: &[Vec<f32>],
    dt: f32,
    shot_id: u32,
    path: &Path,
) -> Result<()> {
    let [nt, nrec] = samples.shape[..] else {
        return Err(FwiError::TraceFormat(format!(
            "trace samples must be 2D [nt, nrec], got {:?}",
            samples.shape
        )));
    };
    if nrec != receivers.len() {
        return Err(FwiError::TraceFormat(format!(
            "{} receiver positions for {} traces",
            receivers.len(),
            nrec
        )));
    }
    let ns = u16::try_from(nt)
        .map_err(|_| FwiError::TraceFormat(format!("{} samples per trace is too many", nt)))?;
    let interval_us = (dt as f64 * 1000.0).round();
    if interval_us <= 0.0 || interval_us > u16::MAX as f64 {
        return Err(FwiError::TraceFormat(format!(
            "sample interval {} ms cannot be stored",
            dt
        )));
    }
    let interval_us = interval_us as u16;
    let fldr = i32::try_from(shot_id)
        .map_err(|_| FwiError::TraceFormat(format!("shot id {} out of range", shot_id)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let (sx, sy, sz) = split_position(source)?;
    let (sx, sy, selev) = (scaled(sx)?, scaled(sy)?, scaled(sz)?);

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&text_header(shot_id, nrec))?;

    let mut bin = [0u8; BINARY_HEADER_LEN];
    put_u16(&mut bin, BIN_TRACES_PER_ENSEMBLE, nrec.min(u16::MAX as usize) as u16);
    put_u16(&mut bin, BIN_INTERVAL, interval_us);
    put_u16(&mut bin, BIN_SAMPLES, ns);
    put_i16(&mut bin, BIN_FORMAT, FORMAT_IEEE_FLOAT);
    put_u16(&mut bin, BIN_REVISION, 0x0100);
    put_i16(&mut bin, BIN_FIXED_LENGTH, 1);
    out.write_all(&bin)?;

    let mut header = [0u8; TRACE_HEADER_LEN];
    for (i, receiver) in receivers.iter().enumerate() {
        let (gx, gy, gz) = split_position(receiver)?;
        let seq = (i + 1) as i32;

        header.fill(0);
        put_i32(&mut header, TR_TRACL, seq);
        put_i32(&mut header, TR_TRACR, seq);
        put_i32(&mut header, TR_FLDR, fldr);
        put_i32(&mut header, TR_TRACF, seq);
        put_i32(&mut header, TR_GELEV, scaled(gz)?);
        put_i32(&mut header, TR_SELEV, selev);
        put_i16(&mut header, TR_SCALEL, COORD_SCALAR);
        put_i16(&mut header, TR_SCALCO, COORD_SCALAR);
        put_i32(&mut header, TR_SX, sx);
        put_i32(&mut header, TR_SY, sy);
        put_i32(&mut header, TR_GX, scaled(gx)?);
        put_i32(&mut header, TR_GY, scaled(gy)?);
        put_u16(&mut header, TR_NS, ns);
        put_u16(&mut header, TR_DT, interval_us);
        out.write_all(&header)?;

        for t in 0..nt {
            out.write_all(&samples.data[t * nrec + i].to_be_bytes())?;
        }
    }
    out.flush()?;

    debug!(
        shot_id,
        traces = nrec,
        samples = nt,
        path = %path.display(),
        "Wrote shot gather"
    );
    Ok(())
}

fn read_binary_header(file: &mut File) -> Result<BinaryHeader> {
    let mut bin = [0u8; BINARY_HEADER_LEN];
    file.seek(SeekFrom::Start(TEXT_HEADER_LEN as u64))?;
    file.read_exact(&mut bin).map_err(|e| {
        FwiError::TraceFormat(format!("truncated binary header: {}", e))
    })?;

    let format = get_i16(&bin, BIN_FORMAT);
    if format != FORMAT_IEEE_FLOAT {
        return Err(FwiError::TraceFormat(format!(
            "unsupported sample format code {}",
            format
        )));
    }
    let header = BinaryHeader {
        interval_us: get_u16(&bin, BIN_INTERVAL),
        samples: get_u16(&bin, BIN_SAMPLES),
    };
    if header.samples == 0 {
        return Err(FwiError::TraceFormat(
            "binary header declares zero samples per trace".to_string(),
        ));
    }
    Ok(header)
}

fn trace_count(file: &File, bin: &BinaryHeader) -> Result<usize> {
    let len = file.metadata()?.len();
    let body = len.saturating_sub(DATA_START) as usize;
    if len < DATA_START || body % bin.trace_len() != 0 {
        return Err(FwiError::TraceFormat(format!(
            "file length {} is not a whole number of {}-byte traces",
            len,
            bin.trace_len()
        )));
    }
    Ok(body / bin.trace_len())
}

/// Read `trace_count` traces starting at trace index `trace_offset`.
pub fn read_traces(path: &Path, trace_offset: usize, trace_count_wanted: usize) -> Result<TraceBlock> {
    let mut file = File::open(path)?;
    let bin = read_binary_header(&mut file)?;
    let available = trace_count(&file, &bin)?;
    if trace_offset + trace_count_wanted > available {
        return Err(FwiError::TraceFormat(format!(
            "traces {}..{} requested but {} holds {}",
            trace_offset,
            trace_offset + trace_count_wanted,
            path.display(),
            available
        )));
    }

    let ns = bin.samples as usize;
    let start = DATA_START + (trace_offset * bin.trace_len()) as u64;
    file.seek(SeekFrom::Start(start))?;
    let mut reader = BufReader::new(file);

    let mut samples = Field::zeros(vec![ns, trace_count_wanted]);
    let mut header = [0u8; TRACE_HEADER_LEN];
    let mut raw = vec![0u8; ns * 4];
    for i in 0..trace_count_wanted {
        reader.read_exact(&mut header)?;
        reader.read_exact(&mut raw)?;
        for (t, chunk) in raw.chunks_exact(4).enumerate() {
            samples.data[t * trace_count_wanted + i] =
                f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    let dt = bin.interval_us as f32 / 1000.0;
    Ok(TraceBlock {
        samples,
        max_time: (ns - 1) as f32 * dt,
        dt,
    })
}

/// Group the traces of a file by field-record number.
///
/// Traces of one shot must be contiguous; a record number that reappears
/// after a different one is rejected.
pub fn scan_headers(path: &Path) -> Result<BTreeMap<u32, ShotHeader>> {
    let mut file = File::open(path)?;
    let bin = read_binary_header(&mut file)?;
    let count = trace_count(&file, &bin)?;
    file.seek(SeekFrom::Start(DATA_START))?;
    let mut reader = BufReader::new(file);

    let mut table: BTreeMap<u32, ShotHeader> = BTreeMap::new();
    let mut current: Option<u32> = None;
    let mut header = [0u8; TRACE_HEADER_LEN];
    let skip = (bin.samples as usize * 4) as i64;

    for position in 0..count {
        reader.read_exact(&mut header)?;
        reader.seek_relative(skip)?;

        let fldr = get_i32(&header, TR_FLDR);
        let shot_id = u32::try_from(fldr).map_err(|_| {
            FwiError::TraceFormat(format!("negative field record {} at trace {}", fldr, position))
        })?;
        let scalco = get_i16(&header, TR_SCALCO);
        let scalel = get_i16(&header, TR_SCALEL);
        let receiver = [
            unscale(get_i32(&header, TR_GX), scalco),
            unscale(get_i32(&header, TR_GY), scalco),
            unscale(get_i32(&header, TR_GELEV), scalel),
        ];

        if current == Some(shot_id) {
            if let Some(entry) = table.get_mut(&shot_id) {
                entry.trace_count += 1;
                entry.receivers.push(receiver);
            }
            continue;
        }
        if table.contains_key(&shot_id) {
            return Err(FwiError::TraceFormat(format!(
                "field record {} is not contiguous in {}",
                shot_id,
                path.display()
            )));
        }
        current = Some(shot_id);
        table.insert(
            shot_id,
            ShotHeader {
                path: path.to_path_buf(),
                trace_offset: position,
                trace_count: 1,
                source: [
                    unscale(get_i32(&header, TR_SX), scalco),
                    unscale(get_i32(&header, TR_SY), scalco),
                    unscale(get_i32(&header, TR_SELEV), scalel),
                ],
                receivers: vec![receiver],
            },
        );
    }

    Ok(table)
}
