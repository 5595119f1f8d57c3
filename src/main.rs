use anyhow::{anyhow, Context, Result};
use clap::Parser;
use memmap2::Mmap;
use rayon::prelude::*;
use regex::Regex;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

use hi3_stream_decoder::capture::{PcapReader, RawPacket};
use hi3_stream_decoder::catalog::StreamCatalog;
use hi3_stream_decoder::{
    configure, hex_string, DecodeOptions, DecoderConfig, DetectorConfig, FieldInput, FindOptions, Hi3Decoder,
    InterceptRecord, PortAggregator, PortList, StreamHandle, StreamItem, StreamTarget, StreamValue,
    TraceSink, Transport, WriterSink,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "ETSI HI3 stream decoder: pcap -> JSONL (sequence numbers, timestamps, CC packets)",
    long_about = None
)]
struct Cli {
    #[arg(long = "output-dir")]
    output_dir: PathBuf,

    // Verify this identifier instead of auto-detecting one per stream
    #[arg(long = "intercept-id")]
    intercept_id: Option<String>,

    // Only accept auto-detected identifiers matching this pattern
    #[arg(long = "id-filter")]
    id_filter: Option<String>,

    #[arg(long = "port", value_delimiter = ',')]
    ports: Vec<u16>,

    #[arg(long = "country-exception", value_delimiter = ',')]
    country_exceptions: Vec<String>,

    #[arg(long = "no-cc")]
    no_cc: bool,

    // Dump every TCP payload field by field to <input>.trace.txt
    #[arg(long = "trace")]
    trace: bool,

    #[arg(long = "save-streams")]
    save_streams: Option<PathBuf>,

    #[arg(long = "load-streams")]
    load_streams: Option<PathBuf>,

    #[arg(long = "ext")]
    ext: Option<String>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

struct RunOptions {
    intercept_id: Option<String>,
    id_filter: Option<Regex>,
    ports: HashSet<u16>,
    decode: DecodeOptions,
    trace: bool,
}

#[derive(Default)]
struct FileSummary {
    records: usize,
    cc_packets: usize,
    errors: usize,
    catalog: StreamCatalog,
}

// Re-presentations of one packet before giving up on it.
const MAX_RECORDS_PER_PACKET: usize = 64;
const CC_BUFFER_LEN: usize = 64 * 1024;

#[inline]
fn write_json_key<W: Write>(w: &mut W, key: &str) -> Result<()> {
    w.write_all(b"\"")?;
    for &b in key.as_bytes() {
        match b {
            b'"' => w.write_all(b"\\\"")?,
            b'\\' => w.write_all(b"\\\\")?,
            b'\n' => w.write_all(b"\\n")?,
            b'\r' => w.write_all(b"\\r")?,
            b'\t' => w.write_all(b"\\t")?,
            c if c < 0x20 => {
                const HEX: &[u8; 16] = b"0123456789abcdef";
                let esc = [b'\\', b'u', b'0', b'0', HEX[(c >> 4) as usize], HEX[(c & 0x0F) as usize]];
                w.write_all(&esc)?;
            }
            c => w.write_all(&[c])?,
        }
    }
    w.write_all(b"\"")?;
    Ok(())
}

#[inline]
fn write_hex_json<W: Write>(w: &mut W, data: &[u8]) -> Result<()> {
    w.write_all(b"\"")?;
    w.write_all(hex_string(data).as_bytes())?;
    w.write_all(b"\"")?;
    Ok(())
}

#[inline]
fn write_u64_field<W: Write>(w: &mut W, key: &str, v: u64, num: &mut itoa::Buffer) -> Result<()> {
    w.write_all(b",")?;
    write_json_key(w, key)?;
    w.write_all(b":")?;
    w.write_all(num.format(v).as_bytes())?;
    Ok(())
}

fn write_record<W: Write>(
    out: &mut W,
    pkt: &RawPacket<'_>,
    handle: StreamHandle,
    record: &InterceptRecord,
    cc: &[u8],
) -> Result<()> {
    let mut num = itoa::Buffer::new();

    out.write_all(b"{\"frame\":")?;
    out.write_all(num.format(pkt.frame_number).as_bytes())?;
    out.write_all(b",\"capture_time_us\":")?;
    out.write_all(num.format(pkt.timestamp_us).as_bytes())?;
    write_u64_field(out, "stream", u64::from(handle.get()), &mut num)?;

    if let Some(id) = &record.interception_point_id {
        out.write_all(b",")?;
        write_json_key(out, "interception_point_id")?;
        out.write_all(b":")?;
        write_json_key(out, id)?;
    }
    if let Some(seq) = record.sequence_number {
        write_u64_field(out, "sequence_number", seq, &mut num)?;
    }
    if let Some(ts) = record.timestamp {
        write_u64_field(out, "seconds", ts.seconds, &mut num)?;
        write_u64_field(out, "microseconds", ts.microseconds, &mut num)?;
    }
    if let Some(q) = record.timestamp_qualifier {
        write_u64_field(out, "timestamp_qualifier", q, &mut num)?;
    }
    if let Some(meta) = record.cc_packet {
        write_u64_field(out, "cc_version", u64::from(meta.version), &mut num)?;
        write_u64_field(out, "cc_length", u64::from(meta.length), &mut num)?;
        if let Some(tag) = meta.tag {
            write_u64_field(out, "cc_tag", u64::from(tag), &mut num)?;
        }
        out.write_all(b",\"cc_packet\":")?;
        write_hex_json(out, cc)?;
    }
    out.write_all(b"}\n")?;
    Ok(())
}

fn expand_inputs(inputs: &[PathBuf], allowed_exts: Option<&HashSet<String>>) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = Vec::new();
    for p in inputs {
        if p.is_file() {
            if should_include(p, allowed_exts) {
                files.push(p.clone());
            }
        } else if p.is_dir() {
            for entry in WalkDir::new(p).follow_links(false) {
                let entry = entry?;
                let path = entry.path();
                if path.is_file() && should_include(path, allowed_exts) {
                    files.push(path.to_path_buf());
                }
            }
        } else {
            return Err(anyhow!("Input path is not a file or directory: {:?}", p));
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

#[inline]
fn should_include(path: &Path, allowed_exts: Option<&HashSet<String>>) -> bool {
    let Some(set) = allowed_exts else { return true; };
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else { return false; };
    set.contains(&ext.to_ascii_lowercase())
}

fn stream_ports(decoder: &Hi3Decoder, handle: StreamHandle) -> PortList {
    match decoder.get_stream_info(handle, StreamItem::DestPortList) {
        Ok(StreamValue::Ports(list)) => list,
        _ => PortList::new(),
    }
}

fn preload_streams(decoder: &Hi3Decoder, catalog: &StreamCatalog) -> Result<Vec<(StreamHandle, String)>> {
    let mut handles = Vec::new();
    for entry in &catalog.streams {
        let Some(first) = entry.ports.iter().next() else { continue; };
        let created = decoder.create_stream(&entry.identifier, first).and_then(|h| {
            decoder.set_stream_info(h, StreamItem::DestPortList, StreamValue::Ports(entry.ports))?;
            Ok(h)
        });
        match created {
            Ok(h) => handles.push((h, entry.identifier.clone())),
            Err(e) => {
                for (h, _) in &handles {
                    let _ = decoder.delete_stream(*h);
                }
                return Err(e).with_context(|| format!("Failed to create stream for '{}'", entry.identifier));
            }
        }
    }
    Ok(handles)
}

/// Present `pkt` to `handle` until the packet is used up.
fn drain_packet<W: Write>(
    decoder: &Hi3Decoder,
    opts: &RunOptions,
    handle: StreamHandle,
    pkt: &RawPacket<'_>,
    cc_buf: &mut [u8],
    out: &mut W,
    summary: &mut FileSummary,
) -> Result<()> {
    let mut record = InterceptRecord::default();
    for _ in 0..MAX_RECORDS_PER_PACKET {
        match decoder.decode_stream(handle, pkt.data, cc_buf, opts.decode, &mut record) {
            Ok(n) => {
                if !record.found().is_empty() {
                    write_record(out, pkt, handle, &record, &cc_buf[..n])?;
                    summary.records += 1;
                }
                if n > 0 {
                    summary.cc_packets += 1;
                }
            }
            Err(e) => {
                log::debug!("frame {} stream {}: {} ({})", pkt.frame_number, handle, e, e.code());
                summary.errors += 1;
            }
        }
        if record.asn_index == 0 {
            break;
        }
    }
    Ok(())
}

fn process_file(decoder: &Hi3Decoder, opts: &RunOptions, catalog: &StreamCatalog, in_path: &Path, out_dir: &Path) -> Result<FileSummary> {
    let file = File::open(in_path).with_context(|| format!("Failed to open input file {:?}", in_path))?;
    let mmap = unsafe { Mmap::map(&file)? };
    let data: &[u8] = &mmap;

    let mut summary = FileSummary::default();
    if data.is_empty() {
        return Ok(summary);
    }
    let reader = PcapReader::new(data).with_context(|| format!("Not a pcap capture: {:?}", in_path))?;

    let file_name = in_path
        .file_name()
        .ok_or_else(|| anyhow!("Input path has no filename: {:?}", in_path))?
        .to_string_lossy()
        .to_string();

    let out_path = out_dir.join(format!("{}.jsonl", file_name));
    let out_file = File::create(&out_path).with_context(|| format!("Failed to create output file {:?}", out_path))?;
    let mut writer = BufWriter::with_capacity(4 * 1024 * 1024, out_file);

    let mut trace = if opts.trace {
        let trace_path = out_dir.join(format!("{}.trace.txt", file_name));
        let f = File::create(&trace_path).with_context(|| format!("Failed to create trace file {:?}", trace_path))?;
        Some(WriterSink::new(BufWriter::new(f)))
    } else {
        None
    };

    let mut streams = preload_streams(decoder, catalog)?;
    let mut cc_buf = vec![0u8; CC_BUFFER_LEN];
    let mut aggregator = PortAggregator::new();

    let result = (|| -> Result<()> {
        for pkt in reader {
            let info = match decoder.inspector().inspect(pkt.data) {
                Ok(info) => info,
                Err(e) => {
                    log::trace!("frame {}: {}", pkt.frame_number, e);
                    continue;
                }
            };
            if info.protocol != Transport::Tcp || info.payload_len == 0 {
                continue;
            }
            if !opts.ports.is_empty() && !opts.ports.contains(&info.dst_port) {
                continue;
            }

            if let Some(sink) = trace.as_mut() {
                let label = format!("#{}", pkt.frame_number);
                if let Err(e) = decoder.decode_fields(FieldInput::Packet(pkt.data), 0, &mut aggregator, Some(sink as &mut dyn TraceSink), &label) {
                    log::debug!("frame {}: field dump stopped: {}", pkt.frame_number, e);
                }
            }

            // Packets on a tracked port go to their streams only.
            let claimed: Vec<StreamHandle> = streams
                .iter()
                .map(|(handle, _)| *handle)
                .filter(|handle| stream_ports(decoder, *handle).contains(info.dst_port))
                .collect();
            if !claimed.is_empty() {
                for handle in claimed {
                    drain_packet(decoder, opts, handle, &pkt, &mut cc_buf, &mut writer, &mut summary)?;
                }
                continue;
            }

            let mut target = match &opts.intercept_id {
                Some(id) => StreamTarget::verify(id.clone()),
                None => StreamTarget::auto(),
            };
            let detection = match decoder.find_stream(pkt.data, FindOptions { discover_ports: true }, &mut target) {
                Ok(d) if d.is_found() => d,
                Ok(_) => continue,
                Err(e) => {
                    log::debug!("frame {}: detection failed: {}", pkt.frame_number, e);
                    continue;
                }
            };
            if let Some(re) = &opts.id_filter {
                if !re.is_match(&target.identifier) {
                    log::debug!("frame {}: ignoring identifier '{}'", pkt.frame_number, target.identifier);
                    continue;
                }
            }

            if let Some((handle, _)) = streams.iter().find(|(_, id)| *id == target.identifier) {
                // Known identifier seen on a new port.
                let mut ports = stream_ports(decoder, *handle);
                ports.insert(info.dst_port);
                decoder.set_stream_info(*handle, StreamItem::DestPortList, StreamValue::Ports(ports))?;
                summary.catalog.record(&target.identifier, ports, detection);
                drain_packet(decoder, opts, *handle, &pkt, &mut cc_buf, &mut writer, &mut summary)?;
                continue;
            }

            let handle = match decoder.create_stream(&target.identifier, info.dst_port) {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("{:?}: cannot track '{}': {}", in_path, target.identifier, e);
                    continue;
                }
            };
            log::info!("{:?}: {:?} '{}' on port {} -> stream {}", in_path, detection, target.identifier, info.dst_port, handle);
            summary.catalog.record(&target.identifier, target.ports, detection);
            streams.push((handle, target.identifier.clone()));
            drain_packet(decoder, opts, handle, &pkt, &mut cc_buf, &mut writer, &mut summary)?;
        }
        Ok(())
    })();

    for (handle, _) in &streams {
        if let Err(e) = decoder.delete_stream(*handle) {
            log::warn!("failed to release stream {}: {}", handle, e);
        }
    }
    result?;

    writer.flush()?;
    if let Some(mut sink) = trace {
        if let Some(e) = sink.take_error() {
            return Err(e).with_context(|| format!("Failed to write trace for {:?}", in_path));
        }
        sink.into_inner().flush()?;
    }
    Ok(summary)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    let overall_start = Instant::now();

    let allowed_exts: Option<HashSet<String>> = cli.ext.as_ref().map(|s| {
        s.split(',')
            .map(|x| x.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|x| !x.is_empty())
            .collect()
    });

    let catalog = if let Some(path) = &cli.load_streams {
        println!("Loading stream catalog from {:?}", path);
        StreamCatalog::load(path).with_context(|| format!("Failed to load stream catalog {:?}", path))?
    } else {
        StreamCatalog::default()
    };

    let id_filter = cli
        .id_filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .with_context(|| "Invalid --id-filter pattern")?;

    let mut detector = DetectorConfig::default();
    if !cli.country_exceptions.is_empty() {
        detector.substitute_country_codes = cli.country_exceptions.iter().map(|c| c.trim().to_ascii_uppercase()).collect();
    }
    let decoder = configure(DecoderConfig { detector, ..DecoderConfig::default() });

    let opts = RunOptions {
        intercept_id: cli.intercept_id.clone(),
        id_filter,
        ports: cli.ports.iter().copied().collect(),
        decode: if cli.no_cc { DecodeOptions::header_only() } else { DecodeOptions::all() },
        trace: cli.trace,
    };

    std::fs::create_dir_all(&cli.output_dir)?;

    let input_files = expand_inputs(&cli.inputs, allowed_exts.as_ref())
        .with_context(|| "Failed to expand input files/directories")?;

    if input_files.is_empty() {
        eprintln!("No input files found.");
        return Ok(());
    }

    println!("Found {} input files", input_files.len());

    let out_dir = cli.output_dir.clone();
    let results: Vec<(PathBuf, Result<FileSummary>)> = input_files
        .par_iter()
        .map(|p| (p.clone(), process_file(decoder, &opts, &catalog, p, &out_dir)))
        .collect();

    let mut total_records = 0usize;
    let mut total_cc = 0usize;
    let mut merged = catalog.clone();
    for (path, res) in results {
        match res {
            Ok(summary) => {
                total_records += summary.records;
                total_cc += summary.cc_packets;
                println!(
                    "Decoded {} records ({} CC packets, {} errors) from {:?}",
                    summary.records, summary.cc_packets, summary.errors, path
                );
                merged.merge(summary.catalog);
            }
            Err(e) => {
                eprintln!("Decoding failed for {:?}: {:#}", path, e);
            }
        }
    }

    if let Some(save_path) = &cli.save_streams {
        println!("Saving {} streams to {:?}", merged.streams.len(), save_path);
        merged.save(save_path).with_context(|| format!("Failed to save stream catalog {:?}", save_path))?;
    }

    println!("Total decoded records: {} ({} CC packets)", total_records, total_cc);
    println!("Total elapsed wall time: {:.3} s", overall_start.elapsed().as_secs_f64());
    Ok(())
}
