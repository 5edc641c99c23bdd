//! Offline dissector for FSoE Safety PDU frames.
//!
//! Takes hex-encoded frames (arguments or stdin, one frame per line) and
//! prints the field breakdown: command, data slots, per-slot CRC and
//! connection ID. CRC values are shown as carried but cannot be verified
//! offline — they chain on session state (sequence numbers, session IDs,
//! previous CRCs) that is not present in the frame itself.
//!
//! ```text
//! fsoe-dissect 3612341a2b0800
//! fsoe-dissect --data-size 2 < capture.txt
//! ```

use std::io::BufRead;

use anyhow::{Context, Result, bail};
use clap::Parser;
use colored::Colorize;

use fsoe_stack::{Command, ResetReason, frame_size};

#[derive(Parser)]
#[command(name = "fsoe-dissect", about = "Dissect captured FSoE Safety PDU frames")]
struct Args {
    /// Hex-encoded frames; reads stdin (one frame per line) when empty.
    frames: Vec<String>,

    /// Safe data size of the frames (1 or even, up to 126). Inferred from
    /// the frame length when omitted.
    #[arg(long)]
    data_size: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let inputs: Vec<String> = if args.frames.is_empty() {
        std::io::stdin()
            .lock()
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .context("reading frames from stdin")?
    } else {
        args.frames.clone()
    };

    let mut first = true;
    for line in inputs.iter().map(|line| line.trim()).filter(|line| !line.is_empty()) {
        if !first {
            println!();
        }
        first = false;
        if let Err(err) = dissect_line(line, args.data_size) {
            println!("{} {err:#}", "error:".red().bold());
        }
    }
    Ok(())
}

fn dissect_line(line: &str, data_size: Option<usize>) -> Result<()> {
    let cleaned: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned).with_context(|| format!("invalid hex: {line:?}"))?;
    let data_size = match data_size {
        Some(size) => size,
        None => infer_data_size(bytes.len())?,
    };
    if bytes.len() != frame_size(data_size) {
        bail!(
            "frame is {} bytes but data size {} requires {}",
            bytes.len(),
            data_size,
            frame_size(data_size)
        );
    }
    dissect_frame(&bytes, data_size);
    Ok(())
}

/// Derive the safe data size from the frame length. A 6-byte frame is the
/// 1-byte-payload layout; anything longer must match `2n + 3` for even n.
fn infer_data_size(frame_len: usize) -> Result<usize> {
    if frame_len == 6 {
        return Ok(1);
    }
    if frame_len >= 7 && frame_len % 2 == 1 {
        let data_size = (frame_len - 3) / 2;
        if data_size % 2 == 0 && data_size <= fsoe_stack::PROCESS_DATA_MAX_SIZE {
            return Ok(data_size);
        }
    }
    bail!("{frame_len} bytes is not a valid Safety PDU length; pass --data-size");
}

fn dissect_frame(bytes: &[u8], data_size: usize) {
    println!("{} {}", "frame:".bold(), hex::encode(bytes));

    let cmd_byte = bytes[0];
    match Command::from_byte(cmd_byte) {
        Some(cmd) => println!(
            "  {:<12} {:#04x} {}",
            "command", cmd_byte,
            format!("{cmd:?}").green()
        ),
        None => println!(
            "  {:<12} {:#04x} {}",
            "command", cmd_byte,
            "unknown".red()
        ),
    }

    let wire_bytes = if data_size == 1 { 1 } else { 2 };
    let slots = if data_size == 1 { 1 } else { data_size / 2 };
    let mut offset = 1;
    for slot in 0..slots {
        let data = &bytes[offset..offset + wire_bytes];
        offset += wire_bytes;
        let crc = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        offset += 2;
        println!(
            "  {:<12} {}  crc {}",
            format!("data[{slot}]"),
            hex::encode(data).yellow(),
            format!("{crc:#06x}").cyan()
        );
    }

    let conn_id = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
    println!("  {:<12} {:#06x}", "conn id", conn_id);

    // A Reset frame carries the communication error code in its first
    // data byte.
    if cmd_byte == Command::Reset as u8 {
        let reason = ResetReason::from_code(bytes[1]);
        println!("  {:<12} {}", "reset code", reason.to_string().magenta());
    }

    println!(
        "  {:<12} {}",
        "note",
        "CRCs chain on session state and cannot be verified offline".dimmed()
    );
}
