// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! JSON <-> CBOR converter for the low-bandwidth dialect.
//!
//! # Usage
//!
//! ```bash
//! # JSON -> CBOR, literal to file
//! jc --out output.cbor '{"hello":"world"}'
//!
//! # JSON -> CBOR from a file
//! jc --out output.cbor @data.json
//!
//! # JSON -> CBOR from stdin
//! echo '[42,38]' | jc --out output.cbor -
//!
//! # CBOR -> JSON to stdout
//! jc --decode @output.cbor
//! ```

use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use lbgate::CborCodec;

/// JSON <-> CBOR converter
#[derive(Parser, Debug)]
#[command(name = "jc")]
#[command(about = "Convert between JSON and CBOR with the v1 key dictionary")]
#[command(version)]
struct Args {
    /// Convert CBOR to JSON instead of JSON to CBOR
    #[arg(short = 'd', long)]
    decode: bool,

    /// Key dictionary version; only "1" is supported
    #[arg(long, default_value = "1")]
    dict_version: String,

    /// Output file; "-" prints to stdout
    #[arg(short, long, default_value = "-")]
    out: String,

    /// Input: a literal value, "@some-file", or "-" for stdin
    input: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.dict_version != "1" {
        eprintln!("only dictionary version 1 is supported");
        return ExitCode::FAILURE;
    }

    let input: Vec<u8> = if args.input == "-" {
        let mut buf = Vec::new();
        if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
            eprintln!("failed to read stdin: {}", e);
            return ExitCode::FAILURE;
        }
        buf
    } else if let Some(path) = args.input.strip_prefix('@') {
        match std::fs::read(path) {
            Ok(buf) => buf,
            Err(e) => {
                eprintln!("failed to read {}: {}", path, e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        args.input.clone().into_bytes()
    };

    let codec = CborCodec::v1(true);
    let output = if args.decode {
        codec.cbor_to_json(input.as_slice())
    } else {
        codec.json_to_cbor(input.as_slice())
    };
    let output = match output {
        Ok(out) => out,
        Err(e) => {
            eprintln!("conversion failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.out == "-" {
        use std::io::Write;
        if std::io::stdout().write_all(&output).is_err() {
            return ExitCode::FAILURE;
        }
    } else {
        if let Err(e) = std::fs::write(&args.out, &output) {
            eprintln!("failed to write {}: {}", args.out, e);
            return ExitCode::FAILURE;
        }
        let hex: String = output.iter().map(|b| format!("{:02x}", b)).collect();
        println!("wrote '{}' ({} bytes) {}", args.out, output.len(), hex);
    }
    ExitCode::SUCCESS
}
