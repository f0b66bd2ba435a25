//! Example: Rendering response payloads with a field layout table
//!
//! Run with: cargo run --example decode_response
//!
//! This example demonstrates:
//! - Parsing a layout table
//! - Decoding a captured HART-IP response message
//! - Extended commands reached through command 31
//! - Best-effort output for unknown commands

use hart_ip::decoder::{LayoutTable, ResponseDecoder};
use hart_ip::utils::parse_hex;
use hart_ip::HartIpResponse;

const LAYOUT: &str = "\
; response layouts, one section per command
[001]
Output1=Response Code,U8
Output2=Device Status,BITS8
Output3=PV Units,U8
Output4=PV,FLOAT

[013]
Output1=Response Code,U8
Output2=Device Status,BITS8
Output3=Tag,PA:6
Output4=Descriptor,PA:12
Output5=Date,HEX:3

[031_1024]
Output1=Response Code,U8
Output2=Device Status,BITS8
Output3=Command,U16
Output4=Uptime,U32
";

fn show(decoder: &ResponseDecoder, message_hex: &str) -> hart_ip::Result<()> {
    let response = HartIpResponse::from_bytes(&parse_hex(message_hex)?)?;
    println!("{}", response);
    println!("{}\n", decoder.decode(&response).replace("\r\n", "\n    "));
    Ok(())
}

fn main() -> hart_ip::Result<()> {
    let decoder = ResponseDecoder::from_table(LayoutTable::parse(LAYOUT)?);

    // =========================================================================
    // Command 1, read primary variable
    // =========================================================================

    show(
        &decoder,
        "01 01 03 00 00 2A 00 18 86 A6 07 0A 0B 0C 01 07 00 00 07 40 48 F5 C3 15",
    )?;

    // =========================================================================
    // Extended command 1024 through command 31
    // =========================================================================

    show(
        &decoder,
        "01 01 03 00 00 2B 00 19 86 A6 07 0A 0B 0C 1F 08 00 00 04 00 00 01 51 80 E9",
    )?;

    // =========================================================================
    // No layout: the data is shown as hex
    // =========================================================================

    show(
        &decoder,
        "01 01 03 00 00 2C 00 16 86 A6 07 0A 0B 0C 30 05 00 00 00 00 00 1F",
    )?;

    Ok(())
}
