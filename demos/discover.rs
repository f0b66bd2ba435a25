//! Example: Discovering the devices behind a HART-IP endpoint
//!
//! Run with: cargo run --example discover -- <host> [port] [udp|tcp]
//!
//! This example demonstrates:
//! - Opening a session over UDP or TCP
//! - Discovering the polled device and its sub-devices
//! - Sending command 1 (read primary variable) to every device
//! - Receiving publish notifications
//! - Keeping the session alive with the inactivity monitor

use hart_ip::{ClientConfig, HartClient, HartIpResponse, MessageLog, TransportKind, HART_IP_PORT};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Prints every frame and error to stdout.
struct StdoutLog;

impl MessageLog for StdoutLog {
    fn log(&self, text: &str, with_timestamp: bool) {
        if with_timestamp {
            println!("{}, {}", hart_ip::utils::timestamp(), text);
        } else {
            println!("{}", text);
        }
    }
}

fn main() -> hart_ip::Result<()> {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(HART_IP_PORT);
    let kind = match args.next().as_deref() {
        Some("tcp") => TransportKind::Tcp,
        _ => TransportKind::Udp,
    };

    // =========================================================================
    // Connect
    // =========================================================================

    let config = ClientConfig::new().with_inactivity_close_time(60_000);
    let client = Arc::new(HartClient::with_logger(config, Arc::new(StdoutLog)));
    client.connect(&host, port, kind, client.config().socket_timeout)?;
    client.start_inactivity_monitor()?;

    let subscription = client.subscribe_publish(|response: &HartIpResponse| {
        println!(
            "published command {} ({} data bytes)",
            response.command,
            response.data.len()
        );
    });

    // =========================================================================
    // Discover
    // =========================================================================

    println!("\n=== Devices ===\n");

    let count = client.discover_devices()?;
    println!("{} device(s) found", count);
    for device in client.devices() {
        let role = if device.is_root() { "root" } else { "sub-device" };
        println!("{:<10} {} ({})", role, device, device.profile);
    }

    // =========================================================================
    // Read the primary variable of each device
    // =========================================================================

    println!("\n=== Primary Variables ===\n");

    for device in client.devices() {
        match client.send_request(1, "", device.id.device_type, device.id.device_id) {
            Ok(response) if response.data.len() >= 5 => {
                let units = response.data[0];
                let pv = f32::from_be_bytes([
                    response.data[1],
                    response.data[2],
                    response.data[3],
                    response.data[4],
                ]);
                println!("{}: PV = {} (units code {})", device.name, pv, units);
            }
            Ok(response) => println!(
                "{}: response code {} ({:?})",
                device.name,
                response.response_code,
                response.class()
            ),
            Err(e) => println!("{}: {}", device.name, e),
        }
    }

    // Give publish notifications a moment to arrive
    thread::sleep(Duration::from_secs(2));

    client.unsubscribe_publish(subscription);
    client.stop_inactivity_monitor();
    client.disconnect();
    Ok(())
}
