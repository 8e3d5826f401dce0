//! Serves a read-only Device Information Service (0x180A) advertising a
//! fixed manufacturer name and model number.

use bzperi::{dsl, dsl::ServerBuilder, flags::CharacteristicFlags, GattUuid, ServerConfig};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
struct Args {
    /// Service name published on D-Bus, e.g. "bzperi" or "bzperi.myapp"
    #[arg(long, default_value = "bzperi")]
    service_name: String,
    /// Name advertised to scanning devices
    #[arg(long, default_value = "device_info_server")]
    advertising_name: String,
}

fn register_device_info() {
    dsl::register(Arc::new(|server: &mut ServerBuilder<'_>| {
        server
            .service("device_info", GattUuid::from_u16(0x180A), |service| {
                let read_only = CharacteristicFlags { read: true, ..Default::default() };
                service
                    .characteristic("mfgr_name", GattUuid::from_u16(0x2A29), read_only, |c| {
                        c.initial_value(b"Acme Corporation".to_vec());
                    })
                    .expect("mfgr_name characteristic");
                service
                    .characteristic("model_number", GattUuid::from_u16(0x2A24), read_only, |c| {
                        c.initial_value(b"bzperi-1".to_vec());
                    })
                    .expect("model_number characteristic");
            })
            .expect("device_info service");
    }));
}

#[tokio::main]
async fn main() -> bzperi::Result<()> {
    env_logger::init();
    let args = Args::parse();

    register_device_info();

    let config = ServerConfig::new(args.service_name).with_advertising_name(args.advertising_name, "dis");
    let handle = bzperi::start(config)?;
    println!("device_info_server running (health: {})", handle.health());

    println!("Press enter to quit.");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let _ = lines.next_line().await;

    handle.shutdown_and_wait()?;
    Ok(())
}
