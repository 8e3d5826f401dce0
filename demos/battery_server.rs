//! Serves a Battery Service (0x180F) whose Battery Level (0x2A19) notifies
//! subscribers as it ticks down, wrapping back to 100 once it reaches zero.

use bzperi::{dsl, dsl::ServerBuilder, flags::CharacteristicFlags, path::derived_root_path, GattUuid, ServerConfig};
use clap::Parser;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tokio::{io::AsyncBufReadExt, time::Duration};

#[derive(Parser)]
struct Args {
    #[arg(long, default_value = "bzperi")]
    service_name: String,
    #[arg(long, default_value = "battery_server")]
    advertising_name: String,
}

static LEVEL: AtomicU8 = AtomicU8::new(100);

fn register_battery_service() {
    dsl::register(Arc::new(|server: &mut ServerBuilder<'_>| {
        server
            .service("battery", GattUuid::from_u16(0x180F), |service| {
                service
                    .characteristic(
                        "level",
                        GattUuid::from_u16(0x2A19),
                        CharacteristicFlags { read: true, notify: true, ..Default::default() },
                        |c| {
                            c.on_read(|| Ok(vec![LEVEL.load(Ordering::Relaxed)]));
                        },
                    )
                    .expect("level characteristic");
            })
            .expect("battery service");
    }));
}

#[tokio::main]
async fn main() -> bzperi::Result<()> {
    env_logger::init();
    let args = Args::parse();

    register_battery_service();

    let root = derived_root_path(&args.service_name);
    let level_path = root.append("battery").and_then(|p| p.append("level"))?;

    let config = ServerConfig::new(args.service_name).with_advertising_name(args.advertising_name, "batt");
    let handle = Arc::new(bzperi::start(config)?);
    println!("battery_server running (health: {})", handle.health());

    tokio::spawn({
        let handle = handle.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let next = LEVEL.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(if v == 0 { 100 } else { v - 1 })).unwrap_or(100);
                println!("battery level now {next}");
                handle.push_update(level_path.clone(), "org.bluez.GattCharacteristic1");
            }
        }
    });

    println!("Press enter to quit.");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let _ = lines.next_line().await;

    handle.shutdown_and_wait()?;
    Ok(())
}
