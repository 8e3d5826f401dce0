//! Serves a custom text-echo service: writes to its one characteristic are
//! stored uppercased, read back on the next `ReadValue`, and pushed out as a
//! `PropertiesChanged` notification.

use bzperi::{
    dsl, dsl::ServerBuilder, flags::CharacteristicFlags, path::derived_root_path, GattUuid, ServerConfig,
};
use clap::Parser;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncBufReadExt;

#[derive(Parser)]
struct Args {
    #[arg(long, default_value = "bzperi")]
    service_name: String,
    #[arg(long, default_value = "text_echo_server")]
    advertising_name: String,
}

const SERVICE_UUID: &str = "12345678-1234-5678-1234-56789abcdef0";
const CHARACTERISTIC_UUID: &str = "12345678-1234-5678-1234-56789abcdef1";
const CHARACTERISTIC_IFACE: &str = "org.bluez.GattCharacteristic1";

fn register_text_echo(last_write: Arc<Mutex<Vec<u8>>>, written_tx: tokio::sync::mpsc::UnboundedSender<()>) {
    dsl::register(Arc::new(move |server: &mut ServerBuilder<'_>| {
        let last_write = last_write.clone();
        let written_tx = written_tx.clone();
        server
            .service("text_echo", GattUuid::from_str_checked(SERVICE_UUID).expect("valid service uuid"), |service| {
                let read_back = last_write.clone();
                service
                    .characteristic(
                        "message",
                        GattUuid::from_str_checked(CHARACTERISTIC_UUID).expect("valid characteristic uuid"),
                        CharacteristicFlags { read: true, write: true, notify: true, ..Default::default() },
                        |c| {
                            c.on_read(move || Ok(read_back.lock().expect("last_write mutex poisoned").clone()));
                            c.on_write(move |bytes| {
                                let upper: Vec<u8> = bytes.to_ascii_uppercase();
                                println!("received {:?}, echoing {:?}", String::from_utf8_lossy(&bytes), String::from_utf8_lossy(&upper));
                                *last_write.lock().expect("last_write mutex poisoned") = upper;
                                let _ = written_tx.send(());
                                Ok(())
                            });
                        },
                    )
                    .expect("message characteristic");
            })
            .expect("text_echo service");
    }));
}

#[tokio::main]
async fn main() -> bzperi::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let last_write = Arc::new(Mutex::new(Vec::new()));
    let (written_tx, mut written_rx) = tokio::sync::mpsc::unbounded_channel();
    register_text_echo(last_write, written_tx);

    let root = derived_root_path(&args.service_name);
    let message_path = root.append("text_echo").and_then(|p| p.append("message"))?;

    let config = ServerConfig::new(args.service_name).with_advertising_name(args.advertising_name, "echo");
    let handle = Arc::new(bzperi::start(config)?);
    println!("text_echo_server running (health: {})", handle.health());

    tokio::spawn({
        let handle = handle.clone();
        async move {
            while written_rx.recv().await.is_some() {
                handle.push_update(message_path.clone(), CHARACTERISTIC_IFACE);
            }
        }
    });

    println!("Writes to the message characteristic are echoed back uppercased via notification.");
    println!("Press enter to quit.");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let _ = lines.next_line().await;

    handle.shutdown_and_wait()?;
    Ok(())
}
