use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use uuid::Uuid;

use gattq::capability::{CharacteristicInfo, CharacteristicProperties, ServiceInfo};
use gattq::fake::FakeTransport;
use gattq::session::Session;
use gattq::transport::{completion_channel, ConnectOptions};
use gattq::uuid::uuid_from_u16;
use gattq::{Address, Event};

// A typical BLE RGB lamp: one vendor service with one writable
// characteristic taking [0x16, r, g, b] commands.
const LAMP_SERVICE_UUID: Uuid = uuid_from_u16(0xFFE0);
const LAMP_RGB_CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0xFFE1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder().filter_level(log::LevelFilter::Debug) // Default Log Level
                         .parse_default_env()
                         .init();

    let (completions_tx, completions_rx) = completion_channel();
    let transport = FakeTransport::new(completions_tx);
    let session = Session::start(Arc::new(transport.clone()), completions_rx);
    let mut events = Box::pin(session.events()?);

    let lamp = Address::from_str("F1:E2:D3:C4:B5:A6")?;
    transport.declare_peripheral(&lamp,
                                 vec![ServiceInfo::new(LAMP_SERVICE_UUID,
                                                       vec![CharacteristicInfo::new(LAMP_RGB_CHARACTERISTIC_UUID,
                                                                                    CharacteristicProperties::WRITE)])]);

    session.connect(lamp.clone(), ConnectOptions::default())?;
    // There is no radio here, so play the peripheral's part too
    transport.complete_connect(&lamp);
    transport.complete_discovery(&lamp);

    while let Some(event) = events.next().await {
        match event {
            Event::PeripheralConnected { peripheral } => {
                println!("connected to {}", peripheral);
            }
            Event::CapabilitiesDiscovered { peripheral, services } => {
                println!("discovered {} service(s) on {}", services.len(), peripheral);
                session.write_characteristic(peripheral,
                                             LAMP_RGB_CHARACTERISTIC_UUID,
                                             vec![0x16, 0xFF, 0x00, 0x00])?;
                transport.complete_write(&lamp, LAMP_RGB_CHARACTERISTIC_UUID, None);
            }
            Event::CharacteristicWritten { peripheral, error: None, .. } => {
                println!("lamp colour written");
                session.disconnect(peripheral)?;
            }
            Event::PeripheralDisconnected { peripheral } => {
                println!("{} disconnected, done", peripheral);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
