//! Full central session against the simulated radio: scan for a
//! sensor, connect, read its battery level, then follow notifications.
//!
//! Run with: cargo run --example sensor_session

use std::sync::Arc;
use std::time::Duration;

use cerulean::driver::simulated::{SimPeripheral, SimRadio};
use cerulean::driver::RadioDriver;
use cerulean::types::{uuid16, AdvertisementSighting, CharacteristicProperties, Handle};
use cerulean::{Central, PeerAddress};

const BATTERY_LEVEL: Handle = Handle(0x0003);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let (radio, events) = SimRadio::new();
    let peer: PeerAddress = "AA:BB:CC:DD:EE:FF".parse()?;
    radio
        .add_peripheral(
            SimPeripheral::new(peer.clone())
                .named("battery-sensor")
                .with_service(uuid16(0x180F))
                .with_characteristic(
                    uuid16(0x2A19),
                    CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                    BATTERY_LEVEL,
                    &[0x64],
                ),
        )
        .await;

    let central = Central::new(Arc::clone(&radio) as Arc<dyn RadioDriver>, events);

    // Advertise while the scan runs.
    {
        let radio = Arc::clone(&radio);
        let peer = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            radio.emit_advertisement(
                AdvertisementSighting::new(peer, -48).named("battery-sensor"),
            );
        });
    }

    let sightings = central
        .scanner()
        .discover(Duration::from_millis(200))
        .await?;
    for sighting in sightings.values() {
        println!(
            "saw {} ({:?}) at {} dBm",
            sighting.peer, sighting.local_name, sighting.rssi
        );
    }

    let conn = central.connect(&peer).await?;
    println!("connected, mtu {}", conn.mtu());

    let table = conn.discover().await?;
    for service in table.services() {
        println!("service {}", service.uuid);
        for characteristic in &service.characteristics {
            println!("  characteristic {} ({:?})", characteristic.uuid, characteristic.properties);
        }
    }

    let level = conn.read(BATTERY_LEVEL).await?;
    println!("battery level: {}%", level[0]);

    let mut notifications = conn.subscribe(BATTERY_LEVEL).await?;
    radio.notify(&peer, BATTERY_LEVEL, &[0x63]);
    if let Some(update) = notifications.recv().await {
        println!("battery update: {}%", update[0]);
    }

    conn.unsubscribe(notifications).await?;
    central.disconnect(&peer).await?;
    println!("session complete");
    Ok(())
}
