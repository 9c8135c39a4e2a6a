//! Integration tests for the hook engine.
//!
//! These run whole configurations through `Engine` against the in-memory bus
//! and device client: triggers fire, actions push overlays, end triggers
//! reset them, and shutdown restores every device.

use std::sync::Arc;
use std::time::Duration;

use openrgb_client::{MemoryClient, Rgb, Write, Zone};
use rgbhook::{Config, Engine, EngineError};
use rgbhook_bus::{BusScope, MemoryConnector, RawSignal, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const RED: Rgb = Rgb::new(255, 0, 0);
const GREEN: Rgb = Rgb::new(0, 255, 0);

fn keyboard() -> Arc<MemoryClient> {
    Arc::new(MemoryClient::default().with_device(
        "Keyboard",
        8,
        Rgb::BLACK,
        vec![Zone::new("Keys", 0, 6), Zone::new("Logo", 6, 2)],
    ))
}

/// Start the engine; the sender stops it
async fn start(
    config: &str,
    client: Arc<MemoryClient>,
    connector: &MemoryConnector,
) -> (oneshot::Sender<()>, JoinHandle<Result<(), EngineError>>) {
    let config = Config::from_toml(config).unwrap();
    let engine = Engine::from_config(&config, client, connector).await.unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(engine.run(async move {
        let _ = rx.await;
    }));
    (tx, task)
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ── Timer hooks ──

const TIMER_HOOK: &str = r#"
version = "0.4.0"

[hooks.flash]
action = { type = "leds", device_id = 0, leds = [0], color = [255, 0, 0] }
trigger = { sleep = "50ms" }
until = { sleep = "100ms" }
"#;

#[tokio::test(start_paused = true)]
async fn sleep_hook_applies_and_reverts() {
    let client = keyboard();
    let connector = MemoryConnector::new();
    let (stop, task) = start(TIMER_HOOK, client.clone(), &connector).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(client.colors(0).unwrap()[0], RED);
    assert_eq!(client.colors(0).unwrap()[1], Rgb::BLACK);

    tokio::time::sleep(Duration::from_millis(110)).await;
    assert_eq!(client.colors(0).unwrap(), vec![Rgb::BLACK; 8]);

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_restores_active_overlays() {
    let client = keyboard();
    let connector = MemoryConnector::new();
    let config = TIMER_HOOK.replace("100ms", "1h");
    let (stop, task) = start(&config, client.clone(), &connector).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(client.colors(0).unwrap()[0], RED);

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(client.colors(0).unwrap()[0], Rgb::BLACK);
}

// ── Signal hooks with conditions ──

const PLAYER_HOOK: &str = r#"
version = "0.4.0"

[hooks.playing]
action = { type = "zone", device_id = 0, zone = "Logo", color = "green" }

[hooks.playing.trigger.signal]
interface = "org.freedesktop.DBus.Properties"
name = "PropertiesChanged"
arguments = ["org.mpris.MediaPlayer2.Player"]

[[hooks.playing.trigger.conditions]]
service_name = "org.mpris.MediaPlayer2.spotify"
path = "/org/mpris/MediaPlayer2"
interface = "org.freedesktop.DBus.Properties"
method = "Get"
arguments = ["$sig_arg0", "PlaybackStatus"]
response = "Playing"

[hooks.playing.until.signal]
interface = "org.freedesktop.DBus.Properties"
name = "PropertiesChanged"
arguments = ["org.mpris.MediaPlayer2.Player"]

[[hooks.playing.until.conditions]]
service_name = "org.mpris.MediaPlayer2.spotify"
path = "/org/mpris/MediaPlayer2"
interface = "org.freedesktop.DBus.Properties"
method = "Get"
arguments = ["$sig_arg0", "PlaybackStatus"]
response = "Paused"
"#;

const SPOTIFY: &str = "org.mpris.MediaPlayer2.spotify";
const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";

fn properties_changed(interface: &str) -> RawSignal {
    RawSignal::new(":1.42", MPRIS_PATH, "org.freedesktop.DBus.Properties", "PropertiesChanged")
        .with_args(vec![Value::from(interface)])
}

#[tokio::test]
async fn conditions_gate_signal_hooks() {
    let client = keyboard();
    let connector = MemoryConnector::new();
    let bus = connector.bus(BusScope::Session).clone();
    let (stop, task) = start(PLAYER_HOOK, client.clone(), &connector).await;
    wait_for(|| bus.subscriber_count() == 1).await;

    // Wrong interface argument: filtered before any condition runs.
    bus.emit(properties_changed("org.mpris.MediaPlayer2.TrackList"));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(bus.calls().is_empty());

    // Condition does not hold.
    bus.reply(SPOTIFY, MPRIS_PATH, "Get", Value::from("Paused"));
    bus.emit(properties_changed("org.mpris.MediaPlayer2.Player"));
    wait_for(|| bus.calls().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(client.colors(0).unwrap()[6], Rgb::BLACK);

    bus.reply(SPOTIFY, MPRIS_PATH, "Get", Value::from("Playing"));
    bus.emit(properties_changed("org.mpris.MediaPlayer2.Player"));
    wait_for(|| client.colors(0).unwrap()[6] == GREEN).await;
    assert_eq!(client.colors(0).unwrap()[7], GREEN);
    assert_eq!(client.colors(0).unwrap()[5], Rgb::BLACK);
    let call = &bus.calls()[1];
    assert_eq!(call.args[0], Value::from("org.mpris.MediaPlayer2.Player"));

    // Start and end triggers both listen now.
    wait_for(|| bus.subscriber_count() == 2).await;
    bus.reply(SPOTIFY, MPRIS_PATH, "Get", Value::from("Paused"));
    bus.emit(properties_changed("org.mpris.MediaPlayer2.Player"));
    wait_for(|| client.colors(0).unwrap()[6] == Rgb::BLACK).await;

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
    assert!(bus.active_rules().is_empty());
}

#[tokio::test]
async fn failed_remote_query_suppresses_activation() {
    let client = keyboard();
    let connector = MemoryConnector::new();
    let bus = connector.bus(BusScope::Session).clone();
    let (stop, task) = start(PLAYER_HOOK, client.clone(), &connector).await;
    wait_for(|| bus.subscriber_count() == 1).await;

    // No scripted reply: the service is unknown.
    bus.emit(properties_changed("org.mpris.MediaPlayer2.Player"));
    wait_for(|| bus.calls().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(client.colors(0).unwrap(), vec![Rgb::BLACK; 8]);

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}

const TWO_PLAYERS: &str = r#"
version = "0.4.0"

[hooks.any_player]
action = { type = "leds", device_id = 0, leds = [0], color = "green" }
until = { sleep = "1h" }

[hooks.any_player.trigger.signal]
interface = "org.freedesktop.DBus.Properties"
name = "PropertiesChanged"

[hooks.spotify]
action = { type = "leds", device_id = 0, leds = [1], color = "red" }
until = { sleep = "1h" }

[hooks.spotify.trigger.signal]
sender = "org.mpris.MediaPlayer2.spotify"
interface = "org.freedesktop.DBus.Properties"
name = "PropertiesChanged"
"#;

#[tokio::test]
async fn sender_filter_only_fires_for_the_named_owner() {
    let client = keyboard();
    let connector = MemoryConnector::new();
    let bus = connector.bus(BusScope::Session).clone();
    bus.set_owner(SPOTIFY, Some(":1.42"));
    let (stop, task) = start(TWO_PLAYERS, client.clone(), &connector).await;
    wait_for(|| bus.subscriber_count() == 2).await;

    // Another player on the same interface.
    bus.emit(RawSignal::new(
        ":1.77",
        MPRIS_PATH,
        "org.freedesktop.DBus.Properties",
        "PropertiesChanged",
    ));
    wait_for(|| client.colors(0).unwrap()[0] == GREEN).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(client.colors(0).unwrap()[1], Rgb::BLACK);

    bus.emit(properties_changed("org.mpris.MediaPlayer2.Player"));
    wait_for(|| client.colors(0).unwrap()[1] == RED).await;

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(client.colors(0).unwrap(), vec![Rgb::BLACK; 8]);
}

// ── Animated effects ──

const FLASH_EFFECT: &str = r#"
version = "0.4.0"

[animation]
frequency = 50

[hooks.alert]
action = { type = "effect", device_id = 0, leds = [0, 1], effect = "flash", vars = { color = "white" } }
trigger = { sleep = "10ms" }
until = { sleep = "10s" }
"#;

#[tokio::test(start_paused = true)]
async fn effects_animate_until_the_end_trigger() {
    let client = keyboard();
    let connector = MemoryConnector::new();
    let (stop, task) = start(FLASH_EFFECT, client.clone(), &connector).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.colors(0).unwrap()[0], Rgb::WHITE);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.colors(0).unwrap()[0], Rgb::BLACK);
    assert_eq!(client.colors(0).unwrap()[2], Rgb::BLACK);

    let fast_writes = client
        .writes()
        .iter()
        .filter(|w| matches!(w, Write::Leds { fast: true, .. }))
        .count();
    assert!(fast_writes >= 1);

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(client.colors(0).unwrap(), vec![Rgb::BLACK; 8]);
}
