// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use sds_wallpad::config::parse_header0;
use sds_wallpad::constants::DISCOVERY_PREFIX;
use sds_wallpad::discovery::{device_configs, virtual_configs, DiscoveryMessage};
use sds_wallpad::dump::dump;
use sds_wallpad::event::{command_channel, event_channel, CommandSender};
use sds_wallpad::{
    parse_inbound, BusCommand, BusConfig, BusEngine, BusEvent, EntranceMode, EventReceiver,
    IntercomMode, SerialSettings, SerialTransport, StreamTransport, TcpTransport, WallpadError,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "wallpad2mqtt")]
#[command(about = "Bridge between a Samsung SDS wallpad RS485 bus and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    bus: BusToml,
    serial: Option<SerialToml>,
    socket: Option<SocketToml>,
    mqtt: MqttToml,
    #[serde(default)]
    rs485: Rs485Toml,
}

#[derive(Debug, Deserialize)]
struct BusToml {
    #[serde(default = "default_off")]
    entrance_mode: String,
    #[serde(default = "default_off")]
    intercom_mode: String,
    /// "on" accepts commands for real devices
    #[serde(default = "default_on")]
    wallpad_mode: String,
    /// "serial" or "socket"
    #[serde(default = "default_serial_mode")]
    serial_mode: String,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
    /// Consecutive failed reopen attempts before the process exits
    #[serde(default = "default_max_reconnect_attempts")]
    max_reconnect_attempts: u32,
}

impl Default for BusToml {
    fn default() -> Self {
        Self {
            entrance_mode: default_off(),
            intercom_mode: default_off(),
            wallpad_mode: default_on(),
            serial_mode: default_serial_mode(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

fn default_off() -> String {
    "off".to_string()
}
fn default_on() -> String {
    "on".to_string()
}
fn default_serial_mode() -> String {
    "serial".to_string()
}
fn default_reconnect_delay() -> u64 {
    1000
}
fn default_max_reconnect_attempts() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
struct SerialToml {
    port: String,
    #[serde(default = "default_baudrate")]
    baudrate: u32,
    #[serde(default = "default_bytesize")]
    bytesize: u8,
    #[serde(default = "default_parity")]
    parity: String,
    #[serde(default = "default_stopbits")]
    stopbits: u8,
}

fn default_baudrate() -> u32 {
    9600
}
fn default_bytesize() -> u8 {
    8
}
fn default_parity() -> String {
    "E".to_string()
}
fn default_stopbits() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
struct SocketToml {
    address: String,
    #[serde(default = "default_socket_port")]
    port: u16,
}

fn default_socket_port() -> u16 {
    8899
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default)]
    need_login: bool,
    #[serde(default)]
    user: String,
    #[serde(default)]
    passwd: String,
    #[serde(default = "default_prefix")]
    prefix: String,
    #[serde(default = "default_true")]
    discovery: bool,
}

fn default_prefix() -> String {
    "sds".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct Rs485Toml {
    /// Seconds before an unacknowledged command is dropped
    #[serde(default = "default_max_retry")]
    max_retry: u64,
    #[serde(default = "default_early_response")]
    early_response: u8,
    #[serde(default = "default_intercom_header")]
    intercom_header: String,
    #[serde(default)]
    intercom_delay: bool,
    /// Seconds of raw traffic to log at startup (0 disables)
    #[serde(default)]
    dump_time: u64,
    #[serde(default)]
    power_decimal: u8,
    #[serde(default = "default_decimal")]
    gas_decimal: u8,
    #[serde(default = "default_decimal")]
    water_decimal: u8,
}

impl Default for Rs485Toml {
    fn default() -> Self {
        Self {
            max_retry: default_max_retry(),
            early_response: default_early_response(),
            intercom_header: default_intercom_header(),
            intercom_delay: false,
            dump_time: 0,
            power_decimal: 0,
            gas_decimal: default_decimal(),
            water_decimal: default_decimal(),
        }
    }
}

fn default_max_retry() -> u64 {
    20
}
fn default_early_response() -> u8 {
    2
}
fn default_intercom_header() -> String {
    "A4".to_string()
}
fn default_decimal() -> u8 {
    2
}

/// Where the RS485 bus is reached.
#[derive(Debug, Clone)]
enum BusEndpoint {
    Serial(SerialSettings),
    Socket { address: String, port: u16 },
}

/// Everything a bridge session needs, resolved from the TOML file.
struct Settings {
    bus: BusConfig,
    endpoint: BusEndpoint,
    mqtt_host: String,
    mqtt_port: u16,
    credentials: Option<(String, String)>,
    dump_time: Option<Duration>,
    reconnect_delay_ms: u64,
    max_reconnect_attempts: u32,
}

fn load_settings(path: &str) -> Result<Settings> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    let config: Config = toml::from_str(&text).context("Failed to parse config file")?;
    build_settings(config)
}

fn build_settings(config: Config) -> Result<Settings> {
    let entrance_mode: EntranceMode = config.bus.entrance_mode.parse()?;
    let intercom_mode: IntercomMode = config.bus.intercom_mode.parse()?;
    let wallpad_mode = match config.bus.wallpad_mode.as_str() {
        "on" => true,
        "off" => false,
        other => bail!("Unknown wallpad_mode '{other}' (expected on/off)"),
    };

    let endpoint = match config.bus.serial_mode.as_str() {
        "serial" => {
            let serial = config
                .serial
                .context("serial_mode = \"serial\" requires a [serial] section")?;
            BusEndpoint::Serial(SerialSettings::new(
                serial.port,
                serial.baudrate,
                serial.bytesize,
                &serial.parity,
                serial.stopbits,
            )?)
        }
        "socket" => {
            let socket = config
                .socket
                .context("serial_mode = \"socket\" requires a [socket] section")?;
            BusEndpoint::Socket {
                address: socket.address,
                port: socket.port,
            }
        }
        other => bail!("Unknown serial_mode '{other}' (expected serial/socket)"),
    };

    let rs485 = &config.rs485;
    let bus = BusConfig::builder()
        .prefix(config.mqtt.prefix.clone())
        .discovery(config.mqtt.discovery)
        .wallpad_mode(wallpad_mode)
        .entrance_mode(entrance_mode)
        .intercom_mode(intercom_mode)
        .intercom_header(parse_header0(&rs485.intercom_header)?)
        .intercom_delay(rs485.intercom_delay)
        .max_retry(Duration::from_secs(rs485.max_retry))
        .early_response(rs485.early_response)
        .allow_aggressive(matches!(endpoint, BusEndpoint::Serial(_)))
        .energy_decimals([rs485.power_decimal, rs485.gas_decimal, rs485.water_decimal])
        .build();

    let (mqtt_host, mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;
    let credentials = config
        .mqtt
        .need_login
        .then(|| (config.mqtt.user.clone(), config.mqtt.passwd.clone()));

    Ok(Settings {
        bus,
        endpoint,
        mqtt_host,
        mqtt_port,
        credentials,
        dump_time: (rs485.dump_time > 0).then(|| Duration::from_secs(rs485.dump_time)),
        reconnect_delay_ms: config.bus.reconnect_delay_ms,
        max_reconnect_attempts: config.bus.max_reconnect_attempts,
    })
}

// ---------------------------------------------------------------------------
// Bus session
// ---------------------------------------------------------------------------

enum BusLink {
    Serial(SerialTransport),
    Socket(TcpTransport),
}

impl BusEndpoint {
    async fn open(&self, config: &BusConfig) -> sds_wallpad::Result<BusLink> {
        match self {
            BusEndpoint::Serial(settings) => {
                let mut transport = SerialTransport::open(settings, config.read_timeout)?;
                transport.probe(config.probe_timeout).await?;
                Ok(BusLink::Serial(transport))
            }
            BusEndpoint::Socket { address, port } => {
                let mut transport =
                    TcpTransport::connect(address, *port, config.read_timeout).await?;
                transport.probe(config.probe_timeout).await?;
                Ok(BusLink::Socket(transport))
            }
        }
    }
}

async fn run_session<S>(
    engine: &mut BusEngine,
    transport: &mut StreamTransport<S>,
    dump_time: Option<Duration>,
) -> sds_wallpad::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(duration) = dump_time {
        dump(transport, duration).await?;
    }
    engine.run(transport).await
}

/// Keep the bus engine running, reopening the link after transport failures.
///
/// Gives up after `max_reconnect_attempts` consecutive failed reopen attempts.
async fn bus_task(
    mut engine: BusEngine,
    endpoint: BusEndpoint,
    mut dump_time: Option<Duration>,
    reconnect_delay_ms: u64,
    max_reconnect_attempts: u32,
) -> Result<()> {
    let mut attempt: u32 = 0;
    let mut first = true;
    loop {
        if attempt > 0 {
            if attempt > max_reconnect_attempts {
                bail!("Bus link could not be reopened after {max_reconnect_attempts} attempts");
            }
            let delay_ms = reconnect_delay_ms * (1u64 << (attempt - 1).min(4));
            error!(
                "Bus reconnection attempt {attempt} failed. Retrying in {:.1}s...",
                delay_ms as f64 / 1000.0
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let mut link = match endpoint.open(engine.config()).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Bus connection error: {e}");
                attempt += 1;
                continue;
            }
        };
        attempt = 0;
        if !first {
            engine.restart_discovery();
        }
        first = false;

        let dump = dump_time.take();
        let result = match &mut link {
            BusLink::Serial(transport) => run_session(&mut engine, transport, dump).await,
            BusLink::Socket(transport) => run_session(&mut engine, transport, dump).await,
        };
        match result {
            Err(e) if e.is_retryable() => {
                warn!("Bus link lost ({e}), will attempt reconnection");
                attempt = 1;
            }
            Err(e) => return Err(e).context("Bus engine failed"),
            Ok(()) => return Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtMostOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_discovery(client: &AsyncClient, messages: Vec<DiscoveryMessage>) {
    for msg in messages {
        debug!("discovery: {}", msg.topic);
        publish_json(client, &msg.topic, &msg.payload, false).await;
    }
}

async fn handle_bus_event(event: BusEvent, client: &AsyncClient, config: &BusConfig) {
    match event {
        BusEvent::Publish { topic, payload } => {
            if let Err(e) = client.publish(&topic, QoS::AtMostOnce, false, payload).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        BusEvent::DeviceFound {
            device,
            id,
            last_query,
            ..
        } => {
            let messages =
                device_configs(&config.prefix, device, id, &last_query, config.energy_decimals);
            publish_discovery(client, messages).await;
        }
        BusEvent::VirtualDeviceReady { device } => {
            publish_discovery(client, virtual_configs(&config.prefix, device)).await;
        }
        BusEvent::DiscoveryComplete => info!("Discovery window closed"),
    }
}

/// Topics the bridge listens on for the given configuration.
fn subscriptions(config: &BusConfig) -> Vec<String> {
    let prefix = &config.prefix;
    let mut topics = vec![
        format!("{DISCOVERY_PREFIX}/status"),
        format!("{prefix}/debug/#"),
    ];
    if !config.virtual_devices().is_empty() {
        topics.push(format!("{prefix}/virtual/+/+/command"));
    }
    if config.wallpad_mode {
        topics.push(format!("{prefix}/+/+/+/command"));
    }
    topics
}

fn forward_inbound(prefix: &str, topic: &str, payload: &str, commands: &CommandSender) {
    match parse_inbound(prefix, topic, payload) {
        Ok(Some(command)) => {
            info!("recv. from HA: {topic} = {payload}");
            if commands.send(command).is_err() {
                warn!("{}", WallpadError::ChannelClosed);
            }
        }
        Ok(None) => debug!("ignored {topic} = {payload}"),
        Err(e) => error!("Rejected {topic} = {payload}: {e}"),
    }
}

async fn event_task(mut events: EventReceiver, client: AsyncClient, config: BusConfig) {
    while let Some(event) = events.recv().await {
        handle_bus_event(event, &client, &config).await;
    }
    info!("Event channel closed");
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=sds_wallpad=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let mut settings = load_settings(&cli.config)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let (event_tx, event_rx) = event_channel();
        let (command_tx, command_rx) = command_channel();

        // Set up MQTT
        let client_id = format!("sds_wallpad-{}", Utc::now().timestamp());
        let mut mqtt_opts = MqttOptions::new(&client_id, &settings.mqtt_host, settings.mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        if let Some((user, passwd)) = &settings.credentials {
            mqtt_opts.set_credentials(user, passwd);
        }
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);
        info!(
            "MQTT: connecting to {}:{} as {client_id}",
            settings.mqtt_host, settings.mqtt_port
        );

        // Task 1: bus events to MQTT
        let event_handle = tokio::spawn(event_task(event_rx, client.clone(), settings.bus.clone()));

        // Task 2: MQTT event loop (receives messages, forwards commands)
        let client_cmds = client.clone();
        let topics = subscriptions(&settings.bus);
        let prefix = settings.bus.prefix.clone();
        let mqtt_handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // rumqttc does not resubscribe after a broker reconnect
                        info!("MQTT connect successful!");
                        for topic in &topics {
                            info!("subscribe {topic}");
                            if let Err(e) = client_cmds.subscribe(topic, QoS::AtMostOnce).await {
                                error!("Failed to subscribe to {topic}: {e}");
                            }
                        }
                        if command_tx.send(BusCommand::Rediscover).is_err() {
                            warn!("{}", WallpadError::ChannelClosed);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        let payload = String::from_utf8_lossy(&msg.payload);
                        forward_inbound(&prefix, &msg.topic, &payload, &command_tx);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Task 3: the bus itself
        let engine = BusEngine::new(settings.bus.clone(), event_tx, command_rx);
        let mut bus_handle = tokio::spawn(bus_task(
            engine,
            settings.endpoint.clone(),
            settings.dump_time,
            settings.reconnect_delay_ms,
            settings.max_reconnect_attempts,
        ));

        // Wait for a signal or for the bus to give up
        info!("MQTT bridge running. Send SIGHUP to restart, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
            result = &mut bus_handle => {
                event_handle.abort();
                mqtt_handle.abort();
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(e).context("Bus task panicked"),
                };
            }
        };

        // Abort tasks
        bus_handle.abort();
        event_handle.abort();
        mqtt_handle.abort();
        if let Err(e) = client.disconnect().await {
            debug!("MQTT disconnect: {e}");
        }

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_settings(&cli.config) {
            Ok(new_settings) => {
                settings = new_settings;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e:#}"),
        }

        info!("Reconnecting...");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str
        .parse()
        .context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Settings> {
        build_settings(toml::from_str(text)?)
    }

    #[test]
    fn test_parse_mqtt_url() {
        assert_eq!(
            parse_mqtt_url("mqtt://broker.local:1883").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(
            parse_mqtt_url("10.0.0.2:1884").unwrap(),
            ("10.0.0.2".to_string(), 1884)
        );
        assert!(parse_mqtt_url("mqtt://broker.local").is_err());
    }

    #[test]
    fn test_minimal_socket_config() {
        let settings = parse(
            r#"
            [bus]
            serial_mode = "socket"
            entrance_mode = "new"

            [socket]
            address = "192.168.0.50"

            [mqtt]
            url = "mqtt://localhost:1883"
            "#,
        )
        .unwrap();

        assert!(!settings.bus.allow_aggressive);
        assert_eq!(settings.bus.prefix, "sds");
        assert_eq!(settings.bus.entrance_mode, EntranceMode::New);
        assert_eq!(settings.bus.energy_decimals, [0, 2, 2]);
        assert!(settings.credentials.is_none());
        assert!(settings.dump_time.is_none());
        assert!(matches!(
            settings.endpoint,
            BusEndpoint::Socket { ref address, port: 8899 } if address == "192.168.0.50"
        ));
    }

    #[test]
    fn test_serial_config_with_login() {
        let settings = parse(
            r#"
            [bus]
            intercom_mode = "on"

            [serial]
            port = "/dev/ttyUSB0"

            [mqtt]
            url = "mqtt://localhost:1883"
            need_login = true
            user = "wallpad"
            passwd = "secret"

            [rs485]
            intercom_header = "A5"
            dump_time = 15
            "#,
        )
        .unwrap();

        assert!(settings.bus.allow_aggressive);
        assert_eq!(settings.bus.intercom_header, 0xA5);
        assert_eq!(settings.dump_time, Some(Duration::from_secs(15)));
        assert_eq!(
            settings.credentials,
            Some(("wallpad".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_missing_link_section_is_rejected() {
        let err = parse(
            r#"
            [mqtt]
            url = "mqtt://localhost:1883"
            "#,
        );
        assert!(err.is_err());
        assert!(parse(
            r#"
            [bus]
            wallpad_mode = "maybe"
            [serial]
            port = "/dev/ttyUSB0"
            [mqtt]
            url = "mqtt://localhost:1883"
            "#,
        )
        .is_err());
    }

    #[test]
    fn test_subscriptions_follow_modes() {
        let config = BusConfig::builder().build();
        assert_eq!(
            subscriptions(&config),
            vec!["homeassistant/status", "sds/debug/#", "sds/+/+/+/command"]
        );

        let config = BusConfig::builder()
            .wallpad_mode(false)
            .intercom_mode(IntercomMode::On)
            .build();
        assert_eq!(
            subscriptions(&config),
            vec!["homeassistant/status", "sds/debug/#", "sds/virtual/+/+/command"]
        );
    }
}
