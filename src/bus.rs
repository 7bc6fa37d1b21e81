// MIT License - Copyright (c) 2026 Peter Wright
// Bus loop: one turn per frame on the wallpad's RS485 line

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::command::BusCommand;
use crate::config::BusConfig;
use crate::constants::{HEADER_0_STATE, HEADER_1_SCAN};
use crate::devices::field::decode;
use crate::devices::{DeviceKind, DeviceSchema, InstanceCache, LastSeen, SchemaTable};
use crate::emulator::VirtualEngine;
use crate::error::{Result, WallpadError};
use crate::event::{BusEvent, CommandReceiver, EventSender};
use crate::protocol::{hex, read_header, verify_checksum, Header};
use crate::queue::CommandQueue;
use crate::transport::BusTransport;

/// Recurrence of the primary header, which paces discovery and picks the
/// transmission policy.
#[derive(Debug)]
struct LoopTracker {
    primary: u8,
    candidates: Vec<u8>,
    stable_cycles: u32,
    primary_timeout: Duration,
    allow_aggressive: bool,
    loop_count: u32,
    scan_count: u32,
    aggressive: bool,
    started: Instant,
}

impl LoopTracker {
    fn new(config: &BusConfig) -> Self {
        Self {
            primary: config.primary_header,
            candidates: config.primary_candidates.clone(),
            stable_cycles: config.stable_cycles,
            primary_timeout: config.primary_timeout,
            allow_aggressive: config.allow_aggressive,
            loop_count: 0,
            scan_count: 0,
            aggressive: false,
            started: Instant::now(),
        }
    }

    /// Start counting from scratch on a fresh transport.
    fn restart(&mut self, now: Instant) {
        self.loop_count = 0;
        self.scan_count = 0;
        self.aggressive = false;
        self.started = now;
    }

    /// Whether this frame is an opportunity to transmit a real command.
    fn is_send_slot(&mut self, header: Header) -> bool {
        if header.h1 == HEADER_1_SCAN || self.aggressive {
            self.scan_count += 1;
            true
        } else {
            false
        }
    }

    /// Count one frame; returns `true` on the turn the loop settles.
    fn count_cycle(&mut self, header: Header, discovery_open: bool) -> bool {
        if header.h0 != self.primary {
            return false;
        }
        // settled and nothing to pace: stop counting
        if self.loop_count > self.stable_cycles && !discovery_open {
            return false;
        }
        self.loop_count += 1;

        if self.loop_count == self.stable_cycles {
            if self.allow_aggressive && self.scan_count < self.stable_cycles {
                warn!(
                    "only {} scan slots in {} cycles, sending aggressively",
                    self.scan_count, self.loop_count
                );
                self.aggressive = true;
            }
            return true;
        }
        if self.loop_count > self.stable_cycles && discovery_open {
            self.loop_count = 1;
        }
        false
    }

    /// Fall back to another primary header when the current one never shows up.
    fn check_primary(&mut self, now: Instant) {
        if self.loop_count != 0
            || now.saturating_duration_since(self.started) <= self.primary_timeout
        {
            return;
        }
        match self.candidates.pop() {
            Some(next) => {
                warn!(
                    "no {:02x} header within {:?}, trying {next:02x}",
                    self.primary, self.primary_timeout
                );
                self.primary = next;
            }
            None => warn!(
                "no primary header candidates left, keeping {:02x}",
                self.primary
            ),
        }
        self.started = now;
        self.scan_count = 0;
    }
}

/// Drives the bus: decodes state frames, answers for virtual devices and
/// slips queued commands into safe slots.
///
/// All protocol state is owned here; the messaging side only talks to it
/// through the command channel.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use sds_wallpad::{BusConfig, BusEngine, SerialSettings, SerialTransport};
/// use sds_wallpad::event::{command_channel, event_channel};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = BusConfig::builder().prefix("sds").build();
///     let (event_tx, mut events) = event_channel();
///     let (_command_tx, commands) = command_channel();
///
///     tokio::spawn(async move {
///         while let Some(event) = events.recv().await {
///             println!("Event: {:?}", event);
///         }
///     });
///
///     let settings = SerialSettings::new("/dev/ttyUSB0", 9600, 8, "E", 1)?;
///     let mut transport = SerialTransport::open(&settings, Duration::from_secs(10))?;
///     let mut engine = BusEngine::new(config, event_tx, commands);
///     engine.run(&mut transport).await?;
///     Ok(())
/// }
/// ```
pub struct BusEngine {
    config: BusConfig,
    schemas: SchemaTable,
    cache: InstanceCache,
    queue: CommandQueue,
    virtuals: VirtualEngine,
    tracker: LoopTracker,
    last_query: Vec<u8>,
    discovery_open: bool,
    events: EventSender,
    commands: CommandReceiver,
}

impl BusEngine {
    pub fn new(config: BusConfig, events: EventSender, commands: CommandReceiver) -> Self {
        let schemas = SchemaTable::new(config.enabled_devices());
        let virtuals = VirtualEngine::new(&config, events.clone());
        Self {
            schemas,
            cache: InstanceCache::default(),
            queue: CommandQueue::new(config.max_retry),
            virtuals,
            tracker: LoopTracker::new(&config),
            last_query: Vec::new(),
            discovery_open: config.discovery,
            events,
            commands,
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn virtual_engine(&self) -> &VirtualEngine {
        &self.virtuals
    }

    /// Whether newly seen instances are still being announced.
    pub fn is_discovering(&self) -> bool {
        self.discovery_open
    }

    pub fn is_aggressive(&self) -> bool {
        self.tracker.aggressive
    }

    /// Header0 currently used to count bus cycles.
    pub fn primary_header(&self) -> u8 {
        self.tracker.primary
    }

    /// Real-device commands still waiting for an ack.
    pub fn pending_commands(&self) -> usize {
        self.queue.len()
    }

    /// Run turns until the transport fails.
    ///
    /// Quiet periods ([`WallpadError::ReadTimeout`]) are not failures. Any
    /// other error ends the session and is returned so the caller can reopen
    /// the transport.
    pub async fn run<T: BusTransport>(&mut self, transport: &mut T) -> Result<()> {
        info!("start loop ...");
        self.tracker.restart(Instant::now());
        loop {
            match self.step(transport).await {
                Ok(()) => {}
                Err(WallpadError::ReadTimeout) => {
                    debug!("no data within read timeout");
                    self.tracker.check_primary(Instant::now());
                }
                Err(e) => {
                    error!("bus session ended: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// Process one frame.
    pub async fn step<T: BusTransport>(&mut self, transport: &mut T) -> Result<()> {
        self.drain_commands();

        let header = read_header(transport).await?;
        let mut sent = false;

        self.virtuals.on_ack(header);
        self.virtuals.on_availability(header);
        if self.virtuals.owns(header.h0) {
            self.virtuals.answer(transport, header).await?;
        }

        if let Some(schema) = self.schemas.by_state_header(header) {
            let rest = transport.read(schema.state.length.saturating_sub(2)).await?;
            let mut frame = header.bytes().to_vec();
            frame.extend(rest);
            if !verify_checksum(&frame) {
                debug!("checksum error: {}", hex(&frame));
                return Ok(());
            }
            sent = self.try_send(transport).await?;
            self.receive_state(schema, &frame);
        } else if header.h0 == HEADER_0_STATE {
            let h2 = transport.read(1).await?[0];
            let key = [header.h0, header.h1, h2];
            if self.queue.expects(&key) {
                self.queue.on_ack(key);
            }
        } else if let Some(schema) = self.schemas.by_query_header(header) {
            let rest = transport.read(schema.query.length.saturating_sub(2)).await?;
            let mut frame = header.bytes().to_vec();
            frame.extend(rest);
            self.last_query = frame;
        }

        if self.tracker.is_send_slot(header) && !sent {
            self.try_send(transport).await?;
        }

        if self.tracker.count_cycle(header, self.discovery_open) {
            self.settle();
        }
        self.tracker.check_primary(Instant::now());
        Ok(())
    }

    /// Reopen discovery and republish the virtual devices.
    ///
    /// Called when the automation layer restarts and after a transport reconnect.
    pub fn restart_discovery(&mut self) {
        info!("restart discovery");
        self.discovery_open = self.config.discovery;
        self.cache.clear();
        for device in self.virtuals.kinds() {
            let _ = self.events.send(BusEvent::VirtualDeviceReady { device });
        }
        self.virtuals.publish_initial_state();
    }

    /// Apply a command from the messaging side.
    pub fn handle_command(&mut self, command: BusCommand) -> Result<()> {
        match command {
            BusCommand::Device { device, packet } => {
                if !self.config.wallpad_mode || self.schemas.get(device).is_none() {
                    return Err(WallpadError::DeviceDisabled {
                        device: device.name().to_string(),
                    });
                }
                self.queue.enqueue(packet, Instant::now());
            }
            BusCommand::Virtual {
                device,
                trigger,
                payload,
            } => self.virtuals.command(device, &trigger, &payload)?,
            BusCommand::InjectRaw(packet) => self.queue.enqueue(packet, Instant::now()),
            BusCommand::Rediscover => self.restart_discovery(),
        }
        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match self.handle_command(command) {
                Ok(()) => {}
                Err(e) if e.is_rejected_command() => error!("rejected command: {e}"),
                Err(e) => warn!("command failed: {e}"),
            }
        }
    }

    /// Transmit the oldest real command if no echo is pending.
    async fn try_send<T: BusTransport>(&mut self, transport: &mut T) -> Result<bool> {
        if transport.pending_count() > 0 {
            return Ok(false);
        }
        let Some(packet) = self.queue.front().map(<[u8]>::to_vec) else {
            return Ok(false);
        };
        transport.write(&packet).await?;
        transport.mark_pending_from_write().await?;
        self.queue.record_attempt(&packet, Instant::now());
        Ok(true)
    }

    fn receive_state(&mut self, schema: &'static DeviceSchema, frame: &[u8]) {
        let kind = schema.kind;
        let id = schema.state.instance_id(frame);

        let last = self.cache.last(kind, id);
        if matches!(last, Some(LastSeen::Frame(f)) if f == frame) {
            return;
        }

        if self.discovery_open && last.is_none() {
            if self.last_query.get(1) == frame.get(1) || kind == DeviceKind::GasValve {
                info!("new device: {kind} {id:x}");
                let _ = self.events.send(BusEvent::DeviceFound {
                    device: kind,
                    id,
                    frame: frame.to_vec(),
                    last_query: self.last_query.clone(),
                });
                self.cache.set_last(kind, id, LastSeen::Registered);
            }
            return;
        }

        self.cache.set_last(kind, id, LastSeen::Frame(frame.to_vec()));
        for field in schema.state.fields {
            for (attribute, value) in decode(field, frame) {
                if value.is_empty() {
                    continue;
                }
                let topic = format!("{}/{kind}/{id:x}/{attribute}/state", self.config.prefix);
                let payload = value.to_string();
                if !self.cache.update_published(&topic, &payload) {
                    continue;
                }
                if attribute == "current" {
                    debug!("publish: {topic} = {payload}");
                } else {
                    info!("publish: {topic} = {payload}");
                }
                let _ = self.events.send(BusEvent::Publish { topic, payload });
            }
        }
    }

    /// The primary header reached the stable count.
    fn settle(&mut self) {
        if !self.discovery_open {
            info!("running stable");
            return;
        }
        info!("discovery done");
        self.discovery_open = false;
        self.cache.clear();
        self.virtuals.publish_initial_state();
        let _ = self.events.send(BusEvent::DiscoveryComplete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(cycles: u32, aggressive: bool) -> LoopTracker {
        let config = BusConfig::builder()
            .stable_cycles(cycles)
            .allow_aggressive(aggressive)
            .build();
        LoopTracker::new(&config)
    }

    #[test]
    fn test_settles_after_stable_cycles() {
        let mut t = tracker(3, true);
        let primary = Header::new(0xA1, 0x5A);
        assert!(t.is_send_slot(primary));
        assert!(!t.count_cycle(primary, true));
        assert!(!t.count_cycle(Header::new(0xAC, 0x79), true));
        assert!(!t.count_cycle(primary, true));
        assert!(t.count_cycle(primary, true));
        // one scan slot in three cycles
        assert!(t.aggressive);
    }

    #[test]
    fn test_enough_scan_slots_stay_normal() {
        let mut t = tracker(2, true);
        let primary = Header::new(0xA1, 0x5A);
        for _ in 0..2 {
            t.is_send_slot(primary);
            t.is_send_slot(primary);
        }
        t.count_cycle(primary, false);
        assert!(t.count_cycle(primary, false));
        assert!(!t.aggressive);
    }

    #[test]
    fn test_aggressive_needs_permission() {
        let mut t = tracker(1, false);
        assert!(t.count_cycle(Header::new(0xA1, 0x41), false));
        assert!(!t.aggressive);
        assert!(!t.is_send_slot(Header::new(0xA1, 0x41)));
    }

    #[test]
    fn test_open_discovery_rewinds_count() {
        let mut t = tracker(2, false);
        let primary = Header::new(0xA1, 0x41);
        t.count_cycle(primary, true);
        assert!(t.count_cycle(primary, true));
        assert!(!t.count_cycle(primary, true));
        assert_eq!(t.loop_count, 1);
        assert!(t.count_cycle(primary, true));
    }

    #[test]
    fn test_count_stops_once_settled() {
        let mut t = tracker(3, false);
        let primary = Header::new(0xA1, 0x41);
        for _ in 0..3 {
            t.count_cycle(primary, false);
        }
        for _ in 0..100 {
            assert!(!t.count_cycle(primary, false));
        }
        assert_eq!(t.loop_count, 4);

        // reopened discovery starts a fresh window
        assert!(!t.count_cycle(primary, true));
        assert_eq!(t.loop_count, 1);
    }

    #[test]
    fn test_primary_fallback() {
        let mut t = tracker(30, true);
        let start = t.started;

        t.check_primary(start + Duration::from_secs(5));
        assert_eq!(t.primary, 0xA1);

        t.check_primary(start + Duration::from_secs(7));
        assert_eq!(t.primary, 0xA5);
        t.check_primary(start + Duration::from_secs(14));
        assert_eq!(t.primary, 0xC2);

        t.candidates.clear();
        t.check_primary(start + Duration::from_secs(21));
        assert_eq!(t.primary, 0xC2);
    }

    #[test]
    fn test_no_fallback_once_counting() {
        let mut t = tracker(30, true);
        let start = t.started;
        t.count_cycle(Header::new(0xA1, 0x41), true);
        t.check_primary(start + Duration::from_secs(60));
        assert_eq!(t.primary, 0xA1);
    }
}
