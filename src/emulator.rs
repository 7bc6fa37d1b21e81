// MIT License - Copyright (c) 2026 Peter Wright
// Virtual device engine: answers queries for absent modules and drives trigger chains

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{BusConfig, EntranceMode};
use crate::constants::{
    FOLLOW_SENTINEL, INTERCOM_CALL_ENDED, INTERCOM_CALL_STARTED, INTERCOM_PRIVATE_RING,
    INTERCOM_PUBLIC_RING, RETRY_WARN_AFTER,
};
use crate::devices::virtual_device::{ChainOptions, PrivateOrigin, Step, Trigger, VirtualKind};
use crate::error::{Result, WallpadError};
use crate::event::{BusEvent, EventSender};
use crate::protocol::{hex, seal, Header};
use crate::transport::BusTransport;

/// A chain in flight: the user action and the step currently offered.
#[derive(Debug, Clone, Copy)]
struct PendingChain {
    trigger: Trigger,
    step: Step,
    since: Instant,
}

/// One impersonated module.
#[derive(Debug)]
struct VirtualSlot {
    kind: VirtualKind,
    header0: u8,
    /// Answer steady-state queries only while a chain is pending.
    quiet_when_idle: bool,
    chains: VecDeque<PendingChain>,
}

impl VirtualSlot {
    fn answers_defaults(&self) -> bool {
        !self.quiet_when_idle || !self.chains.is_empty()
    }
}

/// Which intercom entrance an availability flag belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entrance {
    Public,
    Private,
}

impl Entrance {
    fn name(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

/// Impersonates the configured panel modules.
pub struct VirtualEngine {
    prefix: String,
    slots: Vec<VirtualSlot>,
    acks: HashMap<Header, (VirtualKind, Trigger)>,
    opts: ChainOptions,
    max_retry: Duration,
    early_response: usize,
    read_timeout: Duration,
    public_online: bool,
    private_online: bool,
    events: EventSender,
}

impl VirtualEngine {
    pub fn new(config: &BusConfig, events: EventSender) -> Self {
        let slots = config
            .virtual_devices()
            .into_iter()
            .map(|(kind, header0)| VirtualSlot {
                kind,
                header0,
                quiet_when_idle: kind == VirtualKind::Entrance
                    && config.entrance_mode == EntranceMode::Minimal,
                chains: VecDeque::new(),
            })
            .collect();

        Self {
            prefix: config.prefix.clone(),
            slots,
            acks: HashMap::new(),
            opts: ChainOptions {
                private_origin: PrivateOrigin::default(),
                intercom_delay: config.intercom_delay,
            },
            max_retry: config.max_retry,
            early_response: config.early_response as usize,
            read_timeout: config.read_timeout,
            public_online: false,
            private_online: false,
            events,
        }
    }

    /// Enabled virtual devices.
    pub fn kinds(&self) -> impl Iterator<Item = VirtualKind> + '_ {
        self.slots.iter().map(|s| s.kind)
    }

    /// Whether `header0` is an address this engine impersonates.
    pub fn owns(&self, header0: u8) -> bool {
        self.slots.iter().any(|s| s.header0 == header0)
    }

    /// Step currently offered for `trigger`, if its chain is pending.
    pub fn pending_step(&self, kind: VirtualKind, trigger: Trigger) -> Option<Step> {
        self.slot(kind)?
            .chains
            .iter()
            .find(|c| c.trigger == trigger)
            .map(|c| c.step)
    }

    pub fn private_origin(&self) -> PrivateOrigin {
        self.opts.private_origin
    }

    /// Handle a command from the automation layer.
    ///
    /// `ON` starts the chain; any other payload cancels it. A repeated `ON`
    /// while the chain is under way keeps its current step and restarts that
    /// step's retry window.
    pub fn command(&mut self, kind: VirtualKind, trigger: &str, payload: &str) -> Result<()> {
        let Some(idx) = self.slots.iter().position(|s| s.kind == kind) else {
            return Err(WallpadError::DeviceDisabled {
                device: kind.name().to_string(),
            });
        };
        let Some(trigger) = kind.trigger(trigger) else {
            return Err(WallpadError::UnknownTrigger {
                device: kind.name().to_string(),
                trigger: trigger.to_string(),
            });
        };

        if payload != "ON" {
            self.cancel(kind, trigger);
            return Ok(());
        }

        let now = Instant::now();
        let slot = &mut self.slots[idx];
        match slot.chains.iter_mut().find(|c| c.trigger == trigger) {
            Some(chain) => chain.since = now,
            None => slot.chains.push_back(PendingChain {
                trigger,
                step: trigger.first_step(kind),
                since: now,
            }),
        }
        self.publish_trigger(kind, trigger, "ON");
        Ok(())
    }

    /// Resolve a trigger-step acknowledgement. Returns `false` when nothing waited for `header`.
    pub fn on_ack(&mut self, header: Header) -> bool {
        let Some((kind, trigger)) = self.acks.remove(&header) else {
            return false;
        };
        info!("ack from wallpad: {header}");

        let opts = self.opts;
        let Some(slot) = self.slots.iter_mut().find(|s| s.kind == kind) else {
            return false;
        };
        let Some(idx) = slot.chains.iter().position(|c| c.trigger == trigger) else {
            return true;
        };
        let Some(mut chain) = slot.chains.remove(idx) else {
            return true;
        };

        match chain.step.def(opts).next {
            Some(next) => {
                debug!("{kind}/{trigger}: {:?} -> {next:?}", chain.step);
                chain.step = next;
                chain.since = Instant::now();
                slot.chains.push_back(chain);
            }
            None => {
                info!("{kind}/{trigger}: done");
                self.publish_trigger(kind, trigger, "OFF");
            }
        }
        true
    }

    /// Apply the intercom's doorbell side effects.
    pub fn on_availability(&mut self, header: Header) {
        let Some(intercom) = self.slot(VirtualKind::Intercom) else {
            return;
        };
        if header.h0 != intercom.header0 {
            return;
        }

        match header.h1 {
            INTERCOM_PUBLIC_RING => self.set_available(Entrance::Public, true),
            INTERCOM_PRIVATE_RING => {
                self.set_available(Entrance::Private, true);
                self.opts.private_origin = PrivateOrigin::Inbound;
            }
            INTERCOM_CALL_STARTED | INTERCOM_CALL_ENDED => {
                self.set_available(Entrance::Public, false);
                self.set_available(Entrance::Private, false);
                self.opts.private_origin = PrivateOrigin::User;
            }
            _ => {}
        }
    }

    /// Answer a query addressed to an impersonated module.
    ///
    /// Offers the oldest pending chain step on the keepalive poll; otherwise
    /// sends the canned answer for `header`, if any.
    pub async fn answer<T: BusTransport>(&mut self, transport: &mut T, header: Header) -> Result<()> {
        let Some(idx) = self.slots.iter().position(|s| s.header0 == header.h0) else {
            return Ok(());
        };
        if transport.pending_count() > 0 {
            return Ok(());
        }

        let kind = self.slots[idx].kind;
        let remaining = kind.resp_size().saturating_sub(2 + self.early_response);
        if remaining > 0 {
            transport.wait_available(remaining, self.read_timeout).await?;
        }

        if header.h1 == kind.query_header1()
            && let Some(chain) = self.slots[idx].chains.front().copied()
        {
            return self.send_step(transport, header, kind, chain).await;
        }

        if !self.slots[idx].answers_defaults() {
            return Ok(());
        }
        let Some(answer) = kind.default_answer(header.h1) else {
            return Ok(());
        };

        let mut resp = answer.response.to_vec();
        if resp[2] == FOLLOW_SENTINEL {
            resp[2] = transport.read(1).await?[0];
            seal(&mut resp);
        }
        transport.write(&resp).await?;
        transport.mark_pending_from_write().await?;
        debug!("{kind} answered {header} with {}", hex(&resp));
        Ok(())
    }

    async fn send_step<T: BusTransport>(
        &mut self,
        transport: &mut T,
        header: Header,
        kind: VirtualKind,
        chain: PendingChain,
    ) -> Result<()> {
        let def = chain.step.def(self.opts);
        transport.write(def.payload).await?;
        transport.mark_pending_from_write().await?;

        let elapsed = Instant::now().saturating_duration_since(chain.since);
        if elapsed > self.max_retry {
            error!("send to wallpad: {} max retry time exceeded!", hex(def.payload));
            self.cancel(kind, chain.trigger);
            return Ok(());
        }

        if elapsed > RETRY_WARN_AFTER {
            warn!(
                "send to wallpad: {}, try another {:.1} seconds...",
                hex(def.payload),
                (self.max_retry - elapsed).as_secs_f32()
            );
        } else {
            info!("send to wallpad: {}", hex(def.payload));
        }
        self.acks
            .insert(Header::new(header.h0, def.ack), (kind, chain.trigger));
        Ok(())
    }

    /// Drop a chain with every step still queued behind it and show the trigger as OFF.
    fn cancel(&mut self, kind: VirtualKind, trigger: Trigger) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.kind == kind) {
            slot.chains.retain(|c| c.trigger != trigger);
        }
        self.acks.retain(|_, v| *v != (kind, trigger));
        self.publish_trigger(kind, trigger, "OFF");
    }

    /// Publish the initial state of every virtual entity.
    ///
    /// Idle triggers are shown OFF and both doorbells offline.
    pub fn publish_initial_state(&mut self) {
        let idle: Vec<(VirtualKind, Trigger)> = self
            .slots
            .iter()
            .flat_map(|s| {
                s.kind
                    .triggers()
                    .iter()
                    .filter(|t| !s.chains.iter().any(|c| c.trigger == **t))
                    .map(move |t| (s.kind, *t))
            })
            .collect();
        for (kind, trigger) in idle {
            self.publish_trigger(kind, trigger, "OFF");
        }

        if self.slot(VirtualKind::Intercom).is_some() {
            self.public_online = false;
            self.private_online = false;
            self.publish_available(Entrance::Public, false);
            self.publish_available(Entrance::Private, false);
        }
    }

    fn slot(&self, kind: VirtualKind) -> Option<&VirtualSlot> {
        self.slots.iter().find(|s| s.kind == kind)
    }

    fn set_available(&mut self, entrance: Entrance, online: bool) {
        let flag = match entrance {
            Entrance::Public => &mut self.public_online,
            Entrance::Private => &mut self.private_online,
        };
        if *flag == online {
            return;
        }
        *flag = online;
        self.publish_available(entrance, online);
    }

    fn publish_available(&self, entrance: Entrance, online: bool) {
        let topic = format!(
            "{}/virtual/intercom/{}/available",
            self.prefix,
            entrance.name()
        );
        let payload = if online { "online" } else { "offline" };
        info!("doorlock status: {topic} = {payload}");
        let _ = self.events.send(BusEvent::Publish {
            topic,
            payload: payload.to_string(),
        });
    }

    fn publish_trigger(&self, kind: VirtualKind, trigger: Trigger, payload: &str) {
        let topic = format!("{}/virtual/{kind}/{trigger}/state", self.prefix);
        info!("publish: {topic} = {payload}");
        let _ = self.events.send(BusEvent::Publish {
            topic,
            payload: payload.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntercomMode;
    use crate::event::{event_channel, EventReceiver};
    use crate::transport::StreamTransport;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn intercom(delay: bool) -> (VirtualEngine, EventReceiver) {
        let config = BusConfig::builder()
            .intercom_mode(IntercomMode::On)
            .intercom_delay(delay)
            .build();
        let (tx, rx) = event_channel();
        (VirtualEngine::new(&config, tx), rx)
    }

    fn publishes(rx: &mut EventReceiver) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::Publish { topic, payload } = event {
                out.push((topic, payload));
            }
        }
        out
    }

    fn bus() -> (StreamTransport<DuplexStream>, DuplexStream) {
        let (ours, theirs) = duplex(256);
        (StreamTransport::new(ours, "test", Duration::from_secs(1)), theirs)
    }

    #[test]
    fn test_public_chain_advances_on_ack() {
        let (mut engine, mut rx) = intercom(false);
        engine.command(VirtualKind::Intercom, "public", "ON").unwrap();
        assert_eq!(
            publishes(&mut rx),
            vec![("sds/virtual/intercom/public/state".to_string(), "ON".to_string())]
        );

        // Not sent yet, so nothing is expected.
        assert!(!engine.on_ack(Header::new(0xA4, 0x36)));

        engine
            .acks
            .insert(Header::new(0xA4, 0x36), (VirtualKind::Intercom, Trigger::Public));
        assert!(engine.on_ack(Header::new(0xA4, 0x36)));
        assert_eq!(
            engine.pending_step(VirtualKind::Intercom, Trigger::Public),
            Some(Step::PublicDoor)
        );
        assert!(publishes(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_on_keeps_current_step() {
        let (mut engine, mut rx) = intercom(false);
        let (mut t, mut wallpad) = bus();

        engine.command(VirtualKind::Intercom, "public", "ON").unwrap();
        engine
            .acks
            .insert(Header::new(0xA4, 0x36), (VirtualKind::Intercom, Trigger::Public));
        engine.on_ack(Header::new(0xA4, 0x36));

        tokio::time::advance(Duration::from_secs(15)).await;
        engine.command(VirtualKind::Intercom, "public", "ON").unwrap();
        assert_eq!(
            engine.pending_step(VirtualKind::Intercom, Trigger::Public),
            Some(Step::PublicDoor)
        );

        // 25s after the door step was queued, 10s after the refresh
        tokio::time::advance(Duration::from_secs(10)).await;
        wallpad.write_all(&[0x00, 0x65]).await.unwrap();
        engine.answer(&mut t, Header::new(0xA4, 0x41)).await.unwrap();

        let mut resp = [0u8; 4];
        wallpad.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0xB0, 0x3B, 0x01, 0x0A]);
        assert!(engine.acks.contains_key(&Header::new(0xA4, 0x3B)));
        let states: Vec<String> = publishes(&mut rx).into_iter().map(|p| p.1).collect();
        assert_eq!(states, vec!["ON", "ON"]);
    }

    #[test]
    fn test_unknown_payload_cancels_chain() {
        let (mut engine, mut rx) = intercom(false);
        engine.command(VirtualKind::Intercom, "private", "ON").unwrap();
        engine.command(VirtualKind::Intercom, "private", "OFF").unwrap();
        assert_eq!(engine.pending_step(VirtualKind::Intercom, Trigger::Private), None);
        let published = publishes(&mut rx);
        assert_eq!(published.last().map(|p| p.1.as_str()), Some("OFF"));
    }

    #[test]
    fn test_rejected_commands() {
        let (mut engine, _rx) = intercom(false);
        assert!(matches!(
            engine.command(VirtualKind::Intercom, "ev", "ON"),
            Err(WallpadError::UnknownTrigger { .. })
        ));
        assert!(matches!(
            engine.command(VirtualKind::Entrance, "ev", "ON"),
            Err(WallpadError::DeviceDisabled { .. })
        ));
    }

    #[test]
    fn test_availability_side_effects() {
        let (mut engine, mut rx) = intercom(false);

        engine.on_availability(Header::new(0xA4, 0x31));
        assert_eq!(engine.private_origin(), PrivateOrigin::Inbound);
        engine.on_availability(Header::new(0xA4, 0x31));
        assert_eq!(
            publishes(&mut rx),
            vec![(
                "sds/virtual/intercom/private/available".to_string(),
                "online".to_string()
            )]
        );

        engine.on_availability(Header::new(0xA4, 0x3E));
        assert_eq!(engine.private_origin(), PrivateOrigin::User);
        assert_eq!(
            publishes(&mut rx),
            vec![(
                "sds/virtual/intercom/private/available".to_string(),
                "offline".to_string()
            )]
        );

        // Other addresses never count.
        engine.on_availability(Header::new(0xA5, 0x32));
        assert!(publishes(&mut rx).is_empty());
    }

    #[test]
    fn test_initial_state() {
        let config = BusConfig::builder()
            .entrance_mode(EntranceMode::Full)
            .intercom_mode(IntercomMode::On)
            .build();
        let (tx, mut rx) = event_channel();
        let mut engine = VirtualEngine::new(&config, tx);
        engine.command(VirtualKind::Entrance, "gas", "ON").unwrap();
        publishes(&mut rx);

        engine.publish_initial_state();
        let topics: Vec<String> = publishes(&mut rx).into_iter().map(|p| p.0).collect();
        assert_eq!(
            topics,
            vec![
                "sds/virtual/entrance/ev/state",
                "sds/virtual/intercom/public/state",
                "sds/virtual/intercom/private/state",
                "sds/virtual/intercom/public/available",
                "sds/virtual/intercom/private/available",
            ]
        );
    }

    #[tokio::test]
    async fn test_default_answer() {
        let (mut engine, _rx) = intercom(false);
        let (mut t, mut wallpad) = bus();

        // rest of the A4 41 query
        wallpad.write_all(&[0x00, 0x65]).await.unwrap();
        engine.answer(&mut t, Header::new(0xA4, 0x41)).await.unwrap();

        let mut resp = [0u8; 4];
        wallpad.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0xB0, 0x41, 0x00, 0x71]);
        assert_eq!(t.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_follow_sentinel_mirrors_wallpad() {
        let (mut engine, _rx) = intercom(false);
        let (mut t, mut wallpad) = bus();

        wallpad.write_all(&[0x07, 0x5D]).await.unwrap();
        engine.answer(&mut t, Header::new(0xA4, 0x3E)).await.unwrap();

        let mut resp = [0u8; 4];
        wallpad.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp[..3], &[0xB0, 0x3E, 0x07]);
        assert!(crate::protocol::verify_checksum(&resp));
    }

    #[tokio::test]
    async fn test_pending_echo_blocks_answer() {
        let (mut engine, _rx) = intercom(false);
        let (mut t, mut wallpad) = bus();

        wallpad.write_all(&[0x00, 0x65, 0x00, 0x65]).await.unwrap();
        engine.answer(&mut t, Header::new(0xA4, 0x41)).await.unwrap();
        assert!(t.pending_count() > 0);
        engine.answer(&mut t, Header::new(0xA4, 0x41)).await.unwrap();

        drop(t);
        let mut sent = Vec::new();
        wallpad.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, vec![0xB0, 0x41, 0x00, 0x71]);
    }

    #[tokio::test]
    async fn test_minimal_entrance_stays_quiet_until_triggered() {
        let config = BusConfig::builder()
            .entrance_mode(EntranceMode::Minimal)
            .build();
        let (tx, _rx) = event_channel();
        let mut engine = VirtualEngine::new(&config, tx);
        let (mut t, mut wallpad) = bus();

        wallpad.write_all(&[0x00, 0x6C]).await.unwrap();
        engine.answer(&mut t, Header::new(0xAD, 0x41)).await.unwrap();
        assert_eq!(t.pending_count(), 0);

        engine.command(VirtualKind::Entrance, "ev", "ON").unwrap();
        engine.answer(&mut t, Header::new(0xAD, 0x41)).await.unwrap();

        let mut resp = [0u8; 4];
        wallpad.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0xB0, 0x2F, 0x01, 0x1E]);
        assert!(engine.acks.contains_key(&Header::new(0xAD, 0x2F)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_retry_exhaustion_drops_whole_chain() {
        let (mut engine, mut rx) = intercom(false);
        let (mut t, mut wallpad) = bus();

        engine.command(VirtualKind::Intercom, "public", "ON").unwrap();
        tokio::time::advance(Duration::from_secs(21)).await;

        wallpad.write_all(&[0x00, 0x65]).await.unwrap();
        engine.answer(&mut t, Header::new(0xA4, 0x41)).await.unwrap();

        assert_eq!(engine.pending_step(VirtualKind::Intercom, Trigger::Public), None);
        assert!(engine.acks.is_empty());
        let published = publishes(&mut rx);
        assert_eq!(published.last().map(|p| p.1.as_str()), Some("OFF"));
    }
}
