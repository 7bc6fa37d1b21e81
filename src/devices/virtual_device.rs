// MIT License - Copyright (c) 2026 Peter Wright
// Virtual device tables: canned answers and trigger chains

use std::fmt;

/// Panel modules the bridge can impersonate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VirtualKind {
    /// Entrance switch (elevator call, gas cutoff) at 0xAD
    Entrance,
    /// Newer entrance switch at 0xCC with 5-byte answers
    Entrance2,
    /// Intercom handset (door release)
    Intercom,
}

impl VirtualKind {
    pub const ALL: [VirtualKind; 3] = [
        VirtualKind::Entrance,
        VirtualKind::Entrance2,
        VirtualKind::Intercom,
    ];

    /// Topic segment.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Entrance => "entrance",
            Self::Entrance2 => "entrance2",
            Self::Intercom => "intercom",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == s)
    }

    /// Bus address when nothing overrides it.
    pub fn default_header0(&self) -> u8 {
        match self {
            Self::Entrance => 0xAD,
            Self::Entrance2 => 0xCC,
            Self::Intercom => crate::constants::DEFAULT_INTERCOM_HEADER,
        }
    }

    /// Length of every answer this module sends.
    pub fn resp_size(&self) -> usize {
        match self {
            Self::Entrance2 => 5,
            Self::Entrance | Self::Intercom => 4,
        }
    }

    /// header1 of the wallpad's keepalive poll; trigger steps answer it.
    pub fn query_header1(&self) -> u8 {
        0x41
    }

    /// Steady-state answers.
    pub fn defaults(&self) -> &'static [DefaultAnswer] {
        match self {
            Self::Entrance => ENTRANCE_DEFAULTS,
            Self::Entrance2 => ENTRANCE2_DEFAULTS,
            Self::Intercom => INTERCOM_DEFAULTS,
        }
    }

    pub fn default_answer(&self, header1: u8) -> Option<&'static DefaultAnswer> {
        self.defaults().iter().find(|d| d.header1 == header1)
    }

    /// User-facing triggers.
    pub fn triggers(&self) -> &'static [Trigger] {
        match self {
            Self::Entrance | Self::Entrance2 => &[Trigger::Ev, Trigger::Gas],
            Self::Intercom => &[Trigger::Public, Trigger::Private],
        }
    }

    pub fn trigger(&self, name: &str) -> Option<Trigger> {
        self.triggers().iter().copied().find(|t| t.name() == name)
    }
}

impl fmt::Display for VirtualKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A canned answer to one query header.
#[derive(Debug)]
pub struct DefaultAnswer {
    pub name: &'static str,
    pub header1: u8,
    pub response: &'static [u8],
}

const fn answer(name: &'static str, header1: u8, response: &'static [u8]) -> DefaultAnswer {
    DefaultAnswer {
        name,
        header1,
        response,
    }
}

const ENTRANCE_DEFAULTS: &[DefaultAnswer] = &[
    // must come first after power-up or a long silence
    answer("init", 0x5A, &[0xB0, 0x5A, 0x00, 0x6A]),
    // answering B041 here would stop the gas valve report
    answer("query", 0x41, &[0xB0, 0x56, 0x00, 0x66]),
    answer("gas", 0x56, &[0xB0, 0x41, 0x00, 0x71]),
    answer("light", 0x52, &[0xB0, 0x52, 0x01, 0x63]),
    answer("gasa", 0x55, &[0xB0, 0x41, 0x00, 0x71]),
    answer("eva", 0x2F, &[0xB0, 0x41, 0x00, 0x71]),
];

const ENTRANCE2_DEFAULTS: &[DefaultAnswer] = &[
    answer("init", 0x5A, &[0xB0, 0x5A, 0x01, 0x00, 0x6B]),
    answer("query", 0x41, &[0xB0, 0x41, 0x01, 0x00, 0x70]),
    answer("date", 0x01, &[0xB0, 0x01, 0x01, 0x00, 0x30]),
    answer("broad", 0x0B, &[0xB0, 0x0B, 0x01, 0x00, 0x3A]),
    answer("ukn12", 0x12, &[0xB0, 0x41, 0x01, 0x00, 0x70]),
    answer("ukn09", 0x09, &[0xB0, 0x09, 0x01, 0x00, 0x38]),
    answer("ukn07", 0x07, &[0xB0, 0x07, 0x01, 0x01, 0x37]),
    answer("ukn02", 0x02, &[0xB0, 0x41, 0x01, 0x00, 0x70]),
    answer("eva", 0x10, &[0xB0, 0x41, 0x01, 0x00, 0x70]),
    answer("gasa", 0x13, &[0xB0, 0x41, 0x01, 0x00, 0x70]),
];

const INTERCOM_DEFAULTS: &[DefaultAnswer] = &[
    answer("init", 0x5A, &[0xB0, 0x5A, 0x00, 0x6A]),
    answer("query", 0x41, &[0xB0, 0x41, 0x00, 0x71]),
    // another handset is busy
    answer("block", 0x42, &[0xB0, 0x41, 0x00, 0x71]),
    answer("public", 0x32, &[0xB0, 0x32, 0x00, 0x02]),
    answer("private", 0x31, &[0xB0, 0x31, 0x00, 0x01]),
    // call accepted: report "busy"
    answer("opena", 0x36, &[0xB0, 0x42, 0x00, 0x72]),
    answer("vopena", 0x38, &[0xB0, 0x42, 0x00, 0x72]),
    answer("vconna", 0x35, &[0xB0, 0x35, 0x00, 0x05]),
    answer("open2a", 0x3B, &[0xB0, 0x41, 0x00, 0x71]),
    // byte 2 must mirror the wallpad
    answer("end", 0x3E, &[0xB0, 0x3E, 0xFF, 0xFF]),
];

/// A user action on a virtual device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Elevator call
    Ev,
    /// Gas valve cutoff
    Gas,
    /// Shared entrance door release
    Public,
    /// Private entrance door release
    Private,
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ev => "ev",
            Self::Gas => "gas",
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    /// First step of the chain this trigger starts.
    pub fn first_step(&self, kind: VirtualKind) -> Step {
        match (self, kind) {
            (Self::Ev, VirtualKind::Entrance2) => Step::Entrance2Ev,
            (Self::Gas, VirtualKind::Entrance2) => Step::Entrance2Gas,
            (Self::Ev, _) => Step::EntranceEv,
            (Self::Gas, _) => Step::EntranceGas,
            (Self::Public, _) => Step::PublicCall,
            (Self::Private, _) => Step::PrivateCall,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Who started the private entrance call.
///
/// The wallpad expects a different opening sequence when the call was
/// started by the doorbell rather than by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrivateOrigin {
    /// The doorbell rang (`priv_a`)
    Inbound,
    /// Idle handset (`priv_b`)
    #[default]
    User,
}

/// One step of a trigger chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    EntranceEv,
    EntranceGas,
    Entrance2Ev,
    Entrance2Gas,
    /// Start the shared entrance call
    PublicCall,
    /// Release the shared entrance door
    PublicDoor,
    /// Keep the call open (1..=5) before releasing the door
    PublicHold(u8),
    /// Start the private entrance call; resolved against [`PrivateOrigin`]
    PrivateCall,
    /// Release the private entrance door
    PrivateDoor,
}

/// Acknowledgement header1, answer bytes and successor of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDef {
    pub ack: u8,
    pub payload: &'static [u8],
    pub next: Option<Step>,
}

/// Options that change the chain table at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainOptions {
    pub private_origin: PrivateOrigin,
    /// Hold the shared entrance call for five keepalives before opening
    pub intercom_delay: bool,
}

const HOLD: &[u8] = &[0xB0, 0x42, 0x00, 0x72];
const HOLD_STEPS: u8 = 5;

impl Step {
    pub fn def(self, opts: ChainOptions) -> StepDef {
        let (ack, payload, next): (u8, &'static [u8], Option<Step>) = match self {
            Step::EntranceEv => (0x2F, &[0xB0, 0x2F, 0x01, 0x1E], None),
            Step::EntranceGas => (0x55, &[0xB0, 0x55, 0x01, 0x64], None),
            Step::Entrance2Ev => (0x10, &[0xB0, 0x10, 0x01, 0x01, 0x20], None),
            // sent verbatim; the wallpad accepts it despite the checksum
            Step::Entrance2Gas => (0x13, &[0xB0, 0x13, 0x01, 0x01, 0x5F], None),
            Step::PublicCall => {
                let next = if opts.intercom_delay {
                    Step::PublicHold(1)
                } else {
                    Step::PublicDoor
                };
                (0x36, &[0xB0, 0x36, 0x02, 0x04], Some(next))
            }
            Step::PublicDoor => (0x3B, &[0xB0, 0x3B, 0x01, 0x0A], None),
            Step::PublicHold(n) if n >= HOLD_STEPS => (0x41, HOLD, Some(Step::PublicDoor)),
            Step::PublicHold(n) => (0x41, HOLD, Some(Step::PublicHold(n + 1))),
            Step::PrivateCall => match opts.private_origin {
                PrivateOrigin::Inbound => (0x36, &[0xB0, 0x36, 0x01, 0x07], Some(Step::PrivateDoor)),
                PrivateOrigin::User => (0x35, &[0xB0, 0x38, 0x00, 0x08], Some(Step::PrivateDoor)),
            },
            Step::PrivateDoor => (0x3B, &[0xB0, 0x3B, 0x00, 0x0B], None),
        };
        StepDef { ack, payload, next }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::verify_checksum;

    #[test]
    fn test_default_answers_are_valid_frames() {
        for kind in VirtualKind::ALL {
            for answer in kind.defaults() {
                assert_eq!(answer.response.len(), kind.resp_size(), "{kind} {}", answer.name);
                if answer.response[2] != 0xFF {
                    assert!(verify_checksum(answer.response), "{kind} {}", answer.name);
                }
            }
        }
        assert_eq!(
            VirtualKind::Intercom.default_answer(0x3E).map(|a| a.response[2]),
            Some(0xFF)
        );
    }

    #[test]
    fn test_step_payloads_are_valid_frames() {
        let steps = [
            Step::EntranceEv,
            Step::EntranceGas,
            Step::Entrance2Ev,
            Step::PublicCall,
            Step::PublicDoor,
            Step::PublicHold(3),
            Step::PrivateCall,
            Step::PrivateDoor,
        ];
        for step in steps {
            let def = step.def(ChainOptions::default());
            assert!(verify_checksum(def.payload), "{step:?}");
        }
    }

    #[test]
    fn test_public_chain() {
        let opts = ChainOptions::default();
        assert_eq!(Step::PublicCall.def(opts).next, Some(Step::PublicDoor));
        assert_eq!(Step::PublicDoor.def(opts).next, None);
    }

    #[test]
    fn test_public_chain_with_delay() {
        let opts = ChainOptions {
            intercom_delay: true,
            ..Default::default()
        };
        let mut step = Step::PublicCall;
        let mut hops = 0;
        while let Some(next) = step.def(opts).next {
            step = next;
            hops += 1;
        }
        assert_eq!(step, Step::PublicDoor);
        assert_eq!(hops, 6);
    }

    #[test]
    fn test_private_origin_selects_sequence() {
        let inbound = Step::PrivateCall.def(ChainOptions {
            private_origin: PrivateOrigin::Inbound,
            ..Default::default()
        });
        assert_eq!(inbound.ack, 0x36);
        assert_eq!(inbound.payload, &[0xB0, 0x36, 0x01, 0x07]);

        let user = Step::PrivateCall.def(ChainOptions::default());
        assert_eq!(user.ack, 0x35);
        assert_eq!(user.next, Some(Step::PrivateDoor));
    }

    #[test]
    fn test_trigger_lookup() {
        assert_eq!(VirtualKind::Intercom.trigger("public"), Some(Trigger::Public));
        assert_eq!(VirtualKind::Intercom.trigger("ev"), None);
        assert_eq!(VirtualKind::Entrance2.trigger("gas"), Some(Trigger::Gas));
        assert_eq!(Trigger::Gas.first_step(VirtualKind::Entrance2), Step::Entrance2Gas);
        assert_eq!(Trigger::Gas.first_step(VirtualKind::Entrance), Step::EntranceGas);
    }
}
