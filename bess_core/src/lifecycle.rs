//! Unit lifecycle and its transition rules.
//!
//! `Init -> Running` on registration acknowledgment, `Running -> Isolated` on a
//! safety trip or a remote isolate directive, `Isolated -> Running` only on a
//! local reset. Network handlers can only produce [`RemoteDirective`], and a
//! [`LocalReset`] token cannot be built outside this crate, so a remote peer has
//! no way to bring an isolated unit back.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    Init,
    Running,
    Isolated,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Init => "INI",
            Lifecycle::Running => "RUN",
            Lifecycle::Isolated => "ISO",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Lifecycle::Init => 0,
            Lifecycle::Running => 1,
            Lifecycle::Isolated => 2,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Lifecycle::Init),
            1 => Some(Lifecycle::Running),
            2 => Some(Lifecycle::Isolated),
            _ => None,
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "INI" => Some(Lifecycle::Init),
            "RUN" => Some(Lifecycle::Running),
            "ISO" => Some(Lifecycle::Isolated),
            _ => None,
        }
    }

    pub fn is_running(self) -> bool {
        self == Lifecycle::Running
    }

    pub fn is_isolated(self) -> bool {
        self == Lifecycle::Isolated
    }

    /// Apply one transition input. Inputs that are not valid for the current
    /// state leave it unchanged.
    pub fn apply(self, input: Transition) -> Lifecycle {
        match (self, input) {
            (Lifecycle::Init, Transition::RegistrationAck) => Lifecycle::Running,
            (Lifecycle::Running, Transition::SafetyTrip) => Lifecycle::Isolated,
            (_, Transition::Remote(RemoteDirective::Isolate)) => Lifecycle::Isolated,
            (Lifecycle::Isolated, Transition::Local(_)) => Lifecycle::Running,
            (state, _) => state,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle requests that may arrive over the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteDirective {
    Isolate,
}

impl RemoteDirective {
    /// Only `"ISO"` is honored; every other target state is ignored.
    pub fn parse(target: &str) -> Option<Self> {
        match target {
            "ISO" => Some(RemoteDirective::Isolate),
            _ => None,
        }
    }
}

/// Capability for the physical reset signal.
#[derive(Debug, PartialEq, Eq)]
pub struct LocalReset {
    _private: (),
}

impl LocalReset {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Transition {
    RegistrationAck,
    SafetyTrip,
    Remote(RemoteDirective),
    Local(LocalReset),
}
