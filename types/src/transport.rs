//! Transport kinds, their readiness states, and the browser capability map.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// A selectable cross-origin transport implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    /// Hidden relay document reached through `postMessage`.
    PostMessageChannel,
    /// Embedded bridge module exposing an `httpRequest` entrypoint.
    FlashBridge,
    /// Recognized but never implemented by any bridge.
    SilverlightBridge,
}

impl TransportKind {
    /// Automatic selection order, most preferred first.
    pub const PRIORITY: [Self; 3] = [
        Self::PostMessageChannel,
        Self::FlashBridge,
        Self::SilverlightBridge,
    ];

    /// Wire name used by configuration and by callers forcing a solution.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PostMessageChannel => "html5",
            Self::FlashBridge => "flash",
            Self::SilverlightBridge => "silverlight",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("solution {0} not supported")]
pub struct UnknownSolution(pub String);

impl FromStr for TransportKind {
    type Err = UnknownSolution;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "html5" | "postmessage" => Ok(Self::PostMessageChannel),
            "flash" => Ok(Self::FlashBridge),
            "silverlight" => Ok(Self::SilverlightBridge),
            other => Err(UnknownSolution(other.to_string())),
        }
    }
}

/// Readiness of a transport solution. Moves from `Uninitialized` to exactly one
/// terminal value and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    Uninitialized = 0,
    Ready = 1,
    Failed = 2,
}

impl ReadyState {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Uninitialized),
            1 => Some(Self::Ready),
            2 => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Uninitialized)
    }
}

/// Browser capabilities detected by the embedding page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub postmessage: bool,
    #[serde(default)]
    pub flash: bool,
    #[serde(default)]
    pub silverlight: bool,
    #[serde(default)]
    pub localstorage: bool,
}

impl Capabilities {
    #[must_use]
    pub fn supports(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::PostMessageChannel => self.postmessage,
            TransportKind::FlashBridge => self.flash,
            TransportKind::SilverlightBridge => self.silverlight,
        }
    }

    /// The transport a host page boots with: the first supported kind in
    /// [`TransportKind::PRIORITY`].
    #[must_use]
    pub fn preferred(&self) -> Option<TransportKind> {
        TransportKind::PRIORITY
            .into_iter()
            .find(|kind| self.supports(*kind))
    }
}
