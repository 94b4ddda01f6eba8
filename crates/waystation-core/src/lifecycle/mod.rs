//! Install/activate lifecycle and event dispatch.
//!
//! Each code/cache generation is an `Intermediary`. The `Host` owns the
//! shared storage and origin, keeps at most one active and one waiting
//! generation, and routes every event to the right one:
//!
//! ```text
//! Installing ──preload ok──▶ Installed ──takeover──▶ Activating ──cleanup──▶ Active
//!     │                                                                        │
//!     └──preload failed──▶ Redundant ◀──────────── superseded by a newer one ──┘
//! ```
//!
//! A failed install never disturbs the active generation. Requests already
//! running on an outgoing generation finish there; new requests go to the
//! newest active generation.

pub mod host;
pub mod intermediary;

use std::fmt;

use serde_json::Value;

pub use host::{Host, InstallOutcome, SyncOutcome};
pub use intermediary::{ActivationReport, Intermediary};

use crate::control::ClientId;
use crate::error::{ControlError, PreloadError};
use crate::http::{FetchOptions, Request, Response};
use crate::maintenance::MaintenanceReport;
use crate::origin::FetchError;
use crate::store::VersionTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Installing,
    Installed,
    Activating,
    Active,
    /// Failed to install, or superseded by a newer generation
    Redundant,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Installing => "installing",
            LifecycleState::Installed => "installed",
            LifecycleState::Activating => "activating",
            LifecycleState::Active => "active",
            LifecycleState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Everything the host reacts to.
#[derive(Debug)]
pub enum Event {
    Install {
        version: VersionTag,
        manifest: Vec<String>,
    },
    Activate,
    Fetch {
        client: Option<ClientId>,
        request: Request,
        options: FetchOptions,
    },
    Message {
        client: ClientId,
        raw: String,
    },
    PeriodicTrigger,
    /// Connectivity resumed; run opportunistic maintenance and sync
    Sync {
        tag: String,
    },
    Push {
        payload: Option<Value>,
    },
}

#[derive(Debug)]
pub enum EventOutcome {
    Installed(Result<InstallOutcome, PreloadError>),
    Activated(Option<ActivationReport>),
    Response(Result<Response, FetchError>),
    MessageHandled(Result<(), ControlError>),
    Maintained(Option<MaintenanceReport>),
    Synced(SyncOutcome),
    Notified,
}
