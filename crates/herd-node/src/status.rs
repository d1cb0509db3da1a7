//! Sub status and its classification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a sub is in its reconciliation cycle. Every cycle ends in one of
/// these; none is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStatus {
    #[default]
    Unknown,
    Connecting,
    DnsError,
    ConnectionRefused,
    NoRouteToHost,
    ConnectTimeout,
    FailedToConnect,
    MissingCertificate,
    BadCertificate,
    WaitingToPoll,
    Polling,
    FailedToPoll,
    PollDenied,
    SubNotReady,
    Locked,
    NotEnoughFreeSpace,
    Fetching,
    FetchDenied,
    FailedToFetch,
    Pushing,
    PushDenied,
    FailedToPush,
    FailedToGetObject,
    ComputingUpdate,
    MissingComputedFile,
    UpdatesDisabled,
    SendingUpdate,
    Updating,
    UpdateDenied,
    FailedToUpdate,
    UnsafeUpdate,
    RebootBlocked,
    DisruptionRequested,
    DisruptionDenied,
    ImageUndefined,
    ImageNotReady,
    WaitingForNextFullPoll,
    Synced,
    Unwritable,
}

impl SubStatus {
    pub const ALL: [SubStatus; 39] = [
        SubStatus::Unknown,
        SubStatus::Connecting,
        SubStatus::DnsError,
        SubStatus::ConnectionRefused,
        SubStatus::NoRouteToHost,
        SubStatus::ConnectTimeout,
        SubStatus::FailedToConnect,
        SubStatus::MissingCertificate,
        SubStatus::BadCertificate,
        SubStatus::WaitingToPoll,
        SubStatus::Polling,
        SubStatus::FailedToPoll,
        SubStatus::PollDenied,
        SubStatus::SubNotReady,
        SubStatus::Locked,
        SubStatus::NotEnoughFreeSpace,
        SubStatus::Fetching,
        SubStatus::FetchDenied,
        SubStatus::FailedToFetch,
        SubStatus::Pushing,
        SubStatus::PushDenied,
        SubStatus::FailedToPush,
        SubStatus::FailedToGetObject,
        SubStatus::ComputingUpdate,
        SubStatus::MissingComputedFile,
        SubStatus::UpdatesDisabled,
        SubStatus::SendingUpdate,
        SubStatus::Updating,
        SubStatus::UpdateDenied,
        SubStatus::FailedToUpdate,
        SubStatus::UnsafeUpdate,
        SubStatus::RebootBlocked,
        SubStatus::DisruptionRequested,
        SubStatus::DisruptionDenied,
        SubStatus::ImageUndefined,
        SubStatus::ImageNotReady,
        SubStatus::WaitingForNextFullPoll,
        SubStatus::Synced,
        SubStatus::Unwritable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SubStatus::Unknown => "unknown",
            SubStatus::Connecting => "connecting",
            SubStatus::DnsError => "DNS error",
            SubStatus::ConnectionRefused => "connection refused",
            SubStatus::NoRouteToHost => "no route to host",
            SubStatus::ConnectTimeout => "connect timeout",
            SubStatus::FailedToConnect => "failed to connect",
            SubStatus::MissingCertificate => "missing certificate",
            SubStatus::BadCertificate => "bad certificate",
            SubStatus::WaitingToPoll => "waiting to poll",
            SubStatus::Polling => "polling",
            SubStatus::FailedToPoll => "failed to poll",
            SubStatus::PollDenied => "poll denied",
            SubStatus::SubNotReady => "sub not ready",
            SubStatus::Locked => "locked",
            SubStatus::NotEnoughFreeSpace => "not enough free space",
            SubStatus::Fetching => "fetching",
            SubStatus::FetchDenied => "fetch denied",
            SubStatus::FailedToFetch => "failed to fetch",
            SubStatus::Pushing => "pushing",
            SubStatus::PushDenied => "push denied",
            SubStatus::FailedToPush => "failed to push",
            SubStatus::FailedToGetObject => "failed to get object",
            SubStatus::ComputingUpdate => "computing update",
            SubStatus::MissingComputedFile => "missing computed file",
            SubStatus::UpdatesDisabled => "updates disabled",
            SubStatus::SendingUpdate => "sending update",
            SubStatus::Updating => "updating",
            SubStatus::UpdateDenied => "update denied",
            SubStatus::FailedToUpdate => "failed to update",
            SubStatus::UnsafeUpdate => "unsafe update",
            SubStatus::RebootBlocked => "reboot blocked",
            SubStatus::DisruptionRequested => "disruption requested",
            SubStatus::DisruptionDenied => "disruption denied",
            SubStatus::ImageUndefined => "image undefined",
            SubStatus::ImageNotReady => "image not ready",
            SubStatus::WaitingForNextFullPoll => "waiting for next full poll",
            SubStatus::Synced => "synced",
            SubStatus::Unwritable => "unwritable",
        }
    }

    /// The sub answered at the last attempt.
    pub fn is_alive(self) -> bool {
        !matches!(
            self,
            SubStatus::Unknown
                | SubStatus::Connecting
                | SubStatus::DnsError
                | SubStatus::ConnectionRefused
                | SubStatus::NoRouteToHost
                | SubStatus::ConnectTimeout
                | SubStatus::FailedToConnect
                | SubStatus::FailedToPoll
        )
    }

    /// The sub is known to differ from its image and is being, or failing
    /// to be, brought in line.
    pub fn is_deviant(self) -> bool {
        matches!(
            self,
            SubStatus::WaitingToPoll
                | SubStatus::NotEnoughFreeSpace
                | SubStatus::Fetching
                | SubStatus::FetchDenied
                | SubStatus::FailedToFetch
                | SubStatus::Pushing
                | SubStatus::PushDenied
                | SubStatus::FailedToPush
                | SubStatus::FailedToGetObject
                | SubStatus::SendingUpdate
                | SubStatus::MissingComputedFile
                | SubStatus::UpdatesDisabled
                | SubStatus::Updating
                | SubStatus::UpdateDenied
                | SubStatus::FailedToUpdate
        )
    }

    pub fn is_compliant(self) -> bool {
        self == SubStatus::Synced
    }

    /// The last cycle could not reach the sub at all.
    pub fn is_connect_failure(self) -> bool {
        matches!(
            self,
            SubStatus::DnsError
                | SubStatus::ConnectionRefused
                | SubStatus::NoRouteToHost
                | SubStatus::ConnectTimeout
                | SubStatus::FailedToConnect
                | SubStatus::MissingCertificate
                | SubStatus::BadCertificate
        )
    }

    /// The sub itself is fetching or updating.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SubStatus::Fetching | SubStatus::Pushing | SubStatus::SendingUpdate | SubStatus::Updating
        )
    }

    /// Nothing changes until someone acts.
    pub fn needs_operator(self) -> bool {
        matches!(
            self,
            SubStatus::UnsafeUpdate
                | SubStatus::RebootBlocked
                | SubStatus::DisruptionRequested
                | SubStatus::DisruptionDenied
                | SubStatus::PollDenied
                | SubStatus::FetchDenied
                | SubStatus::PushDenied
                | SubStatus::UpdateDenied
                | SubStatus::MissingCertificate
                | SubStatus::BadCertificate
                | SubStatus::ImageUndefined
                | SubStatus::Unwritable
        )
    }

    pub fn is_waiting_for_disruption(self) -> bool {
        matches!(
            self,
            SubStatus::DisruptionRequested | SubStatus::DisruptionDenied
        )
    }
}

impl fmt::Display for SubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubStatus {
    type Err = String;

    /// Accepts either the display name or the snake_case name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubStatus::ALL
            .iter()
            .copied()
            .find(|status| {
                status.as_str().eq_ignore_ascii_case(s)
                    || serde_json::to_value(status)
                        .ok()
                        .is_some_and(|v| v.as_str() == Some(s))
            })
            .ok_or_else(|| format!("unknown status: {s}"))
    }
}
