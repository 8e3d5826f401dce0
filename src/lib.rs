//! # bzperi — host a BLE GATT peripheral on Linux via BlueZ
//!
//! This crate lets an application declare a hierarchy of GATT services,
//! characteristics and descriptors, publish that hierarchy on the system
//! message bus under the `org.bluez` contract, drive the local adapter into
//! an advertising peripheral state, and forward read/write/notify traffic
//! between remote GATT clients and application-supplied data callbacks.
//!
//! The following functionality is provided.
//!
//! * a fluent, closure-nested [DSL](dsl) for declaring [services](dsl::ServiceBuilder),
//!   [characteristics](dsl::CharacteristicBuilder) and [descriptors](dsl::DescriptorBuilder)
//! * a pure, I/O-free [GATT object tree](tree) with introspection XML generation
//! * a [D-Bus publisher](publisher) that registers the tree under the system bus
//!   and dispatches inbound method calls and property get/set
//! * an [adapter controller](adapter) that discovers and selects a BlueZ adapter,
//!   configures it, registers the GATT application and an LE advertisement, and
//!   tracks device connections
//! * a [lifecycle state machine](lifecycle) that sequences startup asynchronously
//!   and exposes run-state/health to the host
//! * an async [retry](retry) policy with exponential backoff and jitter
//! * a cross-thread [update queue](queue) for pushing characteristic-change
//!   notifications into the event-loop thread
//!
//! This library depends on the [tokio] asynchronous runtime and the system
//! `dbus` daemon; it does not implement the Bluetooth link layer, does not
//! parse HCI packets, does not act as a GATT client, and does not persist
//! bonding keys (BlueZ does).

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("bzperi only supports the Linux operating system.");

use std::{collections::HashMap, fmt, str::FromStr};

use dbus::{
    arg::{PropMap, RefArg},
    nonblock::{stdintf::org_freedesktop_dbus::ObjectManager, Proxy, SyncConnection},
    Path,
};
use displaydoc::Display;
use strum::EnumString;

pub(crate) const SERVICE_NAME: &str = "org.bluez";
pub(crate) const ERR_PREFIX: &str = "org.bluez.Error.";

/// Per spec §5's differentiated D-Bus call timeouts: a plain property
/// get/set.
pub(crate) const PROPERTY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);
/// A regular method call (e.g. `RegisterApplication`).
pub(crate) const METHOD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
/// `RegisterAdvertisement`/`UnregisterAdvertisement`.
pub(crate) const ADVERTISE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);
/// The `GetManagedObjects` adapter-discovery walk.
pub(crate) const DISCOVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub mod adapter;
pub mod advertisement;
pub mod config;
pub mod dsl;
pub mod flags;
pub mod lifecycle;
pub mod logging;
pub mod path;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod tree;
pub mod uuid;
pub mod value;

pub use crate::{
    config::ServerConfig,
    lifecycle::{start, start_with_bondable, Health, RunState, ServerHandle},
    path::ObjectPath,
    queue::UpdateQueue,
    uuid::GattUuid,
    value::Value,
};

/// bzperi error.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed message, either ours or forwarded from BlueZ/D-Bus.
    pub message: String,
}

/// bzperi error kind. Mirrors the taxonomy of spec §7.
#[derive(Clone, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash, EnumString)]
#[non_exhaustive]
pub enum ErrorKind {
    /// malformed input argument
    InvalidArgument,
    /// malformed service name
    InvalidServiceName,
    /// malformed object path segment
    InvalidPath,
    /// malformed GATT UUID
    InvalidUuid,
    /// the system D-Bus is unavailable
    BusUnavailable,
    /// the well-known bus name was lost or could not be acquired
    NameLost,
    /// BlueZ is not ready yet
    NotReady,
    /// the requested object was not found
    NotFound,
    /// operation not permitted
    NotPermitted,
    /// operation not authorized / permission denied
    PermissionDenied,
    /// operation not supported
    NotSupported,
    /// the object already exists
    AlreadyExists,
    /// operation timed out
    Timeout,
    /// operation already in progress
    InProgress,
    /// operation failed
    Failed,
    /// internal D-Bus error: {0}
    #[strum(disabled)]
    Dbus(String),
    /// I/O error: {0:?}
    #[strum(disabled)]
    Io(std::io::ErrorKind),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

/// Maps a BlueZ/D-Bus error name to our taxonomy by substring match, per
/// spec §4.F's retryable-error mapping table.
impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        let name = err.name().unwrap_or_default();
        let message = err.message().unwrap_or_default().to_string();
        log::trace!("D-Bus error {name}: {message}");

        let kind = if name == "org.freedesktop.DBus.Error.UnknownObject" {
            ErrorKind::NotFound
        } else if let Some(suffix) = name.strip_prefix(ERR_PREFIX) {
            match suffix {
                "NotReady" => ErrorKind::NotReady,
                "NotPermitted" => ErrorKind::NotPermitted,
                "NotAuthorized" => ErrorKind::PermissionDenied,
                "NotSupported" => ErrorKind::NotSupported,
                "AlreadyExists" => ErrorKind::AlreadyExists,
                "InProgress" => ErrorKind::InProgress,
                "InvalidArguments" | "InvalidArgs" => ErrorKind::InvalidArgument,
                "Failed" => ErrorKind::Failed,
                _ => ErrorKind::from_str(suffix).unwrap_or(ErrorKind::Failed),
            }
        } else if name.contains("Timeout") || name == "org.freedesktop.DBus.Error.NoReply" {
            ErrorKind::Timeout
        } else if name == "org.freedesktop.DBus.Error.ServiceUnknown" || name == "org.freedesktop.DBus.Error.NameHasNoOwner" {
            ErrorKind::NotReady
        } else {
            ErrorKind::Dbus(name.to_string())
        };
        Self { kind, message }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self { kind: ErrorKind::Io(err.kind()), message: err.to_string() }
    }
}

/// Is this error kind one that a caller should retry, per the substring /
/// taxonomy mapping of spec §4.F? `PermissionDenied`, `NotSupported`,
/// `InvalidArgument` and `AlreadyExists` are never retried.
pub fn is_retryable(kind: &ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::NotReady | ErrorKind::Timeout | ErrorKind::InProgress | ErrorKind::Failed | ErrorKind::BusUnavailable | ErrorKind::NameLost
    )
}

/// bzperi result.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns every BlueZ object implementing `org.bluez.Adapter1`, along with
/// its full set of cached interfaces and properties, by calling
/// `GetManagedObjects` on the BlueZ `ObjectManager` at `/`.
pub(crate) async fn all_dbus_objects(connection: &SyncConnection) -> Result<HashMap<Path<'static>, HashMap<String, PropMap>>> {
    let proxy = Proxy::new(SERVICE_NAME, "/", DISCOVERY_TIMEOUT, connection);
    Ok(proxy.get_managed_objects().await?)
}

pub(crate) fn prop_get<T: for<'b> dbus::arg::Get<'b> + Clone + 'static>(props: &PropMap, name: &str) -> Option<T> {
    dbus::arg::prop_cast::<T>(props, name).cloned()
}

pub(crate) fn refarg_as_string_vec(a: &dyn RefArg) -> Vec<String> {
    a.as_iter()
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_object_maps_to_not_found() {
        let err = dbus::Error::new_custom("org.freedesktop.DBus.Error.UnknownObject", "gone");
        assert_eq!(Error::from(err).kind, ErrorKind::NotFound);
    }

    #[test]
    fn bluez_error_suffix_maps_by_substring() {
        let err = dbus::Error::new_custom("org.bluez.Error.NotReady", "adapter not ready");
        assert_eq!(Error::from(err).kind, ErrorKind::NotReady);
        let err = dbus::Error::new_custom("org.bluez.Error.InProgress", "busy");
        assert_eq!(Error::from(err).kind, ErrorKind::InProgress);
        let err = dbus::Error::new_custom("org.bluez.Error.NotSupported", "nope");
        assert!(!is_retryable(&Error::from(err).kind));
    }
}
